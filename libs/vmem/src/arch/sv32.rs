// Copyright 2026 The keel developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The RISC-V Sv32 translation format: two levels of 1024 entries over
//! 4 KiB granules, with 32-bit descriptors.
//!
//! Besides serving 32-bit targets this format is what keeps the engine
//! honest about being level-count-agnostic.

use bitflags::bitflags;

use crate::arch::{PageTableEntry, PageTableLevel, Paging};
use crate::{Attrs, KIB, MIB, PhysicalAddress, VirtualAddress};

pub struct Sv32;

impl Paging for Sv32 {
    const PAGE_SIZE: usize = 4 * KIB;

    const LEVELS: &'static [PageTableLevel] = &[
        PageTableLevel::new(4 * MIB, 1024),
        PageTableLevel::new(4 * KIB, 1024),
    ];

    // satp.ASID is 9 bits wide on Sv32; the slot table clamps to its own
    // fixed capacity.
    const ASID_BITS: u32 = 9;

    /// The second-to-last page of the 32-bit address space (the last page
    /// is left unmapped as an overflow guard).
    const SCRATCH_BASE: VirtualAddress = VirtualAddress::new(0xffff_e000);

    type Entry = Sv32Entry;
}

const PPN_SHIFT: u32 = 2;

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
    struct Sv32Flags: u32 {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

const RWX: Sv32Flags = Sv32Flags::READ.union(Sv32Flags::WRITE).union(Sv32Flags::EXECUTE);

/// Low descriptor bits; bits 8..10 are software-reserved and left zero.
const FLAG_MASK: u32 = 0x3ff;

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sv32Entry(u32);

impl PageTableEntry for Sv32Entry {
    const VACANT: Self = Self(0);

    fn new_table(frame: PhysicalAddress) -> Self {
        debug_assert!(frame.is_aligned_to(Sv32::PAGE_SIZE));

        #[expect(clippy::cast_possible_truncation, reason = "Sv32 frames fit 34 bits")]
        Self((frame.get() >> PPN_SHIFT) as u32 | Sv32Flags::VALID.bits())
    }

    fn new_leaf(frame: PhysicalAddress, attrs: Attrs) -> Self {
        debug_assert!(frame.is_aligned_to(Sv32::PAGE_SIZE));
        debug_assert!(!attrs.is_empty(), "a leaf without permissions is vacant");

        let mut flags = Sv32Flags::VALID | Sv32Flags::ACCESSED | Sv32Flags::DIRTY;
        flags.set(Sv32Flags::READ, attrs.contains(Attrs::READ));
        flags.set(Sv32Flags::WRITE, attrs.contains(Attrs::WRITE));
        flags.set(Sv32Flags::EXECUTE, attrs.contains(Attrs::EXECUTE));
        flags.set(Sv32Flags::USER, attrs.contains(Attrs::USER));
        flags.set(Sv32Flags::GLOBAL, attrs.contains(Attrs::GLOBAL));

        #[expect(clippy::cast_possible_truncation, reason = "Sv32 frames fit 34 bits")]
        Self((frame.get() >> PPN_SHIFT) as u32 | flags.bits())
    }

    fn is_vacant(&self) -> bool {
        !self.flags().contains(Sv32Flags::VALID)
    }

    fn is_leaf(&self) -> bool {
        self.flags().contains(Sv32Flags::VALID) && self.flags().intersects(RWX)
    }

    fn is_table(&self) -> bool {
        self.flags().contains(Sv32Flags::VALID) && !self.flags().intersects(RWX)
    }

    fn address(&self) -> PhysicalAddress {
        PhysicalAddress::new(((self.0 & !FLAG_MASK) as usize) << PPN_SHIFT)
    }

    fn attrs(&self) -> Attrs {
        let flags = self.flags();

        let mut attrs = Attrs::empty();
        attrs.set(Attrs::READ, flags.contains(Sv32Flags::READ));
        attrs.set(Attrs::WRITE, flags.contains(Sv32Flags::WRITE));
        attrs.set(Attrs::EXECUTE, flags.contains(Sv32Flags::EXECUTE));
        attrs.set(Attrs::USER, flags.contains(Sv32Flags::USER));
        attrs.set(Attrs::GLOBAL, flags.contains(Sv32Flags::GLOBAL));
        // Sv32 has no page-based memory types; everything is cacheable.
        attrs.set(Attrs::CACHED, true);
        attrs
    }
}

impl Sv32Entry {
    fn flags(&self) -> Sv32Flags {
        Sv32Flags::from_bits_truncate(self.0)
    }
}
