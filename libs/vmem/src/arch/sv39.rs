// Copyright 2026 The keel developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The RISC-V Sv39 translation format: three levels of 512 entries over
//! 4 KiB granules.
//!
//! Only the descriptor encoding lives here. The privileged-instruction
//! half of [`Arch`](crate::arch::Arch) for real hardware belongs to the
//! target HAL.

use bitflags::bitflags;

use crate::arch::{PageTableEntry, PageTableLevel, Paging};
use crate::{Attrs, GIB, KIB, MIB, PhysicalAddress, VirtualAddress};

pub struct Sv39;

impl Paging for Sv39 {
    const PAGE_SIZE: usize = 4 * KIB;

    #[expect(clippy::identity_op, reason = "formatting")]
    const LEVELS: &'static [PageTableLevel] = &[
        PageTableLevel::new(1 * GIB, 512),
        PageTableLevel::new(2 * MIB, 512),
        PageTableLevel::new(4 * KIB, 512),
    ];

    // keel uses an 8-bit identifier space even where the implementation
    // reports a wider ASIDLEN, so the slot table stays a fixed 256 entries.
    const ASID_BITS: u32 = 8;

    /// The second-to-last page of the canonical upper half (the last page
    /// is left unmapped as an overflow guard).
    const SCRATCH_BASE: VirtualAddress = VirtualAddress::new(0xffff_ffff_ffff_e000);

    type Entry = Sv39Entry;
}

/// Physical address bits sit shifted right by 2 inside the descriptor.
const PPN_SHIFT: u32 = 2;

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
    struct Sv39Flags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        /// Svpbmt "non-cacheable, idempotent, weakly-ordered" mode.
        const PBMT_NC = 1 << 61;
    }
}

const RWX: Sv39Flags = Sv39Flags::READ.union(Sv39Flags::WRITE).union(Sv39Flags::EXECUTE);

/// Descriptor bits valid in any entry; everything else is address payload.
const FLAG_MASK: usize = 0xff | (0b11 << 61) | (1 << 63);

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sv39Entry(usize);

impl PageTableEntry for Sv39Entry {
    const VACANT: Self = Self(0);

    fn new_table(frame: PhysicalAddress) -> Self {
        debug_assert!(frame.is_aligned_to(Sv39::PAGE_SIZE));

        Self((frame.get() >> PPN_SHIFT) | Sv39Flags::VALID.bits())
    }

    fn new_leaf(frame: PhysicalAddress, attrs: Attrs) -> Self {
        debug_assert!(frame.is_aligned_to(Sv39::PAGE_SIZE));
        debug_assert!(!attrs.is_empty(), "a leaf without permissions is vacant");

        let mut flags = Sv39Flags::VALID | Sv39Flags::ACCESSED | Sv39Flags::DIRTY;
        flags.set(Sv39Flags::READ, attrs.contains(Attrs::READ));
        flags.set(Sv39Flags::WRITE, attrs.contains(Attrs::WRITE));
        flags.set(Sv39Flags::EXECUTE, attrs.contains(Attrs::EXECUTE));
        flags.set(Sv39Flags::USER, attrs.contains(Attrs::USER));
        flags.set(Sv39Flags::GLOBAL, attrs.contains(Attrs::GLOBAL));
        flags.set(Sv39Flags::PBMT_NC, !attrs.contains(Attrs::CACHED));

        Self((frame.get() >> PPN_SHIFT) | flags.bits())
    }

    fn is_vacant(&self) -> bool {
        !self.flags().contains(Sv39Flags::VALID)
    }

    fn is_leaf(&self) -> bool {
        self.flags().contains(Sv39Flags::VALID) && self.flags().intersects(RWX)
    }

    fn is_table(&self) -> bool {
        self.flags().contains(Sv39Flags::VALID) && !self.flags().intersects(RWX)
    }

    fn address(&self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 & !FLAG_MASK) << PPN_SHIFT)
    }

    fn attrs(&self) -> Attrs {
        let flags = self.flags();

        let mut attrs = Attrs::empty();
        attrs.set(Attrs::READ, flags.contains(Sv39Flags::READ));
        attrs.set(Attrs::WRITE, flags.contains(Sv39Flags::WRITE));
        attrs.set(Attrs::EXECUTE, flags.contains(Sv39Flags::EXECUTE));
        attrs.set(Attrs::USER, flags.contains(Sv39Flags::USER));
        attrs.set(Attrs::GLOBAL, flags.contains(Sv39Flags::GLOBAL));
        attrs.set(Attrs::CACHED, !flags.contains(Sv39Flags::PBMT_NC));
        attrs
    }
}

impl Sv39Entry {
    fn flags(&self) -> Sv39Flags {
        Sv39Flags::from_bits_truncate(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_round_trips_address_and_attrs() {
        let frame = PhysicalAddress::new(0x8020_3000);
        let attrs = Attrs::READ | Attrs::WRITE | Attrs::USER | Attrs::CACHED;

        let entry = Sv39Entry::new_leaf(frame, attrs);
        assert!(entry.is_leaf());
        assert!(!entry.is_table());
        assert!(!entry.is_vacant());
        assert_eq!(entry.address(), frame);
        assert_eq!(entry.attrs(), attrs);
    }

    #[test]
    fn table_entry_is_not_leaf() {
        let entry = Sv39Entry::new_table(PhysicalAddress::new(0x8000_0000));
        assert!(entry.is_table());
        assert!(!entry.is_leaf());
        assert_eq!(entry.address(), PhysicalAddress::new(0x8000_0000));
    }

    #[test]
    fn vacant_is_neither() {
        let entry = Sv39Entry::VACANT;
        assert!(entry.is_vacant());
        assert!(!entry.is_leaf());
        assert!(!entry.is_table());
    }

    #[test]
    fn level_indices_slice_the_address() {
        let virt = VirtualAddress::new(0xffff_ffc0_4030_2000);

        let indices: [usize; 3] = [
            Sv39::LEVELS[0].index_of(virt),
            Sv39::LEVELS[1].index_of(virt),
            Sv39::LEVELS[2].index_of(virt),
        ];

        // bits 38..30, 29..21, 20..12 respectively
        assert_eq!(indices, [257, 1, 258]);

        // the canonical kernel-half base selects the upper half of the root
        assert_eq!(
            Sv39::LEVELS[0].index_of(VirtualAddress::new(0xffff_ffc0_0000_0000)),
            256
        );
    }
}
