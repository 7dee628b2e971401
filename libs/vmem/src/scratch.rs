// Copyright 2026 The keel developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::arch::{Arch, FlushScope};
use crate::{PhysicalAddress, VirtualAddress};

/// The single process-wide scratch slot.
///
/// Windowing a frame brings it into the kernel's addressable range at
/// the format's scratch base so a table that is not otherwise mapped can be
/// edited. The returned address is valid only until the next call or the
/// end of the critical section, whichever comes first — the slot is shared
/// by every core, which is why this type lives inside the global lock and
/// can only be reached through its guard.
pub(crate) struct ScratchWindow {
    current: Option<PhysicalAddress>,
}

impl ScratchWindow {
    pub(crate) const fn new() -> Self {
        Self { current: None }
    }

    /// Window `frame` into the scratch slot and return the slot base.
    pub(crate) fn window<A: Arch>(&mut self, arch: &A, frame: PhysicalAddress) -> VirtualAddress {
        debug_assert!(frame.is_aligned_to(A::PAGE_SIZE));

        // The slot translation is re-installed unconditionally, even when
        // `frame` is already windowed: this core's cached slot translation
        // may be stale if another core rewired the slot since we last held
        // the lock. The fence must cover the slot itself before any access
        // goes through it.
        arch.barrier();
        // Safety: `frame` is page-aligned and our caller holds the global
        // lock, which is the only context `set_scratch` may be used in.
        unsafe { arch.set_scratch(frame) };
        arch.fence(
            FlushScope::Global,
            A::SCRATCH_BASE..A::SCRATCH_BASE.checked_add(A::PAGE_SIZE).unwrap(),
        );
        arch.barrier();

        self.current = Some(frame);

        A::SCRATCH_BASE
    }

    /// The frame currently occupying the slot. Nothing may assume its
    /// contents survive a remap; this exists for assertions.
    #[cfg(test)]
    pub(crate) fn current(&self) -> Option<PhysicalAddress> {
        self.current
    }
}
