// Copyright 2026 The keel developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::ops::Range;
use std::sync::Arc;

use crate::arch::{Arch, FlushScope, PageTableLevel, Paging};
use crate::test_utils::Machine;
use crate::{PhysicalAddress, VirtualAddress};

/// [`Arch`] implementation that runs a real translation format `P`
/// against an emulated [`Machine`].
///
/// All per-core operations act on the core the calling thread is
/// registered for, mirroring how a hardware implementation implicitly
/// acts on the executing core.
pub struct EmulateArch<P: Paging> {
    machine: Arc<Machine<P>>,
}

impl<P: Paging> EmulateArch<P> {
    pub fn new(machine: Arc<Machine<P>>) -> Self {
        Self { machine }
    }

    pub fn machine(&self) -> &Arc<Machine<P>> {
        &self.machine
    }
}

impl<P: Paging> Paging for EmulateArch<P> {
    // the format is inherited wholesale...
    const PAGE_SIZE: usize = P::PAGE_SIZE;
    const LEVELS: &'static [PageTableLevel] = P::LEVELS;
    const ASID_BITS: u32 = P::ASID_BITS;
    const SCRATCH_BASE: VirtualAddress = P::SCRATCH_BASE;
    type Entry = P::Entry;
}

// ...while every machine operation is emulated.
impl<P: Paging> Arch for EmulateArch<P> {
    unsafe fn read<T: Copy>(&self, virt: VirtualAddress) -> T {
        self.machine.read(self.machine.current_core(), virt)
    }

    unsafe fn write<T: Copy>(&self, virt: VirtualAddress, value: T) {
        self.machine.write(self.machine.current_core(), virt, value);
    }

    unsafe fn write_bytes(&self, virt: VirtualAddress, value: u8, count: usize) {
        self.machine
            .write_bytes(self.machine.current_core(), virt, value, count);
    }

    unsafe fn set_scratch(&self, frame: PhysicalAddress) {
        self.machine.set_scratch(frame);
    }

    fn barrier(&self) {
        // the emulated machine's memory is sequentially consistent
    }

    fn fence(&self, scope: FlushScope, range: Range<VirtualAddress>) {
        self.machine.fence(self.machine.current_core(), scope, range);
    }

    fn fence_asid(&self, asid: u16) {
        self.machine.fence_asid(self.machine.current_core(), asid);
    }

    fn fence_all(&self) {
        self.machine.fence_all(self.machine.current_core());
    }

    fn fence_remote(&self, scope: FlushScope, range: Option<Range<VirtualAddress>>) {
        self.machine
            .shootdown(self.machine.current_core(), scope, range);
    }

    fn current_core(&self) -> usize {
        self.machine.current_core()
    }

    fn core_count(&self) -> usize {
        self.machine.core_count()
    }

    fn current_asid(&self) -> u16 {
        self.machine.active_asid(self.machine.current_core())
    }

    unsafe fn set_active_table(&self, root: PhysicalAddress, asid: u16) {
        self.machine
            .set_active(self.machine.current_core(), root, asid);
    }
}
