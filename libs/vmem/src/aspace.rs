// Copyright 2026 The keel developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Address spaces and the page-table engine.
//!
//! [`Vmem`] owns the subsystem's single global lock. The scratch window,
//! the identifier slot table, and every pending-invalidation set live
//! behind it; each engine operation takes the lock for the whole of its
//! walk, edits the hierarchy through the window, and commits its
//! invalidations before the lock is released.

use core::fmt;
use core::ops::Range;

use arrayvec::ArrayVec;
use lock_api::{Mutex, RawMutex};

use crate::arch::{Arch, FlushScope, PageTableEntry, Paging};
use crate::asid::{AsidSlots, KERNEL_ASID};
use crate::flush::Flush;
use crate::frame::{FrameKind, FrameMap, KernelRole};
use crate::scratch::ScratchWindow;
use crate::{
    Attrs, Error, FrameAllocator, PhysicalAddress, Result, VirtualAddress, ensure,
};

/// Entries moved per scratch-window remap while copying the kernel range
/// into a fresh root.
const COPY_CHUNK: usize = 32;

/// Identity of one address space, unique for the lifetime of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpaceId(u64);

impl SpaceId {
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Kernel,
    User,
}

/// One translation hierarchy plus the bookkeeping this subsystem keeps for
/// it.
///
/// The engine exclusively owns the root and node frames once a space
/// exists; callers interact with them only through [`Vmem`]. Exclusive
/// `&mut` access serializes edits per space, the global lock serializes
/// them across spaces.
pub struct AddressSpace {
    root: PhysicalAddress,
    bounds: Range<VirtualAddress>,
    id: SpaceId,
    kind: Kind,
    asid: Option<u16>,
}

impl AddressSpace {
    /// The physical frame holding the root table.
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// The virtual range this space is responsible for.
    pub fn bounds(&self) -> Range<VirtualAddress> {
        self.bounds.clone()
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// The identifier as of the last [`Vmem::switch`]. Eviction can take
    /// it away asynchronously; [`Vmem::asid_of`] is authoritative.
    pub fn asid(&self) -> Option<u16> {
        self.asid
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("root", &self.root)
            .field("bounds", &self.bounds)
            .field("id", &self.id)
            .field("asid", &self.asid)
            .finish()
    }
}

/// Caller-owned iteration state for [`Vmem::destroy`].
#[derive(Debug, Default)]
pub struct DestroyCursor {
    released_asid: bool,
    root_index: usize,
    root_returned: bool,
}

impl DestroyCursor {
    pub fn new() -> Self {
        Self::default()
    }
}

struct VmInner {
    scratch: ScratchWindow,
    asids: AsidSlots,
    next_id: u64,
}

/// The virtual address-space management subsystem.
///
/// Generic over the architecture seam and over the raw mutex protecting
/// the global state. On hardware the mutex must mask interrupts while
/// held: a core inside a critical section cannot be allowed to service
/// the shootdown interrupt, which may block on this very lock.
pub struct Vmem<A: Arch, R: RawMutex> {
    arch: A,
    inner: Mutex<R, VmInner>,
}

impl<A: Arch, R: RawMutex> Vmem<A, R> {
    /// Initialize the subsystem and the kernel address space rooted at
    /// `kernel_root`, which is zeroed here.
    ///
    /// The kernel space permanently holds identifier 0.
    pub fn new(
        arch: A,
        kernel_root: PhysicalAddress,
        kernel_bounds: Range<VirtualAddress>,
    ) -> (Self, AddressSpace) {
        debug_assert!(kernel_root.is_aligned_to(A::PAGE_SIZE));
        assert!(!kernel_bounds.is_empty());

        let kernel = AddressSpace {
            root: kernel_root,
            bounds: kernel_bounds,
            id: SpaceId(0),
            kind: Kind::Kernel,
            asid: Some(KERNEL_ASID),
        };

        let this = Self {
            arch,
            inner: Mutex::new(VmInner {
                scratch: ScratchWindow::new(),
                asids: AsidSlots::new(A::ASID_BITS, kernel.id),
                next_id: 1,
            }),
        };

        {
            let mut guard = this.inner.lock();
            let inner = &mut *guard;
            this.zero_frame(inner, kernel_root);
        }

        (this, kernel)
    }

    /// Initialize a fresh address space rooted at `root_frame`.
    ///
    /// The frame is zeroed and every top-level entry covering the kernel
    /// range is copied from the kernel root, so the new space can service
    /// kernel-mode references immediately and shares the kernel's
    /// subtrees. Performs no allocation and cannot fail.
    pub fn create(
        &self,
        kernel: &AddressSpace,
        root_frame: PhysicalAddress,
        bounds: Range<VirtualAddress>,
    ) -> AddressSpace {
        debug_assert!(root_frame.is_aligned_to(A::PAGE_SIZE));
        debug_assert!(kernel.kind == Kind::Kernel);
        assert!(!bounds.is_empty());

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let id = SpaceId(inner.next_id);
        inner.next_id += 1;

        self.zero_frame(inner, root_frame);

        // Copy the shared kernel subtree links. The window holds one frame
        // at a time, so the copy bounces between the two roots in chunks.
        let root_level = &A::LEVELS[0];
        let first = root_level.index_of(kernel.bounds.start);
        let last = root_level.index_of(
            kernel
                .bounds
                .end
                .checked_sub(1)
                .expect("kernel bounds are non-empty"),
        );

        let mut index = first;
        while index <= last {
            let n = (last - index + 1).min(COPY_CHUNK);

            let mut chunk: ArrayVec<A::Entry, COPY_CHUNK> = ArrayVec::new();
            for k in 0..n {
                chunk.push(self.read_entry(inner, kernel.root, index + k));
            }
            for (k, entry) in chunk.iter().enumerate() {
                self.write_entry(inner, root_frame, index + k, *entry);
            }

            index += n;
        }

        log::trace!("created address space {id:?} with root {root_frame}");

        AddressSpace {
            root: root_frame,
            bounds,
            id,
            kind: Kind::User,
            asid: None,
        }
    }

    /// Map `virt` to `phys` with `attrs`, or clear the mapping if `attrs`
    /// is empty.
    ///
    /// The walk builds at most one missing intermediate table per call,
    /// consuming `spare`; the unconsumed spare is handed back on success.
    /// A spare consumed for an intermediate level stays owned by the
    /// address space even if the call then fails with [`Error::MissingTable`]
    /// — the retry picks up where this call left off. The leaf itself is
    /// only written by the call that completes the walk, and that call
    /// flushes the page on every core before returning.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if `virt` is outside the space's bounds;
    /// [`Error::MissingTable`] if an intermediate table is absent and no
    /// spare is left to build it (retry with a frame).
    pub fn enter(
        &self,
        space: &mut AddressSpace,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        attrs: Attrs,
        mut spare: Option<PhysicalAddress>,
    ) -> Result<Option<PhysicalAddress>> {
        ensure!(space.bounds.contains(&virt), self.out_of_range(space, virt));
        debug_assert!(virt.is_aligned_to(A::PAGE_SIZE));
        debug_assert!(phys.is_aligned_to(A::PAGE_SIZE));

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let scope = Self::scope_of(&inner.asids, space);

        let leaf_depth = A::LEVELS.len() - 1;
        let mut table = space.root;

        for (depth, level) in A::LEVELS.iter().enumerate() {
            let index = level.index_of(virt);

            if depth == leaf_depth {
                let entry = if attrs.is_empty() {
                    A::Entry::VACANT
                } else {
                    A::Entry::new_leaf(phys, attrs)
                };
                self.write_entry(inner, table, index, entry);
                break;
            }

            let entry = self.read_entry(inner, table, index);

            if entry.is_table() {
                table = entry.address();
            } else if entry.is_vacant() {
                let Some(frame) = spare.take() else {
                    return Err(Error::MissingTable);
                };

                self.zero_frame(inner, frame);
                self.write_entry(inner, table, index, A::Entry::new_table(frame));
                log::trace!("built level-{} table {frame} for {virt}", depth + 1);

                table = frame;
            } else {
                unreachable!(
                    "level {depth} entry for {virt} is a leaf in the middle of the hierarchy"
                );
            }
        }

        let mut flush = Flush::new(scope);
        flush.pend(virt..virt.checked_add(A::PAGE_SIZE).unwrap());
        flush.commit(&self.arch, guard);

        Ok(spare)
    }

    /// Unmap `virt`.
    ///
    /// Removing an absent mapping is success, not an error. When this
    /// returns, no core will translate `virt` through the old mapping.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if `virt` is outside the space's bounds.
    pub fn remove(&self, space: &mut AddressSpace, virt: VirtualAddress) -> Result<()> {
        ensure!(space.bounds.contains(&virt), self.out_of_range(space, virt));
        debug_assert!(virt.is_aligned_to(A::PAGE_SIZE));

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let scope = Self::scope_of(&inner.asids, space);

        let leaf_depth = A::LEVELS.len() - 1;
        let mut table = space.root;

        for (depth, level) in A::LEVELS.iter().enumerate() {
            let index = level.index_of(virt);
            let entry = self.read_entry(inner, table, index);

            if depth == leaf_depth {
                if entry.is_vacant() {
                    return Ok(());
                }

                self.write_entry(inner, table, index, A::Entry::VACANT);

                let mut flush = Flush::new(scope);
                flush.pend(virt..virt.checked_add(A::PAGE_SIZE).unwrap());
                flush.commit(&self.arch, guard);

                return Ok(());
            }

            if entry.is_table() {
                table = entry.address();
            } else if entry.is_vacant() {
                // nothing mapped below this level
                return Ok(());
            } else {
                unreachable!(
                    "level {depth} entry for {virt} is a leaf in the middle of the hierarchy"
                );
            }
        }

        unreachable!("walk ran past the leaf level");
    }

    /// Resolve `virt` to its backing frame and attributes, or `None` if
    /// any level of the walk is absent. Mutates nothing.
    ///
    /// Unlike the structural edits this is not bounds-checked: the walk
    /// goes through whatever the hierarchy maps, which includes the shared
    /// kernel subtrees from any root — exactly what the hardware would
    /// translate with this root active.
    pub fn resolve(
        &self,
        space: &AddressSpace,
        virt: VirtualAddress,
    ) -> Option<(PhysicalAddress, Attrs)> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut table = space.root;

        for level in A::LEVELS {
            let entry = self.read_entry(inner, table, level.index_of(virt));

            if entry.is_leaf() {
                return Some((entry.address(), entry.attrs()));
            } else if entry.is_table() {
                table = entry.address();
            } else {
                return None;
            }
        }

        None
    }

    /// Extend the shared kernel mapping one coarse unit at a time from
    /// `*cursor` towards `end`, installing an empty next-level table per
    /// unit so the range participates in later [`enter`][Vmem::enter]
    /// calls without further top-level edits.
    ///
    /// `*cursor` advances as units complete, so the caller can resume
    /// after refilling its allocator. Must run during bring-up, before the
    /// first [`create`][Vmem::create]: top-level kernel entries installed
    /// later would not propagate to the roots that already copied them.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if the cursor range escapes the kernel
    /// bounds; [`Error::FrameExhausted`] once `frames` runs dry (resume
    /// with the cursor after refilling).
    pub fn kernel_expand(
        &self,
        kernel: &mut AddressSpace,
        cursor: &mut VirtualAddress,
        end: VirtualAddress,
        frames: &mut dyn FrameAllocator,
    ) -> Result<()> {
        debug_assert!(kernel.kind == Kind::Kernel);
        ensure!(
            kernel.bounds.contains(cursor) && end <= kernel.bounds.end,
            self.out_of_range(kernel, *cursor)
        );

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let root_level = &A::LEVELS[0];
        let unit = root_level.page_size();
        *cursor = cursor.align_down(unit);

        while *cursor < end {
            let index = root_level.index_of(*cursor);
            let entry = self.read_entry(inner, kernel.root, index);

            if entry.is_vacant() {
                let Some(frame) = frames.allocate() else {
                    return Err(Error::FrameExhausted);
                };

                self.zero_frame(inner, frame);
                self.write_entry(inner, kernel.root, index, A::Entry::new_table(frame));
                log::trace!("reserved kernel unit at {cursor} with table {frame}");
            }

            // no translations changed: the new table is empty, so nothing
            // needs flushing
            let Some(next) = cursor.checked_add(unit) else {
                *cursor = VirtualAddress::MAX;
                break;
            };
            *cursor = next;
        }

        Ok(())
    }

    /// Reclaim the table frames of a dead address space, one frame per
    /// call; the root comes last, and `None` signals exhaustion.
    ///
    /// The first call forces identifier deallocation and flushes the old
    /// identifier everywhere. Frames of the shared kernel subtrees are
    /// not the space's to reclaim and are never returned.
    pub fn destroy(
        &self,
        space: &mut AddressSpace,
        cursor: &mut DestroyCursor,
    ) -> Option<PhysicalAddress> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if !cursor.released_asid {
            if let Some(asid) = inner.asids.deallocate(space.id) {
                self.arch.fence_asid(asid);
                self.arch.fence_remote(FlushScope::Asid(asid), None);
                log::debug!("released identifier {asid} of dying space {:?}", space.id);
            }
            space.asid = None;
            cursor.released_asid = true;
        }

        if cursor.root_returned {
            return None;
        }

        let (first, last) = Self::root_range(space);
        let mut index = cursor.root_index.max(first);

        while index <= last {
            let entry = self.read_entry(inner, space.root, index);

            if entry.is_table() {
                return Some(self.detach_deepest(inner, space.root, index));
            }

            index += 1;
            cursor.root_index = index;
        }

        cursor.root_returned = true;
        Some(space.root)
    }

    /// Activate `space` on the calling core, assigning an identifier
    /// first if it has none. The fast path of every context switch:
    /// bounded work, no allocation.
    pub fn switch(&self, space: &mut AddressSpace) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let (asid, recycled) = match space.kind {
            Kind::Kernel => (KERNEL_ASID, false),
            Kind::User => inner.asids.allocate(space.id, self.arch.current_asid()),
        };

        if recycled {
            // Close the stale-identifier alias before the new owner's
            // first memory reference, on this core and on all others.
            self.arch.fence_asid(asid);
            self.arch.fence_remote(FlushScope::Asid(asid), None);
        }

        space.asid = Some(asid);

        // Safety: `root` is a hierarchy this engine built, and it maps the
        // kernel range by construction.
        unsafe { self.arch.set_active_table(space.root, asid) };
    }

    /// The identifier currently assigned to `space`, straight from the
    /// slot table.
    pub fn asid_of(&self, space: &AddressSpace) -> Option<u16> {
        self.inner.lock().asids.lookup(space.id)
    }

    /// Classify `frame`, additionally reporting
    /// [`KernelRole::PageTable`] for frames that are nodes of `space`'s
    /// hierarchy.
    pub fn classify(
        &self,
        map: &FrameMap,
        space: &AddressSpace,
        frame: PhysicalAddress,
    ) -> FrameKind {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if frame == space.root || self.is_table_frame(inner, space, frame) {
            return FrameKind::KernelOwned(KernelRole::PageTable);
        }

        map.classify(frame)
    }

    /// Render the translation hierarchy of `space` for diagnostics.
    pub fn display<'a>(&'a self, space: &'a AddressSpace) -> AddressSpaceDisplay<'a, A, R> {
        AddressSpaceDisplay { vmem: self, space }
    }

    // ===== walk plumbing =====

    fn read_entry(&self, inner: &mut VmInner, table: PhysicalAddress, index: usize) -> A::Entry {
        let window = inner.scratch.window(&self.arch, table);
        let addr = window.checked_add(index * size_of::<A::Entry>()).unwrap();
        // Safety: the scratch slot maps one whole table frame and `index`
        // is bounded by the level geometry.
        unsafe { self.arch.read(addr) }
    }

    fn write_entry(
        &self,
        inner: &mut VmInner,
        table: PhysicalAddress,
        index: usize,
        entry: A::Entry,
    ) {
        let window = inner.scratch.window(&self.arch, table);
        let addr = window.checked_add(index * size_of::<A::Entry>()).unwrap();
        // Safety: the scratch slot maps one whole table frame and `index`
        // is bounded by the level geometry.
        unsafe { self.arch.write(addr, entry) };
    }

    fn zero_frame(&self, inner: &mut VmInner, frame: PhysicalAddress) {
        let window = inner.scratch.window(&self.arch, frame);
        // Safety: the scratch slot maps exactly one frame.
        unsafe { self.arch.write_bytes(window, 0, A::PAGE_SIZE) };
    }

    fn scope_of(asids: &AsidSlots, space: &AddressSpace) -> Option<FlushScope> {
        match space.kind {
            Kind::Kernel => Some(FlushScope::Global),
            // A user space without an identifier has no cached
            // translations anywhere: recycled identifiers are flushed
            // before the lock handing them out is released.
            Kind::User => asids.lookup(space.id).map(FlushScope::Asid),
        }
    }

    fn out_of_range(&self, space: &AddressSpace, virt: VirtualAddress) -> Error {
        Error::OutOfRange {
            virt,
            start: space.bounds.start,
            end: space.bounds.end,
        }
    }

    /// Root-level index range covering the space's bounds.
    fn root_range(space: &AddressSpace) -> (usize, usize) {
        let root_level = &A::LEVELS[0];
        let first = root_level.index_of(space.bounds.start);
        let last = root_level.index_of(
            space
                .bounds
                .end
                .checked_sub(1)
                .expect("bounds are non-empty"),
        );
        (first, last)
    }

    /// Detach the deepest table node under `root[index]` from its parent
    /// and return its frame.
    fn detach_deepest(
        &self,
        inner: &mut VmInner,
        root: PhysicalAddress,
        index: usize,
    ) -> PhysicalAddress {
        let leaf_depth = A::LEVELS.len() - 1;

        let mut parent = root;
        let mut parent_index = index;
        let mut current = self.read_entry(inner, root, index).address();
        let mut depth = 1;

        'descend: while depth < leaf_depth {
            for i in 0..A::LEVELS[depth].entries() {
                let entry = self.read_entry(inner, current, i);
                if entry.is_table() {
                    parent = current;
                    parent_index = i;
                    current = entry.address();
                    depth += 1;
                    continue 'descend;
                }
            }
            break;
        }

        self.write_entry(inner, parent, parent_index, A::Entry::VACANT);
        log::trace!("reclaimed table frame {current}");

        current
    }

    fn is_table_frame(
        &self,
        inner: &mut VmInner,
        space: &AddressSpace,
        frame: PhysicalAddress,
    ) -> bool {
        let (first, last) = Self::root_range(space);

        for index in first..=last {
            let entry = self.read_entry(inner, space.root, index);
            if entry.is_table() && self.subtree_contains(inner, entry.address(), 1, frame) {
                return true;
            }
        }

        false
    }

    fn subtree_contains(
        &self,
        inner: &mut VmInner,
        table: PhysicalAddress,
        depth: usize,
        frame: PhysicalAddress,
    ) -> bool {
        if table == frame {
            return true;
        }

        if depth >= A::LEVELS.len() - 1 {
            return false;
        }

        for index in 0..A::LEVELS[depth].entries() {
            let entry = self.read_entry(inner, table, index);
            if entry.is_table() && self.subtree_contains(inner, entry.address(), depth + 1, frame) {
                return true;
            }
        }

        false
    }
}

pub struct AddressSpaceDisplay<'a, A: Arch, R: RawMutex> {
    vmem: &'a Vmem<A, R>,
    space: &'a AddressSpace,
}

impl<A: Arch, R: RawMutex> fmt::Display for AddressSpaceDisplay<'_, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn fmt_table<A: Arch, R: RawMutex>(
            f: &mut fmt::Formatter<'_>,
            vmem: &Vmem<A, R>,
            inner: &mut VmInner,
            table: PhysicalAddress,
            acc: usize,
            depth: usize,
        ) -> fmt::Result {
            let level = &A::LEVELS[depth];

            for index in 0..level.entries() {
                let entry = vmem.read_entry(inner, table, index);
                let raw = acc | (index * level.page_size());

                if entry.is_leaf() {
                    let virt = VirtualAddress::new(canonicalize::<A>(raw));
                    writeln!(
                        f,
                        "{:>width$}{depth}:{index:<4} {virt} => {} {}",
                        "",
                        entry.address(),
                        entry.attrs(),
                        width = depth * 2,
                    )?;
                } else if entry.is_table() {
                    writeln!(
                        f,
                        "{:>width$}{depth}:{index:<4} table {}",
                        "",
                        entry.address(),
                        width = depth * 2,
                    )?;
                    fmt_table(f, vmem, inner, entry.address(), raw, depth + 1)?;
                }
            }

            Ok(())
        }

        let mut guard = self.vmem.inner.lock();
        let inner = &mut *guard;

        fmt_table(f, self.vmem, inner, self.space.root, 0, 0)
    }
}

/// Sign-extend `raw` from the format's addressable width so upper-half
/// addresses print canonically.
#[expect(
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    reason = "sign extension is the point"
)]
fn canonicalize<A: Arch>(raw: usize) -> usize {
    let virt_bits = (A::LEVELS[0].page_size() * A::LEVELS[0].entries()).ilog2();
    let shift = usize::BITS - virt_bits;
    (((raw as isize) << shift) >> shift) as usize
}


#[cfg(test)]
mod tests {
    extern crate std;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::vec::Vec;

    use proptest::prelude::*;

    use super::*;
    use crate::MIB;
    use crate::arch::PageTableLevel;
    use crate::arch::sv32::Sv32;
    use crate::arch::sv39::{Sv39, Sv39Entry};
    use crate::test_utils::{EmulateArch, Machine, TestFrameAllocator};

    const KERNEL_BASE: VirtualAddress = VirtualAddress::new(0xffff_ffc0_0000_0000);
    const USER_END: VirtualAddress = VirtualAddress::new(0x0000_0040_0000_0000);

    const RW: Attrs = Attrs::READ
        .union(Attrs::WRITE)
        .union(Attrs::USER)
        .union(Attrs::CACHED);
    const KERNEL_RW: Attrs = Attrs::READ
        .union(Attrs::WRITE)
        .union(Attrs::GLOBAL)
        .union(Attrs::CACHED);

    type TestVmem<P> = Vmem<EmulateArch<P>, parking_lot::RawMutex>;

    struct Fixture<P: Paging> {
        machine: Arc<Machine<P>>,
        vmem: TestVmem<P>,
        kernel: AddressSpace,
        pool: TestFrameAllocator,
    }

    fn setup_with<P: Paging>(cores: usize, kernel_bounds: Range<VirtualAddress>) -> Fixture<P> {
        let machine = Arc::new(Machine::new(4 * MIB, cores));
        let arch = EmulateArch::new(Arc::clone(&machine));

        // table frames come from the low 3 MiB; the rest of physical
        // memory is for tests that need their own pools
        let mut pool = TestFrameAllocator::new(
            PhysicalAddress::new(0x1000)..PhysicalAddress::new(3 * MIB),
            P::PAGE_SIZE,
        );

        let kernel_root = pool.frame();
        let (vmem, kernel) = Vmem::new(arch, kernel_root, kernel_bounds);

        Fixture {
            machine,
            vmem,
            kernel,
            pool,
        }
    }

    fn setup(cores: usize) -> Fixture<Sv39> {
        setup_with(cores, KERNEL_BASE..Sv39::SCRATCH_BASE)
    }

    fn user_space<P: Paging>(f: &mut Fixture<P>, end: VirtualAddress) -> AddressSpace {
        let root = f.pool.frame();
        f.vmem.create(&f.kernel, root, VirtualAddress::MIN..end)
    }

    /// Drive the retry protocol until the mapping lands.
    fn map<P: Paging>(
        vmem: &TestVmem<P>,
        pool: &mut TestFrameAllocator,
        space: &mut AddressSpace,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        attrs: Attrs,
    ) {
        loop {
            match vmem.enter(space, virt, phys, attrs, Some(pool.frame())) {
                Ok(unused) => {
                    if let Some(frame) = unused {
                        pool.deallocate(frame);
                    }
                    return;
                }
                Err(Error::MissingTable) => {}
                Err(err) => panic!("enter failed: {err}"),
            }
        }
    }

    #[test_log::test]
    fn round_trip_and_idempotent_removal() {
        let mut f = setup(1);
        let mut space = user_space(&mut f, USER_END);

        let virt = VirtualAddress::new(0x4030_2000);
        let phys = PhysicalAddress::new(0x0100_0000);

        map(&f.vmem, &mut f.pool, &mut space, virt, phys, RW);
        assert_eq!(f.vmem.resolve(&space, virt), Some((phys, RW)));

        f.vmem.remove(&mut space, virt).unwrap();
        assert_eq!(f.vmem.resolve(&space, virt), None);

        // removing an absent mapping is a no-op success
        f.vmem.remove(&mut space, virt).unwrap();
        assert_eq!(f.vmem.resolve(&space, virt), None);
    }

    const ATTR_CHOICES: [Attrs; 3] = [
        Attrs::READ.union(Attrs::CACHED),
        Attrs::READ.union(Attrs::WRITE).union(Attrs::CACHED),
        Attrs::READ.union(Attrs::EXECUTE).union(Attrs::USER),
    ];

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn entered_pages_resolve_back(
            pages in prop::collection::btree_map(
                1usize..0x8000,
                (0x1000usize..0x2000, prop::sample::select(&ATTR_CHOICES)),
                1..10,
            )
        ) {
            let mut f = setup(1);
            let mut space = user_space(&mut f, USER_END);

            let pages: Vec<(VirtualAddress, PhysicalAddress, Attrs)> = pages
                .into_iter()
                .map(|(vpn, (ppn, attrs))| {
                    (
                        VirtualAddress::new(vpn * Sv39::PAGE_SIZE),
                        PhysicalAddress::new(ppn * Sv39::PAGE_SIZE),
                        attrs,
                    )
                })
                .collect();

            for (virt, phys, attrs) in &pages {
                map(&f.vmem, &mut f.pool, &mut space, *virt, *phys, *attrs);
            }

            for (virt, phys, attrs) in &pages {
                prop_assert_eq!(f.vmem.resolve(&space, *virt), Some((*phys, *attrs)));
            }

            for (virt, _, _) in &pages {
                f.vmem.remove(&mut space, *virt).unwrap();
                prop_assert_eq!(f.vmem.resolve(&space, *virt), None);
            }
        }
    }

    #[test_log::test]
    fn missing_table_leaves_no_partial_state() {
        let mut f = setup(1);
        let mut space = user_space(&mut f, USER_END);

        let virt = VirtualAddress::new(0x2000);
        let phys = PhysicalAddress::new(0x0100_0000);

        // no spare on a cold hierarchy: recoverable failure, nothing mapped
        assert_eq!(
            f.vmem.enter(&mut space, virt, phys, RW, None),
            Err(Error::MissingTable)
        );
        assert_eq!(f.vmem.resolve(&space, virt), None);

        // one spare builds one level; the walk still cannot finish
        let spare = f.pool.frame();
        assert_eq!(
            f.vmem.enter(&mut space, virt, phys, RW, Some(spare)),
            Err(Error::MissingTable)
        );
        assert_eq!(f.vmem.resolve(&space, virt), None);

        // the second retry completes with nothing left over
        let spare = f.pool.frame();
        assert_eq!(
            f.vmem.enter(&mut space, virt, phys, RW, Some(spare)),
            Ok(None)
        );
        assert_eq!(f.vmem.resolve(&space, virt), Some((phys, RW)));

        // with the path in place a neighbouring page needs no spare, and
        // an offered one comes back to the caller
        let neighbour = VirtualAddress::new(0x3000);
        let spare = f.pool.frame();
        assert_eq!(
            f.vmem.enter(&mut space, neighbour, phys, RW, Some(spare)),
            Ok(Some(spare))
        );
        f.pool.deallocate(spare);
    }

    #[test_log::test]
    fn out_of_range_is_surfaced() {
        let mut f = setup(1);
        let mut space = user_space(&mut f, VirtualAddress::new(0x10_0000));

        let virt = VirtualAddress::new(0x20_0000);
        let result = f
            .vmem
            .enter(&mut space, virt, PhysicalAddress::new(0x1000), RW, None);

        assert!(matches!(result, Err(Error::OutOfRange { .. })));
        assert_eq!(f.vmem.resolve(&space, virt), None);
    }

    #[test_log::test]
    fn kernel_subtree_is_shared_and_user_pages_are_private() {
        let mut f = setup(1);

        // reserve the first kernel unit during bring-up
        let mut cursor = KERNEL_BASE;
        let end = KERNEL_BASE
            .checked_add(Sv39::LEVELS[0].page_size())
            .unwrap();
        f.vmem
            .kernel_expand(&mut f.kernel, &mut cursor, end, &mut f.pool)
            .unwrap();
        assert_eq!(cursor, end);

        let kpage = KERNEL_BASE.checked_add(0x2000).unwrap();
        let kphys = PhysicalAddress::new(0x1000);
        map(&f.vmem, &mut f.pool, &mut f.kernel, kpage, kphys, KERNEL_RW);

        let mut u = user_space(&mut f, USER_END);

        // every kernel-range root entry is bit-identical in the new root
        let root_level = &Sv39::LEVELS[0];
        let first = root_level.index_of(KERNEL_BASE);
        let last = root_level.index_of(VirtualAddress::new(Sv39::SCRATCH_BASE.get() - 1));
        for index in first..=last {
            let offset = index * size_of::<Sv39Entry>();
            let k: usize = f
                .machine
                .read_phys(f.kernel.root().checked_add(offset).unwrap());
            let n: usize = f.machine.read_phys(u.root().checked_add(offset).unwrap());
            assert_eq!(k, n, "root entry {index} diverged");
        }

        // the kernel mapping is visible through the user root
        assert_eq!(f.vmem.resolve(&u, kpage), Some((kphys, KERNEL_RW)));

        // user mappings are private to their hierarchy
        let upage = VirtualAddress::new(0x7000);
        let uphys = PhysicalAddress::new(0x0100_0000);
        map(&f.vmem, &mut f.pool, &mut u, upage, uphys, RW);

        let v = user_space(&mut f, USER_END);
        assert_eq!(f.vmem.resolve(&v, upage), None);
        assert_eq!(f.vmem.resolve(&u, upage), Some((uphys, RW)));

        // a kernel-range removal through the kernel handle unmaps the page
        // in *every* space: the subtree is shared
        f.vmem.remove(&mut f.kernel, kpage).unwrap();
        assert_eq!(f.vmem.resolve(&f.kernel, kpage), None);
        assert_eq!(f.vmem.resolve(&u, kpage), None);
        assert_eq!(f.vmem.resolve(&v, kpage), None);

        // while the private user page is unaffected
        assert_eq!(f.vmem.resolve(&u, upage), Some((uphys, RW)));
    }

    #[test_log::test]
    fn removal_shoots_down_stale_remote_translations() {
        let mut f = setup(2);
        let mut space = user_space(&mut f, USER_END);

        let virt = VirtualAddress::new(0x5000);
        let phys = PhysicalAddress::new(0x0100_0000);
        map(&f.vmem, &mut f.pool, &mut space, virt, phys, RW);

        f.vmem.switch(&mut space);
        let asid = f.vmem.asid_of(&space).unwrap();

        // core 1 runs the same space and has the page hot in its cache
        f.machine.set_active(1, space.root(), asid);
        f.machine.prime(1, virt);
        f.machine.prime(0, virt);
        assert_eq!(f.machine.probe(1, virt), Some((phys, RW)));

        f.vmem.remove(&mut space, virt).unwrap();

        // a completed remove guarantees no core still translates the page,
        // the primed-and-stale one included
        assert_eq!(f.machine.probe(0, virt), None);
        assert_eq!(f.machine.probe(1, virt), None);
    }

    /// Format with a 2-bit identifier field: 4 slots, 3 of them for user
    /// spaces. Keeps the exhaustion paths cheap to reach.
    struct Sv39Tiny;

    impl Paging for Sv39Tiny {
        const PAGE_SIZE: usize = Sv39::PAGE_SIZE;
        const LEVELS: &'static [PageTableLevel] = Sv39::LEVELS;
        const ASID_BITS: u32 = 2;
        const SCRATCH_BASE: VirtualAddress = Sv39::SCRATCH_BASE;
        type Entry = Sv39Entry;
    }

    #[test_log::test]
    fn identifier_exhaustion_evicts_and_closes_the_alias() {
        let mut f: Fixture<Sv39Tiny> = setup_with(1, KERNEL_BASE..Sv39::SCRATCH_BASE);

        let mut s1 = user_space(&mut f, USER_END);
        let mut s2 = user_space(&mut f, USER_END);
        let mut s3 = user_space(&mut f, USER_END);

        let virt = VirtualAddress::new(0x5000);
        let phys = PhysicalAddress::new(0x0100_0000);
        map(&f.vmem, &mut f.pool, &mut s1, virt, phys, RW);

        // run s1 and warm this core's cache under its identifier
        f.vmem.switch(&mut s1);
        let asid1 = f.vmem.asid_of(&s1).unwrap();
        assert_eq!(f.machine.probe(0, virt), Some((phys, RW)));

        // the identifier survives switching away: that is its entire point
        f.vmem.switch(&mut s2);
        f.vmem.switch(&mut s3);
        assert_eq!(f.vmem.asid_of(&s1), Some(asid1));

        // switching twice is idempotent
        let asid3 = f.vmem.asid_of(&s3).unwrap();
        f.vmem.switch(&mut s3);
        assert_eq!(f.vmem.asid_of(&s3), Some(asid3));

        // a fourth space exhausts the table; the sweep must evict someone
        // who is not live on this core
        let mut s4 = user_space(&mut f, USER_END);
        f.vmem.switch(&mut s4);
        let asid4 = f.vmem.asid_of(&s4).unwrap();

        assert_eq!(f.vmem.asid_of(&s3), Some(asid3), "evicted the live identifier");
        assert_eq!(f.machine.active_asid(0), asid4);
        assert_eq!(f.vmem.asid_of(&s1), None, "the clock should have taken s1's slot");
        assert_eq!(asid4, asid1, "the freed slot is the one recycled");

        // the recycled identifier was flushed everywhere before reuse:
        // probing it through s4 must not surface s1's stale translation
        assert_eq!(f.machine.probe(0, virt), None);
    }

    #[test_log::test]
    fn destroy_returns_every_table_frame_root_last() {
        let mut f = setup(1);
        let mut space = user_space(&mut f, USER_END);

        // two mappings in different coarse units: two disjoint subtrees
        let va1 = VirtualAddress::new(0x2000);
        let va2 = VirtualAddress::new(0x4000_3000);
        let phys = PhysicalAddress::new(0x0100_0000);
        map(&f.vmem, &mut f.pool, &mut space, va1, phys, RW);
        map(&f.vmem, &mut f.pool, &mut space, va2, phys, RW);

        f.vmem.switch(&mut space);
        assert!(f.vmem.asid_of(&space).is_some());

        let outstanding = f.pool.outstanding();

        let mut cursor = DestroyCursor::new();
        let mut reclaimed = Vec::new();
        while let Some(frame) = f.vmem.destroy(&mut space, &mut cursor) {
            reclaimed.push(frame);
        }

        // 2 levels of tables per subtree plus the root
        assert_eq!(reclaimed.len(), 5);
        assert_eq!(*reclaimed.last().unwrap(), space.root());
        let mut unique = reclaimed.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), reclaimed.len());

        // destruction released the identifier up front
        assert_eq!(f.vmem.asid_of(&space), None);

        // exhausted stays exhausted
        assert_eq!(f.vmem.destroy(&mut space, &mut cursor), None);

        for frame in reclaimed {
            f.pool.deallocate(frame);
        }
        assert_eq!(f.pool.outstanding(), outstanding - 5);
    }

    #[test_log::test]
    fn kernel_expand_resumes_after_frame_exhaustion() {
        let mut f = setup(1);

        let unit = Sv39::LEVELS[0].page_size();
        let end = KERNEL_BASE.checked_add(3 * unit).unwrap();
        let mut cursor = KERNEL_BASE;

        // a pool with a single frame covers exactly one unit
        let mut tiny = TestFrameAllocator::new(
            PhysicalAddress::new(3 * MIB)..PhysicalAddress::new(3 * MIB + 0x1000),
            Sv39::PAGE_SIZE,
        );
        assert_eq!(
            f.vmem.kernel_expand(&mut f.kernel, &mut cursor, end, &mut tiny),
            Err(Error::FrameExhausted)
        );
        assert_eq!(cursor, KERNEL_BASE.checked_add(unit).unwrap());

        // refill and resume from the cursor
        let mut refill = TestFrameAllocator::new(
            PhysicalAddress::new(3 * MIB + 0x1000)..PhysicalAddress::new(3 * MIB + 0x3000),
            Sv39::PAGE_SIZE,
        );
        f.vmem
            .kernel_expand(&mut f.kernel, &mut cursor, end, &mut refill)
            .unwrap();
        assert_eq!(cursor, end);

        // the reserved units now take mappings with a single spare each
        let virt = KERNEL_BASE.checked_add(2 * unit + 0x1000).unwrap();
        let spare = f.pool.frame();
        let phys = PhysicalAddress::new(0x1000);
        assert_eq!(
            f.vmem.enter(&mut f.kernel, virt, phys, KERNEL_RW, Some(spare)),
            Ok(None)
        );
        assert_eq!(f.vmem.resolve(&f.kernel, virt), Some((phys, KERNEL_RW)));
    }

    #[test_log::test]
    fn table_frames_classify_as_page_tables() {
        let mut f = setup(1);
        let mut space = user_space(&mut f, USER_END);

        let virt = VirtualAddress::new(0x2000);
        map(
            &f.vmem,
            &mut f.pool,
            &mut space,
            virt,
            PhysicalAddress::new(0x0100_0000),
            RW,
        );

        let map = FrameMap::new(
            PhysicalAddress::new(0x20_0000)..PhysicalAddress::new(0x28_0000),
            PhysicalAddress::new(0x0)..PhysicalAddress::new(0x1000),
            PhysicalAddress::new(0x28_0000)..PhysicalAddress::new(0x29_0000),
            PhysicalAddress::new(0x29_0000)..PhysicalAddress::new(0x2a_0000),
            PhysicalAddress::new(0x2a_0000)..PhysicalAddress::new(0x2a_1000),
        );

        // the root and both intermediate nodes are page-table frames
        assert_eq!(
            f.vmem.classify(&map, &space, space.root()),
            FrameKind::KernelOwned(KernelRole::PageTable)
        );

        let l1: Sv39Entry = f.machine.read_phys(space.root());
        assert_eq!(
            f.vmem.classify(&map, &space, l1.address()),
            FrameKind::KernelOwned(KernelRole::PageTable)
        );

        // everything else falls through to the snapshot
        assert_eq!(
            f.vmem.classify(&map, &space, PhysicalAddress::new(0x20_3000)),
            FrameKind::KernelOwned(KernelRole::Image)
        );
        assert_eq!(
            f.vmem.classify(&map, &space, PhysicalAddress::new(0x30_0000)),
            FrameKind::Free
        );
    }

    #[test_log::test]
    fn hierarchy_dump_lists_leaves() {
        use std::string::ToString;

        let mut f = setup(1);
        let mut space = user_space(&mut f, USER_END);

        let virt = VirtualAddress::new(0x4030_2000);
        let phys = PhysicalAddress::new(0x0100_0000);
        map(&f.vmem, &mut f.pool, &mut space, virt, phys, RW);

        let dump = f.vmem.display(&space).to_string();
        assert!(dump.contains(&std::format!("{virt}")), "missing leaf in:\n{dump}");
        assert!(dump.contains(&std::format!("{phys}")), "missing target in:\n{dump}");
    }

    #[test_log::test]
    fn two_level_format_satisfies_the_same_contract() {
        let kernel_bounds = VirtualAddress::new(0x8000_0000)..Sv32::SCRATCH_BASE;
        let mut f: Fixture<Sv32> = setup_with(1, kernel_bounds);
        let mut space = user_space(&mut f, VirtualAddress::new(0x8000_0000));

        let virt = VirtualAddress::new(0x40_2000);
        let phys = PhysicalAddress::new(0x30_0000);
        let attrs = Attrs::READ | Attrs::WRITE | Attrs::CACHED;

        // a two-level walk needs exactly one intermediate table
        assert_eq!(
            f.vmem.enter(&mut space, virt, phys, attrs, None),
            Err(Error::MissingTable)
        );
        let spare = f.pool.frame();
        assert_eq!(
            f.vmem.enter(&mut space, virt, phys, attrs, Some(spare)),
            Ok(None)
        );

        assert_eq!(f.vmem.resolve(&space, virt), Some((phys, attrs)));

        f.vmem.remove(&mut space, virt).unwrap();
        assert_eq!(f.vmem.resolve(&space, virt), None);
    }

    #[test_log::test]
    fn works_behind_the_in_tree_spin_lock() {
        let machine: Arc<Machine<Sv39>> = Arc::new(Machine::new(4 * MIB, 1));
        let arch = EmulateArch::new(Arc::clone(&machine));
        let mut pool = TestFrameAllocator::new(
            PhysicalAddress::new(0x1000)..PhysicalAddress::new(3 * MIB),
            Sv39::PAGE_SIZE,
        );

        let kernel_root = pool.frame();
        let (vmem, kernel): (Vmem<_, keel_spin::RawSpinMutex>, _) =
            Vmem::new(arch, kernel_root, KERNEL_BASE..Sv39::SCRATCH_BASE);

        let root = pool.frame();
        let mut space = vmem.create(&kernel, root, VirtualAddress::MIN..USER_END);

        let virt = VirtualAddress::new(0x8000);
        let phys = PhysicalAddress::new(0x0100_0000);
        loop {
            match vmem.enter(&mut space, virt, phys, RW, Some(pool.frame())) {
                Ok(_) => break,
                Err(Error::MissingTable) => {}
                Err(err) => panic!("enter failed: {err}"),
            }
        }

        assert_eq!(vmem.resolve(&space, virt), Some((phys, RW)));
    }

    /// Randomized concurrent editors and probers: any probe that starts
    /// after a `remove` returned must observe the page as unmapped, no
    /// matter how stale the probing core's cache was.
    #[test_log::test]
    fn concurrent_probers_never_see_removed_pages() {
        const PAGES: usize = 64;

        let mut f = setup(3);
        let mut space = user_space(&mut f, USER_END);

        f.vmem.switch(&mut space);
        let asid = f.vmem.asid_of(&space).unwrap();
        f.machine.set_active(1, space.root(), asid);
        f.machine.set_active(2, space.root(), asid);

        let Fixture {
            machine,
            vmem,
            kernel: _kernel,
            mut pool,
        } = f;

        let virt_of = |i: usize| VirtualAddress::new(0x40_0000 + i * 0x1000);
        let phys_of = |i: usize| PhysicalAddress::new(0x0100_0000 + i * 0x1000);

        let tombstones: Vec<AtomicBool> = (0..PAGES).map(|_| AtomicBool::new(false)).collect();
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            let vmem = &vmem;
            let machine = &machine;
            let tombstones = &tombstones;
            let done = &done;

            // editor on core 1: map, prime, remove, tombstone
            s.spawn(move || {
                machine.register_current_thread(1);

                for i in 0..PAGES {
                    map(vmem, &mut pool, &mut space, virt_of(i), phys_of(i), RW);
                    machine.prime(1, virt_of(i));

                    vmem.remove(&mut space, virt_of(i)).unwrap();
                    tombstones[i].store(true, Ordering::SeqCst);
                }

                done.store(true, Ordering::SeqCst);
            });

            // prober on core 2, racing the editor with a deliberately warm
            // cache
            s.spawn(move || {
                machine.register_current_thread(2);

                while !done.load(Ordering::SeqCst) {
                    for i in 0..PAGES {
                        let dead = tombstones[i].load(Ordering::SeqCst);
                        let probed = machine.probe(2, virt_of(i));

                        if dead {
                            assert_eq!(
                                probed, None,
                                "page {i} resolved after its removal completed"
                            );
                        }
                    }
                }
            });
        });

        // every page is gone on every core once the dust settles
        for i in 0..PAGES {
            assert_eq!(machine.probe(0, virt_of(i)), None);
            assert_eq!(machine.probe(1, virt_of(i)), None);
            assert_eq!(machine.probe(2, virt_of(i)), None);
        }
    }
}
