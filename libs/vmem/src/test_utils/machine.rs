// Copyright 2026 The keel developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::thread::{self, ThreadId};
use std::vec::Vec;

use parking_lot::Mutex;

use crate::arch::{FlushScope, PageTableEntry, Paging};
use crate::{Attrs, PhysicalAddress, VirtualAddress};

/// An emulated multi-core machine.
///
/// Physical memory is a flat byte array addressed from zero. Every core
/// has its own translation cache filled on demand during
/// [`probe`][Machine::probe]; cached entries survive — and go stale —
/// until an explicit fence removes them, exactly like a hardware TLB. The
/// scratch slot is one global descriptor consulted for the
/// [`Paging::SCRATCH_BASE`] page.
///
/// Threads participate as cores by registering; cores that no thread
/// drives can still be steered from the outside (activated, primed,
/// probed), which is how single-threaded tests model "another core".
pub struct Machine<P: Paging> {
    state: Mutex<State<P>>,
}

struct State<P: Paging> {
    memory: Vec<u8>,
    cpus: Vec<Cpu<P>>,
    scratch_frame: Option<PhysicalAddress>,
    registered: HashMap<ThreadId, usize>,
}

struct Cpu<P: Paging> {
    active: Option<(PhysicalAddress, u16)>,
    /// Cached translations keyed by `(identifier, page)`; `None` tags
    /// entries that survive identifier-scoped fences (global mappings and
    /// the scratch slot).
    tlb: BTreeMap<(Option<u16>, usize), (PhysicalAddress, Attrs)>,
    /// A stalled core stops acknowledging shootdowns; see
    /// [`Machine::stall`].
    stalled: bool,
    _p: core::marker::PhantomData<P>,
}

impl<P: Paging> Cpu<P> {
    fn new() -> Self {
        Self {
            active: None,
            tlb: BTreeMap::new(),
            stalled: false,
            _p: core::marker::PhantomData,
        }
    }
}

impl<P: Paging> Machine<P> {
    /// A machine with `memory` bytes of physical memory and `cores`
    /// cores. The constructing thread is registered as core 0.
    pub fn new(memory: usize, cores: usize) -> Self {
        assert!(cores >= 1);

        let mut registered = HashMap::new();
        registered.insert(thread::current().id(), 0);

        Self {
            state: Mutex::new(State {
                memory: std::vec![0; memory],
                cpus: (0..cores).map(|_| Cpu::new()).collect(),
                scratch_frame: None,
                registered,
            }),
        }
    }

    /// Register the calling thread to drive `core`.
    pub fn register_current_thread(&self, core: usize) {
        let mut state = self.state.lock();
        assert!(core < state.cpus.len());
        state.registered.insert(thread::current().id(), core);
    }

    /// The core the calling thread drives.
    ///
    /// # Panics
    ///
    /// Panics if the thread was never registered.
    pub fn current_core(&self) -> usize {
        *self
            .state
            .lock()
            .registered
            .get(&thread::current().id())
            .expect("calling thread is not registered as a core")
    }

    pub fn core_count(&self) -> usize {
        self.state.lock().cpus.len()
    }

    /// Make `core` stop acknowledging shootdowns. The next remote fence
    /// targeting it halts the machine, which is the specified fatal
    /// outcome.
    pub fn stall(&self, core: usize) {
        self.state.lock().cpus[core].stalled = true;
    }

    // ===== per-core translation =====

    /// Translate `virt` on `core` the way the hardware would: cached
    /// entry first — stale or not — then a table walk that fills the
    /// cache.
    pub fn probe(&self, core: usize, virt: VirtualAddress) -> Option<(PhysicalAddress, Attrs)> {
        let mut state = self.state.lock();
        state
            .translate(core, virt)
            .map(|(frame, attrs)| (frame.checked_add(Self::page_offset(virt)).unwrap(), attrs))
    }

    /// Warm `core`'s translation cache for `virt`.
    pub fn prime(&self, core: usize, virt: VirtualAddress) {
        let _ = self.probe(core, virt);
    }

    pub fn set_active(&self, core: usize, root: PhysicalAddress, asid: u16) {
        self.state.lock().cpus[core].active = Some((root, asid));
    }

    pub fn active_asid(&self, core: usize) -> u16 {
        self.state.lock().cpus[core]
            .active
            .map(|(_, asid)| asid)
            .unwrap_or(0)
    }

    // ===== scratch slot =====

    pub fn set_scratch(&self, frame: PhysicalAddress) {
        self.state.lock().scratch_frame = Some(frame);
    }

    // ===== fences =====

    pub fn fence(&self, core: usize, scope: FlushScope, range: Range<VirtualAddress>) {
        self.state.lock().fence(core, scope, &range);
    }

    pub fn fence_asid(&self, core: usize, asid: u16) {
        self.state.lock().cpus[core]
            .tlb
            .retain(|(tag, _), _| *tag != Some(asid));
    }

    pub fn fence_all(&self, core: usize) {
        self.state.lock().cpus[core].tlb.clear();
    }

    /// Deliver an invalidation to every core but `origin` and wait for
    /// each acknowledgment before returning.
    ///
    /// # Panics
    ///
    /// Halts (panics) if a targeted core does not acknowledge, the fatal
    /// shootdown-timeout condition.
    pub fn shootdown(&self, origin: usize, scope: FlushScope, range: Option<Range<VirtualAddress>>) {
        let mut state = self.state.lock();

        for core in 0..state.cpus.len() {
            if core == origin {
                continue;
            }

            assert!(
                !state.cpus[core].stalled,
                "core {core} failed to acknowledge shootdown, halting"
            );

            match (&range, scope) {
                (Some(range), scope) => state.fence(core, scope, range),
                (None, FlushScope::Asid(asid)) => {
                    state.cpus[core].tlb.retain(|(tag, _), _| *tag != Some(asid));
                }
                (None, FlushScope::Global) => state.cpus[core].tlb.clear(),
            }
        }

        log::trace!("shootdown from core {origin} acknowledged ({scope:?}, {range:?})");
    }

    // ===== physical memory =====

    /// # Panics
    ///
    /// Panics if the access is outside physical memory.
    pub fn read_phys<T: Copy>(&self, addr: PhysicalAddress) -> T {
        self.state.lock().read_phys(addr)
    }

    /// # Panics
    ///
    /// Panics if the access is outside physical memory.
    pub fn write_phys<T: Copy>(&self, addr: PhysicalAddress, value: T) {
        self.state.lock().write_phys(addr, value);
    }

    pub fn fill_phys(&self, addr: PhysicalAddress, value: u8, count: usize) {
        let mut state = self.state.lock();
        let offset = addr.get();
        assert!(offset + count <= state.memory.len());
        state.memory[offset..offset + count].fill(value);
    }

    // ===== translated access (used by EmulateArch) =====

    pub fn read<T: Copy>(&self, core: usize, virt: VirtualAddress) -> T {
        let mut state = self.state.lock();
        let (frame, _attrs) = state
            .translate(core, virt)
            .unwrap_or_else(|| panic!("read: {virt} not mapped on core {core}"));
        state.read_phys(frame.checked_add(Self::page_offset(virt)).unwrap())
    }

    pub fn write<T: Copy>(&self, core: usize, virt: VirtualAddress, value: T) {
        let mut state = self.state.lock();
        let (frame, _attrs) = state
            .translate(core, virt)
            .unwrap_or_else(|| panic!("write: {virt} not mapped on core {core}"));
        state.write_phys(frame.checked_add(Self::page_offset(virt)).unwrap(), value);
    }

    pub fn write_bytes(&self, core: usize, virt: VirtualAddress, value: u8, count: usize) {
        assert!(virt.is_aligned_to(P::PAGE_SIZE) && count <= P::PAGE_SIZE);

        let mut state = self.state.lock();
        let (frame, _attrs) = state
            .translate(core, virt)
            .unwrap_or_else(|| panic!("write_bytes: {virt} not mapped on core {core}"));
        let offset = frame.get();
        assert!(offset + count <= state.memory.len());
        state.memory[offset..offset + count].fill(value);
    }

    fn page_offset(virt: VirtualAddress) -> usize {
        virt.get() & (P::PAGE_SIZE - 1)
    }
}

impl<P: Paging> State<P> {
    fn translate(&mut self, core: usize, virt: VirtualAddress) -> Option<(PhysicalAddress, Attrs)> {
        let page = virt.get() & !(P::PAGE_SIZE - 1);

        // the scratch slot: a single global descriptor, cached like any
        // other translation
        if page == P::SCRATCH_BASE.get() {
            if let Some(entry) = self.cpus[core].tlb.get(&(None, page)) {
                return Some(*entry);
            }

            let frame = self.scratch_frame?;
            let attrs = Attrs::READ | Attrs::WRITE | Attrs::GLOBAL;
            self.cpus[core].tlb.insert((None, page), (frame, attrs));
            return Some((frame, attrs));
        }

        let Some((root, asid)) = self.cpus[core].active else {
            // bare mode before any activation: virtual == physical
            return Some((PhysicalAddress::new(page), Attrs::all()));
        };

        if let Some(entry) = self.cpus[core].tlb.get(&(None, page)) {
            return Some(*entry);
        }
        if let Some(entry) = self.cpus[core].tlb.get(&(Some(asid), page)) {
            return Some(*entry);
        }

        let (frame, attrs) = self.walk(root, virt)?;
        let tag = if attrs.contains(Attrs::GLOBAL) { None } else { Some(asid) };
        self.cpus[core].tlb.insert((tag, page), (frame, attrs));

        Some((frame, attrs))
    }

    fn walk(&self, root: PhysicalAddress, virt: VirtualAddress) -> Option<(PhysicalAddress, Attrs)> {
        let mut table = root;

        for level in P::LEVELS {
            let index = level.index_of(virt);
            let entry: P::Entry =
                self.read_phys(table.checked_add(index * size_of::<P::Entry>()).unwrap());

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

    fn fence(&mut self, core: usize, scope: FlushScope, range: &Range<VirtualAddress>) {
        self.cpus[core].tlb.retain(|(tag, page), _| {
            let in_range = *page >= range.start.get() && *page < range.end.get();
            if !in_range {
                return true;
            }
            match scope {
                // identifier-scoped fences leave global entries alone
                FlushScope::Asid(asid) => *tag != Some(asid),
                FlushScope::Global => false,
            }
        });
    }

    fn read_phys<T: Copy>(&self, addr: PhysicalAddress) -> T {
        let offset = addr.get();
        assert!(
            offset + size_of::<T>() <= self.memory.len(),
            "physical read at {addr} outside memory"
        );
        // Safety: bounds checked above; read_unaligned has no alignment
        // requirement.
        unsafe { self.memory.as_ptr().add(offset).cast::<T>().read_unaligned() }
    }

    fn write_phys<T: Copy>(&mut self, addr: PhysicalAddress, value: T) {
        let offset = addr.get();
        assert!(
            offset + size_of::<T>() <= self.memory.len(),
            "physical write at {addr} outside memory"
        );
        // Safety: bounds checked above; write_unaligned has no alignment
        // requirement.
        unsafe {
            self.memory
                .as_mut_ptr()
                .add(offset)
                .cast::<T>()
                .write_unaligned(value);
        }
    }
}
