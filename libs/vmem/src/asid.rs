// Copyright 2026 The keel developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Address-space-identifier slot table.
//!
//! The slot index *is* the identifier. Slot 0 belongs to the kernel space
//! for the whole lifetime of the system; user spaces rotate through the
//! remaining slots, with a clock sweep evicting a victim once the table is
//! full. The table is only ever touched under the subsystem's global lock.

use crate::aspace::SpaceId;

/// Capacity of the slot table. Architectures reporting a wider identifier
/// field are clamped to this.
pub const MAX_ASID_SLOTS: usize = 256;

pub(crate) const KERNEL_ASID: u16 = 0;

pub(crate) struct AsidSlots {
    slots: [Option<SpaceId>; MAX_ASID_SLOTS],
    /// Slots usable on this hardware, including slot 0.
    count: usize,
    /// Occupied slots, including slot 0.
    occupied: usize,
    /// Rotation cursor, always in `1..count`.
    clock: usize,
}

impl AsidSlots {
    pub(crate) fn new(asid_bits: u32, kernel: SpaceId) -> Self {
        let count = (1_usize << asid_bits.min(16)).min(MAX_ASID_SLOTS);
        assert!(count >= 2, "need at least one user identifier besides the kernel's");

        let mut slots = [None; MAX_ASID_SLOTS];
        slots[0] = Some(kernel);

        Self {
            slots,
            count,
            occupied: 1,
            clock: 1,
        }
    }

    /// The identifier currently owned by `id`, if any.
    pub(crate) fn lookup(&self, id: SpaceId) -> Option<u16> {
        self.slots[..self.count]
            .iter()
            .position(|slot| *slot == Some(id))
            .map(to_asid)
    }

    /// Assign an identifier to `id`, evicting a victim if the table is
    /// full. Idempotent for a space that already holds a slot.
    ///
    /// `live` is the identifier the calling core is translating through
    /// right now; the eviction sweep never selects it, so an allocation
    /// can never yank the identifier out from under its own caller.
    ///
    /// Returns the identifier and whether the slot was recycled from a
    /// previous owner. A recycled identifier may still tag translations in
    /// some core's cache: the caller must flush it everywhere before the
    /// new owner's first memory reference.
    pub(crate) fn allocate(&mut self, id: SpaceId, live: u16) -> (u16, bool) {
        if let Some(asid) = self.lookup(id) {
            return (asid, false);
        }

        let index = if self.occupied < self.count {
            self.scan_vacant()
        } else {
            self.evict(live)
        };

        let recycled = self.occupied == self.count;
        if !recycled {
            self.occupied += 1;
        }

        self.slots[index] = Some(id);
        self.clock = self.advance(index);

        self.assert_bijective();

        (to_asid(index), recycled)
    }

    /// Release the identifier owned by `id`, if any, and keep the table
    /// dense by swapping the highest occupied slot into the hole.
    ///
    /// Returns the identifier that was freed. The moved occupant silently
    /// changes identifier; its orphaned cache entries are tagged with a
    /// now-vacant slot and are flushed when that slot is next recycled.
    pub(crate) fn deallocate(&mut self, id: SpaceId) -> Option<u16> {
        let index = self.lookup(id)? as usize;
        debug_assert_ne!(index, 0, "the kernel identifier is never released");

        let last = self.slots[1..self.count]
            .iter()
            .rposition(Option::is_some)
            .map(|i| i + 1)
            .expect("an occupied slot must exist");

        if last != index {
            self.slots[index] = self.slots[last].take();
            log::debug!("identifier compaction moved slot {last} into slot {index}");
        } else {
            self.slots[index] = None;
        }

        self.occupied -= 1;

        self.assert_bijective();

        Some(to_asid(index))
    }

    /// Rotate the cursor to the next vacant slot. Only called while one
    /// exists.
    fn scan_vacant(&mut self) -> usize {
        let mut index = self.clock;

        for _ in 0..self.count {
            if self.slots[index].is_none() {
                return index;
            }
            index = self.advance(index);
        }

        unreachable!("scan_vacant called with a full table");
    }

    /// Clock sweep: evict the occupant at the cursor unless it is the
    /// identifier the calling core is actively translating through.
    fn evict(&mut self, live: u16) -> usize {
        let mut index = self.clock;

        // At most one slot can match `live`, so two sweeps always suffice.
        for _ in 0..2 * self.count {
            if to_asid(index) != live {
                let evicted = self.slots[index].take();
                log::debug!("evicting identifier {index} from {evicted:?}");
                return index;
            }
            index = self.advance(index);
        }

        unreachable!("eviction sweep found no victim");
    }

    fn advance(&self, index: usize) -> usize {
        // slot 0 is the kernel's and never part of the rotation
        if index + 1 >= self.count { 1 } else { index + 1 }
    }

    fn assert_bijective(&self) {
        #[cfg(debug_assertions)]
        for (i, slot) in self.slots[..self.count].iter().enumerate() {
            let Some(id) = slot else { continue };
            debug_assert!(
                !self.slots[i + 1..self.count].contains(&Some(*id)),
                "space {id:?} owns more than one identifier slot"
            );
        }
    }
}

#[expect(clippy::cast_possible_truncation, reason = "slot indices are bounded by MAX_ASID_SLOTS")]
fn to_asid(index: usize) -> u16 {
    debug_assert!(index < MAX_ASID_SLOTS);
    index as u16
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn space(n: u64) -> SpaceId {
        SpaceId::from_raw(n)
    }

    #[test]
    fn allocate_is_idempotent() {
        let mut slots = AsidSlots::new(8, space(0));

        let (a, _) = slots.allocate(space(1), KERNEL_ASID);
        let (b, recycled) = slots.allocate(space(1), KERNEL_ASID);

        assert_eq!(a, b);
        assert!(!recycled);
    }

    #[test]
    fn kernel_slot_is_never_allocated() {
        // 2 identifier bits: slots 1..4 for users, forcing eviction after
        // the third allocation
        let mut slots = AsidSlots::new(2, space(0));

        for n in 1..=6 {
            let (asid, _) = slots.allocate(space(n), KERNEL_ASID);
            assert_ne!(asid, KERNEL_ASID);
        }
    }

    #[test]
    fn exhaustion_evicts_a_non_live_slot() {
        let mut slots = AsidSlots::new(2, space(0)); // slots 1..4 for users

        let mut asids = [0_u16; 3];
        for (n, asid) in asids.iter_mut().enumerate() {
            let (a, recycled) = slots.allocate(space(n as u64 + 1), KERNEL_ASID);
            assert!(!recycled);
            *asid = a;
        }

        // table is full; pretend the caller is live on `asids[0]`
        let (evicted, recycled) = slots.allocate(space(100), asids[0]);
        assert!(recycled);
        assert_ne!(evicted, asids[0]);
        assert_ne!(evicted, KERNEL_ASID);

        // the previous owner of the recycled slot lost its assignment
        let orphan = (1..=3_u64)
            .map(space)
            .find(|id| slots.lookup(*id).is_none())
            .unwrap();
        assert_ne!(orphan, space(1));
    }

    #[test]
    fn deallocate_compacts_the_last_slot() {
        let mut slots = AsidSlots::new(8, space(0));

        let (a1, _) = slots.allocate(space(1), KERNEL_ASID);
        let (_a2, _) = slots.allocate(space(2), KERNEL_ASID);
        let (a3, _) = slots.allocate(space(3), KERNEL_ASID);

        assert_eq!(slots.deallocate(space(1)), Some(a1));
        // the highest occupied slot moved into the hole
        assert_eq!(slots.lookup(space(3)), Some(a1));
        assert_eq!(slots.lookup(space(1)), None);
        assert!(slots.lookup(space(2)).is_some());
        assert_ne!(slots.lookup(space(3)), Some(a3));
    }

    proptest! {
        /// After any sequence of allocations and deallocations, no space
        /// owns two slots and no slot is owned by two spaces.
        #[test]
        fn bijection_holds(ops in prop::collection::vec((0..40_u64, prop::bool::ANY), 1..200)) {
            let mut slots = AsidSlots::new(4, space(1000)); // 16 slots

            for (n, dealloc) in ops {
                let id = space(n);
                if dealloc {
                    slots.deallocate(id);
                } else {
                    let (asid, _) = slots.allocate(id, KERNEL_ASID);
                    prop_assert!(asid != KERNEL_ASID);
                    prop_assert_eq!(slots.lookup(id), Some(asid));
                }
                // the internal debug assertion has already checked
                // bijectivity; re-check ownership count here
                let owned: usize = (0..=40_u64)
                    .filter(|m| slots.lookup(space(*m)).is_some())
                    .count();
                prop_assert!(owned <= 16);
            }
        }
    }
}
