// Copyright 2026 The keel developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::mem;
use core::ops::Range;

use arrayvec::ArrayVec;

use crate::VirtualAddress;
use crate::arch::{Arch, FlushScope};

/// Ranges a single structural edit can accumulate before the set widens to
/// a full flush.
const MAX_PENDING_RANGES: usize = 8;

/// The pending-invalidation set of one structural edit.
///
/// Created after the global lock is taken, filled while the tables are
/// edited, and consumed by [`commit`][Flush::commit] — which performs the
/// local fence, then the cross-core shootdown, and only then releases the
/// guard it is given. The set never survives a lock release; dropping one
/// with pending work is a bug and is logged as such.
///
/// A `scope` of `None` means the address space holds no identifier. No
/// translation tagged for it can be cached anywhere then — eviction flushes
/// a recycled identifier everywhere before the lock protecting it is
/// released — so such edits need no fence at all.
#[must_use]
pub(crate) struct Flush {
    scope: Option<FlushScope>,
    ranges: ArrayVec<Range<VirtualAddress>, MAX_PENDING_RANGES>,
    all: bool,
}

impl Flush {
    pub(crate) fn new(scope: Option<FlushScope>) -> Self {
        Self {
            scope,
            ranges: ArrayVec::new(),
            all: false,
        }
    }

    /// Record that `range`'s translations changed.
    pub(crate) fn pend(&mut self, range: Range<VirtualAddress>) {
        if self.scope.is_none() || self.all {
            return;
        }

        if self.ranges.try_push(range).is_err() {
            log::trace!("pending-invalidation set overflowed, widening to a full flush");
            self.all = true;
        }
    }

    /// Make every recorded invalidation visible on all cores, then release
    /// `guard`.
    ///
    /// The local fences retire before the unlock so a second editor's own
    /// local flush ordering cannot race ours; the remote fences complete
    /// before return per [`Arch::fence_remote`]'s delivery-before-return
    /// contract.
    pub(crate) fn commit<A: Arch, G>(self, arch: &A, guard: G) {
        if let Some(scope) = self.scope {
            if self.all {
                match scope {
                    FlushScope::Asid(asid) => arch.fence_asid(asid),
                    FlushScope::Global => arch.fence_all(),
                }
                arch.fence_remote(scope, None);
            } else {
                for range in &self.ranges {
                    log::trace!("flushing {:?}..{:?} ({scope:?})", range.start, range.end);
                    arch.fence(scope, range.clone());
                }
                for range in &self.ranges {
                    arch.fence_remote(scope, Some(range.clone()));
                }
            }
        }

        drop(guard);
        mem::forget(self);
    }
}

impl Drop for Flush {
    fn drop(&mut self) {
        if self.all || !self.ranges.is_empty() {
            log::error!("pending TLB invalidations dropped without commit");
        }
    }
}
