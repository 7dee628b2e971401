// Copyright 2026 The keel developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Physical-frame classification.
//!
//! [`FrameMap`] is a snapshot of where the kernel's fixed structures live
//! in physical memory; [`FrameMap::classify`] is a pure function over it.
//! The frame allocator consults it to decide reuse eligibility, the OOM
//! scanner renders it through [`PhysicalMapDisplay`], and
//! [`Vmem::classify`](crate::Vmem::classify) layers per-space page-table
//! detection on top.

use core::fmt;
use core::ops::Range;

use arrayvec::ArrayVec;

use crate::PhysicalAddress;

const MAX_APP_RANGES: usize = 32;

/// What occupies a physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Free,
    /// Reserved at boot, e.g. firmware structures.
    BootOwned,
    KernelOwned(KernelRole),
    AppOwned,
}

/// The role of a kernel-owned frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelRole {
    /// A node of some address space's translation hierarchy.
    PageTable,
    /// Part of the kernel image itself.
    Image,
    Stack,
    Heap,
    /// The system information page shared with early boot.
    SysPage,
}

/// Snapshot of the fixed physical-memory layout.
pub struct FrameMap {
    kernel_image: Range<PhysicalAddress>,
    boot_reserved: Range<PhysicalAddress>,
    kernel_stacks: Range<PhysicalAddress>,
    kernel_heap: Range<PhysicalAddress>,
    syspage: Range<PhysicalAddress>,
    app: ArrayVec<Range<PhysicalAddress>, MAX_APP_RANGES>,
}

impl FrameMap {
    pub fn new(
        kernel_image: Range<PhysicalAddress>,
        boot_reserved: Range<PhysicalAddress>,
        kernel_stacks: Range<PhysicalAddress>,
        kernel_heap: Range<PhysicalAddress>,
        syspage: Range<PhysicalAddress>,
    ) -> Self {
        Self {
            kernel_image,
            boot_reserved,
            kernel_stacks,
            kernel_heap,
            syspage,
            app: ArrayVec::new(),
        }
    }

    /// Record a range of frames as owned by an application.
    ///
    /// # Panics
    ///
    /// Panics if more than the supported number of application ranges are
    /// registered; the range count is a static property of the board
    /// configuration.
    pub fn register_app_range(&mut self, range: Range<PhysicalAddress>) {
        assert!(
            self.app.try_push(range).is_ok(),
            "too many application frame ranges registered"
        );
    }

    /// Classify `frame`. Pure; page-table nodes are only distinguishable
    /// through [`Vmem::classify`](crate::Vmem::classify), which knows the
    /// hierarchy.
    pub fn classify(&self, frame: PhysicalAddress) -> FrameKind {
        if self.boot_reserved.contains(&frame) {
            FrameKind::BootOwned
        } else if self.syspage.contains(&frame) {
            FrameKind::KernelOwned(KernelRole::SysPage)
        } else if self.kernel_image.contains(&frame) {
            FrameKind::KernelOwned(KernelRole::Image)
        } else if self.kernel_stacks.contains(&frame) {
            FrameKind::KernelOwned(KernelRole::Stack)
        } else if self.kernel_heap.contains(&frame) {
            FrameKind::KernelOwned(KernelRole::Heap)
        } else if self.app.iter().any(|range| range.contains(&frame)) {
            FrameKind::AppOwned
        } else {
            FrameKind::Free
        }
    }

    /// Render the classification of `range` as a physical-memory map, one
    /// line per run of identically-classified pages.
    pub fn display(&self, range: Range<PhysicalAddress>, page_size: usize) -> PhysicalMapDisplay<'_> {
        PhysicalMapDisplay {
            map: self,
            range,
            page_size,
        }
    }
}

pub struct PhysicalMapDisplay<'a> {
    map: &'a FrameMap,
    range: Range<PhysicalAddress>,
    page_size: usize,
}

impl fmt::Display for PhysicalMapDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut cursor = self.range.start.align_down(self.page_size);
        while cursor < self.range.end {
            let kind = self.map.classify(cursor);

            let mut end = cursor;
            while end < self.range.end && self.map.classify(end) == kind {
                let Some(next) = end.checked_add(self.page_size) else {
                    break;
                };
                end = next;
            }

            writeln!(f, "{cursor}..{end} {kind:?}")?;
            if end == cursor {
                break;
            }
            cursor = end;
        }

        Ok(())
    }
}
