// Copyright 2026 The keel developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Virtual address-space management for keel.
//!
//! This crate maintains the per-core translation structures of a multi-core
//! kernel: it builds and edits multi-level page tables through a single
//! process-wide scratch window, hands out the hardware's limited
//! address-space identifiers, and keeps every core's translation cache
//! coherent with the tables through local fences and cross-core shootdown.
//!
//! The crate performs no allocation. Table frames are supplied by the
//! caller one page at a time and handed back through [`Vmem::destroy`];
//! everything else lives in fixed-capacity structures. One global lock
//! serializes all structural edits — the scratch window, the identifier
//! table, and the pending-invalidation set are only reachable while it is
//! held.

#![no_std]

#[cfg(any(test, feature = "test_utils"))]
extern crate std;

pub mod arch;
mod address;
mod asid;
mod aspace;
mod attrs;
mod flush;
mod frame;
mod scratch;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

use core::fmt;

pub use address::{AddressRangeExt, PhysicalAddress, VirtualAddress};
pub use asid::MAX_ASID_SLOTS;
pub use aspace::{AddressSpace, AddressSpaceDisplay, DestroyCursor, SpaceId, Vmem};
pub use attrs::Attrs;
pub use frame::{FrameKind, FrameMap, KernelRole, PhysicalMapDisplay};

pub type Result<T> = core::result::Result<T, Error>;

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * KIB;
pub const GIB: usize = 1024 * MIB;

/// Errors surfaced by the structural-edit operations.
///
/// Everything else in this crate is total: looking up an unmapped address
/// or removing an already-absent mapping are ordinary results, and a remote
/// core failing to acknowledge a shootdown is fatal (the architecture
/// primitive halts) rather than an error value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An intermediate table is absent and no spare frame was supplied to
    /// create it. Recoverable: retry the call with a frame.
    MissingTable,
    /// The virtual address lies outside the address space's bounds. A
    /// programming error in the caller; never retried.
    OutOfRange {
        virt: VirtualAddress,
        start: VirtualAddress,
        end: VirtualAddress,
    },
    /// The frame source could not produce a frame. Surfaced to the
    /// memory-pressure path, not handled here.
    FrameExhausted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MissingTable => {
                f.write_str("an intermediate translation table is absent and no frame was supplied")
            }
            Error::OutOfRange { virt, start, end } => write!(
                f,
                "address {virt} is outside the address space bounds {start}..{end}"
            ),
            Error::FrameExhausted => f.write_str("the frame source is exhausted"),
        }
    }
}

impl core::error::Error for Error {}

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $error:expr) => {
        if !$cond {
            return Err($error);
        }
    };
}

/// Source of physical page frames, implemented by the kernel's frame
/// allocator.
///
/// Frames handed out must be page-sized, page-aligned, and physically
/// contiguous with themselves; the engine zeroes what it uses, so their
/// prior contents do not matter.
pub trait FrameAllocator {
    fn allocate(&mut self) -> Option<PhysicalAddress>;
    fn deallocate(&mut self, frame: PhysicalAddress);
}
