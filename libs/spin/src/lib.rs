// Copyright 2026 The keel developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Spin-lock building blocks for keel.
//!
//! The locks in this crate only spin; they never mask interrupts. Code that
//! must not be interrupted while holding a lock (notably the virtual-memory
//! subsystem, whose lock is also taken from the TLB-shootdown path) has to
//! wrap [`RawSpinMutex`] in the target HAL's interrupt gate.

#![no_std]

mod backoff;
mod mutex;

pub use backoff::Backoff;
pub use mutex::{RawSpinMutex, SpinMutex, SpinMutexGuard};
