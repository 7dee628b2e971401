// Copyright 2026 The keel developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::Backoff;

pub type SpinMutex<T> = lock_api::Mutex<RawSpinMutex, T>;
pub type SpinMutexGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinMutex, T>;

/// A test-and-test-and-set spin lock.
///
/// Contending cores spin on a relaxed load and only retry the
/// compare-exchange once the lock reads as free, with [`Backoff`] pacing the
/// inner wait loop.
pub struct RawSpinMutex {
    locked: AtomicBool,
}

// Safety: the compare-exchange on `locked` provides the acquire/release
// pairing lock_api requires; a successful `lock`/`try_lock` is the only way
// the protected data is reached.
unsafe impl lock_api::RawMutex for RawSpinMutex {
    type GuardMarker = lock_api::GuardSend;

    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    fn lock(&self) {
        let mut boff = Backoff::new();

        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.is_locked() {
                boff.spin();
            }
            boff.reset();
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}
