// Copyright 2026 The keel developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

bitflags::bitflags! {
    /// Architecture-neutral mapping attributes.
    ///
    /// The engine, the identifier allocator, and the coherence coordinator
    /// only ever see this set; each architecture adapter translates it to
    /// and from its own descriptor bits. Presence is not an attribute:
    /// entering a page with an empty set clears the leaf instead.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Attrs: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Accessible from user mode.
        const USER = 1 << 3;
        /// May be kept in the data caches.
        const CACHED = 1 << 4;
        /// Translation survives identifier-tagged cache flushes; used for
        /// the shared kernel range.
        const GLOBAL = 1 << 5;
    }
}

impl fmt::Display for Attrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        bitflags::parser::to_writer(self, f)
    }
}
