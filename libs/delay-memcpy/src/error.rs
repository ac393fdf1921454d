// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::Range;
use std::io;

use crate::address::VirtualAddress;
use crate::protect::Protection;

#[derive(Debug, onlyerror::Error)]
pub enum Error {
    /// The operating system refused to change the protection of a page range.
    #[error("failed to make {pages:?} {protection:?}: {source}")]
    Protect {
        pages: Range<VirtualAddress>,
        protection: Protection,
        #[source]
        source: io::Error,
    },
    /// A protection fault hit an address that no pending copy claims.
    #[error("no pending copy claims the faulting address {0}")]
    Unclaimed(VirtualAddress),
    #[error("system page size {0} is not a power of two")]
    PageSize(usize),
    #[error("failed to install the handler for signal {signal}: {source}")]
    InstallHandler {
        signal: i32,
        #[source]
        source: io::Error,
    },
    /// `delay_memcpy` was called before `initialize`.
    #[error("deferred copies are not initialized")]
    Uninitialized,
}
