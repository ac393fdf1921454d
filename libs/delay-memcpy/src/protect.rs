// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::Range;
use std::io;

use crate::address::{AddressRangeExt, VirtualAddress};
use crate::error::Error;
use crate::page::PageSize;

/// Access permissions a page can be switched between while a copy is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    /// Any access faults. Used for destination pages that have not been copied yet.
    NoAccess,
    /// Writes fault. Used for source pages so their contents stay frozen until copied.
    ReadOnly,
    /// Normal access, restored once a page has been copied.
    ReadWrite,
}

impl Protection {
    pub const fn as_prot(self) -> libc::c_int {
        match self {
            Protection::NoAccess => libc::PROT_NONE,
            Protection::ReadOnly => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// Changes the access permissions of whole pages.
///
/// Implementations are called from the fault handler and therefore must be async-signal-safe:
/// no allocation, no locks, no buffered IO.
pub trait Protect {
    /// Applies `protection` to `pages`, which is always page aligned on both ends.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protect`] if the permission change was rejected.
    fn protect(&self, pages: Range<VirtualAddress>, protection: Protection) -> crate::Result<()>;
}

/// The production backend, a thin wrapper around `mprotect(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mprotect;

impl Protect for Mprotect {
    fn protect(&self, pages: Range<VirtualAddress>, protection: Protection) -> crate::Result<()> {
        // Safety: the caller of `delay_memcpy` guarantees that the pages are mapped and owned by it
        // for as long as a copy touching them is pending.
        let ret = unsafe {
            libc::mprotect(
                pages.start.as_mut_ptr().cast(),
                pages.len(),
                protection.as_prot(),
            )
        };

        if ret == 0 {
            Ok(())
        } else {
            Err(Error::Protect {
                pages,
                protection,
                source: io::Error::last_os_error(),
            })
        }
    }
}

/// Changes the protection of every page that `[addr, addr + size)` touches.
///
/// `addr` is rounded down to its page boundary and the length grows by the same amount, so
/// arbitrary unaligned sub-ranges can be passed in.
///
/// # Errors
///
/// Returns [`Error::Protect`] if the backend rejected the change.
pub fn protect_pages<P: Protect + ?Sized>(
    protector: &P,
    page_size: PageSize,
    addr: VirtualAddress,
    size: usize,
    protection: Protection,
) -> crate::Result<()> {
    protector.protect(page_size.enclosing_pages(addr, size), protection)
}
