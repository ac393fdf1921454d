// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Page arithmetic.
//!
//! Everything here is pure and allocation free, the fault handler calls into it from signal
//! context.

use core::ops::Range;

use crate::address::{AddressRangeExt, VirtualAddress};
use crate::error::Error;

/// The granularity at which the operating system enforces memory protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSize(usize);

impl PageSize {
    /// Returns `None` if `size` is not a power of two.
    pub const fn new(size: usize) -> Option<Self> {
        if size.is_power_of_two() {
            Some(Self(size))
        } else {
            None
        }
    }

    /// Queries the page size of the running system.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageSize`] if the reported size is not a power of two.
    pub fn system() -> crate::Result<Self> {
        // Safety: sysconf has no preconditions
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let size = usize::try_from(raw).map_err(|_| Error::PageSize(0))?;
        Self::new(size).ok_or(Error::PageSize(size))
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Rounds `addr` down to the start of the page that contains it.
    #[inline]
    pub const fn page_start(self, addr: VirtualAddress) -> VirtualAddress {
        addr.align_down(self.0)
    }

    /// Returns `true` if `addr` lies in the page range spanned by `[start, start + size)`, that is
    /// the page of `start`, the page of `start + size - 1` or any page between them.
    ///
    /// For `size == 0` this tests whether `addr` is on the page that contains `start`.
    pub fn in_page_range(self, start: VirtualAddress, size: usize, addr: VirtualAddress) -> bool {
        let first = self.page_start(start);
        let last = self.page_start(last_byte(start, size));

        in_range(first, last.offset_from_unsigned(first) + self.0, addr)
    }

    /// Number of distinct pages touched by `[start, start + size)`.
    pub fn page_count(self, start: VirtualAddress, size: usize) -> usize {
        if size == 0 {
            return 0;
        }

        let first = self.page_start(start);
        let last = self.page_start(last_byte(start, size));
        last.offset_from_unsigned(first) / self.0 + 1
    }

    /// The whole-page range that covers `[start, start + size)`.
    pub fn enclosing_pages(self, start: VirtualAddress, size: usize) -> Range<VirtualAddress> {
        Range::from_start_len(start, size).align_out(self.0)
    }
}

/// Returns `true` if `start <= addr <= start + size - 1`. An empty range contains nothing.
#[inline]
pub fn in_range(start: VirtualAddress, size: usize, addr: VirtualAddress) -> bool {
    addr >= start && addr.offset_from_unsigned(start) < size
}

/// The last byte of `[start, start + size)`, or `start` itself for an empty range.
#[inline]
pub(crate) fn last_byte(start: VirtualAddress, size: usize) -> VirtualAddress {
    start.add(size.saturating_sub(1))
}
