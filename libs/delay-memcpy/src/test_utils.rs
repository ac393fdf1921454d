// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Helpers shared by the unit tests, the integration tests and the benchmarks.

use core::cell::RefCell;
use core::ops::Range;
use std::io;
use std::ptr;

use crate::address::VirtualAddress;
use crate::error::Error;
use crate::protect::{Protect, Protection};

/// A page aligned, anonymous, read-write mapping that is unmapped on drop.
pub struct AlignedBuffer {
    base: *mut u8,
    len: usize,
    page_size: usize,
}

impl AlignedBuffer {
    /// Maps at least `len` bytes aligned to `page_size`.
    ///
    /// # Panics
    ///
    /// Panics if the mapping fails.
    pub fn new(len: usize, page_size: usize) -> Self {
        let len = len.next_multiple_of(page_size).max(page_size);

        // Safety: anonymous private mapping, no file descriptor or fixed address involved
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        assert_ne!(
            base,
            libc::MAP_FAILED,
            "mmap failed: {}",
            io::Error::last_os_error()
        );

        Self {
            base: base.cast(),
            len,
            page_size,
        }
    }

    pub fn addr(&self) -> VirtualAddress {
        VirtualAddress::from_mut_ptr(self.base)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.base
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Fills the whole buffer with a pattern derived from `seed`.
    ///
    /// No two of the first 256 pages hold the same bytes, so a page copied from the wrong place
    /// shows up as a mismatch.
    pub fn fill(&self, seed: u8) {
        for i in 0..self.len {
            #[expect(clippy::cast_possible_truncation, reason = "pattern wraps on purpose")]
            let (byte, page) = (i as u8, (i / self.page_size) as u8);
            self.write(i, byte.wrapping_mul(31).wrapping_add(seed) ^ page.wrapping_mul(0x65));
        }
    }

    /// The bytes of page `n`.
    pub fn page(&self, n: usize) -> Vec<u8> {
        self.read(n * self.page_size..(n + 1) * self.page_size)
    }

    /// Reads `range` byte by byte with volatile loads, so every load really reaches memory and
    /// can fault.
    ///
    /// # Panics
    ///
    /// Panics if `range` is out of bounds.
    pub fn read(&self, range: Range<usize>) -> Vec<u8> {
        assert!(range.end <= self.len, "{range:?} out of bounds");
        range
            .map(|i| {
                // Safety: bounds checked above
                unsafe { self.base.add(i).read_volatile() }
            })
            .collect()
    }

    /// Writes a single byte with a volatile store.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is out of bounds.
    pub fn write(&self, offset: usize, byte: u8) {
        assert!(offset < self.len, "{offset:#x} out of bounds");
        // Safety: bounds checked above
        unsafe { self.base.add(offset).write_volatile(byte) }
    }

    pub fn as_slice(&self) -> Vec<u8> {
        self.read(0..self.len)
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // Safety: `base` and `len` describe the mapping created in `new`
        let ret = unsafe { libc::munmap(self.base.cast(), self.len) };
        debug_assert_eq!(ret, 0);
    }
}

/// A [`Protect`] backend that only records the requested changes.
///
/// Lets the engine run against ordinary memory, with faults injected by calling
/// `DelayCopy::handle_fault` directly.
#[derive(Default)]
pub struct RecordingProtector {
    calls: RefCell<Vec<(Range<VirtualAddress>, Protection)>>,
    fail_on: Option<Protection>,
}

impl RecordingProtector {
    /// A recorder that rejects every request for `protection`.
    pub fn failing_on(protection: Protection) -> Self {
        Self {
            calls: RefCell::default(),
            fail_on: Some(protection),
        }
    }

    pub fn calls(&self) -> Vec<(Range<VirtualAddress>, Protection)> {
        self.calls.borrow().clone()
    }

    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
    }

    /// The protection most recently applied to the page at `addr`, if any.
    pub fn current(&self, addr: VirtualAddress) -> Option<Protection> {
        self.calls
            .borrow()
            .iter()
            .rev()
            .find(|(pages, _)| pages.contains(&addr))
            .map(|(_, protection)| *protection)
    }
}

impl Protect for RecordingProtector {
    fn protect(&self, pages: Range<VirtualAddress>, protection: Protection) -> crate::Result<()> {
        if self.fail_on == Some(protection) {
            return Err(Error::Protect {
                pages,
                protection,
                source: io::Error::from_raw_os_error(libc::EACCES),
            });
        }

        self.calls.borrow_mut().push((pages, protection));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_hold_distinct_patterns() {
        let page = 0x1000;
        let buf = AlignedBuffer::new(4 * page, page);
        buf.fill(7);

        for a in 0..4 {
            for b in a + 1..4 {
                assert_ne!(buf.page(a), buf.page(b), "pages {a} and {b}");
            }
        }
    }
}
