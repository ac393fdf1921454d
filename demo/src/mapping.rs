// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt::Write;
use std::io;
use std::ptr::{self, NonNull};

use anyhow::Context;
use rand::Rng;

/// An anonymous read-write mapping, unmapped on drop.
///
/// All accesses go through volatile loads and stores so that each one really reaches the
/// (possibly protected) page.
pub struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

impl Mapping {
    pub fn new(len: usize) -> anyhow::Result<Self> {
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
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("failed to map {len:#x} bytes"));
        }
        let base = NonNull::new(base.cast()).context("mmap returned a null mapping")?;

        Ok(Self { base, len })
    }

    pub fn ptr(&self, offset: usize) -> *mut u8 {
        assert!(offset < self.len, "{offset:#x} out of bounds");
        // Safety: within the mapping, checked above
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Fills the mapping with random bytes.
    pub fn randomize(&mut self) {
        // Safety: we own the whole mapping and it is readable and writable while no copy involving
        // it is pending
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len) };
        rand::rng().fill(bytes);
    }

    pub fn read(&self, offset: usize) -> u8 {
        // Safety: `ptr` checks the bounds
        unsafe { self.ptr(offset).read_volatile() }
    }

    /// Increments the byte at `offset`, which reads and then writes it.
    pub fn increment(&self, offset: usize) {
        let byte = self.read(offset).wrapping_add(1);
        // Safety: `ptr` checks the bounds
        unsafe { self.ptr(offset).write_volatile(byte) }
    }

    /// `len` bytes starting at `offset` as space separated hex.
    pub fn hex_dump(&self, offset: usize, len: usize) -> String {
        (offset..offset + len).fold(String::new(), |mut out, offset| {
            let _ = write!(out, "{:02x} ", self.read(offset));
            out
        })
    }

    /// Reads one byte of every page, completing any copy still pending on this mapping.
    pub fn touch_all(&self, page_size: usize) {
        for offset in (0..self.len).step_by(page_size) {
            self.read(offset);
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // Safety: `base` and `len` describe the mapping created in `new`
        let ret = unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
        debug_assert_eq!(ret, 0);
    }
}
