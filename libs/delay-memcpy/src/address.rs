// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ops::Range;

/// An address in this process' virtual address space.
///
/// Pending copies only ever *refer* to caller-owned memory, so addresses are tracked as plain
/// integers and turned back into pointers right before the copy that needs them.
#[repr(transparent)]
#[derive(Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    #[must_use]
    pub const fn new(n: usize) -> Self {
        Self(n)
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    #[must_use]
    #[inline]
    pub fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        Self(ptr.expose_provenance())
    }

    #[must_use]
    #[inline]
    pub fn from_mut_ptr<T: ?Sized>(ptr: *mut T) -> Self {
        Self(ptr.expose_provenance())
    }

    #[inline]
    pub fn as_ptr(self) -> *const u8 {
        core::ptr::with_exposed_provenance(self.0)
    }

    #[inline]
    pub fn as_mut_ptr(self) -> *mut u8 {
        core::ptr::with_exposed_provenance_mut(self.0)
    }

    /// Adds an unsigned offset to this address, panicking if overflow occurred.
    #[must_use]
    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    /// Calculates the distance between two addresses in bytes, _where it's known that `self`
    /// is equal to or greater than `origin`_.
    ///
    /// # Panics
    ///
    /// Panics if `self` is less than `origin`.
    #[must_use]
    #[inline]
    pub const fn offset_from_unsigned(self, origin: Self) -> usize {
        let (a, b) = self.0.overflowing_sub(origin.0);
        if b {
            panic!("attempt to subtract with overflow")
        } else {
            a
        }
    }

    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[must_use]
    #[inline]
    pub const fn is_aligned_to(self, align: usize) -> bool {
        assert!(
            align.is_power_of_two(),
            "is_aligned_to: align is not a power-of-two"
        );

        self.0 & (align - 1) == 0
    }

    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[must_use]
    #[inline]
    pub const fn align_up(self, align: usize) -> Self {
        assert!(
            align.is_power_of_two(),
            "align_up: align is not a power-of-two"
        );

        let aligned = Self(self.0.wrapping_add(align - 1) & 0usize.wrapping_sub(align));
        debug_assert!(aligned.is_aligned_to(align));
        aligned
    }

    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[must_use]
    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        assert!(
            align.is_power_of_two(),
            "align_down: align is not a power-of-two"
        );

        let aligned = Self(self.0 & 0usize.wrapping_sub(align));
        debug_assert!(aligned.0 <= self.0);
        aligned
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:#018x}", self.0)) // 18 digits to account for the leading 0x
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VirtualAddress")
            .field(&format_args!("{:#018x}", self.0))
            .finish()
    }
}

pub trait AddressRangeExt {
    fn from_start_len(start: VirtualAddress, len: usize) -> Self;

    /// Returns the length of the address range, in bytes.
    fn len(&self) -> usize;

    /// Returns `true` if there exists an address present in both ranges.
    fn overlaps(&self, other: &Self) -> bool;

    /// Grows the range outwards to the nearest multiples of `align`.
    #[must_use]
    fn align_out(self, align: usize) -> Self;
}

impl AddressRangeExt for Range<VirtualAddress> {
    fn from_start_len(start: VirtualAddress, len: usize) -> Self {
        start..start.add(len)
    }

    fn len(&self) -> usize {
        self.end.offset_from_unsigned(self.start)
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    fn align_out(self, align: usize) -> Self {
        self.start.align_down(align)..self.end.align_up(align)
    }
}
