// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::Range;

use crate::address::{AddressRangeExt, VirtualAddress};
use crate::page::{PageSize, last_byte};

/// One of the two endpoints of a pending copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Source,
    Destination,
}

impl Side {
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Side::Source => Side::Destination,
            Side::Destination => Side::Source,
        }
    }
}

/// Progress of a single pending copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyState {
    /// Registered, no page copied yet.
    Pending,
    /// Some but not all pages have been copied.
    PartiallyCopied { completed: usize, total: usize },
    /// Every page has been copied and the descriptor left the registry.
    Retired,
}

/// A copy that has been requested but not (fully) carried out yet.
///
/// The descriptor only refers to the caller's memory, it never owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCopy {
    source: VirtualAddress,
    destination: VirtualAddress,
    size: usize,
    completed_pages: usize,
}

impl PendingCopy {
    pub const fn new(destination: VirtualAddress, source: VirtualAddress, size: usize) -> Self {
        Self {
            source,
            destination,
            size,
            completed_pages: 0,
        }
    }

    pub const fn source(&self) -> VirtualAddress {
        self.source
    }

    pub const fn destination(&self) -> VirtualAddress {
        self.destination
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub const fn completed_pages(&self) -> usize {
        self.completed_pages
    }

    /// First byte of the given side.
    pub const fn start(&self, side: Side) -> VirtualAddress {
        match side {
            Side::Source => self.source,
            Side::Destination => self.destination,
        }
    }

    /// Last byte of the given side.
    pub fn last(&self, side: Side) -> VirtualAddress {
        last_byte(self.start(side), self.size)
    }

    /// The source byte at `offset` into the copy.
    pub const fn source_at(&self, offset: usize) -> VirtualAddress {
        self.source.add(offset)
    }

    /// The destination byte at `offset` into the copy.
    pub const fn destination_at(&self, offset: usize) -> VirtualAddress {
        self.destination.add(offset)
    }

    /// Maps `addr` on `side` to the byte at the same offset on the other side.
    ///
    /// # Panics
    ///
    /// Panics if `addr` lies before the start of `side`.
    pub fn corresponding(&self, side: Side, addr: VirtualAddress) -> VirtualAddress {
        let offset = addr.offset_from_unsigned(self.start(side));
        self.start(side.other()).add(offset)
    }

    /// Number of pages a complete transfer copies, one per page of the source range.
    pub fn page_count(&self, page_size: PageSize) -> usize {
        page_size.page_count(self.source, self.size)
    }

    /// The whole pages a side of this copy touches.
    pub fn pages(&self, side: Side, page_size: PageSize) -> Range<VirtualAddress> {
        page_size.enclosing_pages(self.start(side), self.size)
    }

    /// Returns `true` if `addr` is on any page touched by either side of the copy.
    pub fn claims(&self, addr: VirtualAddress, page_size: PageSize) -> bool {
        page_size.in_page_range(self.source, self.size, addr)
            || page_size.in_page_range(self.destination, self.size, addr)
    }

    pub fn is_complete(&self, page_size: PageSize) -> bool {
        self.completed_pages >= self.page_count(page_size)
    }

    pub fn state(&self, page_size: PageSize) -> CopyState {
        let total = self.page_count(page_size);
        match self.completed_pages {
            0 => CopyState::Pending,
            completed if completed < total => CopyState::PartiallyCopied { completed, total },
            _ => CopyState::Retired,
        }
    }
}

/// Fixed capacity pool of pending copies.
///
/// A `None` slot is free. The registry never grows: once all `N` slots are taken, new copies
/// have to be carried out synchronously by the caller.
#[derive(Debug)]
pub struct Registry<const N: usize> {
    slots: [Option<PendingCopy>; N],
}

impl<const N: usize> Default for Registry<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Registry<N> {
    pub const fn new() -> Self {
        Self { slots: [None; N] }
    }

    /// Stores `copy` in the first free slot and returns its index, or `None` if the registry is
    /// full. A full registry is left untouched.
    pub fn insert(&mut self, copy: PendingCopy) -> Option<usize> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())?;

        *slot = Some(copy);
        Some(index)
    }

    /// Returns the slot of the first pending copy whose source or destination pages contain
    /// `addr`.
    pub fn find_by_address(&self, addr: VirtualAddress, page_size: PageSize) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|copy| copy.claims(addr, page_size))
        })
    }

    pub fn get(&self, slot: usize) -> Option<&PendingCopy> {
        self.slots.get(slot)?.as_ref()
    }

    /// Records one more copied page for the copy in `slot` and returns the updated descriptor.
    pub fn complete_page(&mut self, slot: usize) -> Option<PendingCopy> {
        let copy = self.slots.get_mut(slot)?.as_mut()?;
        copy.completed_pages += 1;
        Some(*copy)
    }

    /// Frees `slot`, returning the descriptor that occupied it.
    pub fn retire(&mut self, slot: usize) -> Option<PendingCopy> {
        self.slots.get_mut(slot)?.take()
    }

    /// Returns `true` if any page in `pages` is already claimed by a pending copy.
    pub fn claims(&self, pages: &Range<VirtualAddress>, page_size: PageSize) -> bool {
        self.iter().any(|(_, copy)| {
            copy.pages(Side::Source, page_size).overlaps(pages)
                || copy.pages(Side::Destination, page_size).overlaps(pages)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &PendingCopy)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| Some((index, slot.as_ref()?)))
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }
}
