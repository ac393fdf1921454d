// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deciding what a single protection fault has to copy.
//!
//! A fault on a page claimed by a [`PendingCopy`] is classified into exactly one [`FaultCase`]:
//! which endpoint the faulting page belongs to ([`Side`]) and where that page sits within the
//! endpoint's range ([`PagePosition`]). The checks run in a fixed order:
//!
//! 1. the whole range fits on the faulting page, tested through the source
//! 2. the same, tested through the destination
//! 3. the first page of the source range
//! 4. the first page of the destination range
//! 5. the last page of the source range
//! 6. the last page of the destination range
//! 7. an interior page of the destination range
//! 8. an interior page of the source range
//!
//! Edge pages must be tested before interior pages: a page is only interior if it is neither the
//! first nor the last page of a range.
//!
//! [`plan`] turns a classification into a [`CopyStep`]: the byte offsets to copy and the one page
//! on each side that has to become accessible before copying. Nothing here touches memory or
//! changes protections, so it can be driven with synthetic addresses.

use core::ops::Range;

use crate::address::VirtualAddress;
use crate::page::PageSize;
use crate::registry::{PendingCopy, Side};

/// Where the faulting page sits within one side of a pending copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PagePosition {
    /// The entire range lives on the faulting page.
    Whole,
    /// First page of a multi-page range; copies from the range start to the page end.
    First,
    /// Last page of a multi-page range; copies from the page start to the range end.
    Last,
    /// A page strictly between first and last; copied in full.
    Interior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaultCase {
    pub side: Side,
    pub position: PagePosition,
}

impl FaultCase {
    const fn new(side: Side, position: PagePosition) -> Self {
        Self { side, position }
    }
}

/// The work a fault handler performs for one fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyStep {
    pub case: FaultCase,
    /// Byte offsets into the copy that this step transfers.
    pub offsets: Range<usize>,
    /// Source page to make accessible before copying.
    pub source_pages: Range<VirtualAddress>,
    /// Destination page to make accessible before copying.
    pub destination_pages: Range<VirtualAddress>,
}

/// Classifies a fault at `addr` against `copy`.
///
/// Returns `None` if `addr` is not on any page of either side.
pub fn classify(copy: &PendingCopy, addr: VirtualAddress, page_size: PageSize) -> Option<FaultCase> {
    let on_page_of = |start: VirtualAddress| page_size.in_page_range(start, 0, addr);
    let first = |side| on_page_of(copy.start(side));
    let last = |side| on_page_of(copy.last(side));

    let case = if first(Side::Source) && last(Side::Source) {
        FaultCase::new(Side::Source, PagePosition::Whole)
    } else if first(Side::Destination) && last(Side::Destination) {
        FaultCase::new(Side::Destination, PagePosition::Whole)
    } else if first(Side::Source) {
        FaultCase::new(Side::Source, PagePosition::First)
    } else if first(Side::Destination) {
        FaultCase::new(Side::Destination, PagePosition::First)
    } else if last(Side::Source) {
        FaultCase::new(Side::Source, PagePosition::Last)
    } else if last(Side::Destination) {
        FaultCase::new(Side::Destination, PagePosition::Last)
    } else if page_size.in_page_range(copy.destination(), copy.size(), addr) {
        FaultCase::new(Side::Destination, PagePosition::Interior)
    } else if page_size.in_page_range(copy.source(), copy.size(), addr) {
        FaultCase::new(Side::Source, PagePosition::Interior)
    } else {
        return None;
    };

    Some(case)
}

/// Works out which bytes a fault at `addr` has to copy.
///
/// Source and destination are expected to either share their offset within a page or to fit on a
/// single page each, so that every source page has exactly one corresponding destination page.
pub fn plan(copy: &PendingCopy, addr: VirtualAddress, page_size: PageSize) -> Option<CopyStep> {
    let case = classify(copy, addr, page_size)?;
    let start = copy.start(case.side);
    let page = page_size.page_start(addr);

    let offsets = match case.position {
        PagePosition::Whole => 0..copy.size(),
        PagePosition::First => {
            let page_end = page.add(page_size.get());
            0..page_end.offset_from_unsigned(start)
        }
        PagePosition::Last => page.offset_from_unsigned(start)..copy.size(),
        PagePosition::Interior => {
            let offset = page.offset_from_unsigned(start);
            offset..offset + page_size.get()
        }
    };
    debug_assert!(offsets.end <= copy.size());

    // the range of one side within this step always lies on one page
    let source = copy.source_at(offsets.start);
    let destination = copy.destination_at(offsets.start);
    debug_assert_eq!(copy.corresponding(Side::Source, source), destination);

    Some(CopyStep {
        case,
        source_pages: page_size.enclosing_pages(source, offsets.len()),
        destination_pages: page_size.enclosing_pages(destination, offsets.len()),
        offsets,
    })
}
