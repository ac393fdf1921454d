// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::MAX_PENDING_COPIES;
use crate::address::{AddressRangeExt, VirtualAddress};
use crate::error::Error;
use crate::fault::{self, CopyStep};
use crate::page::PageSize;
use crate::protect::{Mprotect, Protect, Protection, protect_pages};
use crate::registry::{CopyState, PendingCopy, Registry, Side};

/// Why a copy was carried out immediately instead of being deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fallback {
    /// Every registry slot is taken.
    RegistryFull,
    /// Source and destination start at different offsets within their pages, so their pages
    /// don't line up one to one.
    Misaligned,
    /// Source and destination share at least one page.
    SharedPage,
    /// One of the pages already belongs to another pending copy.
    Claimed,
}

/// What `delay` did with a copy request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The copy is pending in the given registry slot.
    Deferred { slot: usize },
    /// The data was copied before returning.
    Synchronous(Fallback),
    /// Nothing to copy.
    Empty,
}

/// The result of handling one fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultOutcome {
    pub step: CopyStep,
    /// State of the copy after this step.
    pub state: CopyState,
}

/// Counters describing what an engine has done so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub deferred: usize,
    pub synchronous: usize,
    pub faults: usize,
    pub pages_copied: usize,
    pub retired: usize,
}

#[derive(Default)]
struct Counters {
    deferred: AtomicUsize,
    synchronous: AtomicUsize,
    faults: AtomicUsize,
    pages_copied: AtomicUsize,
    retired: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Stats {
        Stats {
            deferred: self.deferred.load(Ordering::Relaxed),
            synchronous: self.synchronous.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            pages_copied: self.pages_copied.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
        }
    }
}

/// A registry of pending copies together with the machinery to complete them page by page.
///
/// The engine is single threaded: its registry is mutated both by [`DelayCopy::delay`] and by the
/// fault handler, which interrupts the very thread that touched a protected page. No lock can be
/// used in that setting, instead registry borrows never outlive a single call and never span a
/// memory access that can fault.
pub struct DelayCopy<P = Mprotect, const N: usize = MAX_PENDING_COPIES> {
    registry: UnsafeCell<Registry<N>>,
    protector: P,
    page_size: PageSize,
    counters: Counters,
}

impl<P: Protect, const N: usize> DelayCopy<P, N> {
    pub fn new(protector: P, page_size: PageSize) -> Self {
        Self {
            registry: UnsafeCell::new(Registry::new()),
            protector,
            page_size,
            counters: Counters::default(),
        }
    }

    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    pub fn protector(&self) -> &P {
        &self.protector
    }

    pub fn stats(&self) -> Stats {
        self.counters.snapshot()
    }

    /// Number of copies that still have pages outstanding.
    pub fn pending_copies(&self) -> usize {
        self.with_registry(|registry| registry.occupied())
    }

    /// Returns a copy of the descriptor in `slot`, if that slot is occupied.
    pub fn pending(&self, slot: usize) -> Option<PendingCopy> {
        self.with_registry(|registry| registry.get(slot).copied())
    }

    fn with_registry<R>(&self, f: impl FnOnce(&mut Registry<N>) -> R) -> R {
        // Safety: the engine is used from a single thread. The fault handler can interrupt that
        // thread, but only when it touches a protected page, and no closure passed to this
        // function touches caller memory.
        f(unsafe { &mut *self.registry.get() })
    }

    /// Requests a copy of `size` bytes from `src` to `dst` and returns `dst`.
    ///
    /// See [`DelayCopy::delay`] for the details.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protect`] if the pages of either range could not be protected.
    ///
    /// # Safety
    ///
    /// Same as [`DelayCopy::delay`].
    pub unsafe fn delay_memcpy(
        &self,
        dst: *mut u8,
        src: *const u8,
        size: usize,
    ) -> crate::Result<*mut u8> {
        // Safety: ensured by the caller
        unsafe { self.delay(dst, src, size)? };
        Ok(dst)
    }

    /// Records a copy of `size` bytes from `src` to `dst` without transferring any data.
    ///
    /// The pages of `src` become read-only and the pages of `dst` inaccessible, the data moves
    /// page by page as those pages are touched. If the copy can't be deferred (see [`Fallback`])
    /// it is performed right away instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protect`] if the pages of either range could not be protected. The copy is
    /// not registered in that case and the source pages are writable again.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads and `dst` valid for writes of `size` bytes, the two ranges
    /// must not overlap, and both must stay mapped and owned by the caller until every page of the
    /// copy has been touched. Other data on the same pages is protected along with the ranges.
    pub unsafe fn delay(
        &self,
        dst: *mut u8,
        src: *const u8,
        size: usize,
    ) -> crate::Result<Disposition> {
        if size == 0 {
            return Ok(Disposition::Empty);
        }

        let copy = PendingCopy::new(
            VirtualAddress::from_mut_ptr(dst),
            VirtualAddress::from_ptr(src),
            size,
        );

        match self.register(copy)? {
            Ok(slot) => {
                log::trace!(
                    "deferred copy of {size:#x} bytes {} -> {} in slot {slot}",
                    copy.source(),
                    copy.destination()
                );
                Counters::bump(&self.counters.deferred);
                Ok(Disposition::Deferred { slot })
            }
            Err(fallback) => {
                log::debug!(
                    "copying {size:#x} bytes {} -> {} synchronously ({fallback:?})",
                    copy.source(),
                    copy.destination()
                );
                // This may touch pages of other pending copies and fault into the handler, which
                // is fine as long as no registry borrow is alive.
                // Safety: ensured by the caller
                unsafe { ptr::copy_nonoverlapping(src, dst, size) };
                Counters::bump(&self.counters.synchronous);
                Ok(Disposition::Synchronous(fallback))
            }
        }
    }

    /// Inserts `copy` and protects its pages, or says why it has to be copied synchronously.
    fn register(&self, copy: PendingCopy) -> crate::Result<Result<usize, Fallback>> {
        let page_size = self.page_size;
        let source_pages = copy.pages(Side::Source, page_size);
        let destination_pages = copy.pages(Side::Destination, page_size);

        let same_offset =
            copy.source().get() % page_size.get() == copy.destination().get() % page_size.get();
        let single_page =
            source_pages.len() == page_size.get() && destination_pages.len() == page_size.get();
        if !same_offset && !single_page {
            return Ok(Err(Fallback::Misaligned));
        }
        if source_pages.overlaps(&destination_pages) {
            return Ok(Err(Fallback::SharedPage));
        }

        let slot = self.with_registry(|registry| {
            if registry.claims(&source_pages, page_size)
                || registry.claims(&destination_pages, page_size)
            {
                return Err(Fallback::Claimed);
            }
            registry.insert(copy).ok_or(Fallback::RegistryFull)
        });
        let slot = match slot {
            Ok(slot) => slot,
            Err(fallback) => return Ok(Err(fallback)),
        };

        let protected = protect_pages(
            &self.protector,
            page_size,
            copy.source(),
            copy.size(),
            Protection::ReadOnly,
        )
        .and_then(|()| {
            protect_pages(
                &self.protector,
                page_size,
                copy.destination(),
                copy.size(),
                Protection::NoAccess,
            )
            .inspect_err(|_| {
                let _ = self.protector.protect(source_pages.clone(), Protection::ReadWrite);
            })
        });

        if let Err(err) = protected {
            log::error!(
                "failed to defer copy {} -> {}: {err}",
                copy.source(),
                copy.destination()
            );
            self.with_registry(|registry| registry.retire(slot));
            return Err(err);
        }

        Ok(Ok(slot))
    }

    /// Completes the part of a pending copy that lives on the page of `addr`.
    ///
    /// This is the body of the protection fault handler. It makes exactly the source and
    /// destination page of the step accessible, copies the bytes of the step and retires the
    /// copy once its last page is done. It runs in signal context: no allocation, no locking,
    /// no logging.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unclaimed`] if no pending copy claims `addr` and [`Error::Protect`] if the
    /// pages of the step could not be made accessible.
    pub fn handle_fault(&self, addr: VirtualAddress) -> crate::Result<FaultOutcome> {
        let page_size = self.page_size;
        let (slot, copy) = self
            .with_registry(|registry| {
                let slot = registry.find_by_address(addr, page_size)?;
                Some((slot, *registry.get(slot)?))
            })
            .ok_or(Error::Unclaimed(addr))?;
        let step = fault::plan(&copy, addr, page_size).ok_or(Error::Unclaimed(addr))?;

        Counters::bump(&self.counters.faults);

        self.protector
            .protect(step.source_pages.clone(), Protection::ReadWrite)?;
        self.protector
            .protect(step.destination_pages.clone(), Protection::ReadWrite)?;

        // Safety: `delay` was promised that both ranges stay valid while the copy is pending, and
        // the pages holding this step's bytes have just been made accessible.
        unsafe {
            ptr::copy_nonoverlapping(
                copy.source_at(step.offsets.start).as_ptr(),
                copy.destination_at(step.offsets.start).as_mut_ptr(),
                step.offsets.len(),
            );
        }
        Counters::bump(&self.counters.pages_copied);

        let state = self.with_registry(|registry| {
            let copy = registry.complete_page(slot)?;
            if copy.is_complete(page_size) {
                registry.retire(slot);
            }
            Some(copy.state(page_size))
        });
        let state = state.ok_or(Error::Unclaimed(addr))?;
        if state == CopyState::Retired {
            Counters::bump(&self.counters.retired);
        }

        Ok(FaultOutcome { step, state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::PagePosition;
    use crate::test_utils::{AlignedBuffer, RecordingProtector};

    struct Fixture<const N: usize> {
        engine: DelayCopy<RecordingProtector, N>,
        src: AlignedBuffer,
        dst: AlignedBuffer,
    }

    impl<const N: usize> Fixture<N> {
        fn new(pages: usize) -> Self {
            Self::with_protector(pages, RecordingProtector::default())
        }

        fn with_protector(pages: usize, protector: RecordingProtector) -> Self {
            let page_size = PageSize::system().unwrap();
            let src = AlignedBuffer::new(pages * page_size.get(), page_size.get());
            let dst = AlignedBuffer::new(pages * page_size.get(), page_size.get());
            src.fill(0x11);
            dst.fill(0xee);

            Self {
                engine: DelayCopy::new(protector, page_size),
                src,
                dst,
            }
        }

        fn page(&self) -> usize {
            self.engine.page_size().get()
        }

        fn delay(&self, offset: usize, size: usize) -> Disposition {
            // Safety: both buffers are live and large enough for every call made by the tests
            unsafe {
                self.engine
                    .delay(
                        self.dst.as_mut_ptr().add(offset),
                        self.src.as_ptr().add(offset),
                        size,
                    )
                    .unwrap()
            }
        }

        fn fault_dst(&self, offset: usize) -> FaultOutcome {
            self.engine
                .handle_fault(self.dst.addr().add(offset))
                .unwrap()
        }

        fn fault_src(&self, offset: usize) -> FaultOutcome {
            self.engine
                .handle_fault(self.src.addr().add(offset))
                .unwrap()
        }
    }

    #[test_log::test]
    fn single_page_via_destination_read() {
        let f = Fixture::<4>::new(1);
        let page = f.page();

        assert_eq!(f.delay(0, page), Disposition::Deferred { slot: 0 });
        assert_eq!(
            f.engine.protector().calls(),
            [
                (f.src.addr()..f.src.addr().add(page), Protection::ReadOnly),
                (f.dst.addr()..f.dst.addr().add(page), Protection::NoAccess),
            ]
        );
        // nothing moved yet
        assert_ne!(f.dst.read(0..20), f.src.read(0..20));

        let outcome = f.fault_dst(19);
        assert_eq!(outcome.step.case.position, PagePosition::Whole);
        assert_eq!(outcome.state, CopyState::Retired);
        assert_eq!(f.dst.as_slice(), f.src.as_slice());
        assert_eq!(f.engine.pending_copies(), 0);
        assert_eq!(
            f.engine.protector().current(f.dst.addr()),
            Some(Protection::ReadWrite)
        );
        assert_eq!(
            f.engine.protector().current(f.src.addr()),
            Some(Protection::ReadWrite)
        );
    }

    #[test_log::test]
    fn single_page_via_source_write() {
        let f = Fixture::<4>::new(1);
        let page = f.page();

        f.delay(0, page);
        let outcome = f.fault_src(0);

        assert_eq!(outcome.step.case.side, Side::Source);
        assert_eq!(outcome.state, CopyState::Retired);
        assert_eq!(f.dst.as_slice(), f.src.as_slice());
    }

    #[test_log::test]
    fn only_touched_pages_are_copied() {
        let f = Fixture::<4>::new(2);
        let page = f.page();
        let untouched = f.dst.read(0..page);

        f.delay(0, 2 * page);
        let outcome = f.fault_dst(page + 0x800);

        assert_eq!(outcome.step.case.position, PagePosition::Last);
        assert_eq!(
            outcome.state,
            CopyState::PartiallyCopied {
                completed: 1,
                total: 2
            }
        );
        assert_eq!(f.dst.page(0), untouched);
        assert_eq!(f.dst.page(1), f.src.page(1));
        assert_ne!(f.dst.page(1), f.src.page(0));
        assert_eq!(f.engine.pending(0).map(|c| c.completed_pages()), Some(1));
        assert_eq!(
            f.engine.protector().current(f.dst.addr()),
            Some(Protection::NoAccess)
        );

        let outcome = f.fault_src(10);
        assert_eq!(outcome.step.case.position, PagePosition::First);
        assert_eq!(outcome.state, CopyState::Retired);
        assert_eq!(f.dst.as_slice(), f.src.as_slice());
    }

    #[test_log::test]
    fn unaligned_range_spans_two_pages() {
        let f = Fixture::<4>::new(2);
        let page = f.page();
        let before = f.dst.as_slice();

        f.delay(0x400, page);
        let outcome = f.fault_dst(0x400);

        assert_eq!(outcome.step.case.position, PagePosition::First);
        assert_eq!(outcome.step.offsets, 0..page - 0x400);
        assert_eq!(f.dst.read(0x400..page), f.src.read(0x400..page));
        // bytes outside the range stay as they were
        assert_eq!(f.dst.read(0..0x400), before[..0x400]);
        assert_eq!(f.dst.read(page..page + 0x400), before[page..page + 0x400]);

        let outcome = f.fault_dst(page + 0x3ff);
        assert_eq!(outcome.step.offsets, page - 0x400..page);
        assert_eq!(outcome.state, CopyState::Retired);
        assert_eq!(f.dst.read(0x400..page + 0x400), f.src.read(0x400..page + 0x400));
        assert_eq!(f.dst.read(page + 0x400..2 * page), before[page + 0x400..]);
    }

    #[test_log::test]
    fn middle_page_of_three() {
        let f = Fixture::<4>::new(3);
        let page = f.page();
        let before = f.dst.as_slice();

        f.delay(0, 3 * page);
        let outcome = f.fault_dst(page + 0x300);

        assert_eq!(
            outcome.step.case,
            crate::fault::FaultCase {
                side: Side::Destination,
                position: PagePosition::Interior
            }
        );
        assert_eq!(f.dst.read(page..2 * page), f.src.read(page..2 * page));
        assert_eq!(f.dst.read(0..page), before[..page]);
        assert_eq!(f.dst.read(2 * page..3 * page), before[2 * page..]);

        f.fault_src(2 * page);
        let outcome = f.fault_dst(0);
        assert_eq!(outcome.state, CopyState::Retired);
        assert_eq!(f.dst.as_slice(), f.src.as_slice());
        assert_eq!(
            f.engine.stats(),
            Stats {
                deferred: 1,
                synchronous: 0,
                faults: 3,
                pages_copied: 3,
                retired: 1,
            }
        );
    }

    #[test_log::test]
    fn each_page_comes_from_its_own_source_page() {
        let f = Fixture::<4>::new(4);
        let page = f.page();

        f.delay(0, 4 * page);
        for (n, side) in [
            (3, Side::Destination),
            (1, Side::Source),
            (0, Side::Destination),
            (2, Side::Source),
        ] {
            match side {
                Side::Destination => f.fault_dst(n * page + 0x10),
                Side::Source => f.fault_src(n * page + 0x10),
            };

            let copied = f.dst.page(n);
            for other in 0..4 {
                if other == n {
                    assert_eq!(copied, f.src.page(other), "page {n}");
                } else {
                    assert_ne!(copied, f.src.page(other), "page {n} holds page {other}");
                }
            }
        }
        assert_eq!(f.engine.pending_copies(), 0);
    }

    #[test_log::test]
    fn full_registry_copies_synchronously() {
        let f = Fixture::<2>::new(3);
        let page = f.page();

        assert_eq!(f.delay(0, 0x10), Disposition::Deferred { slot: 0 });
        assert_eq!(f.delay(page, 0x10), Disposition::Deferred { slot: 1 });
        f.engine.protector().clear();

        assert_eq!(
            f.delay(2 * page, 0x10),
            Disposition::Synchronous(Fallback::RegistryFull)
        );
        assert_eq!(
            f.dst.read(2 * page..2 * page + 0x10),
            f.src.read(2 * page..2 * page + 0x10)
        );
        assert!(f.engine.protector().calls().is_empty());
        assert_eq!(f.engine.stats().synchronous, 1);
    }

    #[test_log::test]
    fn pages_that_do_not_line_up_copy_synchronously() {
        let f = Fixture::<4>::new(4);
        let page = f.page();

        // Safety: both buffers hold four pages
        let disposition = unsafe {
            f.engine
                .delay(f.dst.as_mut_ptr().add(0x20), f.src.as_ptr().add(0x10), page)
                .unwrap()
        };
        assert_eq!(disposition, Disposition::Synchronous(Fallback::Misaligned));
        assert_eq!(f.dst.read(0x20..0x20 + page), f.src.read(0x10..0x10 + page));

        // different offsets are fine as long as each side stays on one page
        // Safety: both buffers hold four pages
        let disposition = unsafe {
            f.engine
                .delay(
                    f.dst.as_mut_ptr().add(2 * page + 0x20),
                    f.src.as_ptr().add(2 * page + 0x10),
                    0x100,
                )
                .unwrap()
        };
        assert!(matches!(disposition, Disposition::Deferred { .. }));
        f.fault_dst(2 * page);
        assert_eq!(
            f.dst.read(2 * page + 0x20..2 * page + 0x120),
            f.src.read(2 * page + 0x10..2 * page + 0x110)
        );
    }

    #[test_log::test]
    fn shared_and_claimed_pages_copy_synchronously() {
        let f = Fixture::<4>::new(2);
        let page = f.page();

        // source and destination on the same page
        // Safety: the ranges lie within one page of the source buffer and don't overlap
        let disposition = unsafe {
            f.engine
                .delay(f.src.as_mut_ptr().add(0x800), f.src.as_ptr(), 0x100)
                .unwrap()
        };
        assert_eq!(disposition, Disposition::Synchronous(Fallback::SharedPage));

        assert_eq!(f.delay(0, 0x100), Disposition::Deferred { slot: 0 });
        // same pages again, from a different offset
        assert_eq!(
            f.delay(0x200, 0x100),
            Disposition::Synchronous(Fallback::Claimed)
        );
        assert_eq!(f.engine.pending_copies(), 1);
        assert!(matches!(f.delay(page, 0x100), Disposition::Deferred { .. }));
    }

    #[test_log::test]
    fn unclaimed_fault() {
        let f = Fixture::<4>::new(2);
        let page = f.page();

        f.delay(0, 0x10);
        let err = f
            .engine
            .handle_fault(f.dst.addr().add(page))
            .unwrap_err();

        assert!(matches!(err, Error::Unclaimed(addr) if addr == f.dst.addr().add(page)));
        assert_eq!(f.engine.stats().faults, 0);
    }

    #[test_log::test]
    fn failed_protection_unregisters_the_copy() {
        let f =
            Fixture::<4>::with_protector(1, RecordingProtector::failing_on(Protection::NoAccess));
        let page = f.page();

        // Safety: both buffers hold a page
        let err = unsafe {
            f.engine
                .delay(f.dst.as_mut_ptr(), f.src.as_ptr(), page)
                .unwrap_err()
        };

        assert!(matches!(
            err,
            Error::Protect {
                protection: Protection::NoAccess,
                ..
            }
        ));
        assert_eq!(f.engine.pending_copies(), 0);
        assert_eq!(
            f.engine.protector().current(f.src.addr()),
            Some(Protection::ReadWrite)
        );
    }

    #[test]
    fn empty_copy_is_a_no_op() {
        let f = Fixture::<4>::new(1);

        assert_eq!(f.delay(0, 0), Disposition::Empty);
        assert!(f.engine.protector().calls().is_empty());
        // Safety: zero bytes are copied
        let dst = unsafe { f.engine.delay_memcpy(f.dst.as_mut_ptr(), f.src.as_ptr(), 0) };
        assert_eq!(dst.unwrap(), f.dst.as_mut_ptr());
    }
}
