// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deferred memory copies.
//!
//! [`delay_memcpy`] returns right after *recording* that `size` bytes should move from `src` to
//! `dst`. No data is transferred at that point. Instead the source pages are made read-only and
//! the destination pages inaccessible, so that the first access to either range raises a
//! protection fault. The fault handler installed by [`initialize`] then copies the bytes that
//! live on the touched page, makes that page (and its counterpart on the other side) accessible
//! again and lets the faulting instruction retry. Pages that are never touched are never copied.
//!
//! The registry of pending copies has a fixed capacity of [`MAX_PENDING_COPIES`]. Requests that
//! don't fit, or whose pages can't be tracked independently, are copied synchronously instead.
//!
//! # Threads
//!
//! None of this is thread-safe: faults are handled on the thread that caused them and the
//! registry is not locked. Use deferred copies from a single thread.
//!
//! # Testing without faults
//!
//! The machinery behind the two entry points is a plain value, [`DelayCopy`], generic over the
//! [`Protect`] backend and the registry capacity. Tests can drive it with a recording backend and
//! call [`DelayCopy::handle_fault`] with synthetic addresses instead of provoking real faults.

mod address;
mod engine;
mod error;
pub mod fault;
mod page;
mod protect;
mod registry;
mod signal;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use address::{AddressRangeExt, VirtualAddress};
pub use engine::{DelayCopy, Disposition, Fallback, FaultOutcome, Stats};
pub use error::Error;
pub use page::{PageSize, in_range};
pub use protect::{Mprotect, Protect, Protection, protect_pages};
pub use registry::{CopyState, PendingCopy, Registry, Side};

pub type Result<T> = core::result::Result<T, Error>;

/// Number of copies the process-wide registry can track at once.
pub const MAX_PENDING_COPIES: usize = 20;

static_assertions::const_assert!(MAX_PENDING_COPIES > 0);

/// Installs the protection fault handler and sets up the process-wide registry.
///
/// Must run before the first [`delay_memcpy`]. Calling it again is harmless.
///
/// # Errors
///
/// Returns [`Error::PageSize`] if the system page size is unusable and [`Error::InstallHandler`]
/// if the signal handler could not be installed.
pub fn initialize() -> Result<()> {
    let page_size = PageSize::system()?;
    let engine = signal::engine_or_init(|| DelayCopy::new(Mprotect, page_size));
    signal::install()?;

    log::debug!(
        "deferred copies ready (page size {:#x}, {MAX_PENDING_COPIES} slots, {} pending)",
        engine.page_size().get(),
        engine.pending_copies()
    );
    Ok(())
}

/// Starts copying `size` bytes from `src` to `dst` and returns `dst`.
///
/// The data moves lazily, one page at a time, when either range is accessed. If the registry is
/// full, or the ranges can't be tracked page by page, the copy happens before this returns.
///
/// # Errors
///
/// Returns [`Error::Uninitialized`] if [`initialize`] has not run and [`Error::Protect`] if the
/// pages of either range could not be protected.
///
/// # Safety
///
/// `src` must be valid for reads and `dst` valid for writes of `size` bytes, the ranges must not
/// overlap, and both must stay mapped and owned by the caller until every page of the copy has
/// been touched. Any other data sharing those pages is protected along with them.
pub unsafe fn delay_memcpy(dst: *mut u8, src: *const u8, size: usize) -> Result<*mut u8> {
    let engine = signal::engine().ok_or(Error::Uninitialized)?;
    // Safety: ensured by the caller
    unsafe { engine.delay_memcpy(dst, src, size) }
}

/// Counters of the process-wide registry, or `None` before [`initialize`].
pub fn stats() -> Option<Stats> {
    signal::engine().map(DelayCopy::stats)
}

/// Number of copies in the process-wide registry that still have pages outstanding.
pub fn pending_copies() -> usize {
    signal::engine().map_or(0, DelayCopy::pending_copies)
}
