//! Element control blocks and tagged control words.
//!
//! Every element of a heterogeneous queue is preceded by a control block
//! whose single word packs the address of the next control block with the
//! element's state tag in the low bits. Queue alignment guarantees at least
//! three low bits are free (`min_alignment >= 8`).

use core::sync::atomic::AtomicUsize;

use bitflags::bitflags;

bitflags! {
    /// State tag stored in the low bits of a control word.
    ///
    /// A clear tag is a committed, consumable element. `DEAD` marks slots
    /// with no live element: consumed or cancelled elements, raw side
    /// blocks and page-jump markers. `DEAD` makes `BUSY` meaningless except
    /// for transient states of the concurrent protocol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct CbFlags: usize {
        /// A put transaction or consume operation is in progress here.
        const BUSY = 1;
        /// No live element: consumed, cancelled, raw block or page jump.
        const DEAD = 2;
        /// The payload lives in an external block; the in-page slot holds
        /// an [`ExternalBlock`] descriptor.
        const EXTERNAL = 4;
    }
}

/// Mask of all tag bits.
pub(crate) const FLAGS_MASK: usize = CbFlags::all().bits();

/// Extracts the next-control-block address from a control word.
#[inline(always)]
pub(crate) const fn word_address(word: usize) -> usize {
    word & !FLAGS_MASK
}

/// Extracts the state tag from a control word.
#[inline(always)]
pub(crate) fn word_flags(word: usize) -> CbFlags {
    CbFlags::from_bits_truncate(word)
}

/// Per-element header of the non-concurrent queue.
#[repr(C)]
pub(crate) struct ControlBlock {
    /// `next_address | tag`.
    pub next: usize,
}

/// Per-element header of the lock-free queue. Same layout as
/// [`ControlBlock`]; the word is read and written atomically.
#[repr(C)]
pub(crate) struct AtomicControlBlock {
    pub next: AtomicUsize,
}

/// In-page descriptor of a payload allocated outside the page list.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExternalBlock {
    pub ptr: *mut u8,
    pub size: usize,
    pub align: usize,
}
