//! Core data structures for the page/segment/heap layers (§3.2).
//!
//! These are plain, `repr(C)`-friendly structs manipulated through raw
//! pointers rather than safe references: pages and segments live in
//! OS-obtained memory managed by hand (this crate cannot depend on another
//! allocator for its own bookkeeping), and their lifetimes are governed by
//! the invariants in §3.3, not by the borrow checker.

use crate::internal::MI_BIN_FULL;
use core::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize};

/// A free block; while on a free list its only live field is `next`. Once
/// handed to the user the memory is opaque.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Block {
    pub next: usize,
}

/// Where a segment's memory originated, so it can be released correctly
/// without the segment needing its own back-pointer into arena state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemId {
    /// Carved out of arena `arena_idx`, occupying `[bit_idx, bit_idx+blocks)`.
    Arena {
        arena_idx: u16,
        bit_idx: u32,
        blocks: u32,
        initially_committed: bool,
    },
    /// Allocated directly from the OS, bypassing arena tracking (§4.5 step 5).
    Os,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageKind {
    Small, // 64KiB pages, 64 per segment
    Medium, // 512KiB pages, 8 per segment
    Large, // one page spans the whole segment
    Huge,  // one page, segment sized to the request
}

/// The owner-only and shared halves of a page's free-list state (§9
/// "Three-list sharding without locks"). Splitting them into two structs
/// documents, in the type system, which half a non-owning thread may
/// touch.
pub struct PageLocal {
    pub free: *mut Block,
    pub local_free: *mut Block,
    pub used: usize,
}

pub struct PageShared {
    /// Atomic LIFO of blocks freed by non-owning threads. The bottom two
    /// bits of the tagged head double as the `Delayed` state for the
    /// thread-delayed-free protocol (§4.4); kept as a plain `usize` so the
    /// tag and pointer move together in one CAS.
    pub thread_free: AtomicUsize,
    /// At least this many blocks are linked into `thread_free` right now
    /// (read without synchronising with `thread_free` itself — see §4.1
    /// "Race with emptiness detection").
    pub thread_freed: AtomicUsize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Delayed {
    NoDelayedFree = 0,
    UseDelayedFree = 1,
    DelayedFreeing = 2,
}

pub const DELAYED_MASK: usize = 0b11;

pub struct Page {
    pub segment_idx: u16, // index in the segment's `pages` array
    pub segment_in_use: bool,
    pub is_reset: bool,
    pub has_aligned: bool,
    pub is_full: bool,

    pub size_class: u16,
    pub block_size: usize,
    pub capacity: u32, // blocks committed
    pub reserved: u32,  // blocks reserved in memory

    pub cookie: usize,

    pub local: PageLocal,
    pub shared: PageShared,

    pub heap: *mut Heap,
    pub next: *mut Page,
    pub prev: *mut Page,
}

impl Page {
    pub const fn empty() -> Self {
        Page {
            segment_idx: 0,
            segment_in_use: false,
            is_reset: false,
            has_aligned: false,
            is_full: false,
            size_class: 0,
            block_size: 0,
            capacity: 0,
            reserved: 0,
            cookie: 0,
            local: PageLocal {
                free: core::ptr::null_mut(),
                local_free: core::ptr::null_mut(),
                used: 0,
            },
            shared: PageShared {
                thread_free: AtomicUsize::new(0),
                thread_freed: AtomicUsize::new(0),
            },
            heap: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
            prev: core::ptr::null_mut(),
        }
    }
}

/// One arena-block-aligned chunk, tracking the pages carved from it.
/// `pages` is a variable-length array whose element count is `capacity`;
/// it is embedded at a fixed offset right after this header inside the
/// segment's own committed memory (never heap-allocated separately).
pub struct Segment {
    pub next: *mut Segment,
    pub prev: *mut Segment,
    pub abandoned_next: AtomicPtr<Segment>,

    pub abandoned: usize,
    pub used: usize,
    pub capacity: usize,
    pub segment_size: usize,
    pub segment_info_size: usize,
    pub cookie: usize,

    pub page_shift: usize,
    pub thread_id: AtomicUsize, // 0 == abandoned
    pub page_kind: PageKind,
    pub memid: MemId,

    /// Pointer to the first `Page` in this segment's inline page array.
    pub pages: *mut Page,
}

pub struct PageQueue {
    pub first: *mut Page,
    pub last: *mut Page,
    pub block_size: usize,
}

impl PageQueue {
    pub const fn empty() -> Self {
        PageQueue {
            first: core::ptr::null_mut(),
            last: core::ptr::null_mut(),
            block_size: 0,
        }
    }
}

pub const MI_SMALL_WSIZE_MAX: usize = 128;

pub struct Heap {
    pub tld: *mut Tld,
    /// Direct lookup: index `i` holds the page currently serving
    /// allocations of `i * MI_INTPTR_SIZE` bytes (or the empty-page
    /// sentinel) for every small 8-byte-granular size (§4.1).
    pub pages_free_direct: [*mut Page; MI_SMALL_WSIZE_MAX + 2],
    pub pages: [PageQueue; MI_BIN_FULL + 1],
    pub thread_delayed_free: AtomicPtr<Block>,
    pub thread_id: usize,
    pub cookie: usize,
    pub rng: crate::internal::Rng,
    pub page_count: usize,
    pub no_reclaim: bool,
    /// Guards the deferred-free callback against reentering the allocator
    /// from within itself (§9 "Deferred-free callback").
    pub in_deferred_free: bool,
}

impl Heap {
    /// A never-initialized sentinel: `thread_id == 0` marks it as unusable
    /// for allocation, matching the convention `Segment.thread_id == 0`
    /// uses for "abandoned" (§4.8 "the default heap before TLS is ready").
    pub const fn empty() -> Self {
        const EMPTY_QUEUE: PageQueue = PageQueue::empty();
        Heap {
            tld: core::ptr::null_mut(),
            pages_free_direct: [core::ptr::null_mut(); MI_SMALL_WSIZE_MAX + 2],
            pages: [EMPTY_QUEUE; MI_BIN_FULL + 1],
            thread_delayed_free: AtomicPtr::new(core::ptr::null_mut()),
            thread_id: 0,
            cookie: 0,
            rng: crate::internal::Rng::new(1),
            page_count: 0,
            no_reclaim: false,
            in_deferred_free: false,
        }
    }
}

pub struct SegmentQueue {
    pub first: *mut Segment,
    pub last: *mut Segment,
}

impl SegmentQueue {
    pub const fn empty() -> Self {
        SegmentQueue {
            first: core::ptr::null_mut(),
            last: core::ptr::null_mut(),
        }
    }
}

pub struct SegmentsTld {
    pub small_free: SegmentQueue,
    pub medium_free: SegmentQueue,
    pub current_size: AtomicIsize,
    pub peak_size: AtomicIsize,
}

impl SegmentsTld {
    pub const fn empty() -> Self {
        SegmentsTld {
            small_free: SegmentQueue::empty(),
            medium_free: SegmentQueue::empty(),
            current_size: AtomicIsize::new(0),
            peak_size: AtomicIsize::new(0),
        }
    }
}

pub struct OsTld {
    pub mmap_next_probable: usize,
}

impl OsTld {
    pub const fn empty() -> Self {
        OsTld {
            mmap_next_probable: 0,
        }
    }
}

/// Per-thread local data (§3.2 "Heap", §4.8 thread lifecycle).
pub struct Tld {
    pub heartbeat: u64,
    pub heap_backing: *mut Heap,
    pub segments: SegmentsTld,
    pub os: OsTld,
    pub stats: crate::stats::Stats,
}

impl Tld {
    pub const fn empty() -> Self {
        Tld {
            heartbeat: 0,
            heap_backing: core::ptr::null_mut(),
            segments: SegmentsTld::empty(),
            os: OsTld::empty(),
            stats: crate::stats::Stats::new(),
        }
    }
}
