//! Segment layer (§4.3, §4.7): arena-block-aligned chunks carrying a
//! header plus an inline array of pages, owned by one thread while live.
//!
//! Grounded in the teacher's segment queue/abandonment design, but backed
//! by the arena bitmap layer for actual memory instead of a per-thread
//! segment cache — the arena's delayed purge already gives back the
//! "avoid OS round trips on churn" benefit the teacher's cache existed
//! for, so the cache itself is not carried forward (see DESIGN.md).

use crate::arena;
use crate::internal::{self, MI_MAX_ALIGN_SIZE, MI_SEGMENT_MASK, MI_SEGMENT_SIZE};
use crate::options::OPTIONS;
use crate::os;
use crate::stats::{stat_decrease, stat_increase, Stats};
use crate::types::*;

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

const PAGE_HUGE_ALIGN: usize = 256 * 1024;

fn capacity_for(kind: PageKind) -> usize {
    match kind {
        PageKind::Small => internal::MI_SMALL_PAGES_PER_SEGMENT,
        PageKind::Medium => internal::MI_MEDIUM_PAGES_PER_SEGMENT,
        PageKind::Large | PageKind::Huge => 1,
    }
}

fn header_size(capacity: usize) -> usize {
    let raw = core::mem::size_of::<Segment>() + capacity * core::mem::size_of::<Page>();
    internal::align_up(raw, MI_MAX_ALIGN_SIZE)
}

fn segment_size_for(kind: PageKind, required: usize) -> (usize, usize) {
    let info_size = header_size(capacity_for(kind));
    let seg_size = match kind {
        PageKind::Huge => internal::align_up(required + info_size, PAGE_HUGE_ALIGN),
        _ => MI_SEGMENT_SIZE,
    };
    (seg_size, info_size)
}

/// Recovers a segment header from any pointer inside it (§3.2 invariant).
#[inline]
pub fn segment_of(p: *const u8) -> *mut Segment {
    ((p as usize) & !MI_SEGMENT_MASK) as *mut Segment
}

/// Recovers the owning page from a user pointer and its already-recovered
/// segment (small/medium use the fixed page-shift; large/huge have one
/// page at index 0).
#[inline]
pub fn page_of(ptr: *const u8, segment: *mut Segment) -> *mut Page {
    unsafe {
        let seg = &*segment;
        let idx = match seg.page_kind {
            PageKind::Large | PageKind::Huge => 0,
            _ => (ptr as usize - segment as usize) >> seg.page_shift,
        };
        seg.pages.add(idx)
    }
}

pub fn segment_page_start(segment: *const Segment, page: *const Page, block_size: usize) -> (*mut u8, usize) {
    unsafe {
        let seg = &*segment;
        let pg = &*page;
        let mut psize = if seg.page_kind == PageKind::Huge {
            seg.segment_size
        } else {
            1 << seg.page_shift
        };
        let mut p = (segment as usize + pg.segment_idx as usize * psize) as *mut u8;
        if pg.segment_idx == 0 {
            p = p.add(seg.segment_info_size);
            psize -= seg.segment_info_size;
            if block_size > 0 && seg.page_kind == PageKind::Small {
                let rem = (p as usize) % block_size;
                if rem != 0 {
                    let adjust = block_size - rem;
                    if adjust < block_size {
                        p = p.add(adjust);
                        psize -= adjust;
                    }
                }
            }
        }
        let secure = OPTIONS.secure_level.load(Ordering::Relaxed);
        if secure > 1 || (secure == 1 && pg.segment_idx as usize == seg.capacity - 1) {
            psize -= os::os_page_size();
        }
        (p, psize)
    }
}

// ---------------------------------------------------------------------
// Free-page segment queues (small/medium only; large/huge are never
// queued since they hold exactly one, always-fully-used page).
// ---------------------------------------------------------------------

fn queue_for(kind: PageKind, tld: &mut SegmentsTld) -> &mut SegmentQueue {
    match kind {
        PageKind::Small => &mut tld.small_free,
        PageKind::Medium => &mut tld.medium_free,
        _ => unreachable!("large/huge segments are never queued"),
    }
}

unsafe fn queue_contains(queue: *const SegmentQueue, segment: *mut Segment) -> bool {
    let mut node = (*queue).first;
    while !node.is_null() {
        if node == segment {
            return true;
        }
        node = (*node).next;
    }
    false
}

unsafe fn queue_remove(queue: *mut SegmentQueue, segment: *mut Segment) {
    debug_assert!(queue_contains(queue, segment));
    if !(*segment).prev.is_null() {
        (*(*segment).prev).next = (*segment).next;
    }
    if !(*segment).next.is_null() {
        (*(*segment).next).prev = (*segment).prev;
    }
    if segment == (*queue).first {
        (*queue).first = (*segment).next;
    }
    if segment == (*queue).last {
        (*queue).last = (*segment).prev;
    }
    (*segment).next = ptr::null_mut();
    (*segment).prev = ptr::null_mut();
}

unsafe fn queue_enqueue(queue: *mut SegmentQueue, segment: *mut Segment) {
    debug_assert!(!queue_contains(queue, segment));
    (*segment).next = ptr::null_mut();
    (*segment).prev = (*queue).last;
    if !(*queue).last.is_null() {
        (*(*queue).last).next = segment;
        (*queue).last = segment;
    } else {
        (*queue).first = segment;
        (*queue).last = segment;
    }
}

unsafe fn is_in_free_queue(segment: *mut Segment, tld: &mut SegmentsTld) -> bool {
    let kind = (*segment).page_kind;
    if !matches!(kind, PageKind::Small | PageKind::Medium) {
        return false;
    }
    !(*segment).next.is_null() || !(*segment).prev.is_null() || queue_for(kind, tld).first == segment
}

unsafe fn remove_from_free_queue_if_present(segment: *mut Segment, tld: &mut SegmentsTld) {
    if is_in_free_queue(segment, tld) {
        let kind = (*segment).page_kind;
        queue_remove(queue_for(kind, tld), segment);
    }
}

fn segments_track_size(delta: isize, tld: &mut SegmentsTld, stats: &Stats) {
    if delta >= 0 {
        stat_increase(&stats.segments, 1);
    } else {
        stat_decrease(&stats.segments, 1);
    }
    let current = tld.current_size.fetch_add(delta, Ordering::Relaxed) + delta;
    let mut peak = tld.peak_size.load(Ordering::Relaxed);
    while current > peak {
        match tld.peak_size.compare_exchange_weak(peak, current, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => peak = actual,
        }
    }
}

// ---------------------------------------------------------------------
// Allocation / free
// ---------------------------------------------------------------------

fn acquire_memory(seg_size: usize, stats: &Stats) -> (*mut u8, MemId) {
    if !OPTIONS.disallow_arena_alloc.load(Ordering::Relaxed) {
        let allow_large = OPTIONS.allow_large_os_pages.load(Ordering::Relaxed);
        if let Some(claim) = arena::alloc_from_arenas(seg_size, allow_large) {
            return (claim.ptr, claim.memid);
        }
    }
    if OPTIONS.disallow_os_alloc.load(Ordering::Relaxed) {
        return (ptr::null_mut(), MemId::Os);
    }
    let p = os::os_alloc_aligned(seg_size, MI_SEGMENT_SIZE, true, stats);
    (p, MemId::Os)
}

/// Allocates a fresh segment of the given kind (§4.3, §4.5).
pub fn segment_alloc(required: usize, kind: PageKind, page_shift: usize, tld: &mut Tld) -> *mut Segment {
    let capacity = capacity_for(kind);
    let (seg_size, info_size) = segment_size_for(kind, required);

    let (raw, memid) = acquire_memory(seg_size, &tld.stats);
    if raw.is_null() {
        log::warn!("segment allocation of {} bytes failed", seg_size);
        return ptr::null_mut();
    }
    debug_assert_eq!(raw as usize % MI_SEGMENT_SIZE, 0);

    segments_track_size(seg_size as isize, &mut tld.segments, &tld.stats);

    unsafe {
        ptr::write_bytes(raw, 0, info_size);
        let segment = raw as *mut Segment;
        let pages_ptr = raw.add(core::mem::size_of::<Segment>()) as *mut Page;
        for i in 0..capacity {
            (*pages_ptr.add(i)).segment_idx = i as u16;
        }
        (*segment).next = ptr::null_mut();
        (*segment).prev = ptr::null_mut();
        ptr::write(&mut (*segment).abandoned_next, AtomicPtr::new(ptr::null_mut()));
        (*segment).abandoned = 0;
        (*segment).used = 0;
        (*segment).capacity = capacity;
        (*segment).segment_size = seg_size;
        (*segment).segment_info_size = info_size;
        (*segment).cookie = internal::ptr_cookie(raw);
        (*segment).page_shift = page_shift;
        ptr::write(&mut (*segment).thread_id, core::sync::atomic::AtomicUsize::new(internal::thread_id()));
        (*segment).page_kind = kind;
        (*segment).memid = memid;
        (*segment).pages = pages_ptr;

        stat_increase(&tld.stats.page_committed, info_size as i64);
        segment
    }
}

fn release_memory(segment: *mut Segment, stats: &Stats) {
    unsafe {
        match (*segment).memid {
            MemId::Arena { .. } => arena::free_to_arena((*segment).memid),
            MemId::Os => {
                os::os_free(segment as *mut u8, (*segment).segment_size, stats);
            }
        }
    }
}

/// Returns a segment with no live pages back to its arena/OS origin.
pub fn segment_free(segment: *mut Segment, tld: &mut Tld) {
    unsafe {
        remove_from_free_queue_if_present(segment, &mut tld.segments);
        debug_assert!((*segment).next.is_null() && (*segment).prev.is_null());
        stat_decrease(&tld.stats.page_committed, (*segment).segment_info_size as i64);
        (*segment).thread_id.store(0, Ordering::Release);

        segments_track_size(-((*segment).segment_size as isize), &mut tld.segments, &tld.stats);
        release_memory(segment, &tld.stats);
    }
}

pub fn segment_has_free(segment: *const Segment) -> bool {
    unsafe { (*segment).used < (*segment).capacity }
}

fn segment_find_free(segment: *mut Segment) -> *mut Page {
    unsafe {
        let cap = (*segment).capacity;
        for i in 0..cap {
            let page = (*segment).pages.add(i);
            if !(*page).segment_in_use {
                return page;
            }
        }
    }
    unreachable!("segment_find_free called on a segment with no free pages")
}

// ---------------------------------------------------------------------
// Page clear / free within a segment
// ---------------------------------------------------------------------

pub fn segment_page_clear(segment: *mut Segment, page: *mut Page, stats: &Stats) {
    unsafe {
        debug_assert!((*page).segment_in_use);
        let inuse = (*page).capacity as usize * (*page).block_size;
        stat_decrease(&stats.page_committed, inuse as i64);
        stat_decrease(&stats.pages, 1);

        let idx = (*page).segment_idx;
        let was_reset = (*page).is_reset;
        *page = Page::empty();
        (*page).segment_idx = idx;
        (*page).is_reset = was_reset;
        (*page).segment_in_use = false;
        (*segment).used -= 1;
    }
}

/// Called once a page has no live blocks left: clears it and, if the
/// segment itself is now wholly unused, returns it to the arena/OS.
pub fn segment_page_free(page: *mut Page, tld: &mut Tld) {
    unsafe {
        let segment = segment_of_page(page);
        segment_page_clear(segment, page, &tld.stats);

        if (*segment).used == 0 {
            segment_free(segment, tld);
        } else if (*segment).used + 1 == (*segment).capacity {
            let kind = (*segment).page_kind;
            if matches!(kind, PageKind::Small | PageKind::Medium) {
                queue_enqueue(queue_for(kind, &mut tld.segments), segment);
            }
        }
    }
}

/// Recovers a page's owning segment from its position in the inline
/// pages array (valid even for a page that was never committed).
unsafe fn segment_of_page(page: *mut Page) -> *mut Segment {
    let idx = (*page).segment_idx as usize;
    let pages_ptr = page.sub(idx);
    (pages_ptr as *mut u8).sub(core::mem::size_of::<Segment>()) as *mut Segment
}

// ---------------------------------------------------------------------
// Abandonment (§4.7)
// ---------------------------------------------------------------------

/// Treiber stack for segments whose memory bypassed the arena layer
/// (`disallow_arena_alloc`, or an arena reservation failure): the arena
/// bitmap has nothing to mark for these, so they get a dedicated list.
static OS_ABANDONED: AtomicPtr<Segment> = AtomicPtr::new(ptr::null_mut());

pub fn segment_abandon(segment: *mut Segment, tld: &mut Tld) {
    unsafe {
        remove_from_free_queue_if_present(segment, &mut tld.segments);
        debug_assert!((*segment).next.is_null() && (*segment).prev.is_null());
        (*segment).thread_id.store(0, Ordering::Release);

        match (*segment).memid {
            MemId::Arena { .. } => arena::mark_abandoned((*segment).memid),
            MemId::Os => loop {
                let head = OS_ABANDONED.load(Ordering::Acquire);
                (*segment).abandoned_next.store(head, Ordering::Relaxed);
                if OS_ABANDONED
                    .compare_exchange_weak(head, segment, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            },
        }
        stat_increase(&tld.stats.segments_abandoned, 1);
    }
}

fn finish_reclaim(segment: *mut Segment, tld: &mut Tld) {
    unsafe {
        (*segment).thread_id.store(internal::thread_id(), Ordering::Release);
        (*segment).abandoned_next.store(ptr::null_mut(), Ordering::Relaxed);
        segments_track_size((*segment).segment_size as isize, &mut tld.segments, &tld.stats);
        stat_decrease(&tld.stats.segments_abandoned, 1);

        if matches!((*segment).memid, MemId::Os) {
            arena::clear_non_arena_abandoned();
        }

        let kind = (*segment).page_kind;
        if matches!(kind, PageKind::Small | PageKind::Medium) && segment_has_free(segment) {
            queue_enqueue(queue_for(kind, &mut tld.segments), segment);
        }
    }
}

/// Adopts one abandoned segment for the calling thread, if any is
/// available. The page layer is responsible for walking its pages
/// afterwards and either clearing empty ones or reclaiming live ones
/// into the calling heap.
pub fn try_reclaim_one(rng: &mut internal::Rng, tld: &mut Tld) -> Option<*mut Segment> {
    if let Some((arena_idx, bit_idx)) = arena::try_reclaim_one(rng) {
        let segment = arena::block_address(arena_idx, bit_idx) as *mut Segment;
        finish_reclaim(segment, tld);
        return Some(segment);
    }
    loop {
        let head = OS_ABANDONED.load(Ordering::Acquire);
        if head.is_null() {
            return None;
        }
        let next = unsafe { (*head).abandoned_next.load(Ordering::Relaxed) };
        if OS_ABANDONED
            .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            finish_reclaim(head, tld);
            return Some(head);
        }
    }
}

// ---------------------------------------------------------------------
// Small / medium / large / huge page allocation
// ---------------------------------------------------------------------

fn generic_page_alloc_in(segment: *mut Segment, tld: &mut Tld) -> *mut Page {
    debug_assert!(segment_has_free(segment));
    let page = segment_find_free(segment);
    unsafe {
        (*page).segment_in_use = true;
        (*segment).used += 1;
        if (*segment).used == (*segment).capacity {
            let kind = (*segment).page_kind;
            queue_remove(queue_for(kind, &mut tld.segments), segment);
        }
    }
    stat_increase(&tld.stats.pages, 1);
    page
}

fn generic_page_alloc(kind: PageKind, page_shift: usize, tld: &mut Tld) -> *mut Page {
    let queue_empty = {
        let q = queue_for(kind, &mut tld.segments);
        q.first.is_null()
    };
    if queue_empty {
        let segment = segment_alloc(0, kind, page_shift, tld);
        if segment.is_null() {
            return ptr::null_mut();
        }
        unsafe { queue_enqueue(queue_for(kind, &mut tld.segments), segment) };
    }
    let first = queue_for(kind, &mut tld.segments).first;
    generic_page_alloc_in(first, tld)
}

fn segment_large_page_alloc(tld: &mut Tld) -> *mut Page {
    let segment = segment_alloc(0, PageKind::Large, internal::MI_LARGE_PAGE_SHIFT, tld);
    if segment.is_null() {
        return ptr::null_mut();
    }
    unsafe {
        (*segment).used = 1;
        let page = (*segment).pages;
        (*page).segment_in_use = true;
        stat_increase(&tld.stats.pages, 1);
        page
    }
}

fn segment_huge_page_alloc(size: usize, tld: &mut Tld) -> *mut Page {
    let segment = segment_alloc(size, PageKind::Huge, internal::MI_SEGMENT_SHIFT, tld);
    if segment.is_null() {
        return ptr::null_mut();
    }
    unsafe {
        debug_assert!((*segment).segment_size - (*segment).segment_info_size >= size);
        (*segment).used = 1;
        let page = (*segment).pages;
        (*page).segment_in_use = true;
        stat_increase(&tld.stats.pages, 1);
        page
    }
}

/// Dispatches to the right segment kind for a block of `block_size` bytes
/// (§4.3 category table).
pub fn segment_page_alloc(block_size: usize, tld: &mut Tld) -> *mut Page {
    if block_size < internal::MI_SMALL_PAGE_SIZE / 8 {
        generic_page_alloc(PageKind::Small, internal::MI_SMALL_PAGE_SHIFT, tld)
    } else if block_size <= internal::MI_MEDIUM_SIZE_MAX {
        generic_page_alloc(PageKind::Medium, internal::MI_MEDIUM_PAGE_SHIFT, tld)
    } else if block_size < internal::MI_LARGE_SIZE_MAX - core::mem::size_of::<Segment>() {
        segment_large_page_alloc(tld)
    } else {
        segment_huge_page_alloc(block_size, tld)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_size_for_small_is_fixed_segment_size() {
        let (size, info) = segment_size_for(PageKind::Small, 0);
        assert_eq!(size, MI_SEGMENT_SIZE);
        assert!(info < size);
        assert_eq!(info % MI_MAX_ALIGN_SIZE, 0);
    }

    #[test]
    fn segment_size_for_huge_grows_with_request() {
        let (size, info) = segment_size_for(PageKind::Huge, 10 * 1024 * 1024);
        assert!(size >= 10 * 1024 * 1024 + info);
        assert_eq!(size % PAGE_HUGE_ALIGN, 0);
    }

    #[test]
    fn segment_of_masks_to_segment_alignment() {
        let fake_segment = (4 * MI_SEGMENT_SIZE) as *const u8;
        let interior = unsafe { fake_segment.add(123) };
        assert_eq!(segment_of(interior) as usize, fake_segment as usize);
    }
}
