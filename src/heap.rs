//! Heap layer: per-thread page queues, the direct small-size lookup
//! table, and the generic (slow-path) allocation routine that ties the
//! page and segment layers together (§4.1 "Three-level lookup").

use crate::internal::{self, SizeCategory};
use crate::page;
use crate::segment;
use crate::types::*;

use core::ptr;

fn queue_push(heap: *mut Heap, bin: usize, page: *mut Page) {
    unsafe {
        let queue = &mut (*heap).pages[bin];
        (*page).next = ptr::null_mut();
        (*page).prev = queue.last;
        if !queue.last.is_null() {
            (*queue.last).next = page;
        } else {
            queue.first = page;
        }
        queue.last = page;
        (*heap).page_count += 1;
    }
}

fn queue_remove(heap: *mut Heap, bin: usize, page: *mut Page) {
    unsafe {
        let queue = &mut (*heap).pages[bin];
        if !(*page).prev.is_null() {
            (*(*page).prev).next = (*page).next;
        }
        if !(*page).next.is_null() {
            (*(*page).next).prev = (*page).prev;
        }
        if queue.first == page {
            queue.first = (*page).next;
        }
        if queue.last == page {
            queue.last = (*page).prev;
        }
        (*page).next = ptr::null_mut();
        (*page).prev = ptr::null_mut();
        (*heap).page_count -= 1;
    }
}

/// Each small class is exactly `block_size / MI_INTPTR_SIZE` words wide
/// by construction (§3.1), so the direct table needs one slot per class,
/// not a range fill: `pages_free_direct[wsize] = page`.
fn set_direct(heap: *mut Heap, page: *mut Page) {
    unsafe {
        let block_size = (*page).block_size;
        if block_size == 0 || block_size > MI_SMALL_WSIZE_MAX * internal::MI_INTPTR_SIZE {
            return;
        }
        let idx = internal::wsize_from_size(block_size);
        if idx < (*heap).pages_free_direct.len() {
            (*heap).pages_free_direct[idx] = page;
        }
    }
}

fn clear_direct(heap: *mut Heap, page: *mut Page) {
    unsafe {
        let block_size = (*page).block_size;
        if block_size == 0 || block_size > MI_SMALL_WSIZE_MAX * internal::MI_INTPTR_SIZE {
            return;
        }
        let idx = internal::wsize_from_size(block_size);
        if idx < (*heap).pages_free_direct.len() && (*heap).pages_free_direct[idx] == page {
            (*heap).pages_free_direct[idx] = ptr::null_mut();
        }
    }
}

fn fresh_page(heap: *mut Heap, bin: usize) -> *mut Page {
    unsafe {
        let class_size = internal::size_classes().class_size(bin);
        let tld = &mut *(*heap).tld;
        let page = segment::segment_page_alloc(class_size, tld);
        if page.is_null() {
            return ptr::null_mut();
        }
        let segment = segment::segment_of(page as *const u8);
        page::page_init(segment, page, class_size, heap, &tld.stats);
        queue_push(heap, bin, page);
        page
    }
}

fn huge_alloc(heap: *mut Heap, size: usize) -> *mut u8 {
    unsafe {
        let tld = &mut *(*heap).tld;
        let page = segment::segment_page_alloc(size, tld);
        if page.is_null() {
            return ptr::null_mut();
        }
        let segment = segment::segment_of(page as *const u8);
        page::page_init(segment, page, size, heap, &tld.stats);
        match page::page_alloc_fast(page) {
            Some(block) => block as *mut u8,
            None => ptr::null_mut(),
        }
    }
}

/// Adopts one abandoned segment (if any) and folds its still-live pages
/// into this heap's queues before falling back to allocating a fresh
/// page (§4.7).
fn try_reclaim(heap: *mut Heap) {
    unsafe {
        let tld = &mut *(*heap).tld;
        let segment = match segment::try_reclaim_one(&mut (*heap).rng, tld) {
            Some(s) => s,
            None => return,
        };
        let capacity = (*segment).capacity;
        for i in 0..capacity {
            let page = (*segment).pages.add(i);
            if !(*page).segment_in_use {
                continue;
            }
            (*page).heap = heap;
            page::page_collect(page);
            if page::page_all_free(page) {
                segment::segment_page_free(page, tld);
            } else {
                let bin = (*page).size_class as usize;
                queue_push(heap, bin, page);
                set_direct(heap, page);
            }
        }
    }
}

/// The slow path: walks the matching size-class queue collecting and
/// reusing pages, adopts an abandoned segment if one is available, and
/// only then asks the segment layer for a brand new page.
pub fn malloc_generic(heap: *mut Heap, size: usize) -> *mut u8 {
    if internal::class_category(size) == SizeCategory::Huge {
        return huge_alloc(heap, size);
    }

    let bin = internal::bin_for_size(size);
    try_reclaim(heap);

    unsafe {
        let mut page = (*heap).pages[bin].first;
        while !page.is_null() {
            let next = (*page).next;
            page::page_collect(page);
            if page::page_all_free(page) {
                queue_remove(heap, bin, page);
                clear_direct(heap, page);
                segment::segment_page_free(page, &mut *(*heap).tld);
            } else if let Some(block) = page::page_alloc_fast(page) {
                set_direct(heap, page);
                return block as *mut u8;
            } else {
                let tld = &mut *(*heap).tld;
                let segment = segment::segment_of(page as *const u8);
                if page::page_extend_free(segment, page, &tld.stats) {
                    if let Some(block) = page::page_alloc_fast(page) {
                        set_direct(heap, page);
                        return block as *mut u8;
                    }
                }
            }
            page = next;
        }
    }

    let page = fresh_page(heap, bin);
    if page.is_null() {
        return ptr::null_mut();
    }
    unsafe {
        match page::page_alloc_fast(page) {
            Some(block) => {
                set_direct(heap, page);
                block as *mut u8
            }
            None => ptr::null_mut(),
        }
    }
}

/// Fast path: a direct-table hit services the allocation with no queue
/// walk and no atomics at all.
pub fn heap_malloc(heap: *mut Heap, size: usize) -> *mut u8 {
    let size = size.max(1);
    unsafe {
        let wsize = internal::wsize_from_size(size);
        if wsize < (*heap).pages_free_direct.len() {
            let page = (*heap).pages_free_direct[wsize];
            if !page.is_null() {
                if let Some(block) = page::page_alloc_fast(page) {
                    return block as *mut u8;
                }
            }
        }
    }
    malloc_generic(heap, size)
}

/// Walks every queued page, collecting remote frees and releasing pages
/// (and, transitively, segments) that are now fully free. Called from
/// thread/process teardown and from `mi_collect` (§4.8, §4.9).
pub fn heap_collect(heap: *mut Heap) {
    unsafe {
        for bin in 0..(*heap).pages.len() {
            let mut page = (*heap).pages[bin].first;
            while !page.is_null() {
                let next = (*page).next;
                page::page_collect(page);
                if page::page_all_free(page) {
                    queue_remove(heap, bin, page);
                    clear_direct(heap, page);
                    segment::segment_page_free(page, &mut *(*heap).tld);
                }
                page = next;
            }
        }
    }
}

/// Abandons every page still holding live blocks (called from thread
/// exit, §4.8) so other threads can later reclaim the segments.
pub fn heap_collect_abandon(heap: *mut Heap) {
    unsafe {
        let tld = &mut *(*heap).tld;
        for bin in 0..(*heap).pages.len() {
            let mut page = (*heap).pages[bin].first;
            while !page.is_null() {
                let next = (*page).next;
                page::page_collect(page);
                let segment = segment::segment_of(page as *const u8);
                if page::page_all_free(page) {
                    queue_remove(heap, bin, page);
                    clear_direct(heap, page);
                    segment::segment_page_free(page, tld);
                } else {
                    queue_remove(heap, bin, page);
                    clear_direct(heap, page);
                    // a segment spans several pages; skip if an earlier
                    // page in this same segment already abandoned it.
                    if (*segment).thread_id.load(core::sync::atomic::Ordering::Relaxed) != 0 {
                        segment::segment_abandon(segment, tld);
                    }
                }
                page = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_direct_round_trips() {
        let mut heap = Heap::empty();
        let mut page = Page::empty();
        page.block_size = internal::MI_INTPTR_SIZE * 3;
        let heap_ptr: *mut Heap = &mut heap;
        let page_ptr: *mut Page = &mut page;

        set_direct(heap_ptr, page_ptr);
        assert_eq!(heap.pages_free_direct[3], page_ptr);
        clear_direct(heap_ptr, page_ptr);
        assert!(heap.pages_free_direct[3].is_null());
    }

    #[test]
    fn queue_push_and_remove_maintain_first_last() {
        let mut heap = Heap::empty();
        let mut a = Page::empty();
        let mut b = Page::empty();
        let heap_ptr: *mut Heap = &mut heap;
        let a_ptr: *mut Page = &mut a;
        let b_ptr: *mut Page = &mut b;

        queue_push(heap_ptr, 0, a_ptr);
        queue_push(heap_ptr, 0, b_ptr);
        assert_eq!(heap.pages[0].first, a_ptr);
        assert_eq!(heap.pages[0].last, b_ptr);

        queue_remove(heap_ptr, 0, a_ptr);
        assert_eq!(heap.pages[0].first, b_ptr);
        assert_eq!(heap.pages[0].last, b_ptr);
    }
}
