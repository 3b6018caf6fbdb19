//! Page layer (§4.1, §4.2): the three-list free/local_free/thread_free
//! sharding, fast-path block alloc/free, and the slow path that collects
//! remotely freed blocks and extends committed capacity.

use crate::internal::{self, block_next, block_set_next};
use crate::os;
use crate::segment;
use crate::stats::Stats;
use crate::types::*;

use core::sync::atomic::Ordering;

/// Exact emptiness check, valid only from the page's owning thread after
/// a collect (§4.1 "Three-list sharding without locks").
pub fn page_all_free(page: *const Page) -> bool {
    unsafe { (*page).local.used == 0 }
}

/// Racy cross-thread peek: every block currently charged as `used` has
/// already been pushed onto `thread_free` by some other thread, so a
/// collect would empty the page. A false negative just delays reclaim;
/// there is no false positive because `used` only ever decreases via the
/// owning thread's own collect (§9 "Race with emptiness detection").
pub fn page_all_free_racy(page: *const Page) -> bool {
    unsafe { (*page).local.used == (*page).shared.thread_freed.load(Ordering::Relaxed) }
}

unsafe fn chain_len(cookie: usize, mut head: *mut Block) -> usize {
    let mut n = 0usize;
    while !head.is_null() {
        n += 1;
        head = block_next(cookie, head);
    }
    n
}

unsafe fn chain_append(cookie: usize, dst: &mut *mut Block, chain: *mut Block) {
    if chain.is_null() {
        return;
    }
    if dst.is_null() {
        *dst = chain;
        return;
    }
    let mut tail = *dst;
    loop {
        let next = block_next(cookie, tail);
        if next.is_null() {
            break;
        }
        tail = next;
    }
    block_set_next(cookie, tail, chain);
}

/// Folds `local_free` into `free`, then atomically drains `thread_free`
/// into `free` as well, adjusting `used`/`thread_freed` for what was
/// actually collected. This is the only place blocks freed by other
/// threads become visible to the owning thread's fast path.
pub fn page_collect(page: *mut Page) {
    unsafe {
        let cookie = (*page).cookie;
        if !(*page).local.local_free.is_null() {
            let chain = (*page).local.local_free;
            (*page).local.local_free = core::ptr::null_mut();
            chain_append(cookie, &mut (*page).local.free, chain);
        }

        loop {
            let old = (*page).shared.thread_free.load(Ordering::Acquire);
            let old_ptr = (old & !DELAYED_MASK) as *mut Block;
            if old_ptr.is_null() {
                break;
            }
            let tag = old & DELAYED_MASK;
            if (*page)
                .shared
                .thread_free
                .compare_exchange_weak(old, tag, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let n = chain_len(cookie, old_ptr);
                chain_append(cookie, &mut (*page).local.free, old_ptr);
                (*page).local.used = (*page).local.used.saturating_sub(n);
                (*page).shared.thread_freed.fetch_sub(n, Ordering::Relaxed);
                break;
            }
        }
    }
}

/// Pops one block off the owner-only free lists; `None` means the caller
/// must run the slow path (collect, extend, or move to a fresh page).
#[inline]
pub fn page_alloc_fast(page: *mut Page) -> Option<*mut Block> {
    unsafe {
        let cookie = (*page).cookie;
        if !(*page).local.free.is_null() {
            let block = (*page).local.free;
            (*page).local.free = block_next(cookie, block);
            (*page).local.used += 1;
            return Some(block);
        }
        if !(*page).local.local_free.is_null() {
            let block = (*page).local.local_free;
            (*page).local.local_free = block_next(cookie, block);
            (*page).local.used += 1;
            return Some(block);
        }
        None
    }
}

/// Frees a block known to belong to the calling (owning) thread: pushes
/// straight onto `local_free`, no atomics involved.
#[inline]
pub fn page_free_local(page: *mut Page, block: *mut Block) {
    unsafe {
        let cookie = (*page).cookie;
        block_set_next(cookie, block, (*page).local.local_free);
        (*page).local.local_free = block;
        (*page).local.used -= 1;
    }
}

/// Frees a block from a thread other than the page's owner: CAS-pushes
/// onto the atomic `thread_free` LIFO, preserving the delayed-free tag.
pub fn page_free_remote(page: *mut Page, block: *mut Block) {
    unsafe {
        let cookie = (*page).cookie;
        loop {
            let old = (*page).shared.thread_free.load(Ordering::Relaxed);
            let old_ptr = (old & !DELAYED_MASK) as *mut Block;
            let tag = old & DELAYED_MASK;
            block_set_next(cookie, block, old_ptr);
            let new = (block as usize) | tag;
            if (*page)
                .shared
                .thread_free
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        (*page).shared.thread_freed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Dispatches a free to the local or remote path depending on whether the
/// calling thread owns `page`'s segment.
pub fn free_block(page: *mut Page, block: *mut Block, segment_owner: usize) {
    if segment_owner == internal::thread_id() {
        page_free_local(page, block);
    } else {
        page_free_remote(page, block);
    }
}

/// Commits additional capacity (up to `reserved`) and threads the newly
/// committed blocks onto `local.free` (§4.2 "page extend").
pub fn page_extend_free(segment: *const Segment, page: *mut Page, stats: &Stats) -> bool {
    unsafe {
        if (*page).capacity >= (*page).reserved {
            return false;
        }
        let (start, page_size) = segment::segment_page_start(segment, page, (*page).block_size);
        let block_size = (*page).block_size;
        let max_blocks = (page_size / block_size) as u32;
        let want = max_blocks.min((*page).reserved).max((*page).capacity + 1);
        let extend = want - (*page).capacity;
        if extend == 0 {
            return false;
        }

        let commit_start = start.add((*page).capacity as usize * block_size);
        let commit_size = extend as usize * block_size;
        if !os::os_commit(commit_start, commit_size, stats) {
            log::warn!("page_extend_free: commit of {} bytes failed", commit_size);
            return false;
        }
        crate::stats::stat_increase(&stats.page_committed, commit_size as i64);

        let cookie = (*page).cookie;
        for i in (0..extend).rev() {
            let block = start.add(((*page).capacity + i) as usize * block_size) as *mut Block;
            block_set_next(cookie, block, (*page).local.free);
            (*page).local.free = block;
        }
        (*page).capacity = want;
        true
    }
}

/// Initializes a freshly found page for `block_size`-sized allocations,
/// called once when a segment hands it to the page layer for the first
/// time (§4.2).
pub fn page_init(segment: *const Segment, page: *mut Page, block_size: usize, heap: *mut Heap, stats: &Stats) {
    unsafe {
        let (_, page_size) = segment::segment_page_start(segment, page, block_size);
        (*page).block_size = block_size;
        (*page).size_class = internal::bin_for_size(block_size) as u16;
        (*page).reserved = (page_size / block_size) as u32;
        (*page).capacity = 0;
        (*page).heap = heap;
        (*page).cookie = if crate::options::OPTIONS.is_secure() {
            internal::ptr_cookie(page as *const u8)
        } else {
            0
        };
        page_extend_free(segment, page, stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_page() -> Page {
        let mut p = Page::empty();
        p.block_size = 32;
        p
    }

    #[test]
    fn freeing_all_outstanding_blocks_empties_the_page() {
        let mut page = fresh_page();
        page.local.used = 4;
        let page_ptr: *mut Page = &mut page;

        let mut blocks = [Block { next: 0 }; 4];
        for b in blocks.iter_mut() {
            page_free_local(page_ptr, b as *mut Block);
        }

        assert!(page_all_free(page_ptr));
        page_collect(page_ptr);
        assert!(page_all_free(page_ptr));
    }

    #[test]
    fn racy_emptiness_check_matches_used_vs_thread_freed() {
        let mut page = fresh_page();
        page.local.used = 2;
        page.shared.thread_freed.store(2, Ordering::Relaxed);
        assert!(page_all_free_racy(&page));
        page.shared.thread_freed.store(1, Ordering::Relaxed);
        assert!(!page_all_free_racy(&page));
    }
}
