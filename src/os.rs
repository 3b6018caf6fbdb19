//! Platform primitives (§6.1): reserve/commit/decommit/protect memory,
//! page size and NUMA queries, a monotonic clock. Thin wrappers over
//! `libc`/`winapi`, matching the teacher's split; reworked from pseudocode
//! into real, checked FFI calls.

use crate::options::OPTIONS;
use crate::stats::{stat_increase, Stats};
use core::ptr::null_mut;
use core::sync::atomic::{AtomicUsize, Ordering};

static OS_PAGE_SIZE: AtomicUsize = AtomicUsize::new(4096);
static OS_ALLOC_GRANULARITY: AtomicUsize = AtomicUsize::new(4096);
static LARGE_OS_PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

pub fn os_page_size() -> usize {
    OS_PAGE_SIZE.load(Ordering::Relaxed)
}

fn os_alloc_granularity() -> usize {
    OS_ALLOC_GRANULARITY.load(Ordering::Relaxed)
}

pub fn os_large_page_size() -> usize {
    let large = LARGE_OS_PAGE_SIZE.load(Ordering::Relaxed);
    if large != 0 {
        large
    } else {
        os_page_size()
    }
}

fn use_large_os_page(size: usize, align: usize) -> bool {
    let large = LARGE_OS_PAGE_SIZE.load(Ordering::Relaxed);
    large != 0 && size % large == 0 && align % large == 0
}

fn good_alloc_size(size: usize) -> usize {
    if size >= usize::MAX - os_alloc_granularity() {
        return size;
    }
    crate::internal::align_up(size, os_alloc_granularity())
}

/// One-time OS query at process init: page size, allocation granularity,
/// and whether huge/large pages are usable (§4.8).
pub fn os_init() {
    #[cfg(unix)]
    unsafe {
        let page = libc::sysconf(libc::_SC_PAGESIZE);
        if page > 0 {
            OS_PAGE_SIZE.store(page as usize, Ordering::Relaxed);
            OS_ALLOC_GRANULARITY.store(page as usize, Ordering::Relaxed);
        }
        if OPTIONS.allow_large_os_pages.load(Ordering::Relaxed) {
            LARGE_OS_PAGE_SIZE.store(2 * 1024 * 1024, Ordering::Relaxed); // 2MiB hugepage
        }
    }
    #[cfg(windows)]
    unsafe {
        use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
        let mut si: SYSTEM_INFO = core::mem::zeroed();
        GetSystemInfo(&mut si);
        if si.dwPageSize > 0 {
            OS_PAGE_SIZE.store(si.dwPageSize as usize, Ordering::Relaxed);
        }
        if si.dwAllocationGranularity > 0 {
            OS_ALLOC_GRANULARITY.store(si.dwAllocationGranularity as usize, Ordering::Relaxed);
        }
        if OPTIONS.allow_large_os_pages.load(Ordering::Relaxed) {
            let min = winapi::um::memoryapi::GetLargePageMinimum();
            if min > 0 {
                LARGE_OS_PAGE_SIZE.store(min, Ordering::Relaxed);
            }
        }
    }
}

/// `numa_node()`/`numa_node_count()` — out of scope to reimplement fully
/// (§1 "Out of scope"); this crate queries the OS for a best-effort answer
/// and otherwise treats the system as single-node.
pub fn numa_node() -> i32 {
    #[cfg(target_os = "linux")]
    unsafe {
        let cpu = libc::sched_getcpu();
        if cpu >= 0 {
            return cpu % numa_node_count().max(1);
        }
    }
    0
}

pub fn numa_node_count() -> i32 {
    1
}

/// Monotonic clock, milliseconds since an arbitrary epoch (§6.1).
pub fn clock_now_msecs() -> u64 {
    #[cfg(unix)]
    unsafe {
        let mut ts: libc::timespec = core::mem::zeroed();
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        (ts.tv_sec as u64) * 1000 + (ts.tv_nsec as u64) / 1_000_000
    }
    #[cfg(windows)]
    unsafe {
        winapi::um::sysinfoapi::GetTickCount64()
    }
    #[cfg(not(any(unix, windows)))]
    {
        0
    }
}

// -------------------------------------------------------------------
// Reserve / free
// -------------------------------------------------------------------

#[cfg(unix)]
fn unix_mmap(size: usize, try_align: usize, protect_flags: i32) -> *mut u8 {
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    if use_large_os_page(size, try_align) {
        #[cfg(target_os = "linux")]
        {
            let large_flags = flags | libc::MAP_HUGETLB;
            let p = unsafe {
                libc::mmap(null_mut(), size, protect_flags, large_flags, -1, 0)
            };
            if p != libc::MAP_FAILED {
                return p as *mut u8;
            }
            // fall through to the regular mapping below on failure.
        }
        let _ = flags; // keep `flags` used when the hugetlb branch is compiled out
        flags |= 0;
    }
    let p = unsafe { libc::mmap(null_mut(), size, protect_flags, flags, -1, 0) };
    if p == libc::MAP_FAILED {
        null_mut()
    } else {
        p as *mut u8
    }
}

#[cfg(windows)]
fn win_virtual_alloc(size: usize, flags: u32) -> *mut u8 {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::PAGE_READWRITE;
    unsafe { VirtualAlloc(null_mut(), size, flags, PAGE_READWRITE) as *mut u8 }
}

/// Allocates `size` bytes from the OS, committed or reserve-only.
pub fn os_mem_alloc(size: usize, commit: bool, stats: &Stats) -> *mut u8 {
    debug_assert!(size > 0 && size % os_page_size() == 0);
    if size == 0 {
        return null_mut();
    }
    let p;
    #[cfg(windows)]
    {
        use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE};
        let mut flags = MEM_RESERVE;
        if commit {
            flags |= MEM_COMMIT;
        }
        p = win_virtual_alloc(size, flags);
    }
    #[cfg(unix)]
    {
        let protect = if commit {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_NONE
        };
        p = unix_mmap(size, 0, protect);
    }
    stat_increase(&stats.mmap_calls, 1);
    if !p.is_null() {
        stat_increase(&stats.reserved, size as i64);
        if commit {
            stat_increase(&stats.committed, size as i64);
        }
    } else {
        log::warn!("os_mem_alloc: reservation of {} bytes failed", size);
    }
    p
}

pub fn os_mem_free(addr: *mut u8, size: usize, stats: &Stats) -> bool {
    if addr.is_null() || size == 0 {
        return true;
    }
    let ok;
    #[cfg(windows)]
    {
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_RELEASE;
        ok = unsafe { VirtualFree(addr as *mut _, 0, MEM_RELEASE) != 0 };
    }
    #[cfg(unix)]
    {
        ok = unsafe { libc::munmap(addr as *mut _, size) == 0 };
    }
    stat_increase(&stats.committed, -(size as i64));
    stat_increase(&stats.reserved, -(size as i64));
    if !ok {
        log::warn!(
            "munmap/VirtualFree failed: addr {:p}, size {}, errno {}",
            addr,
            size,
            errno::errno()
        );
    }
    ok
}

/// Allocates `size` bytes aligned to `align` (a power of two, >= page
/// size). Over-allocates and trims on platforms without a native aligned
/// reservation call (§9 "Segment recovery by address masking").
pub fn os_mem_alloc_aligned(size: usize, align: usize, commit: bool, stats: &Stats) -> *mut u8 {
    debug_assert!(align >= os_page_size() && align.is_power_of_two());
    let size = crate::internal::align_up(size, os_page_size());

    let p = os_mem_alloc(size, commit, stats);
    if p.is_null() {
        return null_mut();
    }
    if (p as usize) % align == 0 {
        return p;
    }
    os_mem_free(p, size, stats);
    if size >= usize::MAX - align {
        return null_mut();
    }
    let over_size = size + align;
    let over = os_mem_alloc(over_size, commit, stats);
    if over.is_null() {
        return null_mut();
    }
    let aligned = crate::internal::align_up(over as usize, align) as *mut u8;
    let pre_size = aligned as usize - over as usize;
    let mid_size = crate::internal::align_up(size, os_page_size());
    let post_size = over_size - pre_size - mid_size;

    #[cfg(unix)]
    {
        if pre_size > 0 {
            os_mem_free(over, pre_size, stats);
        }
        if post_size > 0 {
            os_mem_free(unsafe { aligned.add(mid_size) }, post_size, stats);
        }
        aligned
    }
    #[cfg(windows)]
    {
        // Windows can only release the whole original reservation, not a
        // sub-range, so the trimmed edges are merely decommitted.
        if pre_size > 0 {
            os_decommit(over, pre_size, stats);
        }
        if post_size > 0 {
            os_decommit(unsafe { aligned.add(mid_size) }, post_size, stats);
        }
        aligned
    }
}

pub fn os_alloc(size: usize, stats: &Stats) -> *mut u8 {
    if size == 0 {
        return null_mut();
    }
    os_mem_alloc(good_alloc_size(size), true, stats)
}

pub fn os_free(p: *mut u8, size: usize, stats: &Stats) {
    if size == 0 || p.is_null() {
        return;
    }
    os_mem_free(p, good_alloc_size(size), stats);
}

pub fn os_alloc_aligned(size: usize, align: usize, commit: bool, stats: &Stats) -> *mut u8 {
    if size == 0 {
        return null_mut();
    }
    let size = good_alloc_size(size);
    let align = crate::internal::align_up(align, os_page_size());
    os_mem_alloc_aligned(size, align, commit, stats)
}

// -------------------------------------------------------------------
// Commit / decommit / purge / protect
// -------------------------------------------------------------------

fn page_align_conservative(addr: *mut u8, size: usize) -> Option<(*mut u8, usize)> {
    if addr.is_null() || size == 0 {
        return None;
    }
    let page = os_page_size();
    let start = crate::internal::align_up(addr as usize, page);
    let end = crate::internal::align_down(addr as usize + size, page);
    if end <= start {
        return None;
    }
    Some((start as *mut u8, end - start))
}

fn page_align_liberal(addr: *mut u8, size: usize) -> (*mut u8, usize) {
    let page = os_page_size();
    let start = crate::internal::align_down(addr as usize, page);
    let end = crate::internal::align_up(addr as usize + size, page);
    (start as *mut u8, end - start)
}

pub fn os_commit(addr: *mut u8, size: usize, stats: &Stats) -> bool {
    let (start, csize) = page_align_liberal(addr, size);
    if csize == 0 {
        return true;
    }
    stat_increase(&stats.committed, csize as i64);
    stat_increase(&stats.commit_calls, 1);
    let ok;
    #[cfg(windows)]
    {
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_COMMIT, PAGE_READWRITE};
        ok = unsafe { !VirtualAlloc(start as *mut _, csize, MEM_COMMIT, PAGE_READWRITE).is_null() };
    }
    #[cfg(unix)]
    {
        ok = unsafe { libc::mprotect(start as *mut _, csize, libc::PROT_READ | libc::PROT_WRITE) == 0 };
    }
    if !ok {
        log::warn!("commit failed: start {:p}, size {}", start, csize);
    }
    ok
}

/// Returns `true` if the range no longer needs a recommit before reuse
/// (i.e. the decommit fully released the backing pages, per §6.1).
pub fn os_decommit(addr: *mut u8, size: usize, stats: &Stats) -> bool {
    let (start, csize) = match page_align_conservative(addr, size) {
        Some(v) => v,
        None => return true,
    };
    stat_increase(&stats.committed, -(csize as i64));
    let ok;
    #[cfg(windows)]
    {
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_DECOMMIT;
        ok = unsafe { VirtualFree(start as *mut _, csize, MEM_DECOMMIT) != 0 };
    }
    #[cfg(unix)]
    {
        ok = unsafe { libc::mprotect(start as *mut _, csize, libc::PROT_NONE) == 0 };
    }
    if !ok {
        log::warn!("decommit failed: start {:p}, size {}", start, csize);
    }
    ok
}

/// Advises the kernel the range is unused without revoking access rights
/// (softer than `os_decommit`, §6.1 `os_purge`).
pub fn os_purge(addr: *mut u8, size: usize, stats: &Stats) -> bool {
    let (start, csize) = match page_align_conservative(addr, size) {
        Some(v) => v,
        None => return true,
    };
    stat_increase(&stats.reset, csize as i64);
    #[cfg(windows)]
    {
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_RESET, PAGE_READWRITE};
        let p = unsafe { VirtualAlloc(start as *mut _, csize, MEM_RESET, PAGE_READWRITE) };
        let ok = p == start as *mut _;
        if !ok {
            log::warn!("MEM_RESET failed: start {:p}, size {}", start, csize);
        }
        ok
    }
    #[cfg(unix)]
    {
        let err = unsafe { libc::madvise(start as *mut _, csize, libc::MADV_DONTNEED) };
        if err != 0 {
            log::warn!(
                "madvise(DONTNEED) failed: start {:p}, size {}, errno {}",
                start,
                csize,
                errno::errno()
            );
        }
        err == 0
    }
}

pub fn os_protect(addr: *mut u8, size: usize) -> bool {
    os_protect_impl(addr, size, true)
}

pub fn os_unprotect(addr: *mut u8, size: usize) -> bool {
    os_protect_impl(addr, size, false)
}

fn os_protect_impl(addr: *mut u8, size: usize, no_access: bool) -> bool {
    let (start, csize) = match page_align_conservative(addr, size) {
        Some(v) => v,
        None => return false,
    };
    #[cfg(windows)]
    {
        use winapi::um::memoryapi::VirtualProtect;
        use winapi::um::winnt::{PAGE_NOACCESS, PAGE_READWRITE};
        let mut old = 0u32;
        let prot = if no_access { PAGE_NOACCESS } else { PAGE_READWRITE };
        unsafe { VirtualProtect(start as *mut _, csize, prot, &mut old) != 0 }
    }
    #[cfg(unix)]
    {
        let prot = if no_access {
            libc::PROT_NONE
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        unsafe { libc::mprotect(start as *mut _, csize, prot) == 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn good_alloc_size_rounds_up_to_granularity() {
        OS_ALLOC_GRANULARITY.store(4096, Ordering::Relaxed);
        assert_eq!(good_alloc_size(1), 4096);
        assert_eq!(good_alloc_size(4096), 4096);
        assert_eq!(good_alloc_size(4097), 8192);
    }

    #[test]
    fn page_align_conservative_shrinks_into_range() {
        OS_PAGE_SIZE.store(4096, Ordering::Relaxed);
        let (start, size) = page_align_conservative(4000 as *mut u8, 9000).unwrap();
        assert_eq!(start as usize % 4096, 0);
        assert!(start as usize >= 4000);
        assert!(start as usize + size <= 4000 + 9000);
    }

    #[test]
    fn page_align_liberal_grows_to_cover_range() {
        OS_PAGE_SIZE.store(4096, Ordering::Relaxed);
        let (start, size) = page_align_liberal(100 as *mut u8, 10);
        assert!(start as usize <= 100);
        assert!(start as usize + size >= 110);
    }
}
