//! Process and thread lifecycle (§4.8): lazily allocates the per-thread
//! `Heap`/`Tld` pair the first time a thread touches the allocator, and
//! arranges for it to be abandoned when the thread exits. Uses raw
//! platform TLS rather than `std::thread_local!`, since this crate has
//! no `std` to lean on.

use crate::heap;
use crate::internal;
use crate::options;
use crate::os;
use crate::stats::{self, GLOBAL_STATS};
use crate::types::*;

use core::mem::size_of;
use core::ptr::{self, addr_of, addr_of_mut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Backing allocation for every thread but the main one. `heap` comes
/// first so a `*mut ThreadData` and the `*mut Heap` TLS slot alias the
/// same address.
#[repr(C)]
struct ThreadData {
    heap: Heap,
    tld: Tld,
}

static mut HEAP_MAIN: Heap = Heap::empty();
static mut TLD_MAIN: Tld = Tld::empty();

static PROCESS_INITIALIZED: AtomicBool = AtomicBool::new(false);
static PROCESS_DONE: AtomicBool = AtomicBool::new(false);
static MAIN_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

fn is_main_thread() -> bool {
    let main = MAIN_THREAD_ID.load(Ordering::Relaxed);
    main == 0 || main == internal::thread_id()
}

// ---------------------------------------------------------------------
// Per-thread storage: one slot holding the calling thread's `*mut Heap`,
// null until `heap_init` runs. A platform destructor calls `thread_done`
// so memory abandoned by an exiting thread can be reclaimed elsewhere.
// ---------------------------------------------------------------------

#[cfg(unix)]
mod tls {
    use super::thread_done;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static KEY: AtomicUsize = AtomicUsize::new(usize::MAX);

    unsafe extern "C" fn destructor(value: *mut libc::c_void) {
        if !value.is_null() {
            thread_done();
        }
    }

    fn key() -> libc::pthread_key_t {
        let existing = KEY.load(Ordering::Acquire);
        if existing != usize::MAX {
            return existing as libc::pthread_key_t;
        }
        unsafe {
            let mut created: libc::pthread_key_t = 0;
            libc::pthread_key_create(&mut created, Some(destructor));
            match KEY.compare_exchange(usize::MAX, created as usize, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => created,
                // another thread won the race to create the key; the key
                // we just created is leaked, which is fine, it happens once.
                Err(winner) => winner as libc::pthread_key_t,
            }
        }
    }

    pub fn get() -> *mut super::Heap {
        unsafe { libc::pthread_getspecific(key()) as *mut super::Heap }
    }

    pub fn set(heap: *mut super::Heap) {
        unsafe {
            libc::pthread_setspecific(key(), heap as *mut libc::c_void);
        }
    }
}

#[cfg(windows)]
mod tls {
    use super::thread_done;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use winapi::um::fibersapi::{FlsAlloc, FlsGetValue, FlsSetValue};
    use winapi::um::winbase::FLS_OUT_OF_INDEXES;

    static KEY: AtomicUsize = AtomicUsize::new(usize::MAX);

    unsafe extern "system" fn destructor(value: *mut winapi::ctypes::c_void) {
        if !value.is_null() {
            thread_done();
        }
    }

    fn key() -> u32 {
        let existing = KEY.load(Ordering::Acquire);
        if existing != usize::MAX {
            return existing as u32;
        }
        unsafe {
            let created = FlsAlloc(Some(destructor));
            if created == FLS_OUT_OF_INDEXES {
                log::error!("FlsAlloc failed, thread-local heaps will not be reclaimed on thread exit");
            }
            match KEY.compare_exchange(usize::MAX, created as usize, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => created,
                Err(winner) => winner as u32,
            }
        }
    }

    pub fn get() -> *mut super::Heap {
        unsafe { FlsGetValue(key()) as *mut super::Heap }
    }

    pub fn set(heap: *mut super::Heap) {
        unsafe {
            FlsSetValue(key(), heap as *mut _);
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod tls {
    // No portable destructor hook on this platform: the slot still works
    // within a thread's lifetime but an exiting thread's heap is only
    // reclaimed by `process_done`, not as each thread exits.
    #[thread_local]
    static mut SLOT: *mut super::Heap = core::ptr::null_mut();

    pub fn get() -> *mut super::Heap {
        unsafe { SLOT }
    }

    pub fn set(heap: *mut super::Heap) {
        unsafe {
            SLOT = heap;
        }
    }
}

fn heap_is_main(heap: *mut Heap) -> bool {
    heap as *const Heap == addr_of!(HEAP_MAIN)
}

/// Returns the calling thread's heap, initializing it on first use.
pub fn get_default_heap() -> *mut Heap {
    let heap = tls::get();
    if !heap.is_null() {
        return heap;
    }
    thread_init();
    let heap = tls::get();
    if heap.is_null() {
        // allocation of the thread-local heap failed; fall back to the
        // main heap rather than handing callers a null pointer.
        unsafe { addr_of_mut!(HEAP_MAIN) }
    } else {
        heap
    }
}

/// Lazily creates the calling thread's heap. Returns `true` if it was
/// already initialized.
fn heap_init() -> bool {
    if !tls::get().is_null() {
        return true;
    }

    if is_main_thread() {
        unsafe {
            tls::set(addr_of_mut!(HEAP_MAIN));
        }
        return false;
    }

    unsafe {
        let td = os::os_alloc(size_of::<ThreadData>(), &GLOBAL_STATS) as *mut ThreadData;
        if td.is_null() {
            log::error!("failed to allocate thread-local heap memory");
            return false;
        }

        ptr::write(addr_of_mut!((*td).heap), Heap::empty());
        ptr::write(addr_of_mut!((*td).tld), Tld::empty());

        let heap = addr_of_mut!((*td).heap);
        let tld = addr_of_mut!((*td).tld);

        let tid = internal::thread_id();
        let mut rng = internal::Rng::new(tid as u64 ^ internal::process_cookie() as u64);
        (*heap).thread_id = tid;
        (*heap).cookie = (heap as usize ^ rng.next_usize()) | 1;
        (*heap).rng = rng;
        (*heap).tld = tld;
        (*tld).heap_backing = heap;

        tls::set(heap);
    }
    false
}

/// Abandons the calling thread's heap (called from the TLS destructor on
/// thread exit, and from `process_done` for the main thread).
fn heap_done() -> bool {
    let heap = tls::get();
    if heap.is_null() {
        return true;
    }
    tls::set(ptr::null_mut());

    unsafe {
        let backing = (*(*heap).tld).heap_backing;
        if backing.is_null() {
            return false;
        }

        if heap_is_main(backing) {
            heap::heap_collect(backing);
        } else {
            heap::heap_collect_abandon(backing);
        }

        stats::merge_into_global(&(*(*backing).tld).stats);

        if !heap_is_main(backing) {
            os::os_free(backing as *mut u8, size_of::<ThreadData>(), &GLOBAL_STATS);
        }
    }
    false
}

/// Called the first time a thread reaches into the allocator
/// (`heap::malloc_generic`/`get_default_heap`); cheap to call repeatedly.
pub fn thread_init() {
    process_init();

    if heap_init() {
        return; // already initialized
    }
    if is_main_thread() {
        return; // the main heap doesn't count itself as a spawned thread
    }

    unsafe {
        let heap = tls::get();
        stats::stat_increase(&(*(*heap).tld).stats.threads, 1);
    }
    log::debug!("thread init: {:#x}", internal::thread_id());
}

/// Called from the platform TLS destructor when a (non-main) thread
/// exits.
pub fn thread_done() {
    let heap = tls::get();
    if !is_main_thread() && !heap.is_null() {
        unsafe {
            stats::stat_decrease(&(*(*heap).tld).stats.threads, 1);
        }
    }

    if heap_done() {
        return;
    }
    log::debug!("thread done: {:#x}", internal::thread_id());
}

/// Runs once per process: wires up the main heap, reads configuration
/// from the environment, and initializes the OS layer. Safe to call from
/// every `thread_init`; only the first call does anything.
pub fn process_init() {
    if PROCESS_INITIALIZED.swap(true, Ordering::AcqRel) {
        return;
    }

    let tid = internal::thread_id();
    MAIN_THREAD_ID.store(tid, Ordering::Relaxed);

    unsafe {
        HEAP_MAIN.thread_id = tid;
        HEAP_MAIN.tld = addr_of_mut!(TLD_MAIN);
        (*addr_of_mut!(TLD_MAIN)).heap_backing = addr_of_mut!(HEAP_MAIN);

        let mut rng = internal::Rng::new(tid as u64 ^ internal::process_cookie() as u64);
        HEAP_MAIN.cookie = (addr_of!(HEAP_MAIN) as usize ^ rng.next_usize()) | 1;
        HEAP_MAIN.rng = rng;

        tls::set(addr_of_mut!(HEAP_MAIN));
    }

    options::init_from_env();
    os::os_init();
    register_process_done();

    log::debug!("process init: {:#x}", tid);
}

/// Runs once at process exit: collects the main heap and, if requested,
/// prints final statistics.
fn process_done() {
    if !PROCESS_INITIALIZED.load(Ordering::Acquire) {
        return;
    }
    if PROCESS_DONE.swap(true, Ordering::AcqRel) {
        return;
    }

    unsafe {
        heap::heap_collect(addr_of_mut!(HEAP_MAIN));
    }

    if options::OPTIONS.show_stats.load(Ordering::Relaxed) || options::OPTIONS.verbose.load(Ordering::Relaxed) {
        stats::stats_print();
    }

    log::debug!("process done: {:#x}", MAIN_THREAD_ID.load(Ordering::Relaxed));
}

extern "C" fn process_done_extern() {
    process_done();
}

#[cfg(any(unix, windows))]
fn register_process_done() {
    unsafe {
        libc::atexit(process_done_extern);
    }
}

#[cfg(not(any(unix, windows)))]
fn register_process_done() {
    log::warn!("no atexit available on this platform; process-wide stats will not be flushed");
}

// ---------------------------------------------------------------------
// Automatic process startup, so programs that never call an explicit
// init function still get `process_init` run before `main` (§4.8).
// `thread_init` also calls `process_init` itself, so this is a
// convenience, not a correctness requirement.
// ---------------------------------------------------------------------

#[cfg(all(any(target_os = "linux", target_os = "android"), not(test)))]
#[used]
#[link_section = ".init_array"]
static INIT_ARRAY: extern "C" fn() = {
    extern "C" fn run() {
        process_init();
    }
    run
};

#[cfg(all(target_os = "macos", not(test)))]
#[used]
#[link_section = "__DATA,__mod_init_func"]
static INIT_ARRAY: extern "C" fn() = {
    extern "C" fn run() {
        process_init();
    }
    run
};

#[cfg(all(target_os = "windows", target_env = "msvc", not(test)))]
#[used]
#[link_section = ".CRT$XCU"]
static INIT_ARRAY: extern "C" fn() = {
    extern "C" fn run() {
        process_init();
    }
    run
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_main_thread_is_true_before_any_process_init() {
        // MAIN_THREAD_ID defaults to 0, which `is_main_thread` treats as
        // "no process init has run yet, so everyone is the main thread".
        assert!(is_main_thread());
    }

    #[test]
    fn heap_is_main_matches_only_the_static_main_heap() {
        let mut other = Heap::empty();
        let other_ptr: *mut Heap = &mut other;
        unsafe {
            assert!(heap_is_main(addr_of_mut!(HEAP_MAIN)));
        }
        assert!(!heap_is_main(other_ptr));
    }
}
