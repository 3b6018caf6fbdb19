//! End-to-end exercises of the public allocator (§8.4): small churn
//! within one thread, cross-thread free, and realloc across a
//! size-class boundary.
//!
//! These go through `Mimalloc`'s `GlobalAlloc` methods directly rather
//! than installing it as the process's `#[global_allocator]` or linking
//! against its exported C symbols: either would fight with the test
//! harness's own allocator, which already owns the process's `malloc`.

use std::alloc::{GlobalAlloc, Layout};
use std::sync::Once;
use std::thread;
use tri_malloc::Mimalloc;

const ALLOC: Mimalloc = Mimalloc;

static LOG_INIT: Once = Once::new();

/// Turns on `env_logger` so `RUST_LOG=tri_malloc=trace cargo test -- --nocapture`
/// surfaces the arena/segment/page diagnostics during a run; a no-op
/// without that env var set.
fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

#[test]
fn small_churn_single_thread_round_trips() {
    for round in 0..64usize {
        let size = 8 + (round % 16) * 8;
        let layout = Layout::from_size_align(size, 8).unwrap();
        unsafe {
            let p = ALLOC.alloc(layout);
            assert!(!p.is_null());
            for i in 0..size {
                *p.add(i) = (round % 251) as u8;
            }
            for i in 0..size {
                assert_eq!(*p.add(i), (round % 251) as u8);
            }
            ALLOC.dealloc(p, layout);
        }
    }
}

#[test]
fn zero_sized_layout_is_non_null_and_freeable() {
    let layout = Layout::from_size_align(0, 1).unwrap();
    unsafe {
        let p = ALLOC.alloc(layout);
        assert!(!p.is_null());
        ALLOC.dealloc(p, layout);
    }
}

#[test]
fn alloc_zeroed_zeroes_the_whole_region() {
    let layout = Layout::from_size_align(256, 8).unwrap();
    unsafe {
        let p = ALLOC.alloc_zeroed(layout);
        assert!(!p.is_null());
        for i in 0..256 {
            assert_eq!(*p.add(i), 0);
        }
        ALLOC.dealloc(p, layout);
    }
}

#[test]
fn realloc_across_size_class_boundary_preserves_contents() {
    let small_layout = Layout::from_size_align(16, 8).unwrap();
    unsafe {
        let small = ALLOC.alloc(small_layout);
        assert!(!small.is_null());
        for i in 0..16 {
            *small.add(i) = (i + 1) as u8;
        }

        // 4096 bytes lands well past the small-size-class ceiling, so
        // this must move to a freshly-sized block.
        let grown = ALLOC.realloc(small, small_layout, 4096);
        assert!(!grown.is_null());
        for i in 0..16 {
            assert_eq!(*grown.add(i), (i + 1) as u8);
        }

        let grown_layout = Layout::from_size_align(4096, 8).unwrap();
        ALLOC.dealloc(grown, grown_layout);
    }
}

#[test]
fn over_aligned_allocation_is_correctly_aligned() {
    for &align in &[32usize, 64, 256, 4096] {
        let layout = Layout::from_size_align(align * 2, align).unwrap();
        unsafe {
            let p = ALLOC.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0);
            *p = 0x42;
            assert_eq!(*p, 0x42);
            ALLOC.dealloc(p, layout);
        }
    }
}

#[test]
fn over_aligned_realloc_preserves_alignment_and_contents() {
    let align = 256;
    let layout = Layout::from_size_align(align, align).unwrap();
    unsafe {
        let p = ALLOC.alloc(layout);
        assert!(!p.is_null());
        *p = 7;

        let grown = ALLOC.realloc(p, layout, align * 4);
        assert!(!grown.is_null());
        assert_eq!(grown as usize % align, 0);
        assert_eq!(*grown, 7);

        let grown_layout = Layout::from_size_align(align * 4, align).unwrap();
        ALLOC.dealloc(grown, grown_layout);
    }
}

#[test]
fn cross_thread_free_does_not_crash_the_owning_thread() {
    init_logging();
    let (tx, rx) = std::sync::mpsc::channel::<usize>();
    let layout = Layout::from_size_align(128, 8).unwrap();

    let producer = thread::spawn(move || {
        for _ in 0..256 {
            let p = unsafe { ALLOC.alloc(layout) };
            assert!(!p.is_null());
            tx.send(p as usize).unwrap();
        }
    });

    let consumer = thread::spawn(move || {
        for _ in 0..256 {
            let addr = rx.recv().unwrap();
            unsafe { ALLOC.dealloc(addr as *mut u8, layout) };
        }
    });

    producer.join().unwrap();
    consumer.join().unwrap();

    // the producer thread can still allocate after its blocks were all
    // remotely freed by the consumer thread.
    unsafe {
        let p = ALLOC.alloc(layout);
        assert!(!p.is_null());
        ALLOC.dealloc(p, layout);
    }
}

#[test]
fn many_threads_allocate_and_free_concurrently() {
    init_logging();
    let handles: Vec<_> = (0..8)
        .map(|t| {
            thread::spawn(move || {
                for i in 0..512usize {
                    let size = 16 + ((t * 7 + i) % 200);
                    let layout = Layout::from_size_align(size, 8).unwrap();
                    unsafe {
                        let p = ALLOC.alloc(layout);
                        assert!(!p.is_null());
                        *p = t as u8;
                        assert_eq!(*p, t as u8);
                        ALLOC.dealloc(p, layout);
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}

/// §8.4 scenario 3: a thread abandons live allocations on exit (its TLS
/// destructor folds the still-owned segment into the abandoned set
/// instead of freeing it, since other threads may still reach blocks in
/// it through remote frees); another thread's next allocation reclaims
/// that segment before minting a fresh one, and `abandoned_count` drops
/// back down once it does.
#[test]
fn abandoned_segment_is_reclaimed_by_another_thread() {
    init_logging();
    let layout = Layout::from_size_align(64, 8).unwrap();
    let before = tri_malloc::abandoned_count();

    thread::spawn(move || {
        for _ in 0..32 {
            let p = unsafe { ALLOC.alloc(layout) };
            assert!(!p.is_null());
        }
        // exits here without freeing any of the above.
    })
    .join()
    .unwrap();

    assert!(tri_malloc::abandoned_count() > before);

    // every slow-path allocation tries to reclaim one abandoned segment
    // first (§4.7); a handful of calls is enough to drain the one the
    // thread above left behind.
    let mut claimed = Vec::new();
    for _ in 0..8 {
        let p = unsafe { ALLOC.alloc(layout) };
        assert!(!p.is_null());
        claimed.push(p);
        if tri_malloc::abandoned_count() <= before {
            break;
        }
    }
    for p in claimed {
        unsafe { ALLOC.dealloc(p, layout) };
    }

    assert_eq!(tri_malloc::abandoned_count(), before);
}

/// §8.4 scenario 4: once a segment is freed back to its arena with
/// `purge_delay_ms` at zero, the range is purged immediately rather than
/// waiting for `try_purge_all`'s periodic sweep. A "large" allocation
/// (above the medium ceiling) gets a whole segment to itself, so a
/// single free empties it and drives it straight through
/// `arena::free_to_arena`'s immediate-purge branch.
#[test]
fn arena_purge_runs_immediately_when_delay_is_zero() {
    init_logging();
    use std::sync::atomic::Ordering;

    struct RestoreDelay(i64);
    impl Drop for RestoreDelay {
        fn drop(&mut self) {
            tri_malloc::OPTIONS
                .purge_delay_ms
                .store(self.0, Ordering::Relaxed);
        }
    }
    let _restore = RestoreDelay(tri_malloc::OPTIONS.purge_delay_ms.load(Ordering::Relaxed));
    tri_malloc::OPTIONS.purge_delay_ms.store(0, Ordering::Relaxed);

    let layout = Layout::from_size_align(256 * 1024, 8).unwrap();
    for _ in 0..4 {
        unsafe {
            let p = ALLOC.alloc(layout);
            assert!(!p.is_null());
            *p = 9;
            assert_eq!(*p, 9);
            ALLOC.dealloc(p, layout);
        }
    }
}
