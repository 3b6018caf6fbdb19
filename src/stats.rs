//! Process-wide atomic statistics (§3.2 "Stats", §4.9). Every OS call and
//! every segment/page lifecycle transition updates these via relaxed
//! atomics; nothing here is on the fast allocation/free path.

use core::sync::atomic::{AtomicI64, Ordering};

#[derive(Default)]
pub struct StatCount {
    pub allocated: AtomicI64,
    pub freed: AtomicI64,
    pub peak: AtomicI64,
    pub current: AtomicI64,
}

impl StatCount {
    pub const fn new() -> Self {
        StatCount {
            allocated: AtomicI64::new(0),
            freed: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            current: AtomicI64::new(0),
        }
    }
}

#[derive(Default)]
pub struct StatCounter {
    pub total: AtomicI64,
    pub count: AtomicI64,
}

impl StatCounter {
    pub const fn new() -> Self {
        StatCounter {
            total: AtomicI64::new(0),
            count: AtomicI64::new(0),
        }
    }

    pub fn add(&self, amount: i64) {
        self.total.fetch_add(amount, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Stats {
    pub segments: StatCount,
    pub pages: StatCount,
    pub reserved: StatCount,
    pub committed: StatCount,
    pub reset: StatCount,
    pub page_committed: StatCount,
    pub segments_abandoned: StatCount,
    pub pages_abandoned: StatCount,
    pub pages_extended: StatCount,
    pub mmap_calls: StatCount,
    pub mmap_right_align: StatCount,
    pub mmap_ensure_aligned: StatCount,
    pub commit_calls: StatCount,
    pub threads: StatCount,
    pub huge: StatCount,
    pub malloc: StatCount,
    pub searches: StatCounter,
}

impl Stats {
    pub const fn new() -> Self {
        Stats {
            segments: StatCount::new(),
            pages: StatCount::new(),
            reserved: StatCount::new(),
            committed: StatCount::new(),
            reset: StatCount::new(),
            page_committed: StatCount::new(),
            segments_abandoned: StatCount::new(),
            pages_abandoned: StatCount::new(),
            pages_extended: StatCount::new(),
            mmap_calls: StatCount::new(),
            mmap_right_align: StatCount::new(),
            mmap_ensure_aligned: StatCount::new(),
            commit_calls: StatCount::new(),
            threads: StatCount::new(),
            huge: StatCount::new(),
            malloc: StatCount::new(),
            searches: StatCounter::new(),
        }
    }
}

/// Process-wide stats, merged into from per-thread `Tld` on thread exit.
pub static GLOBAL_STATS: Stats = Stats::new();

pub fn stat_increase(stat: &StatCount, amount: i64) {
    stat_update(stat, amount);
}

pub fn stat_decrease(stat: &StatCount, amount: i64) {
    stat_update(stat, -amount);
}

pub fn stat_update(stat: &StatCount, amount: i64) {
    if amount == 0 {
        return;
    }
    let current = stat.current.fetch_add(amount, Ordering::Relaxed) + amount;
    let mut old_peak = stat.peak.load(Ordering::Relaxed);
    while current > old_peak {
        match stat.peak.compare_exchange_weak(
            old_peak,
            current,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => old_peak = actual,
        }
    }
    if amount > 0 {
        stat.allocated.fetch_add(amount, Ordering::Relaxed);
    } else {
        stat.freed.fetch_add(-amount, Ordering::Relaxed);
    }
}

/// Merges a thread-local stats block into the process-wide totals, called
/// from thread teardown (§4.8) before the `Tld` is released.
pub fn merge_into_global(local: &Stats) {
    macro_rules! merge_count {
        ($field:ident) => {
            let delta = local.$field.current.load(Ordering::Relaxed);
            stat_update(&GLOBAL_STATS.$field, delta);
        };
    }
    merge_count!(segments);
    merge_count!(pages);
    merge_count!(reserved);
    merge_count!(committed);
    merge_count!(reset);
    merge_count!(page_committed);
    merge_count!(segments_abandoned);
    merge_count!(pages_abandoned);
    merge_count!(pages_extended);
    merge_count!(mmap_calls);
    merge_count!(mmap_right_align);
    merge_count!(mmap_ensure_aligned);
    merge_count!(commit_calls);
    merge_count!(threads);
    merge_count!(huge);
    merge_count!(malloc);
    let searches = local.searches.total.load(Ordering::Relaxed);
    if searches != 0 {
        GLOBAL_STATS.searches.add(searches);
    }
}

/// A plain (non-atomic) snapshot, handy for test assertions.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountSnapshot {
    pub allocated: i64,
    pub freed: i64,
    pub peak: i64,
    pub current: i64,
}

impl From<&StatCount> for CountSnapshot {
    fn from(c: &StatCount) -> Self {
        CountSnapshot {
            allocated: c.allocated.load(Ordering::Relaxed),
            freed: c.freed.load(Ordering::Relaxed),
            peak: c.peak.load(Ordering::Relaxed),
            current: c.current.load(Ordering::Relaxed),
        }
    }
}

pub fn reserved_snapshot() -> CountSnapshot {
    CountSnapshot::from(&GLOBAL_STATS.reserved)
}

pub fn committed_snapshot() -> CountSnapshot {
    CountSnapshot::from(&GLOBAL_STATS.committed)
}

/// Prints a human-readable dump of the global stats, gated on
/// `show_stats`/`verbose` and invoked from `process_done`.
pub fn stats_print() {
    let seg = CountSnapshot::from(&GLOBAL_STATS.segments);
    let pages = CountSnapshot::from(&GLOBAL_STATS.pages);
    let reserved = CountSnapshot::from(&GLOBAL_STATS.reserved);
    let committed = CountSnapshot::from(&GLOBAL_STATS.committed);
    log::info!(
        "segments: {} peak {} | pages: {} peak {} | reserved: {} bytes peak {} | committed: {} bytes peak {}",
        seg.current, seg.peak, pages.current, pages.peak, reserved.current, reserved.peak,
        committed.current, committed.peak,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_update_tracks_peak_and_current() {
        let s = StatCount::new();
        stat_increase(&s, 100);
        stat_increase(&s, 50);
        stat_decrease(&s, 30);
        assert_eq!(s.current.load(Ordering::Relaxed), 120);
        assert_eq!(s.peak.load(Ordering::Relaxed), 150);
        assert_eq!(s.allocated.load(Ordering::Relaxed), 150);
        assert_eq!(s.freed.load(Ordering::Relaxed), 30);
    }

    #[test]
    fn zero_amount_is_a_no_op() {
        let s = StatCount::new();
        stat_update(&s, 0);
        assert_eq!(s.current.load(Ordering::Relaxed), 0);
        assert_eq!(s.allocated.load(Ordering::Relaxed), 0);
    }
}
