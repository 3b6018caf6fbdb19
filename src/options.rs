//! Process-wide configuration, read once from the environment at process
//! init (§4.8, §6.3). Never re-read afterwards; never allocates.

use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};

/// `arena_eager_commit` policy (§6.3).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EagerCommit {
    OnDemand = 0,
    Always = 1,
    OnDemandIfOvercommit = 2,
}

impl EagerCommit {
    fn from_raw(v: u32) -> Self {
        match v {
            1 => EagerCommit::Always,
            2 => EagerCommit::OnDemandIfOvercommit,
            _ => EagerCommit::OnDemand,
        }
    }
}

pub struct Options {
    pub purge_delay_ms: AtomicI64,
    pub arena_purge_mult: AtomicU32,
    pub arena_reserve_bytes: AtomicUsize,
    arena_eager_commit: AtomicU32,
    pub allow_large_os_pages: AtomicBool,
    pub disallow_arena_alloc: AtomicBool,
    pub disallow_os_alloc: AtomicBool,
    pub secure_level: AtomicU32,
    pub verbose: AtomicBool,
    pub show_stats: AtomicBool,
    initialized: AtomicBool,
}

// Defaults, named as constants so `DESIGN.md` and tests can reference them
// without re-reading the environment.
pub const DEFAULT_PURGE_DELAY_MS: i64 = 10;
pub const DEFAULT_ARENA_PURGE_MULT: u32 = 10;
pub const DEFAULT_ARENA_RESERVE_BYTES: usize = 1 << 30; // 1 GiB

pub static OPTIONS: Options = Options {
    purge_delay_ms: AtomicI64::new(DEFAULT_PURGE_DELAY_MS),
    arena_purge_mult: AtomicU32::new(DEFAULT_ARENA_PURGE_MULT),
    arena_reserve_bytes: AtomicUsize::new(DEFAULT_ARENA_RESERVE_BYTES),
    arena_eager_commit: AtomicU32::new(EagerCommit::OnDemand as u32),
    allow_large_os_pages: AtomicBool::new(false),
    disallow_arena_alloc: AtomicBool::new(false),
    disallow_os_alloc: AtomicBool::new(false),
    secure_level: AtomicU32::new(0),
    verbose: AtomicBool::new(false),
    show_stats: AtomicBool::new(false),
    initialized: AtomicBool::new(false),
};

impl Options {
    pub fn eager_commit(&self) -> EagerCommit {
        EagerCommit::from_raw(self.arena_eager_commit.load(Ordering::Relaxed))
    }

    pub fn is_secure(&self) -> bool {
        self.secure_level.load(Ordering::Relaxed) > 0
    }

    /// `purge_delay` as the arena level sees it: `purge_delay * arena_purge_mult`.
    /// A negative `purge_delay` (never purge) propagates unchanged.
    pub fn arena_purge_delay_ms(&self) -> i64 {
        let base = self.purge_delay_ms.load(Ordering::Relaxed);
        if base < 0 {
            return base;
        }
        base.saturating_mul(self.arena_purge_mult.load(Ordering::Relaxed) as i64)
    }
}

/// Parses `var` as a `bool` ("0"/"1"/"true"/"false", case-insensitive).
fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "0" => Some(false),
        "1" => Some(true),
        s if s.eq_ignore_ascii_case("true") => Some(true),
        s if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

fn parse_i64(raw: &str) -> Option<i64> {
    raw.trim().parse().ok()
}

fn parse_u32(raw: &str) -> Option<u32> {
    raw.trim().parse().ok()
}

fn parse_usize(raw: &str) -> Option<usize> {
    raw.trim().parse().ok()
}

/// Reads one `MIMALLOC_<NAME>` environment variable via libc `getenv`,
/// without going through the Rust standard library's environment access
/// (which assumes an allocator is already up).
fn getenv(name: &str) -> Option<alloc_free_string::Buf> {
    alloc_free_string::getenv_raw(name)
}

/// A tiny stack-buffer string reader so `options::init_from_env` can call
/// `libc::getenv` without touching `std::env` or heap allocation.
mod alloc_free_string {
    use core::ffi::c_char;

    pub struct Buf {
        data: [u8; 64],
        len: usize,
    }

    impl Buf {
        pub fn as_str(&self) -> &str {
            core::str::from_utf8(&self.data[..self.len]).unwrap_or("")
        }
    }

    pub fn getenv_raw(name: &str) -> Option<Buf> {
        // Build a NUL-terminated stack copy of `name` (all option names here
        // are short, known at compile time, and ASCII).
        let mut key = [0u8; 32];
        let bytes = name.as_bytes();
        if bytes.len() >= key.len() {
            return None;
        }
        key[..bytes.len()].copy_from_slice(bytes);
        let ptr = unsafe { libc::getenv(key.as_ptr() as *const c_char) };
        if ptr.is_null() {
            return None;
        }
        let mut buf = Buf {
            data: [0u8; 64],
            len: 0,
        };
        unsafe {
            let mut i = 0usize;
            while i < buf.data.len() {
                let c = *ptr.add(i) as u8;
                if c == 0 {
                    break;
                }
                buf.data[i] = c;
                i += 1;
            }
            buf.len = i;
        }
        Some(buf)
    }
}

/// Parses all recognised `MIMALLOC_*` environment variables into `OPTIONS`.
/// Idempotent; safe to call more than once (later calls are no-ops) but
/// normally invoked exactly once from `init::process_init`.
pub fn init_from_env() {
    if OPTIONS
        .initialized
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        return;
    }

    if let Some(v) = getenv("MIMALLOC_PURGE_DELAY") {
        if let Some(n) = parse_i64(v.as_str()) {
            OPTIONS.purge_delay_ms.store(n, Ordering::Relaxed);
        } else {
            log::warn!("MIMALLOC_PURGE_DELAY: invalid value {:?}, keeping default", v.as_str());
        }
    }
    if let Some(v) = getenv("MIMALLOC_ARENA_PURGE_MULT") {
        if let Some(n) = parse_u32(v.as_str()) {
            OPTIONS.arena_purge_mult.store(n, Ordering::Relaxed);
        }
    }
    if let Some(v) = getenv("MIMALLOC_ARENA_RESERVE") {
        if let Some(n) = parse_usize(v.as_str()) {
            OPTIONS.arena_reserve_bytes.store(n, Ordering::Relaxed);
        }
    }
    if let Some(v) = getenv("MIMALLOC_ARENA_EAGER_COMMIT") {
        if let Some(n) = parse_u32(v.as_str()) {
            OPTIONS
                .arena_eager_commit
                .store(EagerCommit::from_raw(n) as u32, Ordering::Relaxed);
        }
    }
    if let Some(v) = getenv("MIMALLOC_ALLOW_LARGE_OS_PAGES") {
        if let Some(b) = parse_bool(v.as_str()) {
            OPTIONS.allow_large_os_pages.store(b, Ordering::Relaxed);
        }
    }
    if let Some(v) = getenv("MIMALLOC_DISALLOW_ARENA_ALLOC") {
        if let Some(b) = parse_bool(v.as_str()) {
            OPTIONS.disallow_arena_alloc.store(b, Ordering::Relaxed);
        }
    }
    if let Some(v) = getenv("MIMALLOC_DISALLOW_OS_ALLOC") {
        if let Some(b) = parse_bool(v.as_str()) {
            OPTIONS.disallow_os_alloc.store(b, Ordering::Relaxed);
        }
    }
    if let Some(v) = getenv("MIMALLOC_SECURE") {
        if let Some(n) = parse_u32(v.as_str()) {
            OPTIONS.secure_level.store(n, Ordering::Relaxed);
        }
    }
    if let Some(v) = getenv("MIMALLOC_VERBOSE") {
        if let Some(b) = parse_bool(v.as_str()) {
            OPTIONS.verbose.store(b, Ordering::Relaxed);
        }
    }
    if let Some(v) = getenv("MIMALLOC_SHOW_STATS") {
        if let Some(b) = parse_bool(v.as_str()) {
            OPTIONS.show_stats.store(b, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing_accepts_both_forms() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("FALSE"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn eager_commit_unknown_raw_falls_back_to_on_demand() {
        assert_eq!(EagerCommit::from_raw(99), EagerCommit::OnDemand);
    }

    #[test]
    fn arena_purge_delay_never_purge_stays_negative() {
        OPTIONS.purge_delay_ms.store(-1, Ordering::Relaxed);
        OPTIONS.arena_purge_mult.store(10, Ordering::Relaxed);
        assert_eq!(OPTIONS.arena_purge_delay_ms(), -1);
        OPTIONS.purge_delay_ms.store(DEFAULT_PURGE_DELAY_MS, Ordering::Relaxed);
    }
}
