//! # Scan
//!
//! Multi-threaded wildcard signature scanning over the process's own
//! memory.
//!
//! All modes share the same shape: the region catalog is snapshotted once,
//! a fixed pool of workers claims regions off a shared atomic counter, and
//! a per-scan [`CancelToken`] stops everyone cooperatively. The token is
//! checked on every byte compared, so cancellation latency is small even in
//! the middle of a huge region; the wall-clock timeout is only checked when
//! a worker claims its next region, so a timeout can overshoot by however
//! long one region takes to scan.
//!
//! `scan_first` races its workers and keeps whatever match is reported
//! first. **This is not guaranteed to be the lowest matching address** when
//! more than one worker is running; callers that need a deterministic
//! result must pass `threads = 1`.

mod batch;

pub use batch::{scan_batch, BatchHandle, ScanProgress, ScanTarget, TargetFlags};

use std::slice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};
use region::Protection;

use crate::addr::Address;
use crate::catalog::{self, MemoryRegion, RegionQuery, DEFAULT_DENYLIST};
use crate::pattern::Pattern;

/// Lowest address scanned by default; skips the null page and its
/// surroundings.
pub const DEFAULT_SCAN_FLOOR: usize = 0x10000;
/// One past the highest address scanned by default (top of x86-64 user
/// space).
pub const DEFAULT_SCAN_CEILING: usize = 0x7fff_ffff_ffff;

/// Cooperative cancellation shared between the workers of one scan.
///
/// Each scan gets its own token, so concurrent scans cancel independently.
/// Cloning shares the underlying flag.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; visible to every clone of the token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Parameters shared by every scan mode.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Regions must intersect this protection mask to be scanned.
    pub protection: Protection,
    /// Wall-clock budget; `None` scans to exhaustion.
    pub timeout: Option<Duration>,
    /// Stop `scan_all` after this many matches.
    pub max_results: Option<usize>,
    /// Visit regions in descending address order.
    pub reverse: bool,
    /// Lowest region base considered.
    pub start: Address,
    /// One past the highest region base considered.
    pub end: Address,
    /// Worker count; defaults to the hardware concurrency.
    pub threads: usize,
    /// Module-path substrings excluded from scanning.
    pub denylist: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            protection: Protection::READ_EXECUTE,
            timeout: None,
            max_results: None,
            reverse: false,
            start: Address::new(DEFAULT_SCAN_FLOOR),
            end: Address::new(DEFAULT_SCAN_CEILING),
            threads: num_cpus::get(),
            denylist: DEFAULT_DENYLIST.clone(),
        }
    }
}

impl ScanOptions {
    /// Restricts the scan to regions whose protection intersects `mask`.
    pub fn with_protection(mut self, mask: Protection) -> Self {
        self.protection = mask;
        self
    }

    /// Sets the wall-clock budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Caps the number of `scan_all` results.
    pub fn with_max_results(mut self, cap: usize) -> Self {
        self.max_results = Some(cap);
        self
    }

    /// Bounds the scanned address range.
    pub fn with_range(mut self, start: Address, end: Address) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Sets the worker count.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Visits regions in descending address order.
    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Snapshots the region catalog for a scan of `min_size`-byte patterns.
    fn snapshot_regions(&self, min_size: usize) -> Vec<MemoryRegion> {
        let mut regions = catalog::regions(&RegionQuery {
            protection: self.protection,
            min_size,
            start: self.start,
            end: self.end,
            denylist: &self.denylist,
        });
        if self.reverse {
            regions.reverse();
        }
        regions
    }

    /// Instant at which the scan must wind down, if a timeout is set.
    fn deadline(&self, started: Instant) -> Option<Instant> {
        self.timeout.map(|t| started + t)
    }
}

/// Finds one address matching `pattern`, or `None` if the pattern is absent
/// (or empty), the timeout expires first, or every region is exhausted.
///
/// With more than one worker the result is whichever match is found first,
/// which is *not* necessarily the lowest address.
///
/// # Safety
///
/// Scanning reads raw memory in catalog-listed regions. Another thread
/// unmapping or reprotecting one of those regions mid-scan is undefined
/// behavior; callers must not run scans while tearing down mappings.
pub unsafe fn scan_first(pattern: &Pattern, options: &ScanOptions) -> Option<Address> {
    if pattern.is_empty() {
        debug!("scan_first: empty pattern");
        return None;
    }

    let started = Instant::now();
    let regions = options.snapshot_regions(pattern.len());
    debug!("scan_first: {} regions", regions.len());

    let token = CancelToken::new();
    let claim = AtomicUsize::new(0);
    let result = AtomicUsize::new(0);

    thread::scope(|scope| {
        for _ in 0..options.threads.max(1) {
            scope.spawn(|| {
                while !token.is_cancelled() {
                    if past_deadline(options.deadline(started), "scan_first", &token) {
                        return;
                    }
                    let index = claim.fetch_add(1, Ordering::Relaxed);
                    let Some(region) = regions.get(index) else {
                        return;
                    };
                    // Regions are catalog-vetted as readable; see the
                    // safety contract on `scan_first`.
                    let haystack = unsafe {
                        slice::from_raw_parts(region.base.as_ptr::<u8>(), region.size)
                    };
                    for offset in 0..=haystack.len() - pattern.len() {
                        if token.is_cancelled() {
                            return;
                        }
                        if pattern.matches(&haystack[offset..]) {
                            result.store((region.base + offset).get(), Ordering::Release);
                            token.cancel();
                            return;
                        }
                    }
                }
            });
        }
    });

    let found = result.load(Ordering::Acquire);
    if found == 0 {
        info!("scan_first: not found");
    } else {
        info!("scan_first: match at {:#x}", found);
    }
    (found != 0).then(|| Address::new(found))
}

/// Collects every address matching `pattern`, up to `max_results` when a
/// cap is set. The order of results is unspecified; matches never span two
/// regions.
///
/// # Safety
///
/// Same requirements as [`scan_first`].
pub unsafe fn scan_all(pattern: &Pattern, options: &ScanOptions) -> Vec<Address> {
    if pattern.is_empty() {
        debug!("scan_all: empty pattern");
        return Vec::new();
    }

    let started = Instant::now();
    let regions = options.snapshot_regions(pattern.len());
    debug!("scan_all: {} regions", regions.len());

    let token = CancelToken::new();
    let claim = AtomicUsize::new(0);
    let results = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for _ in 0..options.threads.max(1) {
            scope.spawn(|| {
                while !token.is_cancelled() {
                    if past_deadline(options.deadline(started), "scan_all", &token) {
                        return;
                    }
                    let index = claim.fetch_add(1, Ordering::Relaxed);
                    let Some(region) = regions.get(index) else {
                        return;
                    };
                    // Same safety contract as `scan_first`.
                    let haystack = unsafe {
                        slice::from_raw_parts(region.base.as_ptr::<u8>(), region.size)
                    };
                    for offset in 0..=haystack.len() - pattern.len() {
                        if token.is_cancelled() {
                            return;
                        }
                        if pattern.matches(&haystack[offset..]) {
                            let mut results = results.lock().unwrap();
                            results.push(region.base + offset);
                            if options
                                .max_results
                                .is_some_and(|cap| results.len() >= cap)
                            {
                                token.cancel();
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    let results = results.into_inner().unwrap();
    info!("scan_all: {} matches", results.len());
    results
}

/// Cancels `token` and reports when `deadline` has passed.
fn past_deadline(deadline: Option<Instant>, what: &str, token: &CancelToken) -> bool {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => {
            debug!("{what}: timed out");
            token.cancel();
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A scan window covering exactly the region that holds `buffer`, so
    /// tests never touch memory owned by other threads.
    fn options_for(buffer: &[u8]) -> ScanOptions {
        let info = region::query(buffer.as_ptr()).unwrap();
        ScanOptions::default()
            .with_protection(Protection::READ)
            .with_range(
                Address::new(info.as_range().start),
                Address::from_ptr(buffer.as_ptr()) + buffer.len(),
            )
    }

    /// An anonymous-mapping-sized buffer with `marker` planted at `offsets`.
    fn marked_buffer(marker: &[u8], offsets: &[usize]) -> Vec<u8> {
        let mut buffer = vec![0u8; 1 << 20];
        for &offset in offsets {
            buffer[offset..offset + marker.len()].copy_from_slice(marker);
        }
        buffer
    }

    /// A byte sequence that does not occur anywhere else in the test
    /// process (checked against nothing, relied on statistically: 12
    /// specific bytes do not appear by chance).
    const MARKER: [u8; 12] = [
        0xd1, 0x07, 0x5a, 0xee, 0x19, 0xc4, 0x83, 0x6b, 0xf2, 0x3d, 0x90, 0x7c,
    ];

    #[test]
    fn first_match_at_known_offset() {
        let buffer = marked_buffer(&MARKER, &[0x4321]);
        let pattern = Pattern::from_bytes(&MARKER);
        let options = options_for(&buffer).with_threads(1);

        let found = unsafe { scan_first(&pattern, &options) }.unwrap();
        assert_eq!(found, Address::from_ptr(buffer.as_ptr()) + 0x4321);
    }

    #[test]
    fn wildcards_match_within_scanned_window() {
        let buffer = marked_buffer(&MARKER, &[0x100]);
        let mut text = String::new();
        for (i, byte) in MARKER.iter().enumerate() {
            if i == 4 || i == 7 {
                text.push_str("?? ");
            } else {
                text.push_str(&format!("{byte:02X} "));
            }
        }
        let pattern: Pattern = text.parse().unwrap();
        let options = options_for(&buffer).with_threads(1);

        let found = unsafe { scan_first(&pattern, &options) }.unwrap();
        assert_eq!(found, Address::from_ptr(buffer.as_ptr()) + 0x100);
    }

    #[test]
    fn racing_workers_find_some_valid_match() {
        // Two occurrences; racing workers may legitimately report either.
        let buffer = marked_buffer(&MARKER, &[0x1000, 0x80000]);
        let pattern = Pattern::from_bytes(&MARKER);
        let options = options_for(&buffer).with_threads(4);

        let found = unsafe { scan_first(&pattern, &options) }.unwrap();
        let base = Address::from_ptr(buffer.as_ptr());
        assert!(found == base + 0x1000 || found == base + 0x80000);
    }

    #[test]
    fn all_matches_exact_set() {
        let offsets = [0x100usize, 0x5000, 0x7ffff];
        let buffer = marked_buffer(&MARKER, &offsets);
        let pattern = Pattern::from_bytes(&MARKER);
        let options = options_for(&buffer);

        let mut found = unsafe { scan_all(&pattern, &options) };
        found.sort();
        let base = Address::from_ptr(buffer.as_ptr());
        let expected: Vec<Address> = offsets.iter().map(|&o| base + o).collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn max_results_caps_and_cancels() {
        let buffer = marked_buffer(&MARKER, &[0x100, 0x200, 0x300, 0x400]);
        let pattern = Pattern::from_bytes(&MARKER);
        let options = options_for(&buffer).with_threads(1).with_max_results(2);

        let found = unsafe { scan_all(&pattern, &options) };
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn empty_pattern_completes_immediately() {
        let pattern = Pattern::parse("").unwrap();
        let options = ScanOptions::default();
        assert_eq!(unsafe { scan_first(&pattern, &options) }, None);
        assert!(unsafe { scan_all(&pattern, &options) }.is_empty());
    }

    #[test]
    fn absent_pattern_is_not_found() {
        let buffer = marked_buffer(&MARKER, &[]);
        let pattern = Pattern::from_bytes(&MARKER);
        let options = options_for(&buffer).with_threads(2);
        assert_eq!(unsafe { scan_first(&pattern, &options) }, None);
    }
}
