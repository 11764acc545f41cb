//! Asynchronous multi-target scanning.
//!
//! Resolving dozens of signatures one full memory pass at a time is wasteful;
//! the batch scanner makes a single pass in which every worker checks each
//! still-unresolved target against the regions it claims. The whole batch
//! runs on a background thread and reports completion through a callback.

use std::collections::HashMap;
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bitflags::bitflags;
use log::{debug, info};

use super::{CancelToken, ScanOptions};
use crate::addr::Address;
use crate::pattern::Pattern;

bitflags! {
    /// Consumer-interpreted properties of a scan target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TargetFlags: u32 {
        /// The code behind this signature uses AVX encodings; consumers
        /// should pick an interception strategy that does not relocate
        /// those instructions.
        const AVX = 1;
    }
}

/// One named signature to resolve.
///
/// The resolved address is written at most once: the first worker to match
/// the pattern wins and later matches are ignored, so the address is stable
/// as soon as it is observable.
#[derive(Debug)]
pub struct ScanTarget {
    /// The signature to search for.
    pattern: Pattern,
    /// Consumer-interpreted properties.
    flags: TargetFlags,
    /// Resolved address, zero while unresolved.
    address: AtomicUsize,
}

impl ScanTarget {
    /// Creates an unresolved target.
    pub fn new(pattern: Pattern) -> Self {
        Self::with_flags(pattern, TargetFlags::empty())
    }

    /// Creates an unresolved target carrying flags.
    pub fn with_flags(pattern: Pattern, flags: TargetFlags) -> Self {
        Self {
            pattern,
            flags,
            address: AtomicUsize::new(0),
        }
    }

    /// The signature to search for.
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Consumer-interpreted properties.
    pub fn flags(&self) -> TargetFlags {
        self.flags
    }

    /// The resolved address, if any worker has matched the pattern yet.
    pub fn address(&self) -> Option<Address> {
        let value = self.address.load(Ordering::Acquire);
        (value != 0).then(|| Address::new(value))
    }

    /// Whether the target has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.address.load(Ordering::Acquire) != 0
    }

    /// Publishes a match; returns `false` when another worker already won.
    fn resolve(&self, address: Address) -> bool {
        self.address
            .compare_exchange(0, address.get(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Progress signal for a running batch scan, cheap enough for a UI to poll
/// every frame. Carries no results; read the targets for those.
#[derive(Debug, Default)]
pub struct ScanProgress {
    /// Targets resolved so far.
    matched: AtomicUsize,
    /// Total targets in the batch; fixed once the batch starts.
    total: AtomicUsize,
}

impl ScanProgress {
    /// Creates an idle progress signal (ratio 1.0 until a batch starts).
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets resolved so far.
    pub fn matched(&self) -> usize {
        self.matched.load(Ordering::Relaxed)
    }

    /// Total targets in the running batch.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Completion ratio in `0.0..=1.0`; an empty batch reads as complete.
    pub fn ratio(&self) -> f32 {
        let total = self.total();
        if total == 0 {
            return 1.0;
        }
        (self.matched() as f32 / total as f32).clamp(0.0, 1.0)
    }

    /// Starts a batch of `total` targets with `matched` already resolved.
    fn begin(&self, matched: usize, total: usize) {
        self.matched.store(matched, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
    }

    /// Records one freshly resolved target.
    fn bump(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle to a running batch scan.
pub struct BatchHandle {
    /// Cancels the batch's workers.
    token: CancelToken,
    /// The background thread driving the batch.
    thread: JoinHandle<()>,
}

impl BatchHandle {
    /// Requests cancellation; unresolved targets stay unresolved.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The batch's cancellation token.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Blocks until the batch (and its completion callback) has finished.
    pub fn join(self) {
        let _ = self.thread.join();
    }
}

/// Resolves a set of named targets in one pass over memory, on a background
/// thread.
///
/// Workers claim regions off a shared counter; for each claimed region they
/// try every still-unresolved target. The batch ends when every target is
/// resolved, the timeout elapses, or the region list is exhausted —
/// whichever comes first — and then invokes `on_complete` on the background
/// thread. Timeout expiry is indistinguishable from not-found: affected
/// targets are simply left unresolved.
///
/// Targets that are already resolved (or have empty patterns) are skipped.
///
/// # Safety
///
/// Same requirements as [`scan_first`](super::scan_first).
pub unsafe fn scan_batch<F>(
    targets: Arc<HashMap<String, ScanTarget>>,
    options: ScanOptions,
    progress: Option<Arc<ScanProgress>>,
    on_complete: F,
) -> BatchHandle
where
    F: FnOnce() + Send + 'static,
{
    let token = CancelToken::new();
    let worker_token = token.clone();

    let thread = thread::spawn(move || {
        run_batch(&targets, &options, progress.as_deref(), &worker_token);
        on_complete();
    });

    BatchHandle { token, thread }
}

/// Body of the background batch thread.
fn run_batch(
    targets: &HashMap<String, ScanTarget>,
    options: &ScanOptions,
    progress: Option<&ScanProgress>,
    token: &CancelToken,
) {
    if targets.is_empty() {
        debug!("scan_batch: no targets");
        return;
    }

    let started = Instant::now();
    let total = targets.len();
    let already_resolved = targets.values().filter(|t| t.is_resolved()).count();
    if let Some(progress) = progress {
        progress.begin(already_resolved, total);
    }

    // Regions smaller than every remaining pattern are useless; regions in
    // between sizes are kept and the oversized patterns skipped per region.
    let min_pattern = targets
        .values()
        .filter(|t| !t.is_resolved() && !t.pattern().is_empty())
        .map(|t| t.pattern().len())
        .min();
    let Some(min_pattern) = min_pattern else {
        debug!("scan_batch: nothing left to resolve");
        return;
    };

    let regions = options.snapshot_regions(min_pattern);
    debug!(
        "scan_batch: {} regions, {} targets",
        regions.len(),
        total
    );

    let claim = AtomicUsize::new(0);
    let resolved = AtomicUsize::new(already_resolved);

    thread::scope(|scope| {
        for _ in 0..options.threads.max(1) {
            scope.spawn(|| {
                while !token.is_cancelled() {
                    if super::past_deadline(options.deadline(started), "scan_batch", token) {
                        return;
                    }
                    let index = claim.fetch_add(1, Ordering::Relaxed);
                    let Some(region) = regions.get(index) else {
                        return;
                    };
                    // Regions are catalog-vetted as readable; see the
                    // safety contract on `scan_batch`.
                    let haystack = unsafe {
                        slice::from_raw_parts(region.base.as_ptr::<u8>(), region.size)
                    };

                    for (name, target) in targets.iter() {
                        if token.is_cancelled() {
                            return;
                        }
                        if target.is_resolved() {
                            continue;
                        }
                        let pattern = target.pattern();
                        if pattern.is_empty() || pattern.len() > haystack.len() {
                            continue;
                        }
                        for offset in 0..=haystack.len() - pattern.len() {
                            if token.is_cancelled() {
                                return;
                            }
                            if pattern.matches(&haystack[offset..]) {
                                let address = region.base + offset;
                                if target.resolve(address) {
                                    debug!("scan_batch: `{name}` at {address}");
                                    if let Some(progress) = progress {
                                        progress.bump();
                                    }
                                    if resolved.fetch_add(1, Ordering::Relaxed) + 1 == total {
                                        token.cancel();
                                    }
                                }
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    info!(
        "scan_batch: resolved {}/{} targets",
        targets.values().filter(|t| t.is_resolved()).count(),
        total
    );
}
