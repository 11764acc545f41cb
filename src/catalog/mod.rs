//! # Catalog
//!
//! Enumerates the committed memory regions of the current process and
//! filters them down to the ones that are safe to scan or patch.
//!
//! The catalog is rebuilt on every call; the process's own allocations
//! change over time, so nothing here is cached.

use std::path::PathBuf;

use lazy_static::lazy_static;
use log::trace;
use region::Protection;

use crate::addr::Address;

#[cfg(unix)]
mod linux;
#[cfg(windows)]
mod windows;

lazy_static! {
    /// Module-name substrings whose image regions are never scanned or
    /// patched. The defaults cover graphics runtimes and overlay/driver
    /// modules that react badly to being probed.
    pub static ref DEFAULT_DENYLIST: Vec<String> = ["dxgi", "d3d11", "amd", "nv", "intel"]
        .iter()
        .map(|s| s.to_string())
        .collect();
}

/// What backs a memory region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionKind {
    /// A private allocation (heap, anonymous mapping, thread stack).
    Private,
    /// Backed by an executable or library image; carries the module path.
    Image(PathBuf),
    /// Anything else (shared mappings, kernel-provided pseudo regions).
    Other,
}

/// A snapshot of one region of the process's address space.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    /// First address of the region.
    pub base: Address,
    /// Region size in bytes.
    pub size: usize,
    /// Current protection of the region.
    pub protection: Protection,
    /// What backs the region.
    pub kind: RegionKind,
    /// Whether the region is committed (always true on Linux, where only
    /// mapped regions are listed).
    pub committed: bool,
    /// Whether the region carries a guard marker.
    pub guarded: bool,
}

impl MemoryRegion {
    /// One past the last address of the region.
    pub fn end(&self) -> Address {
        self.base + self.size
    }
}

/// Parameters for a catalog request.
#[derive(Debug, Clone)]
pub struct RegionQuery<'a> {
    /// Keep regions whose protection intersects this mask.
    pub protection: Protection,
    /// Reject regions smaller than this (a pattern can never match inside
    /// a region smaller than itself).
    pub min_size: usize,
    /// Only regions whose base is at or above this address.
    pub start: Address,
    /// Only regions whose base is below this address.
    pub end: Address,
    /// Case-insensitive substrings of module paths to reject.
    pub denylist: &'a [String],
}

/// Returns the ordered list of committed regions matching `query`.
///
/// Pure read; regions are enumerated fresh on every call.
pub fn regions(query: &RegionQuery) -> Vec<MemoryRegion> {
    #[cfg(unix)]
    let all = linux::enumerate();
    #[cfg(windows)]
    let all = windows::enumerate(query.start, query.end);

    let kept: Vec<MemoryRegion> = all
        .into_iter()
        .filter(|r| r.base >= query.start && r.base < query.end)
        .filter(|r| r.protection.intersects(query.protection))
        .filter(|r| is_safe(r, query))
        .collect();
    trace!("catalog: {} regions match query", kept.len());
    kept
}

/// Whether a region may be scanned or patched at all.
fn is_safe(region: &MemoryRegion, query: &RegionQuery) -> bool {
    if !region.committed || region.guarded || region.protection == Protection::NONE {
        return false;
    }
    if region.size < query.min_size {
        return false;
    }
    // Overflow here would wrap the end below the base and break every
    // downstream offset computation.
    if region.base.get().checked_add(region.size).is_none() {
        return false;
    }
    match &region.kind {
        RegionKind::Private => true,
        RegionKind::Image(path) => {
            let path = path.to_string_lossy().to_lowercase();
            !query
                .denylist
                .iter()
                .any(|bad| path.contains(&bad.to_lowercase()))
        }
        RegionKind::Other => false,
    }
}
