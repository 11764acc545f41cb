//! # Alloc
//!
//! Executable memory within relative-jump range of a hook site.
//!
//! A 5-byte near jump only reaches ±2 GiB, so trampolines must live close
//! to the code they displace. Allocation walks the address space outward
//! from the hook site, trying fixed-address mappings in free gaps until one
//! sticks, then sub-allocates small blocks out of the mapped page with a
//! slice pool so neighbouring hooks share it.
//!
//! Pools are process-wide: trampolines must stay mapped as long as any
//! thread might still execute them, which in practice means the life of
//! the process.

use std::ops::{Deref, DerefMut, Range};
use std::slice;
use std::sync::Mutex;

use lazy_static::lazy_static;
use log::{debug, warn};
use mmap::{MapOption, MemoryMap};
use slice_pool::sync::{SliceBox, SlicePool};
use thiserror::Error;

use crate::addr::Address;

/// The furthest a trampoline may be from its hook site (±2 GiB).
pub const MAX_DISTANCE: usize = 0x8000_0000;

/// Errors raised while allocating executable memory.
#[derive(Debug, Error)]
pub enum AllocError {
    /// Every candidate gap within reach was exhausted.
    #[error("no free executable memory within range of {0}")]
    OutOfRange(Address),
    /// Walking the address space for free gaps failed.
    #[error("querying free space failed: {0}")]
    Query(#[from] region::Error),
}

/// An owned slice of read/write/executable memory.
///
/// The backing mapping stays alive for as long as its pool does; dropping
/// the handle only returns the slice to the pool.
pub struct ExecutableMemory {
    /// Chunk handed out by one of the shared pools.
    data: SliceBox<u8>,
}

impl ExecutableMemory {
    /// First address of the slice.
    pub fn base(&self) -> Address {
        Address::from_ptr(self.data.as_ptr())
    }
}

impl Deref for ExecutableMemory {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for ExecutableMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Allocates read/write/executable memory near an origin address.
pub struct NearAllocator {
    /// Maximum tolerated distance between origin and allocation.
    max_distance: usize,
    /// Every mapping made so far, kept for reuse by later requests.
    pools: Mutex<Vec<SlicePool<u8>>>,
}

impl NearAllocator {
    /// Creates an allocator with the given maximum origin distance.
    pub fn new(max_distance: usize) -> Self {
        Self {
            max_distance,
            pools: Mutex::new(Vec::new()),
        }
    }

    /// Hands out `size` bytes of executable memory within range of
    /// `origin`, mapping a fresh pool when no existing one fits.
    pub fn allocate(&self, origin: Address, size: usize) -> Result<ExecutableMemory, AllocError> {
        let range = origin.get().saturating_sub(self.max_distance)
            ..origin.get().saturating_add(self.max_distance);
        let mut pools = self.pools.lock().unwrap();

        for pool in pools.iter() {
            if pool_within(pool, &range) {
                if let Some(data) = pool.alloc(size) {
                    return Ok(ExecutableMemory { data });
                }
            }
        }

        let pool = map_pool_near(origin, &range, size)?;
        let data = pool.alloc(size).ok_or(AllocError::OutOfRange(origin))?;
        pools.push(pool);
        Ok(ExecutableMemory { data })
    }
}

/// Whether a pool's memory lies entirely inside `range`.
fn pool_within(pool: &SlicePool<u8>, range: &Range<usize>) -> bool {
    let lower = pool.as_ptr() as usize;
    let upper = lower + pool.len();
    range.contains(&lower) && range.contains(&(upper - 1))
}

/// Maps a new executable pool as close to `origin` as possible.
///
/// Candidates after the origin are tried before candidates below it; some
/// platforms refuse to map anything below the process image.
fn map_pool_near(
    origin: Address,
    range: &Range<usize>,
    size: usize,
) -> Result<SlicePool<u8>, AllocError> {
    let after = FreeGapWalk::new(origin.get(), range.clone(), Direction::After);
    let before = FreeGapWalk::new(origin.get(), range.clone(), Direction::Before);

    for candidate in after.chain(before) {
        let address = candidate?;
        if let Some(slab) = map_fixed(address, size) {
            let mapped = slab.0.data() as usize;
            if !range.contains(&mapped) {
                // The kernel placed it elsewhere; useless for near jumps.
                warn!("fixed mapping at {address} landed out of range, discarding");
                continue;
            }
            debug!("mapped {} byte executable pool at {address}", slab.0.len());
            return Ok(SlicePool::new(slab));
        }
    }

    warn!("no executable memory available within range of {origin}");
    Err(AllocError::OutOfRange(origin))
}

/// Tries one fixed read/write/executable mapping at `address`.
fn map_fixed(address: Address, size: usize) -> Option<MappedSlab> {
    MemoryMap::new(
        size,
        &[
            MapOption::MapReadable,
            MapOption::MapWritable,
            MapOption::MapExecutable,
            MapOption::MapAddr(address.as_ptr::<u8>() as *const _),
        ],
    )
    .ok()
    .map(MappedSlab)
}

/// Which side of the origin a gap walk explores.
enum Direction {
    /// Addresses below the origin.
    Before,
    /// Addresses at or above the origin.
    After,
}

/// Iterator over page-aligned addresses of unmapped gaps, walking away from
/// an origin one region at a time.
struct FreeGapWalk {
    /// Next address to probe.
    current: usize,
    /// Bounds of the walk.
    range: Range<usize>,
    /// Which way the walk moves.
    direction: Direction,
}

impl FreeGapWalk {
    /// Starts a walk at `origin`, clamped down to page alignment.
    fn new(origin: usize, range: Range<usize>, direction: Direction) -> Self {
        let page = region::page::size();
        Self {
            current: origin - origin % page,
            range,
            direction,
        }
    }
}

impl Iterator for FreeGapWalk {
    type Item = Result<Address, region::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let page = region::page::size();

        while self.current > 0 && self.range.contains(&self.current) {
            match region::query(self.current as *const u8) {
                // Mapped: skip past the whole region.
                Ok(info) => {
                    self.current = match self.direction {
                        Direction::Before => info.as_range().start.saturating_sub(page),
                        Direction::After => info.as_range().end,
                    };
                }
                // Unmapped: this address is a candidate.
                Err(region::Error::UnmappedRegion) => {
                    let candidate = self.current;
                    self.current = match self.direction {
                        Direction::Before => candidate.saturating_sub(page),
                        Direction::After => candidate + page,
                    };
                    return Some(Ok(Address::new(candidate)));
                }
                Err(error) => return Some(Err(error)),
            }
        }

        None
    }
}

/// Adapter making a memory map usable as pool storage.
struct MappedSlab(MemoryMap);

impl MappedSlab {
    /// The mapping as a byte slice.
    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
    }

    /// The mapping as a mutable byte slice.
    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
    }
}

impl AsRef<[u8]> for MappedSlab {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for MappedSlab {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

// The mapping is only reached through pool-issued chunks, which hand out
// disjoint slices.
unsafe impl Send for MappedSlab {}
unsafe impl Sync for MappedSlab {}

lazy_static! {
    /// Process-wide pool set shared by every engine instance, so trampoline
    /// pages are reused across engines and survive engine teardown.
    static ref POOL: NearAllocator = NearAllocator::new(MAX_DISTANCE);
}

/// Allocates `size` bytes of read/write/executable memory within near-jump
/// range of `origin` from the shared pools.
///
/// The returned buffer's contents are unspecified.
pub fn allocate_executable(origin: Address, size: usize) -> Result<ExecutableMemory, AllocError> {
    POOL.allocate(origin, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_within_reach_of_origin() {
        let origin = Address::new(allocate_executable as usize);
        let memory = allocate_executable(origin, 64).unwrap();
        assert_eq!(memory.len(), 64);

        let distance = if memory.base() > origin {
            memory.base() - origin
        } else {
            origin - memory.base()
        };
        assert!(distance < MAX_DISTANCE);
    }

    #[test]
    fn allocations_are_writable_and_disjoint() {
        let origin = Address::new(allocate_executable as usize);
        let mut first = allocate_executable(origin, 32).unwrap();
        let mut second = allocate_executable(origin, 32).unwrap();

        first.fill(0xAA);
        second.fill(0xBB);
        assert!(first.iter().all(|&b| b == 0xAA));
        assert!(second.iter().all(|&b| b == 0xBB));

        let first_range = first.base().get()..first.base().get() + first.len();
        assert!(!first_range.contains(&second.base().get()));
    }

    #[test]
    fn allocation_is_executable() {
        let origin = Address::new(allocate_executable as usize);
        let mut memory = allocate_executable(origin, 16).unwrap();

        // mov eax, 0x2a; ret
        memory[..6].copy_from_slice(&[0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]);
        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(memory.base().get()) };
        assert_eq!(f(), 0x2a);
    }
}
