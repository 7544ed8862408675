//! Free-region search near an anchor address.
//!
//! A veneer pool is only useful when every patch site can reach it with a
//! signed 32-bit displacement, so the pool block has to come out of the
//! 2 GiB neighborhood of the host image. The walk below follows how the OS
//! hands out address space: query the region under a cursor, try to claim
//! granularity-aligned free space, move past the region when the claim is
//! refused.

use std::ptr::NonNull;

use libc::c_void;

#[cfg(windows)]
use windows::Win32::System::Memory::PAGE_EXECUTE_READWRITE;

#[cfg(windows)]
use crate::os::windows::winapi::{self, AllocationType};

const GIB: usize = 1 << 30;

/// Reach of a rel32 displacement in either direction.
pub const PULL_RANGE: usize = 2 * GIB;

/// One entry of the process memory map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub base: usize,
    pub size: usize,
    pub free: bool,
}

/// The slice of the OS the region search needs.
///
/// Production code walks the live process map through [`ProcessMap`]; tests
/// substitute synthetic maps.
pub trait MemoryMap {
    /// OS reservation quantum.
    fn granularity(&self) -> usize;

    /// Region containing `addr`, or `None` when the map cannot be read.
    fn query(&self, addr: usize) -> Option<Region>;

    /// Reserve and commit `size` read-write-execute bytes at `addr`.
    /// Refusal is not an error; the caller keeps scanning.
    fn reserve(&mut self, addr: usize, size: usize) -> Option<NonNull<c_void>>;
}

pub(crate) fn roundup(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return 0;
    }

    let remainder = value % multiple;
    if remainder == 0 {
        value
    } else {
        value + (multiple - remainder)
    }
}

pub(crate) fn rounddown(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return 0;
    }

    value - value % multiple
}

/// Searches `anchor ± 2 GiB` for a free gap of at least `size` bytes and
/// claims it with read-write-execute protection.
///
/// The two-step query-then-reserve is deliberate: a region that looked free
/// can be taken by another allocator between the query and the reservation,
/// and the OS refuses some free-looking gaps outright. Both cases keep the
/// scan going instead of failing it.
pub fn find_free_region(
    map: &mut impl MemoryMap,
    anchor: usize,
    size: usize,
) -> Option<NonNull<c_void>> {
    let granularity = map.granularity();

    let mut cursor = if anchor >= PULL_RANGE {
        roundup(anchor - PULL_RANGE, granularity)
    } else {
        0
    };

    let limit = if anchor < usize::MAX - PULL_RANGE {
        rounddown(anchor + PULL_RANGE, granularity)
    } else {
        usize::MAX
    };

    while cursor < limit {
        let region = map.query(cursor)?;
        let next = region.base.checked_add(region.size)?;

        if region.free {
            let candidate = roundup(region.base, granularity);

            // Only usable if alignment kept us inside the region and the
            // rest of the region still holds the requested size.
            if candidate < next && next - candidate >= size {
                if let Some(block) = map.reserve(candidate, size) {
                    return Some(block);
                }

                log::trace!("reservation at 0x{candidate:X} refused, scanning on");
            }
        }

        cursor = next;
    }

    None
}

/// The live process map, through `VirtualQuery`/`VirtualAlloc`.
#[cfg(windows)]
pub struct ProcessMap;

#[cfg(windows)]
impl MemoryMap for ProcessMap {
    fn granularity(&self) -> usize {
        winapi::allocation_granularity()
    }

    fn query(&self, addr: usize) -> Option<Region> {
        match winapi::virtual_query(addr) {
            Ok(info) => Some(Region {
                base: info.base_address,
                size: info.region_size,
                free: info.is_free(),
            }),
            Err(err) => {
                log::error!("VirtualQuery at 0x{addr:X} failed: {err}");
                None
            }
        }
    }

    fn reserve(&mut self, addr: usize, size: usize) -> Option<NonNull<c_void>> {
        let result = unsafe {
            winapi::virtual_alloc(
                Some(addr as *const c_void),
                size,
                AllocationType::CommitReserve,
                PAGE_EXECUTE_READWRITE,
            )
        };

        match result {
            Ok(block) => NonNull::new(block),
            Err(err) => {
                log::warn!("VirtualAlloc at 0x{addr:X} failed: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: usize = 0x10000;
    const ANCHOR: usize = 0x7FF6_0010_0000;
    const LO: usize = ANCHOR - PULL_RANGE;

    /// Synthetic memory map: a sorted run of regions plus a list of
    /// reservation addresses the "OS" refuses.
    struct MockMap {
        granularity: usize,
        regions: Vec<Region>,
        refuse: Vec<usize>,
        reserved: Vec<(usize, usize)>,
    }

    impl MockMap {
        fn new(regions: Vec<Region>) -> Self {
            Self {
                granularity: G,
                regions,
                refuse: Vec::new(),
                reserved: Vec::new(),
            }
        }
    }

    impl MemoryMap for MockMap {
        fn granularity(&self) -> usize {
            self.granularity
        }

        fn query(&self, addr: usize) -> Option<Region> {
            self.regions
                .iter()
                .copied()
                .find(|region| addr >= region.base && addr - region.base < region.size)
        }

        fn reserve(&mut self, addr: usize, size: usize) -> Option<NonNull<c_void>> {
            if self.refuse.contains(&addr) {
                return None;
            }

            self.reserved.push((addr, size));
            NonNull::new(addr as *mut c_void)
        }
    }

    fn busy(base: usize, size: usize) -> Region {
        Region { base, size, free: false }
    }

    fn free(base: usize, size: usize) -> Region {
        Region { base, size, free: true }
    }

    #[test]
    fn picks_first_free_gap() {
        let mut map = MockMap::new(vec![
            busy(LO, 0x100000),
            free(LO + 0x100000, 0x100000),
        ]);

        let block = find_free_region(&mut map, ANCHOR, 0x1000).unwrap();

        assert_eq!(block.as_ptr() as usize, LO + 0x100000);
        assert_eq!(map.reserved, vec![(LO + 0x100000, 0x1000)]);
    }

    #[test]
    fn aligns_candidate_to_granularity() {
        // The free region starts off-granularity; the candidate has to be
        // rounded up into it.
        let mut map = MockMap::new(vec![
            busy(LO, 0x8000),
            free(LO + 0x8000, 0x20000),
        ]);

        let block = find_free_region(&mut map, ANCHOR, 0x1000).unwrap();

        assert_eq!(block.as_ptr() as usize, LO + G);
    }

    #[test]
    fn skips_gaps_smaller_than_request() {
        // After alignment only 0x1000 bytes remain in the first gap.
        let mut map = MockMap::new(vec![
            busy(LO, 0x8000),
            free(LO + 0x8000, 0x9000),
            busy(LO + 0x11000, 0xF000),
            free(LO + 0x20000, 0x10000),
        ]);

        let block = find_free_region(&mut map, ANCHOR, 0x2000).unwrap();

        assert_eq!(block.as_ptr() as usize, LO + 0x20000);
    }

    #[test]
    fn keeps_scanning_after_refused_reservation() {
        let mut map = MockMap::new(vec![
            free(LO, 0x10000),
            free(LO + 0x10000, 0x10000),
        ]);
        map.refuse.push(LO);

        let block = find_free_region(&mut map, ANCHOR, 0x1000).unwrap();

        assert_eq!(block.as_ptr() as usize, LO + 0x10000);
    }

    #[test]
    fn gives_up_past_upper_limit() {
        // Two busy regions tile the whole window and beyond.
        let mut map = MockMap::new(vec![
            busy(LO, PULL_RANGE),
            busy(LO + PULL_RANGE, PULL_RANGE + 0x100000),
        ]);

        assert!(find_free_region(&mut map, ANCHOR, 0x1000).is_none());
        assert!(map.reserved.is_empty());
    }

    #[test]
    fn aborts_when_map_cannot_be_read() {
        // Hole in the map right after the first region.
        let mut map = MockMap::new(vec![busy(LO, 0x10000)]);

        assert!(find_free_region(&mut map, ANCHOR, 0x1000).is_none());
    }

    #[test]
    fn clamps_search_window_at_address_zero() {
        // Anchor below the pull range: the walk starts at 0 instead of
        // wrapping around.
        let mut map = MockMap::new(vec![busy(0, 0x10000), free(0x10000, 0x20000)]);

        let block = find_free_region(&mut map, 0x100000, 0x1000).unwrap();

        assert_eq!(block.as_ptr() as usize, 0x10000);
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(roundup(0, G), 0);
        assert_eq!(roundup(1, G), G);
        assert_eq!(roundup(G, G), G);
        assert_eq!(roundup(G + 1, G), 2 * G);
        assert_eq!(rounddown(G - 1, G), 0);
        assert_eq!(rounddown(G, G), G);
        assert_eq!(rounddown(2 * G + 5, G), 2 * G);
        assert_eq!(roundup(123, 0), 0);
        assert_eq!(rounddown(123, 0), 0);
    }
}
