//! BiBOP (Big Bag of Pages) small-object space and the space facade.
//!
//! Small objects are segregated into power-of-two size classes. Each 4KB
//! page of the small-object region serves exactly one class while it has
//! live blocks; once its last block is freed the page goes back to the
//! shared page pool and its physical memory is discarded. Objects larger
//! than [`MAX_SMALL_OBJECT_SIZE`] are routed to the large-object space.

use std::io;

use sys_alloc::{Region, RegionOptions};

use crate::config::GcConfig;
use crate::descriptor::{ARRAY_LENGTH_SIZE, OBJECT_HEADER_SIZE};
use crate::error::SpaceKind;
use crate::los::LargeObjectSpace;
use crate::object::Placement;

// ============================================================================
// Constants
// ============================================================================

/// Size of a heap page.
pub const PAGE_SIZE: usize = 4096;

/// Size classes for small objects.
pub const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Objects above this size go to the large-object space.
pub const MAX_SMALL_OBJECT_SIZE: usize = 2048;

/// Magic number stamped into every object header ("RFGC").
pub(crate) const OBJECT_MAGIC: u32 = 0x5246_4743;

const NUM_CLASSES: usize = SIZE_CLASSES.len();

const fn compute_class_index(size: usize) -> usize {
    if size <= 16 {
        0
    } else if size <= 32 {
        1
    } else if size <= 64 {
        2
    } else if size <= 128 {
        3
    } else if size <= 256 {
        4
    } else if size <= 512 {
        5
    } else if size <= 1024 {
        6
    } else {
        7
    }
}

// ============================================================================
// Usage reporting
// ============================================================================

/// Capacity and occupancy of one space, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceUsage {
    /// Bytes the space can hand out.
    pub capacity: usize,
    /// Bytes currently charged to live blocks (rounded to block size).
    pub used: usize,
}

impl SpaceUsage {
    #[must_use]
    pub const fn free(&self) -> usize {
        self.capacity - self.used
    }
}

/// Occupancy of both spaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapUsage {
    pub small: SpaceUsage,
    pub large: SpaceUsage,
}

impl HeapUsage {
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.small.capacity + self.large.capacity
    }

    #[must_use]
    pub const fn used(&self) -> usize {
        self.small.used + self.large.used
    }

    #[must_use]
    pub const fn free(&self) -> usize {
        self.capacity() - self.used()
    }
}

// ============================================================================
// SmallObjectSpace
// ============================================================================

/// Per-page bookkeeping.
#[derive(Debug, Default)]
struct PageInfo {
    /// Size class served by this page; `None` while the page is in the pool.
    class: Option<usize>,
    /// Slots freed since the page was claimed.
    free_slots: Vec<u16>,
    /// Next never-used slot.
    bump: u16,
    /// Number of allocated slots.
    live: u16,
    /// Whether the page is on its class's partial list.
    in_partial: bool,
}

impl PageInfo {
    fn has_room(&self, block: usize) -> bool {
        !self.free_slots.is_empty() || usize::from(self.bump) < PAGE_SIZE / block
    }
}

/// Size-class pooled pages for objects up to [`MAX_SMALL_OBJECT_SIZE`].
pub(crate) struct SmallObjectSpace {
    region: Region,
    pages: Vec<PageInfo>,
    /// Unclaimed pages; the lowest index is popped first.
    free_pages: Vec<usize>,
    /// Claimed pages with at least one free slot, per class.
    partial: [Vec<usize>; NUM_CLASSES],
    used: usize,
    discard: bool,
}

impl SmallObjectSpace {
    /// Reserves `capacity` bytes, rounded down to whole pages.
    pub fn new(capacity: usize, discard: bool) -> io::Result<Self> {
        let page_count = capacity / PAGE_SIZE;
        let region = RegionOptions::new().len(page_count * PAGE_SIZE).reserve()?;
        let mut pages = Vec::with_capacity(page_count);
        pages.resize_with(page_count, PageInfo::default);
        Ok(Self {
            region,
            pages,
            free_pages: (0..page_count).rev().collect(),
            partial: Default::default(),
            used: 0,
            discard,
        })
    }

    pub fn capacity(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    pub const fn used(&self) -> usize {
        self.used
    }

    /// Pages currently serving a size class.
    #[cfg(test)]
    pub fn pages_in_use(&self) -> usize {
        self.pages.len() - self.free_pages.len()
    }

    pub fn base(&self) -> *mut u8 {
        self.region.ptr()
    }

    /// Places a block for an object of `size` bytes.
    pub fn allocate(&mut self, size: usize) -> Option<Placement> {
        debug_assert!(size <= MAX_SMALL_OBJECT_SIZE);
        let class = compute_class_index(size);
        let block = SIZE_CLASSES[class];

        let page_idx = if let Some(&idx) = self.partial[class].last() {
            idx
        } else {
            let idx = self.free_pages.pop()?;
            let page = &mut self.pages[idx];
            page.class = Some(class);
            page.in_partial = true;
            self.partial[class].push(idx);
            idx
        };

        let page = &mut self.pages[page_idx];
        let slot = if let Some(slot) = page.free_slots.pop() {
            slot
        } else {
            let slot = page.bump;
            page.bump += 1;
            slot
        };
        page.live += 1;

        if !page.has_room(block) {
            page.in_partial = false;
            self.partial[class].pop();
        }

        self.used += block;
        Some(Placement {
            space: SpaceKind::Small,
            offset: page_idx * PAGE_SIZE + usize::from(slot) * block,
            block,
        })
    }

    /// Returns a block to its page. A page whose last block is freed goes
    /// back to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the placement does not name a claimed page of this space.
    pub fn free(&mut self, placement: &Placement) {
        let page_idx = placement.offset / PAGE_SIZE;
        let page = &mut self.pages[page_idx];
        let Some(class) = page.class else {
            panic!("small-object free in unclaimed page {page_idx}");
        };
        let block = SIZE_CLASSES[class];
        assert_eq!(block, placement.block, "block size does not match page class");

        #[allow(clippy::cast_possible_truncation)]
        let slot = ((placement.offset % PAGE_SIZE) / block) as u16;
        page.live -= 1;
        self.used -= block;

        if page.live == 0 {
            if page.in_partial {
                if let Some(pos) = self.partial[class].iter().position(|&p| p == page_idx) {
                    self.partial[class].swap_remove(pos);
                }
            }
            *page = PageInfo::default();
            self.release_page(page_idx);
        } else {
            page.free_slots.push(slot);
            if !page.in_partial {
                page.in_partial = true;
                self.partial[class].push(page_idx);
            }
        }
    }

    fn release_page(&mut self, page_idx: usize) {
        if self.discard {
            if let Err(_err) = self.region.discard(page_idx * PAGE_SIZE, PAGE_SIZE) {
                #[cfg(feature = "tracing")]
                tracing::warn!(page = page_idx, error = %_err, "page discard failed");
            }
        }
        self.free_pages.push(page_idx);
    }
}

// ============================================================================
// Spaces - facade over both spaces
// ============================================================================

/// Routes allocations by size and owns the payload memory of all objects.
pub(crate) struct Spaces {
    small: SmallObjectSpace,
    large: LargeObjectSpace,
}

impl Spaces {
    pub fn new(config: &GcConfig) -> io::Result<Self> {
        Ok(Self {
            small: SmallObjectSpace::new(config.small_space_bytes, config.discard_free_pages)?,
            large: LargeObjectSpace::new(config.large_space_bytes, config.discard_free_pages)?,
        })
    }

    /// Space an object of `size` bytes is routed to.
    pub const fn space_for(size: usize) -> SpaceKind {
        if size <= MAX_SMALL_OBJECT_SIZE {
            SpaceKind::Small
        } else {
            SpaceKind::Large
        }
    }

    /// Whether a request could ever be satisfied by an empty heap.
    pub fn can_ever_fit(&self, size: usize) -> bool {
        match Self::space_for(size) {
            SpaceKind::Small => self.small.capacity() >= PAGE_SIZE,
            SpaceKind::Large => size.div_ceil(PAGE_SIZE) * PAGE_SIZE <= self.large.capacity(),
        }
    }

    /// Places a block for `size` bytes; on failure names the exhausted space.
    pub fn allocate(&mut self, size: usize) -> Result<Placement, SpaceKind> {
        let space = Self::space_for(size);
        let placement = match space {
            SpaceKind::Small => self.small.allocate(size),
            SpaceKind::Large => self.large.allocate(size),
        };
        placement.ok_or(space)
    }

    pub fn free(&mut self, placement: &Placement) {
        match placement.space {
            SpaceKind::Small => self.small.free(placement),
            SpaceKind::Large => self.large.free(placement),
        }
    }

    pub fn usage(&self) -> HeapUsage {
        HeapUsage {
            small: SpaceUsage {
                capacity: self.small.capacity(),
                used: self.small.used(),
            },
            large: SpaceUsage {
                capacity: self.large.capacity(),
                used: self.large.used(),
            },
        }
    }

    fn block_ptr(&self, placement: &Placement) -> *mut u8 {
        let base = match placement.space {
            SpaceKind::Small => self.small.base(),
            SpaceKind::Large => self.large.base(),
        };
        // SAFETY: placements are only produced by this facade and lie inside
        // the reserved region of their space.
        unsafe { base.add(placement.offset) }
    }

    /// Zeroes a fresh block and writes its header and array length word.
    pub fn init_block(
        &mut self,
        placement: &Placement,
        index: u32,
        size: usize,
        array_len: Option<usize>,
    ) {
        let block = self.block_ptr(placement);
        // SAFETY: the block is exclusively owned by the new object, is at
        // least `size` bytes long and 16-byte aligned (size classes and page
        // runs are multiples of 16 starting at page boundaries).
        unsafe {
            block.write_bytes(0, size);
            block.cast::<u32>().write(OBJECT_MAGIC);
            block.add(4).cast::<u32>().write(index);
            block.add(8).cast::<u64>().write(size as u64);
            if let Some(len) = array_len {
                block.add(OBJECT_HEADER_SIZE).cast::<u64>().write(len as u64);
            }
        }
        debug_assert!(ARRAY_LENGTH_SIZE == 8);
    }

    /// Whether the header at `placement` names the object `index` of `size`
    /// bytes.
    pub fn header_matches(&self, placement: &Placement, index: u32, size: usize) -> bool {
        let block = self.block_ptr(placement);
        // SAFETY: `placement` is a live block with a header written by
        // `init_block`.
        let (magic, stored_index, stored_size) = unsafe {
            (
                block.cast::<u32>().read(),
                block.add(4).cast::<u32>().read(),
                block.add(8).cast::<u64>().read(),
            )
        };
        magic == OBJECT_MAGIC && stored_index == index && stored_size == size as u64
    }

    /// Payload bytes `[offset, offset + len)` of a live block.
    pub fn bytes(&self, placement: &Placement, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= placement.block);
        // SAFETY: the range lies within the live block; the caller holds the
        // heap lock, so no writer aliases it.
        unsafe { std::slice::from_raw_parts(self.block_ptr(placement).add(offset), len) }
    }

    pub fn bytes_mut(&mut self, placement: &Placement, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= placement.block);
        // SAFETY: as for `bytes`, with exclusive access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.block_ptr(placement).add(offset), len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_class_index() {
        assert_eq!(compute_class_index(1), 0);
        assert_eq!(compute_class_index(16), 0);
        assert_eq!(compute_class_index(17), 1);
        assert_eq!(compute_class_index(1024), 6);
        assert_eq!(compute_class_index(1025), 7);
        assert_eq!(compute_class_index(2048), 7);
    }

    #[test]
    fn test_small_allocate_fills_page_then_claims_next() {
        let mut space = SmallObjectSpace::new(4 * PAGE_SIZE, true).unwrap();
        let per_page = PAGE_SIZE / 2048;

        let blocks: Vec<_> = (0..per_page).map(|_| space.allocate(2000).unwrap()).collect();
        assert_eq!(space.pages_in_use(), 1);
        assert!(blocks.iter().all(|b| b.offset / PAGE_SIZE == blocks[0].offset / PAGE_SIZE));

        let next = space.allocate(2000).unwrap();
        assert_ne!(next.offset / PAGE_SIZE, blocks[0].offset / PAGE_SIZE);
        assert_eq!(space.pages_in_use(), 2);
        assert_eq!(space.used(), (per_page + 1) * 2048);
    }

    #[test]
    fn test_small_exhaustion_and_reuse() {
        let mut space = SmallObjectSpace::new(2 * PAGE_SIZE, true).unwrap();
        let mut blocks = Vec::new();
        while let Some(b) = space.allocate(1024) {
            blocks.push(b);
        }
        assert_eq!(blocks.len(), 2 * PAGE_SIZE / 1024);
        assert_eq!(space.used(), space.capacity());

        let freed = blocks.pop().unwrap();
        space.free(&freed);
        let again = space.allocate(1000).unwrap();
        assert_eq!(again, freed);
    }

    #[test]
    fn test_empty_page_returns_to_pool_for_other_class() {
        let mut space = SmallObjectSpace::new(PAGE_SIZE, true).unwrap();
        let a = space.allocate(16).unwrap();
        let b = space.allocate(16).unwrap();
        assert!(space.allocate(2048).is_none());

        space.free(&a);
        space.free(&b);
        assert_eq!(space.pages_in_use(), 0);
        assert_eq!(space.used(), 0);

        let big = space.allocate(2048).unwrap();
        assert_eq!(big.block, 2048);
    }

    #[test]
    fn test_spaces_routes_by_size() {
        let config = GcConfig::default()
            .with_small_space_bytes(64 * 1024)
            .with_large_space_bytes(64 * 1024);
        let mut spaces = Spaces::new(&config).unwrap();

        let small = spaces.allocate(MAX_SMALL_OBJECT_SIZE).unwrap();
        assert_eq!(small.space, SpaceKind::Small);
        let large = spaces.allocate(MAX_SMALL_OBJECT_SIZE + 1).unwrap();
        assert_eq!(large.space, SpaceKind::Large);
        assert_eq!(large.block, PAGE_SIZE);

        let usage = spaces.usage();
        assert_eq!(usage.used(), 2048 + PAGE_SIZE);
        assert_eq!(usage.free(), usage.capacity() - usage.used());

        spaces.free(&small);
        spaces.free(&large);
        assert_eq!(spaces.usage().used(), 0);
    }

    #[test]
    fn test_block_header_round_trip() {
        let config = GcConfig::default()
            .with_small_space_bytes(16 * 1024)
            .with_large_space_bytes(16 * 1024);
        let mut spaces = Spaces::new(&config).unwrap();
        let p = spaces.allocate(40).unwrap();
        spaces.init_block(&p, 7, 40, Some(2));

        assert!(spaces.header_matches(&p, 7, 40));
        assert!(!spaces.header_matches(&p, 8, 40));
        assert!(!spaces.header_matches(&p, 7, 48));
        assert_eq!(spaces.bytes(&p, 16, 8), &2u64.to_ne_bytes());

        spaces.bytes_mut(&p, 24, 4).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(spaces.bytes(&p, 24, 4), &[1, 2, 3, 4]);
    }
}
