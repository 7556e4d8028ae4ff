//! Large-object space.
//!
//! Objects above [`MAX_SMALL_OBJECT_SIZE`](crate::heap::MAX_SMALL_OBJECT_SIZE)
//! get a dedicated run of whole pages. Free runs are kept in an
//! address-ordered map; placement is first-fit and freeing coalesces with
//! both neighbours, so a space filled with equal-sized objects and then
//! emptied returns to a single run.

use std::collections::BTreeMap;
use std::io;

use sys_alloc::{Region, RegionOptions};

use crate::error::SpaceKind;
use crate::heap::PAGE_SIZE;
use crate::object::Placement;

pub(crate) struct LargeObjectSpace {
    region: Region,
    page_count: usize,
    /// First page of each free run mapped to its length in pages.
    free_runs: BTreeMap<usize, usize>,
    used_pages: usize,
    discard: bool,
}

impl LargeObjectSpace {
    /// Reserves `capacity` bytes, rounded down to whole pages.
    pub fn new(capacity: usize, discard: bool) -> io::Result<Self> {
        let page_count = capacity / PAGE_SIZE;
        let region = RegionOptions::new().len(page_count * PAGE_SIZE).reserve()?;
        let mut free_runs = BTreeMap::new();
        if page_count > 0 {
            free_runs.insert(0, page_count);
        }
        Ok(Self {
            region,
            page_count,
            free_runs,
            used_pages: 0,
            discard,
        })
    }

    pub const fn capacity(&self) -> usize {
        self.page_count * PAGE_SIZE
    }

    pub const fn used(&self) -> usize {
        self.used_pages * PAGE_SIZE
    }

    pub fn base(&self) -> *mut u8 {
        self.region.ptr()
    }

    /// Longest free run in bytes.
    #[cfg(test)]
    pub fn largest_free_run(&self) -> usize {
        self.free_runs.values().copied().max().unwrap_or(0) * PAGE_SIZE
    }

    #[cfg(test)]
    pub fn free_run_count(&self) -> usize {
        self.free_runs.len()
    }

    /// First-fit placement of `size` bytes rounded up to whole pages.
    pub fn allocate(&mut self, size: usize) -> Option<Placement> {
        let pages = size.div_ceil(PAGE_SIZE).max(1);
        let (start, run) = self
            .free_runs
            .iter()
            .find(|(_, &len)| len >= pages)
            .map(|(&start, &len)| (start, len))?;

        self.free_runs.remove(&start);
        if run > pages {
            self.free_runs.insert(start + pages, run - pages);
        }
        self.used_pages += pages;

        Some(Placement {
            space: SpaceKind::Large,
            offset: start * PAGE_SIZE,
            block: pages * PAGE_SIZE,
        })
    }

    /// Returns a page run, merging it with adjacent free runs.
    pub fn free(&mut self, placement: &Placement) {
        let mut start = placement.offset / PAGE_SIZE;
        let pages = placement.block / PAGE_SIZE;
        let end = start + pages;
        debug_assert!(end <= self.page_count);

        if self.discard {
            if let Err(_err) = self.region.discard(placement.offset, placement.block) {
                #[cfg(feature = "tracing")]
                tracing::warn!(offset = placement.offset, error = %_err, "page run discard failed");
            }
        }

        let mut len = pages;
        if let Some((&prev, &prev_len)) = self.free_runs.range(..start).next_back() {
            debug_assert!(prev + prev_len <= start, "overlapping free runs");
            if prev + prev_len == start {
                self.free_runs.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free_runs.remove(&end) {
            len += next_len;
        }
        self.free_runs.insert(start, len);
        self.used_pages -= pages;
    }
}
