//! Virtual memory regions backing the collector's heap spaces.
//!
//! A [`Region`] is a contiguous, page-aligned, read/write anonymous mapping
//! reserved once when a space is created. Spaces carve pages out of it and
//! hand whole pages back with [`Region::discard`] when they become empty, so
//! the OS may reclaim the physical memory while the address range stays
//! reserved and accessible.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the system page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Rounds `len` up to a multiple of the allocation granularity.
#[must_use]
pub fn round_to_granularity(len: usize) -> usize {
    let gran = allocation_granularity();
    len.div_ceil(gran) * gran
}

/// An owned virtual memory region.
///
/// The region is released when this handle is dropped.
pub struct Region {
    inner: os::RegionInner,
}

impl Region {
    /// Returns a pointer to the start of the region.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the region in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the region is zero-sized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns `true` if `addr` lies inside the region.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr() as usize;
        addr >= start && addr < start + self.len()
    }

    /// Tells the OS that the contents of `[offset, offset + len)` are no
    /// longer needed.
    ///
    /// The range stays mapped and writable. Its contents afterwards are
    /// unspecified (zero on Linux), so callers must reinitialize memory they
    /// hand out again.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is not page aligned, falls outside the
    /// region, or the OS call fails.
    pub fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        let ps = page_size();
        if offset % ps != 0 || len % ps != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "discard range must be page aligned",
            ));
        }
        if offset.checked_add(len).is_none_or(|end| end > self.len()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "discard range exceeds region",
            ));
        }
        if len == 0 {
            return Ok(());
        }
        // SAFETY: The range was checked to lie inside this region.
        unsafe { self.inner.discard(offset, len) }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// Configuration for reserving a [`Region`].
#[derive(Debug, Clone)]
pub struct RegionOptions {
    len: usize,
    populate: bool,
    no_reserve: bool,
}

impl RegionOptions {
    /// Creates options with length 0. A length must be set before reserving.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            populate: false,
            no_reserve: true,
        }
    }

    /// Sets the length of the region in bytes. It is rounded up to the
    /// allocation granularity when the region is reserved.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets whether to prefault the page tables (`MAP_POPULATE` on Linux).
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Sets whether to skip reserving swap space (`MAP_NORESERVE`).
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Reserves an anonymous read/write region.
    ///
    /// # Errors
    ///
    /// Returns an error if the length is zero or the OS refuses the mapping.
    pub fn reserve(&self) -> io::Result<Region> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        let len = round_to_granularity(self.len);
        // SAFETY: A fresh anonymous mapping does not alias any existing memory.
        let inner = unsafe { os::RegionInner::map_anon(len, self.populate, self.no_reserve)? };
        Ok(Region { inner })
    }
}

impl Default for RegionOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag >= page_size());
        assert_eq!(round_to_granularity(1), ag);
        assert_eq!(round_to_granularity(ag), ag);
    }

    #[test]
    fn test_reserve_and_write() {
        let region = RegionOptions::new()
            .len(4 * page_size())
            .reserve()
            .expect("failed to reserve");

        let p = region.ptr();
        assert!(!p.is_null());
        assert_eq!(p as usize % page_size(), 0);
        assert!(region.contains(p as usize));
        assert!(!region.contains(p as usize + region.len()));

        unsafe {
            ptr::write_volatile(p.add(page_size()), 42);
            assert_eq!(ptr::read_volatile(p.add(page_size())), 42);
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(RegionOptions::new().reserve().is_err());
    }

    #[test]
    fn test_discard_keeps_range_writable() {
        let ps = page_size();
        let region = RegionOptions::new().len(2 * ps).reserve().unwrap();
        unsafe { ptr::write_volatile(region.ptr(), 7) };

        region.discard(0, ps).unwrap();

        unsafe {
            ptr::write_volatile(region.ptr(), 9);
            assert_eq!(ptr::read_volatile(region.ptr()), 9);
        }
    }

    #[test]
    fn test_discard_rejects_bad_ranges() {
        let ps = page_size();
        let region = RegionOptions::new().len(ps).reserve().unwrap();
        assert!(region.discard(1, ps).is_err());
        assert!(region.discard(0, region.len() + ps).is_err());
        assert!(region.discard(0, 0).is_ok());
    }
}
