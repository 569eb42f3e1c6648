//! Virtual memory primitives for handle segments.
//!
//! A segment reserves an aligned range of address space up front
//! and commits pages lazily as blocks are handed out.
//! Everything that talks to the operating system goes through [VirtualMemory],
//! so the table can be pointed at a different policy (for instance one that
//! refuses to commit past a quota).
use std::fmt::{self, Debug, Formatter};
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use once_cell::sync::Lazy;

/// An error from the operating system's memory manager
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Unable to reserve {size} bytes (align {align}): {source}")]
    Reserve {
        size: usize,
        align: usize,
        #[source]
        source: io::Error,
    },
    #[error("Unable to commit {len} bytes at offset {offset:#x}: {source}")]
    Commit {
        offset: usize,
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("Unable to decommit {len} bytes at offset {offset:#x}: {source}")]
    Decommit {
        offset: usize,
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("Range {offset:#x}+{len:#x} is outside of a {size:#x} byte region")]
    InvalidRange {
        offset: usize,
        len: usize,
        size: usize,
    },
}

/// A source of page-granular memory.
///
/// ## Safety
/// Reserved ranges must not overlap any other live reservation,
/// and freshly committed memory must read as zero
/// (including memory that was previously decommitted).
pub unsafe trait VirtualMemory: Debug + Send + Sync {
    /// The granularity of commit and decommit requests
    fn page_size(&self) -> usize;
    /// Reserve `size` bytes of address space aligned to `align`.
    ///
    /// The memory is inaccessible until it is committed.
    fn reserve(&self, size: usize, align: usize) -> Result<NonNull<u8>, io::Error>;
    /// Make the pages in `[ptr, ptr + len)` readable and writable.
    ///
    /// ## Safety
    /// The range must be page-aligned and inside a live reservation.
    unsafe fn commit(&self, ptr: NonNull<u8>, len: usize) -> Result<(), io::Error>;
    /// Return the pages in `[ptr, ptr + len)` to the operating system.
    ///
    /// ## Safety
    /// The range must be page-aligned and inside a live reservation.
    /// Nothing may reference the memory afterwards.
    unsafe fn decommit(&self, ptr: NonNull<u8>, len: usize) -> Result<(), io::Error>;
    /// Release an entire reservation.
    ///
    /// ## Safety
    /// Arguments must exactly match a prior call to `reserve`.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize, align: usize);
}

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
});

/// The page size of the operating system
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Memory that comes directly from the operating system.
///
/// On unix this maps anonymous memory with `mmap`
/// and toggles page protection to commit and decommit.
/// Elsewhere it falls back to zeroed allocations from `std::alloc`,
/// where committing is a no-op.
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemMemory;
impl SystemMemory {
    /// A shared handle to the system memory source
    pub fn shared() -> Arc<dyn VirtualMemory> {
        Arc::new(SystemMemory)
    }
}

#[cfg(unix)]
unsafe impl VirtualMemory for SystemMemory {
    #[inline]
    fn page_size(&self) -> usize {
        page_size()
    }

    fn reserve(&self, size: usize, align: usize) -> Result<NonNull<u8>, io::Error> {
        assert!(align.is_power_of_two());
        let len = size
            .checked_add(align)
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        unsafe {
            let raw = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if raw == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            /*
             * Over-reserve and then cut off the misaligned head
             * and whatever is left over at the tail.
             */
            let start = raw as usize;
            let aligned = (start + align - 1) & !(align - 1);
            let head = aligned - start;
            if head > 0 {
                libc::munmap(raw, head);
            }
            let tail = len - head - size;
            if tail > 0 {
                libc::munmap((aligned + size) as *mut libc::c_void, tail);
            }
            Ok(NonNull::new_unchecked(aligned as *mut u8))
        }
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, len: usize) -> Result<(), io::Error> {
        let res = libc::mprotect(
            ptr.as_ptr() as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
        );
        if res != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, len: usize) -> Result<(), io::Error> {
        // NOTE: Mapping over the range guarantees the pages read as zero once recommitted
        let res = libc::mmap(
            ptr.as_ptr() as *mut libc::c_void,
            len,
            libc::PROT_NONE,
            libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if res == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize, _align: usize) {
        libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
    }
}

#[cfg(not(unix))]
unsafe impl VirtualMemory for SystemMemory {
    #[inline]
    fn page_size(&self) -> usize {
        page_size()
    }

    fn reserve(&self, size: usize, align: usize) -> Result<NonNull<u8>, io::Error> {
        let layout = std::alloc::Layout::from_size_align(size, align)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    unsafe fn commit(&self, _ptr: NonNull<u8>, _len: usize) -> Result<(), io::Error> {
        Ok(())
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, len: usize) -> Result<(), io::Error> {
        std::ptr::write_bytes(ptr.as_ptr(), 0, len);
        Ok(())
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        std::alloc::dealloc(
            ptr.as_ptr(),
            std::alloc::Layout::from_size_align_unchecked(size, align),
        );
    }
}

/// An owned reservation of address space.
///
/// The reservation is released when the region is dropped.
pub struct Region {
    base: NonNull<u8>,
    size: usize,
    align: usize,
    memory: Arc<dyn VirtualMemory>,
}
/// The region only hands out raw pointers, synchronization is up to its users
unsafe impl Send for Region {}
unsafe impl Sync for Region {}
impl Region {
    /// Reserve `size` bytes aligned to `align`, with nothing committed
    pub fn reserve(
        memory: &Arc<dyn VirtualMemory>,
        size: usize,
        align: usize,
    ) -> Result<Region, MemoryError> {
        let base = memory
            .reserve(size, align)
            .map_err(|source| MemoryError::Reserve { size, align, source })?;
        debug_assert_eq!(base.as_ptr() as usize % align, 0);
        Ok(Region {
            base,
            size,
            align,
            memory: Arc::clone(memory),
        })
    }
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
    #[inline]
    pub fn page_size(&self) -> usize {
        self.memory.page_size()
    }
    fn check_range(&self, offset: usize, len: usize) -> Result<NonNull<u8>, MemoryError> {
        let page = self.page_size();
        let in_bounds = offset
            .checked_add(len)
            .map_or(false, |end| end <= self.size);
        if !in_bounds || offset % page != 0 || len % page != 0 {
            return Err(MemoryError::InvalidRange {
                offset,
                len,
                size: self.size,
            });
        }
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }
    /// Commit the page-aligned range `[offset, offset + len)`
    pub fn commit(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        let ptr = self.check_range(offset, len)?;
        unsafe { self.memory.commit(ptr, len) }
            .map_err(|source| MemoryError::Commit { offset, len, source })
    }
    /// Decommit the page-aligned range `[offset, offset + len)`
    ///
    /// ## Safety
    /// Nothing may access the range until it is committed again.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        let ptr = self.check_range(offset, len)?;
        self.memory
            .decommit(ptr, len)
            .map_err(|source| MemoryError::Decommit { offset, len, source })
    }
}
impl Drop for Region {
    fn drop(&mut self) {
        unsafe { self.memory.release(self.base, self.size, self.align) }
    }
}
impl Debug for Region {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("base", &self.base)
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SIZE: usize = 64 * 1024;

    #[test]
    fn reservations_are_aligned() {
        let memory = SystemMemory::shared();
        let regions = (0..8)
            .map(|_| Region::reserve(&memory, SIZE, SIZE).unwrap())
            .collect::<Vec<_>>();
        for region in &regions {
            assert_eq!(region.base().as_ptr() as usize % SIZE, 0);
            assert_eq!(region.size(), SIZE);
        }
    }

    #[test]
    fn decommitted_pages_come_back_zeroed() {
        let memory = SystemMemory::shared();
        let region = Region::reserve(&memory, SIZE, SIZE).unwrap();
        let page = region.page_size();
        region.commit(0, page).unwrap();
        unsafe {
            let ptr = region.base().as_ptr();
            assert_eq!(*ptr.add(17), 0);
            *ptr.add(17) = 0xAB;
            region.decommit(0, page).unwrap();
            region.commit(0, page).unwrap();
            assert_eq!(*ptr.add(17), 0);
        }
    }

    #[test]
    fn rejects_bad_ranges() {
        let memory = SystemMemory::shared();
        let region = Region::reserve(&memory, SIZE, SIZE).unwrap();
        let page = region.page_size();
        assert!(matches!(
            region.commit(SIZE, page),
            Err(MemoryError::InvalidRange { .. })
        ));
        assert!(matches!(
            region.commit(1, page),
            Err(MemoryError::InvalidRange { .. })
        ));
    }
}
