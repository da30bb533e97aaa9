//! Code memory management using mmap.
//!
//! The code cache is one anonymous mapping. Installed code is written into it
//! before publication and, afterwards, only individual aligned words are
//! rewritten. Every access goes through atomics so a patching thread and a
//! reading thread never race on plain memory.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering, fence};

use crate::error::MemoryError;

/// A block of code memory allocated via mmap.
///
/// When `executable` is requested the mapping is RWX from the start, which is
/// what a real runtime needs to run the patched code. Otherwise it is RW and
/// only inspected.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Allocate a new RW block with the given size.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        Self::reserve(size, false)
    }

    /// Allocate a new block, optionally mapped executable.
    pub fn reserve(size: usize, executable: bool) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        // whole pages only
        let page_size = Self::page_size();
        let aligned_size = size
            .checked_add(page_size - 1)
            .ok_or(MemoryError::InvalidSize)?
            & !(page_size - 1);

        let ptr = Self::mmap_alloc(aligned_size, executable)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            executable,
        })
    }

    /// The system page size.
    pub fn page_size() -> usize {
        #[cfg(unix)]
        {
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size > 0 { size as usize } else { 4096 }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    #[cfg(unix)]
    fn mmap_alloc(size: usize, executable: bool) -> Result<NonNull<u8>, MemoryError> {
        use std::ptr;

        let mut prot = libc::PROT_READ | libc::PROT_WRITE;
        if executable {
            prot |= libc::PROT_EXEC;
        }

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(if executable {
                MemoryError::ProtectionFailed
            } else {
                MemoryError::AllocationFailed
            });
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn mmap_alloc(size: usize, _executable: bool) -> Result<NonNull<u8>, MemoryError> {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    /// Base of the mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Absolute address of the first byte.
    pub fn base_address(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Mapped bytes, rounded up to whole pages.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if the memory is mapped executable.
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MemoryError::OutOfBounds { offset, len }),
        }
    }

    /// Write bytes at the given offset.
    ///
    /// The bytes are stored one at a time with relaxed atomics and followed by a
    /// release fence; the caller publishes them through a lock or an atomic
    /// store that readers acquire.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        self.check(offset, data.len())?;
        for (i, byte) in data.iter().enumerate() {
            self.byte(offset + i).store(*byte, Ordering::Relaxed);
        }
        fence(Ordering::Release);
        Ok(())
    }

    /// Read `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, MemoryError> {
        self.check(offset, len)?;
        fence(Ordering::Acquire);
        Ok((0..len)
            .map(|i| self.byte(offset + i).load(Ordering::Relaxed))
            .collect())
    }

    /// Atomically load an aligned 32-bit word.
    pub fn load_u32(&self, offset: usize) -> Result<u32, MemoryError> {
        Ok(self.word32(offset)?.load(Ordering::Acquire))
    }

    /// Atomically store an aligned 32-bit word.
    pub fn store_u32(&self, offset: usize, value: u32) -> Result<(), MemoryError> {
        self.word32(offset)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Atomically load an aligned 64-bit word.
    pub fn load_u64(&self, offset: usize) -> Result<u64, MemoryError> {
        Ok(self.word64(offset)?.load(Ordering::Acquire))
    }

    /// Atomically store an aligned 64-bit word.
    pub fn store_u64(&self, offset: usize, value: u64) -> Result<(), MemoryError> {
        self.word64(offset)?.store(value, Ordering::Release);
        Ok(())
    }

    fn byte(&self, offset: usize) -> &AtomicU8 {
        // SAFETY: callers bounds-check `offset`; the mapping lives as long as
        // `self` and is only ever accessed through atomics.
        unsafe { AtomicU8::from_ptr(self.ptr.as_ptr().add(offset)) }
    }

    fn word32(&self, offset: usize) -> Result<&AtomicU32, MemoryError> {
        self.check(offset, 4)?;
        let ptr = unsafe { self.ptr.as_ptr().add(offset) };
        if (ptr as usize) % 4 != 0 {
            return Err(MemoryError::OutOfBounds { offset, len: 4 });
        }
        // SAFETY: in bounds and 4-byte aligned, see `byte`.
        Ok(unsafe { AtomicU32::from_ptr(ptr.cast()) })
    }

    fn word64(&self, offset: usize) -> Result<&AtomicU64, MemoryError> {
        self.check(offset, 8)?;
        let ptr = unsafe { self.ptr.as_ptr().add(offset) };
        if (ptr as usize) % 8 != 0 {
            return Err(MemoryError::OutOfBounds { offset, len: 8 });
        }
        // SAFETY: in bounds and 8-byte aligned, see `byte`.
        Ok(unsafe { AtomicU64::from_ptr(ptr.cast()) })
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            }
        }
        #[cfg(not(unix))]
        {
            if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, Self::page_size()) {
                unsafe {
                    std::alloc::dealloc(self.ptr.as_ptr(), layout);
                }
            }
        }
    }
}

// The mapping is owned and every access after construction is atomic.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_memory() {
        let mem = ExecutableMemory::new(4096).unwrap();
        assert!(mem.size() >= 4096);
        assert!(!mem.is_executable());
        assert_eq!(mem.base_address() % ExecutableMemory::page_size() as u64, 0);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            ExecutableMemory::new(0),
            Err(MemoryError::InvalidSize)
        ));
    }

    #[test]
    fn test_write_then_read() {
        let mem = ExecutableMemory::new(4096).unwrap();
        mem.write(10, &[0x90, 0xC3]).unwrap();
        assert_eq!(mem.read(9, 4).unwrap(), vec![0, 0x90, 0xC3, 0]);
    }

    #[test]
    fn test_write_past_end_fails() {
        let mem = ExecutableMemory::new(4096).unwrap();
        let size = mem.size();
        assert!(mem.write(size - 1, &[1, 2]).is_err());
    }

    #[test]
    fn test_word_access_requires_alignment() {
        let mem = ExecutableMemory::new(4096).unwrap();
        mem.store_u64(16, 0xDEAD_BEEF_CAFE_F00D).unwrap();
        assert_eq!(mem.load_u64(16).unwrap(), 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(mem.load_u32(16).unwrap(), 0xCAFE_F00D);
        assert!(mem.store_u64(12, 0).is_err());
        assert!(mem.load_u32(2).is_err());
    }

    #[test]
    fn test_executable_mapping() {
        // Some hardened kernels refuse RWX mappings; only check the flag when it works.
        if let Ok(mem) = ExecutableMemory::reserve(4096, true) {
            assert!(mem.is_executable());
            mem.write(0, &[0xC3]).unwrap();
        }
    }
}
