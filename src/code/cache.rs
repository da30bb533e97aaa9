//! The code cache: one mapping that holds every installed blob.
//!
//! Page 0 is reserved as the safepoint polling page. Blobs are bump-allocated
//! after it and registered by start address so any code address can be mapped
//! back to the blob that contains it.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::{Mutex, PoisonError, RwLock};

use serde::Serialize;

use super::artifact::ArtifactId;
use super::memory::ExecutableMemory;
use crate::error::{CodeCacheError, MemoryError};

/// What a registered blob holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobKind {
    Artifact,
    RuntimeStub,
    Adapter,
    NativeWrapper,
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlobKind::Artifact => "artifact",
            BlobKind::RuntimeStub => "runtime stub",
            BlobKind::Adapter => "adapter",
            BlobKind::NativeWrapper => "native wrapper",
        };
        f.write_str(name)
    }
}

/// A registered region of the code cache.
#[derive(Debug, Clone, Serialize)]
pub struct CodeBlob {
    pub start: u64,
    pub size: usize,
    pub kind: BlobKind,
    pub name: String,
    pub artifact: Option<ArtifactId>,
}

impl CodeBlob {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.start + self.size as u64
    }

    pub fn range(&self) -> Range<u64> {
        self.start..self.start + self.size as u64
    }
}

/// An allocated but unpublished region.
///
/// Only the owner of a slot writes to it, and it becomes visible to lookups
/// only through [`CodeCache::commit`].
#[derive(Debug)]
pub struct CodeSlot {
    start: u64,
    offset: usize,
    size: usize,
    /// Allocation top before this slot, alignment padding included
    floor: usize,
}

impl CodeSlot {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

pub struct CodeCache {
    memory: ExecutableMemory,
    top: Mutex<usize>,
    blobs: RwLock<BTreeMap<u64, CodeBlob>>,
    page_size: usize,
    /// End of the usable region; the mapping itself is page-rounded
    limit: usize,
}

impl CodeCache {
    pub fn new(size: usize, executable: bool) -> Result<Self, CodeCacheError> {
        let page_size = ExecutableMemory::page_size();
        let memory = ExecutableMemory::reserve(size + page_size, executable)?;
        Ok(Self {
            memory,
            top: Mutex::new(page_size),
            blobs: RwLock::new(BTreeMap::new()),
            page_size,
            limit: page_size + size,
        })
    }

    /// Address of the safepoint polling page.
    pub fn poll_page(&self) -> u64 {
        self.memory.base_address()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn range(&self) -> Range<u64> {
        let base = self.memory.base_address();
        base..base + self.memory.size() as u64
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.range().contains(&addr)
    }

    pub fn capacity(&self) -> usize {
        self.limit - self.page_size
    }

    pub fn used(&self) -> usize {
        *self.top.lock().unwrap_or_else(PoisonError::into_inner) - self.page_size
    }

    pub fn is_executable(&self) -> bool {
        self.memory.is_executable()
    }

    /// Reserve `size` bytes aligned to `align` (a power of two).
    pub fn allocate(&self, size: usize, align: usize) -> Result<CodeSlot, CodeCacheError> {
        debug_assert!(align.is_power_of_two());
        let base = self.memory.base_address() as usize;
        let mut top = self.top.lock().unwrap_or_else(PoisonError::into_inner);
        let start = (base + *top + align - 1) & !(align - 1);
        let offset = start - base;
        let free = self.limit - *top;
        if size == 0 || offset + size > self.limit {
            return Err(CodeCacheError::Full {
                requested: size,
                free,
            });
        }
        let floor = *top;
        *top = offset + size;
        Ok(CodeSlot {
            start: start as u64,
            offset,
            size,
            floor,
        })
    }

    /// Give back a slot that was never committed.
    ///
    /// Only the most recent allocation can actually be reclaimed; anything else
    /// stays as a hole. Releasing slots newest first reclaims all of them.
    pub fn release(&self, slot: CodeSlot) {
        let mut top = self.top.lock().unwrap_or_else(PoisonError::into_inner);
        if *top == slot.offset + slot.size {
            *top = slot.floor;
        }
    }

    /// Current allocation top, for a later [`CodeCache::unwind`].
    pub(crate) fn mark(&self) -> usize {
        *self.top.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop every blob and slot allocated since `mark`.
    ///
    /// The caller must have been the only allocator since taking the mark.
    pub(crate) fn unwind(&self, mark: usize) {
        let mut top = self.top.lock().unwrap_or_else(PoisonError::into_inner);
        let floor = self.memory.base_address() + mark as u64;
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|&start, _| start < floor);
        *top = mark.min(*top);
    }

    /// Copy `bytes` into the slot and register it as a blob.
    pub fn commit(
        &self,
        slot: CodeSlot,
        bytes: &[u8],
        kind: BlobKind,
        name: impl Into<String>,
        artifact: Option<ArtifactId>,
    ) -> Result<CodeBlob, CodeCacheError> {
        if bytes.len() > slot.size {
            return Err(MemoryError::OutOfBounds {
                offset: slot.offset,
                len: bytes.len(),
            }
            .into());
        }
        self.memory.write(slot.offset, bytes)?;
        let blob = CodeBlob {
            start: slot.start,
            size: slot.size,
            kind,
            name: name.into(),
            artifact,
        };
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(blob.start, blob.clone());
        Ok(blob)
    }

    /// Find the blob containing `addr`.
    pub fn find_blob(&self, addr: u64) -> Option<CodeBlob> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        blobs
            .range(..=addr)
            .next_back()
            .map(|(_, blob)| blob)
            .filter(|blob| blob.contains(addr))
            .cloned()
    }

    pub fn blobs(&self) -> Vec<CodeBlob> {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn offset_of(&self, addr: u64, len: usize) -> Result<usize, MemoryError> {
        let base = self.memory.base_address();
        if addr < base {
            return Err(MemoryError::OutOfBounds {
                offset: 0,
                len,
            });
        }
        Ok((addr - base) as usize)
    }

    pub fn load_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        self.memory.load_u32(self.offset_of(addr, 4)?)
    }

    pub fn store_u32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.memory.store_u32(self.offset_of(addr, 4)?, value)
    }

    pub fn load_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        self.memory.load_u64(self.offset_of(addr, 8)?)
    }

    pub fn store_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.memory.store_u64(self.offset_of(addr, 8)?, value)
    }

    pub fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        self.memory.read(self.offset_of(addr, len)?, len)
    }

    /// Rewrite published bytes.
    ///
    /// Only for multi-byte updates done while every mutator is stopped, such
    /// as heap reference fix-ups; concurrent call-site patching goes through
    /// the word stores.
    pub(crate) fn rewrite(&self, addr: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        self.memory.write(self.offset_of(addr, bytes.len())?, bytes)
    }
}

impl fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeCache")
            .field("range", &self.range())
            .field("used", &self.used())
            .finish()
    }
}
