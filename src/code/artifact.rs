//! Installed compiled artifacts.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

use super::cache::CodeBlob;
use super::oopmap::{ExceptionHandler, OopMap, OopMapSet, find_handler};
use crate::callsite::CallSiteRecord;
use crate::metadata::{ClassId, MethodId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ArtifactId(pub u32);

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "artifact#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ArtifactState {
    InUse = 0,
    /// Retired: callers landing here are sent back through resolution
    NotEntrant = 1,
}

/// Layout of an artifact inside its code cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactLayout {
    pub code_size: usize,
    /// Start of the stub section (trampolines and to-interpreter stubs)
    pub stub_offset: usize,
    /// Start of the literal area
    pub data_offset: usize,
    pub data_size: usize,
}

/// An installed, executable compilation.
pub struct CompiledArtifact {
    id: ArtifactId,
    method: MethodId,
    blob: CodeBlob,
    layout: ArtifactLayout,
    verified_entry: u64,
    frame_size: u32,
    oop_maps: OopMapSet,
    exception_handlers: Vec<ExceptionHandler>,
    dependencies: Vec<ClassId>,
    call_sites: Vec<CallSiteRecord>,
    state: AtomicU8,
}

/// Everything the installer hands over once the image is committed.
pub(crate) struct ArtifactParts {
    pub id: ArtifactId,
    pub method: MethodId,
    pub blob: CodeBlob,
    pub layout: ArtifactLayout,
    pub verified_entry: usize,
    pub frame_size: u32,
    pub oop_maps: OopMapSet,
    pub exception_handlers: Vec<ExceptionHandler>,
    pub dependencies: Vec<ClassId>,
    pub call_sites: Vec<CallSiteRecord>,
}

impl CompiledArtifact {
    pub(crate) fn new(parts: ArtifactParts) -> Self {
        let verified_entry = parts.blob.start + parts.verified_entry as u64;
        Self {
            id: parts.id,
            method: parts.method,
            blob: parts.blob,
            layout: parts.layout,
            verified_entry,
            frame_size: parts.frame_size,
            oop_maps: parts.oop_maps,
            exception_handlers: parts.exception_handlers,
            dependencies: parts.dependencies,
            call_sites: parts.call_sites,
            state: AtomicU8::new(ArtifactState::InUse as u8),
        }
    }

    pub fn id(&self) -> ArtifactId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.blob.name
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn start(&self) -> u64 {
        self.blob.start
    }

    pub fn size(&self) -> usize {
        self.blob.size
    }

    pub fn blob(&self) -> &CodeBlob {
        &self.blob
    }

    pub fn layout(&self) -> ArtifactLayout {
        self.layout
    }

    pub fn code_size(&self) -> usize {
        self.layout.code_size
    }

    pub fn code_range(&self) -> Range<u64> {
        self.start()..self.start() + self.layout.code_size as u64
    }

    pub fn data_address(&self) -> u64 {
        self.start() + self.layout.data_offset as u64
    }

    pub fn verified_entry(&self) -> u64 {
        self.verified_entry
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.blob.contains(addr)
    }

    pub fn dependencies(&self) -> &[ClassId] {
        &self.dependencies
    }

    pub fn depends_on(&self, class: ClassId) -> bool {
        self.dependencies.contains(&class)
    }

    pub fn call_sites(&self) -> &[CallSiteRecord] {
        &self.call_sites
    }

    /// Index of the call site whose instruction starts at `offset`.
    pub fn call_site_at(&self, offset: u32) -> Option<usize> {
        self.call_sites.binary_search_by_key(&offset, |r| r.offset).ok()
    }

    /// The oop map in effect at `pc`.
    pub fn oop_map_at(&self, pc: u64) -> Option<&OopMap> {
        let offset = u32::try_from(pc.checked_sub(self.start())?).ok()?;
        self.oop_maps.at_or_before(offset)
    }

    pub fn oop_maps(&self) -> &OopMapSet {
        &self.oop_maps
    }

    /// Absolute address of the exception handler covering `pc`.
    pub fn handler_for(&self, pc: u64) -> Option<u64> {
        let offset = u32::try_from(pc.checked_sub(self.start())?).ok()?;
        find_handler(&self.exception_handlers, offset).map(|h| self.start() + h as u64)
    }

    pub fn state(&self) -> ArtifactState {
        match self.state.load(Ordering::Acquire) {
            0 => ArtifactState::InUse,
            _ => ArtifactState::NotEntrant,
        }
    }

    pub fn is_not_entrant(&self) -> bool {
        self.state() == ArtifactState::NotEntrant
    }

    /// Retire the artifact. Returns `false` if it already was.
    pub fn make_not_entrant(&self) -> bool {
        self.state
            .compare_exchange(
                ArtifactState::InUse as u8,
                ArtifactState::NotEntrant as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("start", &format_args!("{:#x}", self.start()))
            .field("size", &self.size())
            .field("state", &self.state())
            .field("call_sites", &self.call_sites.len())
            .finish()
    }
}
