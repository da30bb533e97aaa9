//! Typed views over installed call instructions.
//!
//! Everything outside this module and the installer treats a call site as a
//! destination that can be read without locking and rewritten under a
//! [`PatchScope`]. The raw field behind it is a [`PatchSite`]: either the
//! rel32 displacement of an x86 call, or an aligned 8-byte word (the
//! immediate of a `movabs`, or a trampoline's data word) stored with a single
//! atomic write.

use std::fmt;

use serde::Serialize;

use crate::arch::{Backend, write_u32, write_u64};
use crate::code::artifact::CompiledArtifact;
use crate::code::cache::CodeCache;
use crate::direct_call::ToInterpStub;
use crate::error::{InstallError, PatchError};
use crate::guard::PatchScope;
use crate::ic::InlineCache;
use crate::metadata::MethodId;
use crate::reloc::CallKind;

/// Where the destination of an installed call lives, relative to the
/// artifact's start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchSite {
    /// 4-byte aligned displacement relative to `next_pc`
    Rel32 { field: u32, next_pc: u32 },
    /// 8-byte aligned absolute address
    Word { field: u32 },
    /// Bound at install time, never rewritten
    Fixed,
}

impl PatchSite {
    pub fn is_patchable(&self) -> bool {
        !matches!(self, PatchSite::Fixed)
    }

    /// Whether a single aligned store updates the field.
    pub fn is_aligned(&self) -> bool {
        match *self {
            PatchSite::Rel32 { field, .. } => field % 4 == 0,
            PatchSite::Word { field } => field % 8 == 0,
            PatchSite::Fixed => true,
        }
    }

    fn rel32(next_pc: u64, target: u64) -> Option<u32> {
        i32::try_from(target.wrapping_sub(next_pc) as i64)
            .ok()
            .map(|disp| disp as u32)
    }

    /// Write `target` into an artifact image that starts at `base` once installed.
    pub(crate) fn encode(&self, image: &mut [u8], base: u64, target: u64) -> Result<(), InstallError> {
        match *self {
            PatchSite::Rel32 { field, next_pc } => {
                let disp = Self::rel32(base + next_pc as u64, target).ok_or(InstallError::OutOfRange {
                    offset: field as usize,
                    target,
                    form: "rel32",
                })?;
                write_u32(image, field as usize, disp)
            }
            PatchSite::Word { field } => write_u64(image, field as usize, target),
            PatchSite::Fixed => Ok(()),
        }
    }

    /// Current destination, or `None` for a fixed site.
    pub fn load(&self, cache: &CodeCache, base: u64) -> Result<Option<u64>, PatchError> {
        match *self {
            PatchSite::Rel32 { field, next_pc } => {
                let disp = cache.load_u32(base + field as u64)? as i32;
                Ok(Some((base + next_pc as u64).wrapping_add(disp as i64 as u64)))
            }
            PatchSite::Word { field } => Ok(Some(cache.load_u64(base + field as u64)?)),
            PatchSite::Fixed => Ok(None),
        }
    }

    /// Atomically replace the destination.
    pub fn store(
        &self,
        cache: &CodeCache,
        base: u64,
        target: u64,
        _scope: &PatchScope<'_>,
    ) -> Result<(), PatchError> {
        match *self {
            PatchSite::Rel32 { field, next_pc } => {
                let address = base + field as u64;
                let disp = Self::rel32(base + next_pc as u64, target)
                    .ok_or(PatchError::OutOfRange { address, target })?;
                cache.store_u32(address, disp)?;
            }
            PatchSite::Word { field } => cache.store_u64(base + field as u64, target)?,
            PatchSite::Fixed => return Err(PatchError::NotPatchable { address: base }),
        }
        Ok(())
    }
}

/// The immutable kind tag of a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallSiteKind {
    Static,
    OptVirtual,
    Virtual,
    Interface,
    /// Call into a runtime stub or external routine
    Runtime,
    SafepointPoll,
}

impl CallSiteKind {
    pub fn is_method_call(self) -> bool {
        self.call_kind().is_some()
    }

    pub fn call_kind(self) -> Option<CallKind> {
        match self {
            CallSiteKind::Static => Some(CallKind::Static),
            CallSiteKind::OptVirtual => Some(CallKind::OptVirtual),
            CallSiteKind::Virtual => Some(CallKind::Virtual),
            CallSiteKind::Interface => Some(CallKind::Interface),
            CallSiteKind::Runtime | CallSiteKind::SafepointPoll => None,
        }
    }
}

impl From<CallKind> for CallSiteKind {
    fn from(kind: CallKind) -> Self {
        match kind {
            CallKind::Static => CallSiteKind::Static,
            CallKind::OptVirtual => CallSiteKind::OptVirtual,
            CallKind::Virtual => CallSiteKind::Virtual,
            CallKind::Interface => CallSiteKind::Interface,
        }
    }
}

impl fmt::Display for CallSiteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.call_kind() {
            Some(kind) => kind.fmt(f),
            None if *self == CallSiteKind::Runtime => f.write_str("runtime"),
            None => f.write_str("safepoint_poll"),
        }
    }
}

/// Side-table entry the installer keeps for every call and poll.
#[derive(Debug)]
pub struct CallSiteRecord {
    /// Offset of the instruction in the artifact
    pub offset: u32,
    pub kind: CallSiteKind,
    pub callee: Option<MethodId>,
    pub site: PatchSite,
    /// Present on static and opt-virtual sites
    pub to_interp: Option<ToInterpStub>,
    /// Present on virtual and interface sites
    pub ic: Option<InlineCache>,
}

/// A call site of an installed artifact.
#[derive(Clone, Copy)]
pub struct CallSite<'a> {
    artifact: &'a CompiledArtifact,
    index: usize,
    cache: &'a CodeCache,
    backend: &'static dyn Backend,
}

impl<'a> CallSite<'a> {
    pub fn new(
        artifact: &'a CompiledArtifact,
        index: usize,
        cache: &'a CodeCache,
        backend: &'static dyn Backend,
    ) -> Option<Self> {
        artifact.call_sites().get(index)?;
        Some(Self {
            artifact,
            index,
            cache,
            backend,
        })
    }

    pub fn record(&self) -> &'a CallSiteRecord {
        &self.artifact.call_sites()[self.index]
    }

    pub fn artifact(&self) -> &'a CompiledArtifact {
        self.artifact
    }

    pub fn cache(&self) -> &'a CodeCache {
        self.cache
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> CallSiteKind {
        self.record().kind
    }

    pub fn callee(&self) -> Option<MethodId> {
        self.record().callee
    }

    /// Address of the call instruction.
    pub fn address(&self) -> u64 {
        self.artifact.start() + self.record().offset as u64
    }

    pub fn inline_cache(&self) -> Option<&'a InlineCache> {
        self.record().ic.as_ref()
    }

    pub fn to_interp_stub(&self) -> Option<&'a ToInterpStub> {
        self.record().to_interp.as_ref()
    }

    /// The current destination. Lock-free.
    pub fn destination(&self) -> Result<u64, PatchError> {
        let record = self.record();
        if let Some(target) = record.site.load(self.cache, self.artifact.start())? {
            return Ok(target);
        }
        // Fixed sites are decoded from the instruction bytes.
        let end = self.artifact.start() + self.artifact.code_size() as u64;
        let len = (end - self.address()).min(32) as usize;
        let bytes = self.cache.read(self.address(), len)?;
        let decoded = match record.kind {
            CallSiteKind::SafepointPoll => {
                return Err(PatchError::NotPatchable {
                    address: self.address(),
                });
            }
            _ => self.backend.call_target(&bytes, 0, self.address()),
        };
        decoded.map_err(|_| PatchError::NotPatchable {
            address: self.address(),
        })
    }

    /// Repoint the call. The caller holds the patching lock.
    pub fn set_destination(&self, target: u64, scope: &PatchScope<'_>) -> Result<(), PatchError> {
        let record = self.record();
        if !record.site.is_patchable() {
            return Err(PatchError::NotPatchable {
                address: self.address(),
            });
        }
        record.site.store(self.cache, self.artifact.start(), target, scope)
    }
}

impl fmt::Debug for CallSite<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSite")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("kind", &self.kind())
            .field("callee", &self.callee())
            .finish()
    }
}
