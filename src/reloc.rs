//! Relocation records and the compilation result handed to the installer.

use std::fmt;

use serde::Serialize;

use crate::code::oopmap::{ExceptionHandler, OopMapSet};
use crate::metadata::{ClassId, MetadataRef, MethodId};
use crate::stubs::RuntimeStubId;

/// Width of an embedded constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantWidth {
    /// 32-bit (compressed reference)
    Narrow,
    /// Full pointer width
    Wide,
}

/// Safepoint poll flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollMode {
    /// Mid-method poll addressing the poll page pc-relatively
    Near,
    /// Mid-method poll loading the poll page address as a constant
    Far,
    ReturnNear,
    ReturnFar,
}

impl PollMode {
    pub fn is_near(self) -> bool {
        matches!(self, PollMode::Near | PollMode::ReturnNear)
    }

    pub fn is_return(self) -> bool {
        matches!(self, PollMode::ReturnNear | PollMode::ReturnFar)
    }
}

/// How a method call site dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Static,
    OptVirtual,
    Virtual,
    Interface,
}

impl CallKind {
    /// Bound to one target; governed by the direct-call patcher.
    pub fn is_direct(self) -> bool {
        matches!(self, CallKind::Static | CallKind::OptVirtual)
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallKind::Static => "static",
            CallKind::OptVirtual => "opt_virtual",
            CallKind::Virtual => "virtual",
            CallKind::Interface => "interface",
        };
        f.write_str(name)
    }
}

/// Destination of a foreign call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignTarget {
    Stub(RuntimeStubId),
    Address(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocationKind {
    /// An embedded heap reference, registered with the collector.
    HeapReference { value: u64, compressed: bool },
    /// An embedded reference to non-moving metadata.
    MetadataReference {
        reference: MetadataRef,
        compressed: bool,
    },
    /// A pc-relative load of an address inside the artifact's literal area.
    DataReference { data_offset: usize },
    ForeignCall { target: ForeignTarget },
    MethodCall { callee: MethodId, kind: CallKind },
    SafepointPoll { mode: PollMode },
}

/// One patch the installer performs, at an offset into the instruction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub offset: usize,
    pub kind: RelocationKind,
}

/// Everything the compiler hands over for one method.
#[derive(Debug, Clone)]
pub struct CompilationResult {
    pub name: String,
    pub method: MethodId,
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub data_alignment: usize,
    pub relocations: Vec<Relocation>,
    pub verified_entry: usize,
    pub frame_size: u32,
    pub oop_maps: OopMapSet,
    pub exception_handlers: Vec<ExceptionHandler>,
    pub dependencies: Vec<ClassId>,
}

impl CompilationResult {
    pub fn new(name: impl Into<String>, method: MethodId, code: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            method,
            code,
            data: Vec::new(),
            data_alignment: 8,
            relocations: Vec::new(),
            verified_entry: 0,
            frame_size: 0,
            oop_maps: OopMapSet::new(),
            exception_handlers: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: Vec<u8>, alignment: usize) -> Self {
        self.data = data;
        self.data_alignment = alignment;
        self
    }

    pub fn relocate(mut self, offset: usize, kind: RelocationKind) -> Self {
        self.relocations.push(Relocation { offset, kind });
        self
    }

    pub fn depends_on(mut self, class: ClassId) -> Self {
        self.dependencies.push(class);
        self
    }
}
