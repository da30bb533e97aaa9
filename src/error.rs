//! Error types for code installation and call-site linking.
//!
//! Installation errors are contract violations between the compiler back end
//! and the installer: the artifact is discarded and never published. Link
//! errors surface from the resolution slow paths and belong to the caller.

use std::path::PathBuf;

use crate::arch::Arch;
use crate::metadata::{ClassId, MetadataRef, MethodId};
use crate::reloc::PollMode;

/// Errors raised by the mmap-backed code memory.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory allocation failed")]
    AllocationFailed,
    #[error("memory protection change failed")]
    ProtectionFailed,
    #[error("invalid memory size")]
    InvalidSize,
    #[error("access of {len} bytes at offset {offset:#x} is outside the mapping")]
    OutOfBounds { offset: usize, len: usize },
}

/// Errors raised by the code cache allocator.
#[derive(Debug, thiserror::Error)]
pub enum CodeCacheError {
    #[error("code cache full: requested {requested} bytes, {free} bytes free")]
    Full { requested: usize, free: usize },
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Installation-fatal errors.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("{arch}: expected {expected} at offset {offset:#x}, found {found:#010x}")]
    EncodingMismatch {
        arch: Arch,
        offset: usize,
        expected: &'static str,
        found: u32,
    },
    #[error("{arch} does not support {mode:?} safepoint polls")]
    UnsupportedPollMode { arch: Arch, mode: PollMode },
    #[error("target {target:#x} is out of range for the {form} at offset {offset:#x}")]
    OutOfRange {
        offset: usize,
        target: u64,
        form: &'static str,
    },
    #[error("value {value:#x} does not fit the {form} at offset {offset:#x}")]
    ValueTooWide {
        offset: usize,
        value: u64,
        form: &'static str,
    },
    #[error("call site at offset {offset:#x} is not aligned for atomic patching")]
    MisalignedCallSite { offset: usize },
    #[error("method call site at offset {offset:#x} cannot be patched atomically")]
    UnpatchableCallSite { offset: usize },
    #[error("relocation at offset {offset:#x} lies outside the {len}-byte instruction stream")]
    OffsetOutOfBounds { offset: usize, len: usize },
    #[error("data reference to offset {data_offset:#x} lies outside the {len}-byte literal area")]
    DataOffsetOutOfBounds { data_offset: usize, len: usize },
    #[error("entry point {offset:#x} lies outside the {len}-byte instruction stream")]
    BadEntryPoint { offset: usize, len: usize },
    #[error("metadata reference {0:?} could not be resolved")]
    UnresolvedMetadata(MetadataRef),
    #[error("reference {value:#x} cannot be compressed with the configured encoding")]
    Uncompressible { value: u64 },
    #[error("compressed reference at offset {offset:#x} requested but no encoding is configured")]
    NoCompressedEncoding { offset: usize },
    #[error("patched instruction at offset {offset:#x} decodes to {found:#x}, expected {expected:#x}")]
    VerificationFailed {
        offset: usize,
        expected: u64,
        found: u64,
    },
    #[error(transparent)]
    CodeCache(#[from] CodeCacheError),
}

/// Errors raised when rewriting an installed call site.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("call site at {address:#x} cannot be patched after installation")]
    NotPatchable { address: u64 },
    #[error("destination {target:#x} is out of range for the call site at {address:#x}")]
    OutOfRange { address: u64, target: u64 },
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Errors raised by the adapter library.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("signature {fingerprint} cannot be called: {reason}")]
    Unrepresentable { fingerprint: String, reason: String },
    #[error("native method {0:?} has no bound implementation")]
    UnboundNative(MethodId),
    #[error(transparent)]
    CodeCache(#[from] CodeCacheError),
}

/// Errors raised while generating the runtime stub table.
#[derive(Debug, thiserror::Error)]
pub enum StubError {
    #[error("no service implementation registered for runtime stub {0}")]
    MissingService(&'static str),
    #[error("failed to generate runtime stub {name}")]
    Generation {
        name: &'static str,
        #[source]
        source: CodeCacheError,
    },
}

/// Errors raised by the resolution and dispatch slow paths.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("no such method {0:?}")]
    NoSuchMethod(MethodId),
    #[error("no such class {0:?}")]
    NoSuchClass(ClassId),
    #[error("class {0:?} has been unloaded")]
    ClassUnloaded(ClassId),
    #[error("virtual call with a null receiver")]
    NullReceiver,
    #[error("class {class:?} does not implement {method:?}")]
    IncompatibleClassChange { class: ClassId, method: MethodId },
    #[error("class {class:?} has no concrete implementation of {method:?}")]
    AbstractMethod { class: ClassId, method: MethodId },
    #[error("artifact has no call site {0}")]
    NoSuchCallSite(usize),
    #[error("call site {0} is a runtime call and cannot be dispatched")]
    NotAMethodCall(usize),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// Errors raised while parsing a method descriptor.
#[derive(Debug, thiserror::Error)]
#[error("malformed descriptor {descriptor:?} at position {position}")]
pub struct SignatureError {
    pub descriptor: String,
    pub position: usize,
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised while bringing up a [`crate::runtime::LinkRuntime`].
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    CodeCache(#[from] CodeCacheError),
    #[error(transparent)]
    Stubs(#[from] StubError),
}
