//! Stitch - code installation and call-site linking for a JIT
//!
//! This library takes machine code produced by a compiler, copies it into an
//! executable code cache, patches every relocation for the target
//! architecture, and links the calls it makes: inline caches for virtual and
//! interface calls, direct calls with to-interpreter stubs, the shared
//! runtime stubs, and the adapters that convert between the interpreted and
//! compiled calling conventions.
//!
//! [`LinkRuntime`] ties the pieces together.

pub mod adapters;
pub mod arch;
pub mod callsite;
pub mod code;
pub mod config;
pub mod direct_call;
pub mod error;
pub mod gc;
pub mod guard;
pub mod ic;
pub mod installer;
pub mod metadata;
pub mod reloc;
pub mod runtime;
pub mod signature;
pub mod stubs;

// Re-export commonly used types
pub use arch::{Arch, Backend, backend_for};
pub use code::{ArtifactId, CodeCache, CompiledArtifact};
pub use config::{CompressedEncoding, LinkerConfig};
pub use error::{ConfigError, InitError, InstallError, LinkError};
pub use installer::Installer;
pub use metadata::{ClassId, MetadataRegistry, MethodFlags, MethodId};
pub use reloc::{CallKind, CompilationResult, RelocationKind};
pub use runtime::{CodeOwner, Dispatch, DispatchPath, LinkRuntime, SiteState};
pub use signature::Signature;
