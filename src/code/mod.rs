//! Code memory, the code cache and what lives in it.

pub mod artifact;
pub mod cache;
pub mod codebuf;
pub mod memory;
pub mod oopmap;

pub use artifact::{ArtifactId, ArtifactState, CompiledArtifact};
pub use cache::{BlobKind, CodeBlob, CodeCache};
pub use codebuf::CodeBuffer;
