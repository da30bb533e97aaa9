//! The collector's view of installed code.
//!
//! Every heap reference embedded in an instruction is registered here at
//! install time so that a moving collection can find and re-patch it. The
//! code cache range is registered once so the collector never scans it as
//! heap data.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::code::artifact::ArtifactId;

/// Registration calls made by the installer.
pub trait GcHooks: Send + Sync {
    fn register_code_reference(&self, artifact: ArtifactId, address: u64, value: u64, narrow: bool);

    fn register_code_region(&self, range: Range<u64>);
}

/// One heap reference embedded in installed code.
#[derive(Debug)]
pub struct CodeReference {
    pub artifact: ArtifactId,
    /// Address of the instruction materializing the reference
    pub address: u64,
    pub narrow: bool,
    value: AtomicU64,
}

impl CodeReference {
    /// The uncompressed reference currently patched into the instruction.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    pub(crate) fn set_value(&self, value: u64) {
        self.value.store(value, Ordering::Release);
    }
}

/// The registration table the runtime keeps.
#[derive(Debug, Default)]
pub struct HeapRefTable {
    references: Mutex<Vec<Arc<CodeReference>>>,
    regions: Mutex<Vec<Range<u64>>>,
}

impl HeapRefTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every registered reference.
    pub fn references(&self) -> Vec<Arc<CodeReference>> {
        self.references.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn references_of(&self, artifact: ArtifactId) -> Vec<Arc<CodeReference>> {
        self.references()
            .into_iter()
            .filter(|r| r.artifact == artifact)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.references.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `addr` lies in a registered code region.
    pub fn is_code(&self, addr: u64) -> bool {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|r| r.contains(&addr))
    }
}

impl GcHooks for HeapRefTable {
    fn register_code_reference(&self, artifact: ArtifactId, address: u64, value: u64, narrow: bool) {
        self.references
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(CodeReference {
                artifact,
                address,
                narrow,
                value: AtomicU64::new(value),
            }));
    }

    fn register_code_region(&self, range: Range<u64>) {
        self.regions.lock().unwrap_or_else(PoisonError::into_inner).push(range);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration() {
        let table = HeapRefTable::new();
        table.register_code_region(0x1000..0x2000);
        table.register_code_reference(ArtifactId(1), 0x1010, 0xABCD, false);
        table.register_code_reference(ArtifactId(2), 0x1810, 0x40, true);

        assert!(table.is_code(0x1FFF));
        assert!(!table.is_code(0x2000));
        assert_eq!(table.len(), 2);
        let refs = table.references_of(ArtifactId(2));
        assert_eq!(refs.len(), 1);
        assert!(refs[0].narrow);
        refs[0].set_value(0x80);
        assert_eq!(table.references_of(ArtifactId(2))[0].value(), 0x80);
    }
}
