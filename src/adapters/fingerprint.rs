//! Calling-convention fingerprints.
//!
//! Two methods share an adapter when their argument slots normalize to the
//! same sequence: every sub-word integer is passed like an `int`, arrays like
//! objects. Slot types are packed four bits apiece, eight to a word.

use std::fmt;

use crate::signature::{BasicType, Signature};

const BITS_PER_TYPE: usize = 4;
const TYPES_PER_WORD: usize = 32 / BITS_PER_TYPE;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    words: Vec<u32>,
    len: usize,
}

/// The type an argument slot is passed as.
pub fn adapter_encoding(ty: BasicType) -> BasicType {
    match ty {
        BasicType::Boolean | BasicType::Byte | BasicType::Char | BasicType::Short | BasicType::Int => {
            BasicType::Int
        }
        BasicType::Object | BasicType::Array => BasicType::Object,
        other => other,
    }
}

impl Fingerprint {
    pub fn from_slot_types(types: &[BasicType]) -> Self {
        let mut words = vec![0u32; types.len().div_ceil(TYPES_PER_WORD)];
        for (i, &ty) in types.iter().enumerate() {
            let code = adapter_encoding(ty).code() as u32;
            words[i / TYPES_PER_WORD] |= code << ((i % TYPES_PER_WORD) * BITS_PER_TYPE);
        }
        Self {
            words,
            len: types.len(),
        }
    }

    /// Fingerprint of a method's incoming arguments, receiver included.
    pub fn for_signature(signature: &Signature, is_static: bool) -> Self {
        Self::from_slot_types(&signature.to_slot_types(!is_static))
    }

    /// The normalized slot types.
    pub fn slot_types(&self) -> Vec<BasicType> {
        (0..self.len)
            .filter_map(|i| {
                let code = self.words[i / TYPES_PER_WORD] >> ((i % TYPES_PER_WORD) * BITS_PER_TYPE);
                BasicType::from_code((code & 0xF) as u8)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for ty in self.slot_types() {
            let c = if ty == BasicType::Void { '_' } else { ty.descriptor_char() };
            write!(f, "{c}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint{self}")
    }
}
