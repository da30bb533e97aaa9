//! Code buffer for building stubs, trampolines and adapters.
//!
//! Generated code is assembled here with buffer-relative offsets and copied
//! into the code cache once its final size is known.

use std::collections::HashMap;

/// Growable machine code with named labels.
pub struct CodeBuffer {
    code: Vec<u8>,
    /// label name -> offset
    labels: HashMap<String, usize>,
    /// (site offset, label, form), resolved by `patch_forward_refs`
    forward_refs: Vec<(usize, String, ReferenceSize)>,
}

/// Encoding of an unresolved label reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSize {
    /// 32-bit relative offset from the end of the field (x86_64)
    Rel32,
    /// imm19 conditional branch (AArch64 `b.cond`)
    AArch64Cond,
    /// B-type conditional branch (RISC-V `bne`/`beq`)
    RiscvBranch,
}

/// A forward reference whose label was never defined or is out of range.
#[derive(Debug, thiserror::Error)]
pub enum LabelError {
    #[error("undefined label: {0}")]
    Undefined(String),
    #[error("label {0} is out of range of its reference")]
    OutOfRange(String),
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            labels: HashMap::new(),
            forward_refs: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Offset the next emitted byte lands at.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Little-endian.
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Read back a little-endian 32-bit value.
    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.code[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    /// Overwrite a previously emitted 32-bit value.
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.code[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Bind `name` to the current offset.
    pub fn define_label(&mut self, name: &str) {
        self.labels.insert(name.to_string(), self.code.len());
    }

    pub fn get_label(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    /// Record a reference to `label` at `offset`.
    ///
    /// For `Rel32` the offset names the displacement field; for the branch
    /// forms it names the instruction whose immediate gets filled in.
    pub fn add_forward_ref(&mut self, offset: usize, label: &str, size: ReferenceSize) {
        self.forward_refs.push((offset, label.to_string(), size));
    }

    /// Resolve every recorded reference against the bound labels.
    pub fn patch_forward_refs(&mut self) -> Result<(), LabelError> {
        let refs = std::mem::take(&mut self.forward_refs);
        for (offset, label, size) in refs {
            let target = self
                .labels
                .get(&label)
                .copied()
                .ok_or_else(|| LabelError::Undefined(label.clone()))?;

            match size {
                ReferenceSize::Rel32 => {
                    // Relative to the end of the field
                    let rel = target as i64 - (offset as i64 + 4);
                    let rel = i32::try_from(rel).map_err(|_| LabelError::OutOfRange(label))?;
                    self.patch_u32(offset, rel as u32);
                }
                ReferenceSize::AArch64Cond => {
                    let rel = (target as i64 - offset as i64) / 4;
                    if !(-(1 << 18)..(1 << 18)).contains(&rel) {
                        return Err(LabelError::OutOfRange(label));
                    }
                    let inst = self.read_u32(offset);
                    let inst = (inst & !(0x7FFFF << 5)) | (((rel as u32) & 0x7FFFF) << 5);
                    self.patch_u32(offset, inst);
                }
                ReferenceSize::RiscvBranch => {
                    let rel = target as i64 - offset as i64;
                    if !(-(1 << 12)..(1 << 12)).contains(&rel) {
                        return Err(LabelError::OutOfRange(label));
                    }
                    let imm = rel as u32;
                    let inst = self.read_u32(offset) & 0x01FF_F07F;
                    let inst = inst
                        | ((imm >> 12) & 0x1) << 31
                        | ((imm >> 5) & 0x3F) << 25
                        | ((imm >> 1) & 0xF) << 8
                        | ((imm >> 11) & 0x1) << 7;
                    self.patch_u32(offset, inst);
                }
            }
        }
        Ok(())
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Unresolved references stay as emitted.
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }

    /// Align the code to the given boundary, padding with `filler`.
    ///
    /// `filler` is the architecture's no-op; the padding must be a whole
    /// number of fillers, so a 4-byte no-op only pads 4-aligned buffers.
    pub fn align_with(&mut self, alignment: usize, filler: &[u8]) {
        debug_assert!(alignment.is_power_of_two());
        while self.code.len() & (alignment - 1) != 0 {
            self.emit_bytes(filler);
        }
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}
