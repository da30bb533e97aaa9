//! Per-architecture back ends.
//!
//! A back end knows three things about its CPU: how to patch and decode the
//! instruction forms compiled code uses for constants, calls and polls
//! ([`Relocator`]); which registers carry arguments ([`CallingConvention`]);
//! and how to emit the handful of instruction sequences stubs and adapters
//! are built from ([`MacroAssembler`]). One back end is selected per runtime
//! and everything else talks to it through `&'static dyn Backend`.

pub mod aarch64;
pub mod riscv64;
pub mod x86_64;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::callsite::PatchSite;
use crate::code::codebuf::CodeBuffer;
use crate::error::InstallError;
use crate::reloc::{ConstantWidth, PollMode};
use crate::stubs::StubShape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    Aarch64,
    #[serde(rename = "riscv64")]
    Riscv64,
}

impl Arch {
    pub const ALL: [Arch; 3] = [Arch::X86_64, Arch::Aarch64, Arch::Riscv64];

    /// The architecture this process runs on, falling back to x86_64.
    pub fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else if cfg!(target_arch = "riscv64") {
            Arch::Riscv64
        } else {
            Arch::X86_64
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
            Arch::Riscv64 => "riscv64",
        }
    }
}

impl Default for Arch {
    fn default() -> Self {
        Arch::host()
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A machine register by hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VReg {
    Gp(u8),
    Fp(u8),
}

/// Where an argument lives under some calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgLocation {
    Reg(VReg),
    /// Outgoing stack slot, in 4-byte units from the stack pointer at the call
    Stack(u32),
    /// The upper half of a wide value
    Unused,
}

/// Argument registers of one calling convention, in assignment order.
#[derive(Debug, Clone, Copy)]
pub struct ArgRegisters {
    pub int: &'static [VReg],
    pub float: &'static [VReg],
}

/// An operand location for the adapter move primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    Reg(VReg),
    /// Byte offset from the stack pointer
    Sp(i32),
    /// Byte offset from the interpreter's expression stack pointer
    Interp(i32),
}

/// What is being moved, which selects the register file and width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    Word,
    Float,
    Double,
}

/// Shape of the instruction at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallForm {
    /// pc-relative call or jump
    Direct,
    /// Constant load of the target followed by a register call
    Indirect,
}

/// Offsets of a call trampoline within the buffer it was emitted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrampolineLayout {
    pub start: usize,
    /// 8-byte aligned word holding the destination
    pub data: usize,
}

/// Offsets of a to-interpreter stub within the buffer it was emitted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToInterpLayout {
    pub start: usize,
    /// Start of the instruction(s) materializing the method constant
    pub method_constant: usize,
    /// 8-byte aligned word holding the jump destination
    pub jump_word: usize,
}

/// Instruction patching and decoding for one architecture.
///
/// `code` is an artifact image, `offset` the instruction's offset in it and
/// `pc` the absolute address the instruction will live at.
pub trait Relocator {
    fn arch(&self) -> Arch;

    fn patch_constant(
        &self,
        code: &mut [u8],
        offset: usize,
        value: u64,
        width: ConstantWidth,
    ) -> Result<(), InstallError>;

    fn read_constant(&self, code: &[u8], offset: usize, width: ConstantWidth) -> Result<u64, InstallError>;

    fn patch_data_reference(
        &self,
        code: &mut [u8],
        offset: usize,
        pc: u64,
        target: u64,
    ) -> Result<(), InstallError>;

    fn data_reference_target(&self, code: &[u8], offset: usize, pc: u64) -> Result<u64, InstallError>;

    fn call_form(&self, code: &[u8], offset: usize) -> Result<CallForm, InstallError>;

    /// Bind the call at `offset` to `target`, whatever its form.
    fn patch_call(&self, code: &mut [u8], offset: usize, pc: u64, target: u64) -> Result<(), InstallError>;

    fn call_target(&self, code: &[u8], offset: usize, pc: u64) -> Result<u64, InstallError>;

    /// The field holding the destination of a call of `form` at `offset`,
    /// when the call is not routed through a trampoline.
    fn call_patch_site(&self, form: CallForm, offset: usize) -> PatchSite;

    fn patch_poll(
        &self,
        code: &mut [u8],
        offset: usize,
        pc: u64,
        poll_page: u64,
        mode: PollMode,
    ) -> Result<(), InstallError>;

    fn poll_target(&self, code: &[u8], offset: usize, pc: u64, mode: PollMode) -> Result<u64, InstallError>;
}

/// Argument registers of the managed and native conventions.
pub trait CallingConvention {
    fn java_registers(&self) -> ArgRegisters;

    fn c_registers(&self) -> ArgRegisters;

    /// Native floats fall back to integer registers once the FP ones run out.
    fn c_floats_use_int_registers(&self) -> bool {
        false
    }
}

/// The instruction sequences stubs and adapters are assembled from.
pub trait MacroAssembler {
    /// One no-op instruction.
    fn nop(&self) -> &'static [u8];

    /// Whether patchable calls go through a per-call trampoline.
    fn uses_call_trampolines(&self) -> bool;

    fn emit_call_trampoline(&self, buf: &mut CodeBuffer) -> TrampolineLayout;

    /// Load `method` into the method register and jump through a patchable word.
    fn emit_to_interp_stub(&self, buf: &mut CodeBuffer, method: u64) -> ToInterpLayout;

    fn emit_runtime_stub(&self, buf: &mut CodeBuffer, shape: StubShape, service: u64);

    fn emit_move(&self, buf: &mut CodeBuffer, from: Loc, to: Loc, kind: MoveKind);

    fn emit_load_constant(&self, buf: &mut CodeBuffer, reg: VReg, value: u64);

    /// `sp += delta`
    fn emit_adjust_sp(&self, buf: &mut CodeBuffer, delta: i32);

    fn emit_jump_absolute(&self, buf: &mut CodeBuffer, target: u64);

    fn emit_call_absolute(&self, buf: &mut CodeBuffer, target: u64);

    /// Jump to the compiled entry stored in the method held by the method register.
    fn emit_jump_via_method(&self, buf: &mut CodeBuffer, entry_offset: i32);

    /// Compare the receiver's class word against the inline cache data
    /// register and jump to `miss` when they differ.
    fn emit_receiver_check(&self, buf: &mut CodeBuffer, miss: u64);

    fn emit_frame_enter(&self, buf: &mut CodeBuffer, frame_bytes: u32);

    fn emit_frame_leave_and_return(&self, buf: &mut CodeBuffer);

    fn method_register(&self) -> VReg;

    /// A call with a placeholder target, laid out so the installer can bind
    /// it. Returns the offset of the call instruction.
    fn emit_patchable_call(&self, buf: &mut CodeBuffer) -> usize;

    /// Load `value` into `reg` using the fixed-length form that constant
    /// relocations expect. Returns the offset of the sequence.
    fn emit_patchable_constant(&self, buf: &mut CodeBuffer, reg: VReg, value: u64) -> usize;

    fn emit_return(&self, buf: &mut CodeBuffer);

    /// Bytes the call instruction pushes between the caller's outgoing
    /// arguments and the callee's stack pointer.
    fn return_address_size(&self) -> i32 {
        0
    }
}

pub trait Backend: Relocator + CallingConvention + MacroAssembler + Send + Sync {}

impl<T: Relocator + CallingConvention + MacroAssembler + Send + Sync> Backend for T {}

static X86_64: x86_64::X86_64Backend = x86_64::X86_64Backend;
static AARCH64: aarch64::AArch64Backend = aarch64::AArch64Backend;
static RISCV64: riscv64::Riscv64Backend = riscv64::Riscv64Backend;

pub fn backend_for(arch: Arch) -> &'static dyn Backend {
    match arch {
        Arch::X86_64 => &X86_64,
        Arch::Aarch64 => &AARCH64,
        Arch::Riscv64 => &RISCV64,
    }
}

pub(crate) fn read_u32(code: &[u8], offset: usize) -> Result<u32, InstallError> {
    let bytes = code
        .get(offset..offset + 4)
        .ok_or(InstallError::OffsetOutOfBounds {
            offset,
            len: code.len(),
        })?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn write_u32(code: &mut [u8], offset: usize, value: u32) -> Result<(), InstallError> {
    let len = code.len();
    code.get_mut(offset..offset + 4)
        .ok_or(InstallError::OffsetOutOfBounds { offset, len })?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub(crate) fn read_u64(code: &[u8], offset: usize) -> Result<u64, InstallError> {
    let lo = read_u32(code, offset)? as u64;
    let hi = read_u32(code, offset + 4)? as u64;
    Ok(lo | (hi << 32))
}

pub(crate) fn write_u64(code: &mut [u8], offset: usize, value: u64) -> Result<(), InstallError> {
    write_u32(code, offset, value as u32)?;
    write_u32(code, offset + 4, (value >> 32) as u32)
}

pub(crate) fn byte_at(code: &[u8], offset: usize) -> Result<u8, InstallError> {
    code.get(offset).copied().ok_or(InstallError::OffsetOutOfBounds {
        offset,
        len: code.len(),
    })
}

/// Sign-extend the low `bits` bits of `value`.
pub(crate) fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}
