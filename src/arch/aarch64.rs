//! AArch64 back end.
//!
//! Patchable calls are `bl` instructions bound once to a per-call trampoline
//! in the artifact's stub section: `ldr x16, #8; br x16; .quad dest`. The
//! aligned data word is the only thing rewritten after installation. Wide
//! constants are `movz`/`movk` sequences; polls are far-only.

use super::{
    ArgRegisters, Arch, CallForm, CallingConvention, Loc, MacroAssembler, MoveKind, Relocator,
    ToInterpLayout, TrampolineLayout, VReg, read_u32, sign_extend, write_u32,
};
use crate::callsite::PatchSite;
use crate::code::codebuf::{CodeBuffer, ReferenceSize};
use crate::error::InstallError;
use crate::reloc::{ConstantWidth, PollMode};
use crate::stubs::StubShape;

/// AArch64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0, X1 = 1, X2 = 2, X3 = 3,
    X4 = 4, X5 = 5, X6 = 6, X7 = 7,
    X8 = 8, X9 = 9, X10 = 10, X11 = 11,
    X12 = 12, X13 = 13, X14 = 14, X15 = 15,
    X16 = 16, X17 = 17, X18 = 18, X19 = 19,
    X20 = 20, X21 = 21, X22 = 22, X23 = 23,
    X24 = 24, X25 = 25, X26 = 26, X27 = 27,
    X28 = 28,
    Fp = 29,  // Frame pointer
    Lr = 30,  // Link register
    Sp = 31,  // Stack pointer / zero register depending on the instruction
}

impl Reg {
    /// Alias for SP when used as zero register
    pub const XZR: Reg = Reg::Sp;

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Method register loaded by to-interpreter stubs and read by adapters.
pub const METHOD_REG: u8 = 12;
/// Inline cache data register checked by unverified entries.
pub const IC_DATA_REG: u8 = 9;
/// Interpreter expression stack pointer.
pub const INTERP_ESP: u8 = 20;
/// Offset of the class word in an object header.
pub const CLASS_WORD_OFFSET: u32 = 8;

const IP0: u8 = 16;
const IP1: u8 = 17;
const NOP: u32 = 0xD503_201F;

const MOVZ_X: u32 = 0xD280_0000;
const MOVK_X: u32 = 0xF280_0000;
const MOVZ_W: u32 = 0x5280_0000;
const MOVK_W: u32 = 0x7280_0000;
const MOVE_WIDE_MASK: u32 = 0xFF80_0000;

const JAVA_INT_ARGS: [VReg; 8] = [
    VReg::Gp(1),
    VReg::Gp(2),
    VReg::Gp(3),
    VReg::Gp(4),
    VReg::Gp(5),
    VReg::Gp(6),
    VReg::Gp(7),
    VReg::Gp(0),
];
const C_INT_ARGS: [VReg; 8] = [
    VReg::Gp(0),
    VReg::Gp(1),
    VReg::Gp(2),
    VReg::Gp(3),
    VReg::Gp(4),
    VReg::Gp(5),
    VReg::Gp(6),
    VReg::Gp(7),
];
const FLOAT_ARGS: [VReg; 8] = [
    VReg::Fp(0),
    VReg::Fp(1),
    VReg::Fp(2),
    VReg::Fp(3),
    VReg::Fp(4),
    VReg::Fp(5),
    VReg::Fp(6),
    VReg::Fp(7),
];

/// AArch64 assembler.
pub struct AArch64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> AArch64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// Emit a raw 32-bit instruction.
    pub fn emit_raw(&mut self, inst: u32) {
        self.buf.emit_u32(inst);
    }

    /// ADD Xd|SP, Xn|SP, #imm12
    pub fn add_imm(&mut self, rd: u8, rn: u8, imm12: u32) {
        self.emit_raw(0x9100_0000 | ((imm12 & 0xFFF) << 10) | ((rn as u32) << 5) | rd as u32);
    }

    /// SUB Xd|SP, Xn|SP, #imm12
    pub fn sub_imm(&mut self, rd: u8, rn: u8, imm12: u32) {
        self.emit_raw(0xD100_0000 | ((imm12 & 0xFFF) << 10) | ((rn as u32) << 5) | rd as u32);
    }

    /// MOV Xd, Xm (ORR Xd, XZR, Xm)
    pub fn mov(&mut self, rd: u8, rm: u8) {
        self.emit_raw(0xAA00_03E0 | ((rm as u32) << 16) | rd as u32);
    }

    /// MOVZ Xd, #imm16, LSL #(16 * hw)
    pub fn movz(&mut self, rd: u8, imm16: u16, hw: u32) {
        self.emit_raw(MOVZ_X | (hw << 21) | ((imm16 as u32) << 5) | rd as u32);
    }

    /// MOVK Xd, #imm16, LSL #(16 * hw)
    pub fn movk(&mut self, rd: u8, imm16: u16, hw: u32) {
        self.emit_raw(MOVK_X | (hw << 21) | ((imm16 as u32) << 5) | rd as u32);
    }

    /// Shortest movz/movk sequence for `value`.
    pub fn mov64(&mut self, rd: u8, value: u64) {
        self.movz(rd, value as u16, 0);
        for hw in 1..4 {
            let part = (value >> (16 * hw)) as u16;
            if part != 0 {
                self.movk(rd, part, hw);
            }
        }
    }

    /// CMP Xn, Xm
    pub fn cmp(&mut self, rn: u8, rm: u8) {
        self.emit_raw(0xEB00_001F | ((rm as u32) << 16) | ((rn as u32) << 5));
    }

    /// LDR Xt, [Xn|SP, #imm] (unsigned, scaled by 8)
    pub fn ldr(&mut self, rt: u8, rn: u8, imm: u32) {
        self.emit_raw(0xF940_0000 | (((imm / 8) & 0xFFF) << 10) | ((rn as u32) << 5) | rt as u32);
    }

    /// STR Xt, [Xn|SP, #imm] (unsigned, scaled by 8)
    pub fn str(&mut self, rt: u8, rn: u8, imm: u32) {
        self.emit_raw(0xF900_0000 | (((imm / 8) & 0xFFF) << 10) | ((rn as u32) << 5) | rt as u32);
    }

    /// LDR Dt/St, [Xn|SP, #imm]
    pub fn ldr_fp(&mut self, rt: u8, rn: u8, imm: u32, double: bool) {
        let (base, scale) = if double { (0xFD40_0000, 8) } else { (0xBD40_0000, 4) };
        self.emit_raw(base | (((imm / scale) & 0xFFF) << 10) | ((rn as u32) << 5) | rt as u32);
    }

    /// STR Dt/St, [Xn|SP, #imm]
    pub fn str_fp(&mut self, rt: u8, rn: u8, imm: u32, double: bool) {
        let (base, scale) = if double { (0xFD00_0000, 8) } else { (0xBD00_0000, 4) };
        self.emit_raw(base | (((imm / scale) & 0xFFF) << 10) | ((rn as u32) << 5) | rt as u32);
    }

    /// FMOV between FP registers, or between an FP and a general register.
    pub fn fmov(&mut self, to: VReg, from: VReg, double: bool) {
        let inst = match (to, from, double) {
            (VReg::Fp(d), VReg::Fp(n), true) => 0x1E60_4000 | ((n as u32) << 5) | d as u32,
            (VReg::Fp(d), VReg::Fp(n), false) => 0x1E20_4000 | ((n as u32) << 5) | d as u32,
            (VReg::Fp(d), VReg::Gp(n), true) => 0x9E67_0000 | ((n as u32) << 5) | d as u32,
            (VReg::Fp(d), VReg::Gp(n), false) => 0x1E27_0000 | ((n as u32) << 5) | d as u32,
            (VReg::Gp(d), VReg::Fp(n), true) => 0x9E66_0000 | ((n as u32) << 5) | d as u32,
            (VReg::Gp(d), VReg::Fp(n), false) => 0x1E26_0000 | ((n as u32) << 5) | d as u32,
            (VReg::Gp(d), VReg::Gp(n), _) => 0xAA00_03E0 | ((n as u32) << 16) | d as u32,
        };
        self.emit_raw(inst);
    }

    /// LDR Xt, literal
    pub fn ldr_literal(&mut self, rt: u8, offset: i32) {
        self.emit_raw(0x5800_0000 | ((((offset / 4) as u32) & 0x7FFFF) << 5) | rt as u32);
    }

    /// B.EQ to a label of the buffer.
    pub fn b_eq_label(&mut self, label: &str) {
        let at = self.buf.offset();
        self.emit_raw(0x5400_0000);
        self.buf.add_forward_ref(at, label, ReferenceSize::AArch64Cond);
    }

    /// BR Xn
    pub fn br(&mut self, rn: u8) {
        self.emit_raw(0xD61F_0000 | ((rn as u32) << 5));
    }

    /// BLR Xn
    pub fn blr(&mut self, rn: u8) {
        self.emit_raw(0xD63F_0000 | ((rn as u32) << 5));
    }

    /// RET
    pub fn ret(&mut self) {
        self.emit_raw(0xD65F_03C0);
    }

    /// STP X29, X30, [SP, #-16]!
    pub fn push_frame_record(&mut self) {
        self.emit_raw(0xA9BF_7BFD);
    }

    /// LDP X29, X30, [SP], #16
    pub fn pop_frame_record(&mut self) {
        self.emit_raw(0xA8C1_7BFD);
    }

    pub fn nop(&mut self) {
        self.emit_raw(NOP);
    }
}

fn mismatch(offset: usize, expected: &'static str, found: u32) -> InstallError {
    InstallError::EncodingMismatch {
        arch: Arch::Aarch64,
        offset,
        expected,
        found,
    }
}

fn is_move_wide(inst: u32, base: u32, hw: u32) -> bool {
    inst & MOVE_WIDE_MASK == base && (inst >> 21) & 0x3 == hw
}

fn set_imm16(inst: u32, imm16: u16) -> u32 {
    (inst & !(0xFFFF << 5)) | ((imm16 as u32) << 5)
}

fn imm16(inst: u32) -> u64 {
    ((inst >> 5) & 0xFFFF) as u64
}

/// Number of instructions in the movz/movk constant sequence at `offset`.
fn movptr_len(code: &[u8], offset: usize) -> Result<usize, InstallError> {
    let i0 = read_u32(code, offset)?;
    if !is_move_wide(i0, MOVZ_X, 0) {
        return Err(mismatch(offset, "movz/movk constant", i0));
    }
    for hw in 1..3 {
        let inst = read_u32(code, offset + 4 * hw as usize)?;
        if !is_move_wide(inst, MOVK_X, hw) {
            return Err(mismatch(offset, "movz/movk constant", inst));
        }
    }
    match read_u32(code, offset + 12) {
        Ok(inst) if is_move_wide(inst, MOVK_X, 3) => Ok(4),
        _ => Ok(3),
    }
}

fn is_register_branch(inst: u32) -> bool {
    matches!(inst & 0xFFFF_FC1F, 0xD63F_0000 | 0xD61F_0000)
}

/// Literal-load forms a data reference may use.
enum DataForm {
    LdrLiteral,
    Adr,
    /// `adrp` followed by `add` (`scale` 1) or `ldr` unsigned offset (`scale` 8)
    AdrpPair { scale: u64 },
}

fn data_form(code: &[u8], offset: usize) -> Result<DataForm, InstallError> {
    let inst = read_u32(code, offset)?;
    if matches!(inst & 0xFF00_0000, 0x1800_0000 | 0x5800_0000 | 0x1C00_0000 | 0x5C00_0000 | 0x9C00_0000) {
        return Ok(DataForm::LdrLiteral);
    }
    match inst & 0x9F00_0000 {
        0x1000_0000 => Ok(DataForm::Adr),
        0x9000_0000 => {
            let next = read_u32(code, offset + 4)?;
            match next & 0xFFC0_0000 {
                0x9100_0000 => Ok(DataForm::AdrpPair { scale: 1 }),
                0xF940_0000 => Ok(DataForm::AdrpPair { scale: 8 }),
                _ => Err(mismatch(offset + 4, "add/ldr after adrp", next)),
            }
        }
        _ => Err(mismatch(offset, "pc-relative literal load", inst)),
    }
}

fn encode_adr_imm(inst: u32, imm21: i64) -> u32 {
    let imm = imm21 as u32;
    (inst & 0x9F00_001F) | ((imm & 0x3) << 29) | (((imm >> 2) & 0x7FFFF) << 5)
}

fn decode_adr_imm(inst: u32) -> i64 {
    let imm = (((inst >> 5) & 0x7FFFF) << 2) | ((inst >> 29) & 0x3);
    sign_extend(imm as u64, 21)
}

pub struct AArch64Backend;

impl AArch64Backend {
    fn patch_branch(&self, code: &mut [u8], offset: usize, pc: u64, target: u64) -> Result<(), InstallError> {
        let inst = read_u32(code, offset)?;
        let delta = target.wrapping_sub(pc) as i64;
        if delta % 4 != 0 || !(-(1 << 27)..(1 << 27)).contains(&delta) {
            return Err(InstallError::OutOfRange {
                offset,
                target,
                form: "b/bl imm26",
            });
        }
        write_u32(code, offset, (inst & 0xFC00_0000) | (((delta >> 2) as u32) & 0x03FF_FFFF))
    }
}

impl Relocator for AArch64Backend {
    fn arch(&self) -> Arch {
        Arch::Aarch64
    }

    fn patch_constant(
        &self,
        code: &mut [u8],
        offset: usize,
        value: u64,
        width: ConstantWidth,
    ) -> Result<(), InstallError> {
        match width {
            ConstantWidth::Wide => {
                let len = movptr_len(code, offset)?;
                if len == 3 && value >> 48 != 0 {
                    return Err(InstallError::ValueTooWide {
                        offset,
                        value,
                        form: "movz/movk 48-bit constant",
                    });
                }
                for i in 0..len {
                    let at = offset + 4 * i;
                    let inst = read_u32(code, at)?;
                    write_u32(code, at, set_imm16(inst, (value >> (16 * i)) as u16))?;
                }
                Ok(())
            }
            ConstantWidth::Narrow => {
                let hi = read_u32(code, offset)?;
                let lo = read_u32(code, offset + 4)?;
                if !is_move_wide(hi, MOVZ_W, 1) || !is_move_wide(lo, MOVK_W, 0) {
                    return Err(mismatch(offset, "movz w, lsl 16; movk w", hi));
                }
                let narrow = u32::try_from(value).map_err(|_| InstallError::ValueTooWide {
                    offset,
                    value,
                    form: "movz/movk 32-bit constant",
                })?;
                write_u32(code, offset, set_imm16(hi, (narrow >> 16) as u16))?;
                write_u32(code, offset + 4, set_imm16(lo, narrow as u16))
            }
        }
    }

    fn read_constant(&self, code: &[u8], offset: usize, width: ConstantWidth) -> Result<u64, InstallError> {
        match width {
            ConstantWidth::Wide => {
                let len = movptr_len(code, offset)?;
                let mut value = 0;
                for i in 0..len {
                    value |= imm16(read_u32(code, offset + 4 * i)?) << (16 * i);
                }
                Ok(value)
            }
            ConstantWidth::Narrow => {
                let hi = read_u32(code, offset)?;
                let lo = read_u32(code, offset + 4)?;
                if !is_move_wide(hi, MOVZ_W, 1) || !is_move_wide(lo, MOVK_W, 0) {
                    return Err(mismatch(offset, "movz w, lsl 16; movk w", hi));
                }
                Ok((imm16(hi) << 16) | imm16(lo))
            }
        }
    }

    fn patch_data_reference(
        &self,
        code: &mut [u8],
        offset: usize,
        pc: u64,
        target: u64,
    ) -> Result<(), InstallError> {
        let out_of_range = |form| InstallError::OutOfRange {
            offset,
            target,
            form,
        };
        let inst = read_u32(code, offset)?;
        let delta = target.wrapping_sub(pc) as i64;
        match data_form(code, offset)? {
            DataForm::LdrLiteral => {
                if delta % 4 != 0 || !(-(1 << 20)..(1 << 20)).contains(&delta) {
                    return Err(out_of_range("ldr literal"));
                }
                let imm19 = ((delta >> 2) as u32) & 0x7FFFF;
                write_u32(code, offset, (inst & !(0x7FFFF << 5)) | (imm19 << 5))
            }
            DataForm::Adr => {
                if !(-(1 << 20)..(1 << 20)).contains(&delta) {
                    return Err(out_of_range("adr"));
                }
                write_u32(code, offset, encode_adr_imm(inst, delta))
            }
            DataForm::AdrpPair { scale } => {
                let pages = (target >> 12) as i64 - (pc >> 12) as i64;
                if !(-(1 << 20)..(1 << 20)).contains(&pages) {
                    return Err(out_of_range("adrp"));
                }
                let low = target & 0xFFF;
                if low % scale != 0 {
                    return Err(out_of_range("adrp + ldr"));
                }
                write_u32(code, offset, encode_adr_imm(inst, pages))?;
                let next = read_u32(code, offset + 4)?;
                let imm12 = ((low / scale) as u32) << 10;
                write_u32(code, offset + 4, (next & !(0xFFF << 10)) | imm12)
            }
        }
    }

    fn data_reference_target(&self, code: &[u8], offset: usize, pc: u64) -> Result<u64, InstallError> {
        let inst = read_u32(code, offset)?;
        match data_form(code, offset)? {
            DataForm::LdrLiteral => {
                let imm19 = sign_extend(((inst >> 5) & 0x7FFFF) as u64, 19);
                Ok(pc.wrapping_add((imm19 << 2) as u64))
            }
            DataForm::Adr => Ok(pc.wrapping_add(decode_adr_imm(inst) as u64)),
            DataForm::AdrpPair { scale } => {
                let page = ((pc >> 12) as i64 + decode_adr_imm(inst)) as u64;
                let next = read_u32(code, offset + 4)?;
                let low = ((next >> 10) & 0xFFF) as u64 * scale;
                Ok((page << 12) + low)
            }
        }
    }

    fn call_form(&self, code: &[u8], offset: usize) -> Result<CallForm, InstallError> {
        let inst = read_u32(code, offset)?;
        match inst & 0xFC00_0000 {
            0x9400_0000 | 0x1400_0000 => return Ok(CallForm::Direct),
            _ => {}
        }
        if let Ok(len) = movptr_len(code, offset) {
            if read_u32(code, offset + 4 * len).is_ok_and(is_register_branch) {
                return Ok(CallForm::Indirect);
            }
        }
        Err(mismatch(offset, "bl, b or movz/movk + blr", inst))
    }

    fn patch_call(&self, code: &mut [u8], offset: usize, pc: u64, target: u64) -> Result<(), InstallError> {
        match self.call_form(code, offset)? {
            CallForm::Direct => self.patch_branch(code, offset, pc, target),
            CallForm::Indirect => self.patch_constant(code, offset, target, ConstantWidth::Wide),
        }
    }

    fn call_target(&self, code: &[u8], offset: usize, pc: u64) -> Result<u64, InstallError> {
        match self.call_form(code, offset)? {
            CallForm::Direct => {
                let imm26 = sign_extend((read_u32(code, offset)? & 0x03FF_FFFF) as u64, 26);
                Ok(pc.wrapping_add((imm26 << 2) as u64))
            }
            CallForm::Indirect => self.read_constant(code, offset, ConstantWidth::Wide),
        }
    }

    fn call_patch_site(&self, _form: CallForm, _offset: usize) -> PatchSite {
        PatchSite::Fixed
    }

    fn patch_poll(
        &self,
        code: &mut [u8],
        offset: usize,
        _pc: u64,
        poll_page: u64,
        mode: PollMode,
    ) -> Result<(), InstallError> {
        if mode.is_near() {
            return Err(InstallError::UnsupportedPollMode {
                arch: Arch::Aarch64,
                mode,
            });
        }
        self.patch_constant(code, offset, poll_page, ConstantWidth::Wide)
    }

    fn poll_target(&self, code: &[u8], offset: usize, _pc: u64, mode: PollMode) -> Result<u64, InstallError> {
        if mode.is_near() {
            return Err(InstallError::UnsupportedPollMode {
                arch: Arch::Aarch64,
                mode,
            });
        }
        self.read_constant(code, offset, ConstantWidth::Wide)
    }
}

impl CallingConvention for AArch64Backend {
    fn java_registers(&self) -> ArgRegisters {
        ArgRegisters {
            int: &JAVA_INT_ARGS,
            float: &FLOAT_ARGS,
        }
    }

    fn c_registers(&self) -> ArgRegisters {
        ArgRegisters {
            int: &C_INT_ARGS,
            float: &FLOAT_ARGS,
        }
    }
}

fn mem_base(loc: Loc) -> (u8, u32) {
    match loc {
        Loc::Sp(disp) => (Reg::Sp.code(), disp.max(0) as u32),
        Loc::Interp(disp) => (INTERP_ESP, disp.max(0) as u32),
        Loc::Reg(_) => (Reg::Sp.code(), 0),
    }
}

impl MacroAssembler for AArch64Backend {
    fn nop(&self) -> &'static [u8] {
        &[0x1F, 0x20, 0x03, 0xD5]
    }

    fn uses_call_trampolines(&self) -> bool {
        true
    }

    fn emit_call_trampoline(&self, buf: &mut CodeBuffer) -> TrampolineLayout {
        buf.align_with(8, self.nop());
        let start = buf.offset();
        let mut asm = AArch64Assembler::new(buf);
        asm.ldr_literal(IP0, 8);
        asm.br(IP0);
        buf.emit_u64(0);
        TrampolineLayout {
            start,
            data: start + 8,
        }
    }

    fn emit_to_interp_stub(&self, buf: &mut CodeBuffer, method: u64) -> ToInterpLayout {
        let start = buf.offset();
        AArch64Assembler::new(buf).mov64(METHOD_REG, method);
        let jump = self.emit_call_trampoline(buf);
        ToInterpLayout {
            start,
            method_constant: start,
            jump_word: jump.data,
        }
    }

    fn emit_runtime_stub(&self, buf: &mut CodeBuffer, shape: StubShape, service: u64) {
        let mut asm = AArch64Assembler::new(buf);
        match shape {
            StubShape::TailJump => {
                asm.mov64(IP0, service);
                asm.br(IP0);
            }
            StubShape::CallAndReturn | StubShape::CallAndJump => {
                asm.push_frame_record();
                asm.add_imm(Reg::Fp.code(), Reg::Sp.code(), 0);
                asm.mov64(IP0, service);
                asm.blr(IP0);
                asm.pop_frame_record();
                if shape == StubShape::CallAndJump {
                    asm.br(0);
                } else {
                    asm.ret();
                }
            }
        }
    }

    fn emit_move(&self, buf: &mut CodeBuffer, from: Loc, to: Loc, kind: MoveKind) {
        let double = kind != MoveKind::Float;
        let mut asm = AArch64Assembler::new(buf);
        match (from, to) {
            (Loc::Reg(src), Loc::Reg(dst)) => {
                if src != dst {
                    asm.fmov(dst, src, double);
                }
            }
            (src, Loc::Reg(dst)) => {
                let (base, disp) = mem_base(src);
                match dst {
                    VReg::Gp(rt) => asm.ldr(rt, base, disp),
                    VReg::Fp(rt) => asm.ldr_fp(rt, base, disp, double),
                }
            }
            (Loc::Reg(src), dst) => {
                let (base, disp) = mem_base(dst);
                match src {
                    VReg::Gp(rt) => asm.str(rt, base, disp),
                    VReg::Fp(rt) => asm.str_fp(rt, base, disp, double),
                }
            }
            (src, dst) => {
                let (sbase, sdisp) = mem_base(src);
                let (dbase, ddisp) = mem_base(dst);
                asm.ldr(IP1, sbase, sdisp);
                asm.str(IP1, dbase, ddisp);
            }
        }
    }

    fn emit_load_constant(&self, buf: &mut CodeBuffer, reg: VReg, value: u64) {
        if let VReg::Gp(rd) = reg {
            AArch64Assembler::new(buf).mov64(rd, value);
        }
    }

    fn emit_adjust_sp(&self, buf: &mut CodeBuffer, delta: i32) {
        let sp = Reg::Sp.code();
        let mut asm = AArch64Assembler::new(buf);
        let mut remaining = delta;
        while remaining != 0 {
            let step = remaining.clamp(-4080, 4080);
            if step > 0 {
                asm.add_imm(sp, sp, step as u32);
            } else {
                asm.sub_imm(sp, sp, (-step) as u32);
            }
            remaining -= step;
        }
    }

    fn emit_jump_absolute(&self, buf: &mut CodeBuffer, target: u64) {
        let mut asm = AArch64Assembler::new(buf);
        asm.mov64(IP0, target);
        asm.br(IP0);
    }

    fn emit_call_absolute(&self, buf: &mut CodeBuffer, target: u64) {
        let mut asm = AArch64Assembler::new(buf);
        asm.mov64(IP0, target);
        asm.blr(IP0);
    }

    fn emit_jump_via_method(&self, buf: &mut CodeBuffer, entry_offset: i32) {
        let mut asm = AArch64Assembler::new(buf);
        asm.ldr(IP0, METHOD_REG, entry_offset.max(0) as u32);
        asm.br(IP0);
    }

    fn emit_receiver_check(&self, buf: &mut CodeBuffer, miss: u64) {
        let mut asm = AArch64Assembler::new(buf);
        asm.ldr(IP1, 1, CLASS_WORD_OFFSET);
        asm.cmp(IP1, IC_DATA_REG);
        asm.b_eq_label("ic_hit");
        asm.mov64(IP0, miss);
        asm.br(IP0);
        buf.define_label("ic_hit");
    }

    fn emit_frame_enter(&self, buf: &mut CodeBuffer, frame_bytes: u32) {
        {
            let mut asm = AArch64Assembler::new(buf);
            asm.push_frame_record();
            asm.add_imm(Reg::Fp.code(), Reg::Sp.code(), 0);
        }
        let frame = (frame_bytes + 15) & !15;
        self.emit_adjust_sp(buf, -(frame as i32));
    }

    fn emit_frame_leave_and_return(&self, buf: &mut CodeBuffer) {
        let mut asm = AArch64Assembler::new(buf);
        asm.add_imm(Reg::Sp.code(), Reg::Fp.code(), 0);
        asm.pop_frame_record();
        asm.ret();
    }

    fn method_register(&self) -> VReg {
        VReg::Gp(METHOD_REG)
    }

    fn emit_patchable_call(&self, buf: &mut CodeBuffer) -> usize {
        let offset = buf.offset();
        // bl .
        AArch64Assembler::new(buf).emit_raw(0x9400_0000);
        offset
    }

    fn emit_patchable_constant(&self, buf: &mut CodeBuffer, reg: VReg, value: u64) -> usize {
        let offset = buf.offset();
        let rd = match reg {
            VReg::Gp(rd) | VReg::Fp(rd) => rd,
        };
        let mut asm = AArch64Assembler::new(buf);
        asm.movz(rd, value as u16, 0);
        for hw in 1..4 {
            asm.movk(rd, (value >> (16 * hw)) as u16, hw);
        }
        offset
    }

    fn emit_return(&self, buf: &mut CodeBuffer) {
        AArch64Assembler::new(buf).ret();
    }
}
