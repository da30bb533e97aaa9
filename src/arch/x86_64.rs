//! x86-64 back end.
//!
//! Call sites are `call rel32` (E8) / `jmp rel32` (E9), or `mov r64, imm64`
//! followed by `call r64` for targets out of rel32 reach. A rel32 field that
//! is 4-byte aligned is rewritten with one atomic store, so no trampolines
//! are needed. Stubs and adapters follow the System V AMD64 ABI for native
//! calls and the managed convention below for compiled code.

use super::{
    ArgRegisters, Arch, CallForm, CallingConvention, Loc, MacroAssembler, MoveKind, Relocator,
    ToInterpLayout, TrampolineLayout, VReg, byte_at, read_u32, read_u64, write_u32, write_u64,
};
use crate::callsite::PatchSite;
use crate::code::codebuf::{CodeBuffer, ReferenceSize};
use crate::error::InstallError;
use crate::reloc::{ConstantWidth, PollMode};
use crate::stubs::StubShape;

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    const ALL: [Reg; 16] = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rbx,
        Reg::Rsp,
        Reg::Rbp,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    pub fn from_encoding(enc: u8) -> Reg {
        Self::ALL[(enc & 0xF) as usize]
    }

    /// Get the register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Check if this register requires REX.B or REX.R extension.
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// Get the REX.B bit for this register (when used as base/rm).
    pub fn rex_b(self) -> u8 {
        if self.needs_rex_ext() { 0x01 } else { 0x00 }
    }

    /// Get the REX.R bit for this register (when used as reg).
    pub fn rex_r(self) -> u8 {
        if self.needs_rex_ext() { 0x04 } else { 0x00 }
    }
}

/// Method register loaded by to-interpreter stubs and read by adapters.
pub const METHOD_REG: Reg = Reg::Rbx;
/// Inline cache data register checked by unverified entries.
pub const IC_DATA_REG: Reg = Reg::Rax;
/// Interpreter expression stack pointer.
pub const INTERP_ESP: Reg = Reg::R13;
/// Offset of the class word in an object header.
pub const CLASS_WORD_OFFSET: i32 = 8;

const SCRATCH: Reg = Reg::R11;

const JAVA_INT_ARGS: [VReg; 6] = [
    VReg::Gp(6),
    VReg::Gp(2),
    VReg::Gp(1),
    VReg::Gp(8),
    VReg::Gp(9),
    VReg::Gp(7),
];
const C_INT_ARGS: [VReg; 6] = [
    VReg::Gp(7),
    VReg::Gp(6),
    VReg::Gp(2),
    VReg::Gp(1),
    VReg::Gp(8),
    VReg::Gp(9),
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

/// x86-64 assembler.
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    fn emit_rex_w(&mut self, reg: Reg, rm: Reg) {
        self.buf.emit_u8(0x48 | reg.rex_r() | rm.rex_b());
    }

    fn emit_rex_w_single(&mut self, rm: Reg) {
        self.buf.emit_u8(0x48 | rm.rex_b());
    }

    /// Encode ModR/M byte.
    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// ModR/M (+ SIB) (+ displacement) for `[base + disp]`.
    fn emit_mem(&mut self, reg_field: u8, base: Reg, disp: i32) {
        let needs_sib = base == Reg::Rsp || base == Reg::R12;
        let rm = if needs_sib { 0b100 } else { base.code() };
        let mode = if disp == 0 && base != Reg::Rbp && base != Reg::R13 {
            0b00
        } else if (-128..=127).contains(&disp) {
            0b01
        } else {
            0b10
        };
        self.buf.emit_u8(Self::modrm(mode, reg_field, rm));
        if needs_sib {
            self.buf.emit_u8(0x24);
        }
        match mode {
            0b01 => self.buf.emit_u8(disp as u8),
            0b10 => self.buf.emit_u32(disp as u32),
            _ => {}
        }
    }

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: u64) {
        self.emit_rex_w_single(dst);
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm);
    }

    /// MOV r64, [base + disp]
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_rex_w(dst, base);
        self.buf.emit_u8(0x8B);
        self.emit_mem(dst.code(), base, disp);
    }

    /// MOV [base + disp], r64
    pub fn mov_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.emit_rex_w(src, base);
        self.buf.emit_u8(0x89);
        self.emit_mem(src.code(), base, disp);
    }

    /// CMP r64, r64
    pub fn cmp_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x39);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// ADD r64, imm32 (negative values subtract)
    pub fn add_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_rex_w_single(dst);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// MOVSD/MOVSS xmm, xmm
    pub fn movs_xx(&mut self, dst: u8, src: u8, double: bool) {
        self.buf.emit_u8(if double { 0xF2 } else { 0xF3 });
        self.buf.emit_bytes(&[0x0F, 0x10]);
        self.buf.emit_u8(Self::modrm(0b11, dst, src));
    }

    /// MOVSD/MOVSS xmm, [base + disp]
    pub fn movs_xm(&mut self, dst: u8, base: Reg, disp: i32, double: bool) {
        self.buf.emit_u8(if double { 0xF2 } else { 0xF3 });
        if base.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_bytes(&[0x0F, 0x10]);
        self.emit_mem(dst, base, disp);
    }

    /// MOVSD/MOVSS [base + disp], xmm
    pub fn movs_mx(&mut self, base: Reg, disp: i32, src: u8, double: bool) {
        self.buf.emit_u8(if double { 0xF2 } else { 0xF3 });
        if base.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_bytes(&[0x0F, 0x11]);
        self.emit_mem(src, base, disp);
    }

    /// MOVQ xmm, r64
    pub fn movq_xmm_r64(&mut self, xmm: u8, src: Reg) {
        self.buf.emit_u8(0x66);
        self.buf.emit_u8(0x48 | src.rex_b());
        self.buf.emit_bytes(&[0x0F, 0x6E]);
        self.buf.emit_u8(Self::modrm(0b11, xmm, src.code()));
    }

    /// MOVQ r64, xmm
    pub fn movq_r64_xmm(&mut self, dst: Reg, xmm: u8) {
        self.buf.emit_u8(0x66);
        self.buf.emit_u8(0x48 | dst.rex_b());
        self.buf.emit_bytes(&[0x0F, 0x7E]);
        self.buf.emit_u8(Self::modrm(0b11, xmm, dst.code()));
    }

    pub fn push(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    pub fn pop(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    /// CALL r64
    pub fn call_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    /// JMP r64
    pub fn jmp_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 4, reg.code()));
    }

    /// JMP [base + disp]
    pub fn jmp_m(&mut self, base: Reg, disp: i32) {
        if base.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF);
        self.emit_mem(4, base, disp);
    }

    /// JE rel32 to a label of the buffer.
    pub fn je_label(&mut self, label: &str) {
        self.buf.emit_bytes(&[0x0F, 0x84]);
        let field = self.buf.offset();
        self.buf.emit_u32(0);
        self.buf.add_forward_ref(field, label, ReferenceSize::Rel32);
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    pub fn nop(&mut self) {
        self.buf.emit_u8(0x90);
    }
}

/// Offset of the disp32 field of a RIP-relative instruction and its opcode.
///
/// Recognizes the forms compiled code uses for literal loads and polls:
/// `mov`, `lea`, `cmp`, `test` and the SSE scalar moves.
fn locate_rip_operand(code: &[u8], offset: usize) -> Result<(u8, usize), InstallError> {
    let mismatch = |found: u32| InstallError::EncodingMismatch {
        arch: Arch::X86_64,
        offset,
        expected: "rip-relative operand",
        found,
    };
    let mut p = offset;
    if matches!(byte_at(code, p)?, 0x66 | 0xF2 | 0xF3) {
        p += 1;
    }
    if byte_at(code, p)? & 0xF0 == 0x40 {
        p += 1;
    }
    let opcode = byte_at(code, p)?;
    let opcode = if opcode == 0x0F {
        p += 1;
        match byte_at(code, p)? {
            op @ (0x10 | 0x11 | 0x28 | 0x6E | 0x7E) => op,
            op => return Err(mismatch(op as u32)),
        }
    } else {
        match opcode {
            0x8B | 0x8D | 0x89 | 0x3B | 0x39 | 0x85 => opcode,
            op => return Err(mismatch(op as u32)),
        }
    };
    p += 1;
    let modrm = byte_at(code, p)?;
    if modrm & 0xC7 != 0x05 {
        return Err(mismatch(modrm as u32));
    }
    Ok((opcode, p + 1))
}

/// Offset of the immediate of `mov r64, imm64` or `mov r32, imm32`.
fn locate_immediate(code: &[u8], offset: usize, width: ConstantWidth) -> Result<usize, InstallError> {
    let b0 = byte_at(code, offset)?;
    let found = read_u32(code, offset).unwrap_or(b0 as u32);
    match width {
        ConstantWidth::Wide => {
            if matches!(b0, 0x48 | 0x49) && (0xB8..=0xBF).contains(&byte_at(code, offset + 1)?) {
                Ok(offset + 2)
            } else {
                Err(InstallError::EncodingMismatch {
                    arch: Arch::X86_64,
                    offset,
                    expected: "mov r64, imm64",
                    found,
                })
            }
        }
        ConstantWidth::Narrow => {
            if (0xB8..=0xBF).contains(&b0) {
                Ok(offset + 1)
            } else if b0 == 0x41 && (0xB8..=0xBF).contains(&byte_at(code, offset + 1)?) {
                Ok(offset + 2)
            } else {
                Err(InstallError::EncodingMismatch {
                    arch: Arch::X86_64,
                    offset,
                    expected: "mov r32, imm32",
                    found,
                })
            }
        }
    }
}

/// Whether a register call or jump follows at `offset`.
fn is_register_branch(code: &[u8], offset: usize) -> bool {
    let mut p = offset;
    if code.get(p) == Some(&0x41) {
        p += 1;
    }
    match (code.get(p), code.get(p + 1)) {
        (Some(0xFF), Some(&modrm)) => matches!(modrm & 0xF8, 0xD0 | 0xE0),
        _ => false,
    }
}

fn rel32(from_next_pc: u64, target: u64) -> Option<i32> {
    i32::try_from(target.wrapping_sub(from_next_pc) as i64).ok()
}

pub struct X86_64Backend;

impl Relocator for X86_64Backend {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn patch_constant(
        &self,
        code: &mut [u8],
        offset: usize,
        value: u64,
        width: ConstantWidth,
    ) -> Result<(), InstallError> {
        let field = locate_immediate(code, offset, width)?;
        match width {
            ConstantWidth::Wide => write_u64(code, field, value),
            ConstantWidth::Narrow => {
                let narrow = u32::try_from(value).map_err(|_| InstallError::ValueTooWide {
                    offset,
                    value,
                    form: "mov r32, imm32",
                })?;
                write_u32(code, field, narrow)
            }
        }
    }

    fn read_constant(&self, code: &[u8], offset: usize, width: ConstantWidth) -> Result<u64, InstallError> {
        let field = locate_immediate(code, offset, width)?;
        match width {
            ConstantWidth::Wide => read_u64(code, field),
            ConstantWidth::Narrow => Ok(read_u32(code, field)? as u64),
        }
    }

    fn patch_data_reference(
        &self,
        code: &mut [u8],
        offset: usize,
        pc: u64,
        target: u64,
    ) -> Result<(), InstallError> {
        let (_, field) = locate_rip_operand(code, offset)?;
        let next_pc = pc + (field - offset) as u64 + 4;
        let disp = rel32(next_pc, target).ok_or(InstallError::OutOfRange {
            offset,
            target,
            form: "rip-relative operand",
        })?;
        write_u32(code, field, disp as u32)
    }

    fn data_reference_target(&self, code: &[u8], offset: usize, pc: u64) -> Result<u64, InstallError> {
        let (_, field) = locate_rip_operand(code, offset)?;
        let next_pc = pc + (field - offset) as u64 + 4;
        let disp = read_u32(code, field)? as i32;
        Ok(next_pc.wrapping_add(disp as i64 as u64))
    }

    fn call_form(&self, code: &[u8], offset: usize) -> Result<CallForm, InstallError> {
        match byte_at(code, offset)? {
            0xE8 | 0xE9 => Ok(CallForm::Direct),
            0x48 | 0x49
                if (0xB8..=0xBF).contains(&byte_at(code, offset + 1)?)
                    && is_register_branch(code, offset + 10) =>
            {
                Ok(CallForm::Indirect)
            }
            _ => Err(InstallError::EncodingMismatch {
                arch: Arch::X86_64,
                offset,
                expected: "call",
                found: read_u32(code, offset).unwrap_or(0),
            }),
        }
    }

    fn patch_call(&self, code: &mut [u8], offset: usize, pc: u64, target: u64) -> Result<(), InstallError> {
        match self.call_form(code, offset)? {
            CallForm::Direct => {
                let disp = rel32(pc + 5, target).ok_or(InstallError::OutOfRange {
                    offset,
                    target,
                    form: "rel32 call",
                })?;
                write_u32(code, offset + 1, disp as u32)
            }
            CallForm::Indirect => write_u64(code, offset + 2, target),
        }
    }

    fn call_target(&self, code: &[u8], offset: usize, pc: u64) -> Result<u64, InstallError> {
        match self.call_form(code, offset)? {
            CallForm::Direct => {
                let disp = read_u32(code, offset + 1)? as i32;
                Ok((pc + 5).wrapping_add(disp as i64 as u64))
            }
            CallForm::Indirect => read_u64(code, offset + 2),
        }
    }

    fn call_patch_site(&self, form: CallForm, offset: usize) -> PatchSite {
        match form {
            CallForm::Direct => PatchSite::Rel32 {
                field: offset as u32 + 1,
                next_pc: offset as u32 + 5,
            },
            CallForm::Indirect => PatchSite::Word {
                field: offset as u32 + 2,
            },
        }
    }

    fn patch_poll(
        &self,
        code: &mut [u8],
        offset: usize,
        pc: u64,
        poll_page: u64,
        mode: PollMode,
    ) -> Result<(), InstallError> {
        if mode.is_near() {
            let (opcode, _) = locate_rip_operand(code, offset)?;
            if opcode != 0x85 {
                return Err(InstallError::EncodingMismatch {
                    arch: Arch::X86_64,
                    offset,
                    expected: "test [rip+disp32], r32",
                    found: opcode as u32,
                });
            }
            self.patch_data_reference(code, offset, pc, poll_page)
        } else {
            self.patch_constant(code, offset, poll_page, ConstantWidth::Wide)
        }
    }

    fn poll_target(&self, code: &[u8], offset: usize, pc: u64, mode: PollMode) -> Result<u64, InstallError> {
        if mode.is_near() {
            self.data_reference_target(code, offset, pc)
        } else {
            self.read_constant(code, offset, ConstantWidth::Wide)
        }
    }
}

impl CallingConvention for X86_64Backend {
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

fn gp(reg: VReg) -> Reg {
    match reg {
        VReg::Gp(enc) => Reg::from_encoding(enc),
        VReg::Fp(_) => Reg::Rax,
    }
}

fn mem_base(loc: Loc) -> Option<(Reg, i32)> {
    match loc {
        Loc::Sp(disp) => Some((Reg::Rsp, disp)),
        Loc::Interp(disp) => Some((INTERP_ESP, disp)),
        Loc::Reg(_) => None,
    }
}

impl MacroAssembler for X86_64Backend {
    fn nop(&self) -> &'static [u8] {
        &[0x90]
    }

    fn uses_call_trampolines(&self) -> bool {
        false
    }

    fn emit_call_trampoline(&self, buf: &mut CodeBuffer) -> TrampolineLayout {
        // mov r11, imm64 with the immediate 8-byte aligned, then jmp r11
        while (buf.offset() + 2) % 8 != 0 {
            buf.emit_u8(0x90);
        }
        let start = buf.offset();
        let mut asm = X86_64Assembler::new(buf);
        asm.mov_ri64(SCRATCH, 0);
        asm.jmp_r(SCRATCH);
        TrampolineLayout {
            start,
            data: start + 2,
        }
    }

    fn emit_to_interp_stub(&self, buf: &mut CodeBuffer, method: u64) -> ToInterpLayout {
        let start = buf.offset();
        X86_64Assembler::new(buf).mov_ri64(METHOD_REG, method);
        let jump = self.emit_call_trampoline(buf);
        ToInterpLayout {
            start,
            method_constant: start,
            jump_word: jump.data,
        }
    }

    fn emit_runtime_stub(&self, buf: &mut CodeBuffer, shape: StubShape, service: u64) {
        let mut asm = X86_64Assembler::new(buf);
        match shape {
            StubShape::TailJump => {
                asm.mov_ri64(SCRATCH, service);
                asm.jmp_r(SCRATCH);
            }
            StubShape::CallAndReturn | StubShape::CallAndJump => {
                asm.push(Reg::Rbp);
                asm.mov_rr(Reg::Rbp, Reg::Rsp);
                asm.mov_ri64(SCRATCH, service);
                asm.call_r(SCRATCH);
                asm.pop(Reg::Rbp);
                if shape == StubShape::CallAndJump {
                    asm.jmp_r(Reg::Rax);
                } else {
                    asm.ret();
                }
            }
        }
    }

    fn emit_move(&self, buf: &mut CodeBuffer, from: Loc, to: Loc, kind: MoveKind) {
        let double = kind != MoveKind::Float;
        let mut asm = X86_64Assembler::new(buf);
        match (from, to) {
            (Loc::Reg(VReg::Gp(s)), Loc::Reg(VReg::Gp(d))) => {
                if s != d {
                    asm.mov_rr(Reg::from_encoding(d), Reg::from_encoding(s));
                }
            }
            (Loc::Reg(VReg::Fp(s)), Loc::Reg(VReg::Fp(d))) => {
                if s != d {
                    asm.movs_xx(d, s, double);
                }
            }
            (Loc::Reg(VReg::Gp(s)), Loc::Reg(VReg::Fp(d))) => {
                asm.movq_xmm_r64(d, Reg::from_encoding(s))
            }
            (Loc::Reg(VReg::Fp(s)), Loc::Reg(VReg::Gp(d))) => {
                asm.movq_r64_xmm(Reg::from_encoding(d), s)
            }
            (src, Loc::Reg(dst)) => {
                let (base, disp) = mem_base(src).unwrap_or((Reg::Rsp, 0));
                match dst {
                    VReg::Gp(_) => asm.mov_rm(gp(dst), base, disp),
                    VReg::Fp(x) => asm.movs_xm(x, base, disp, double),
                }
            }
            (Loc::Reg(src), dst) => {
                let (base, disp) = mem_base(dst).unwrap_or((Reg::Rsp, 0));
                match src {
                    VReg::Gp(_) => asm.mov_mr(base, disp, gp(src)),
                    VReg::Fp(x) => asm.movs_mx(base, disp, x, double),
                }
            }
            (src, dst) => {
                let (sbase, sdisp) = mem_base(src).unwrap_or((Reg::Rsp, 0));
                let (dbase, ddisp) = mem_base(dst).unwrap_or((Reg::Rsp, 0));
                asm.mov_rm(Reg::Rax, sbase, sdisp);
                asm.mov_mr(dbase, ddisp, Reg::Rax);
            }
        }
    }

    fn emit_load_constant(&self, buf: &mut CodeBuffer, reg: VReg, value: u64) {
        X86_64Assembler::new(buf).mov_ri64(gp(reg), value);
    }

    fn emit_adjust_sp(&self, buf: &mut CodeBuffer, delta: i32) {
        if delta != 0 {
            X86_64Assembler::new(buf).add_ri32(Reg::Rsp, delta);
        }
    }

    fn emit_jump_absolute(&self, buf: &mut CodeBuffer, target: u64) {
        let mut asm = X86_64Assembler::new(buf);
        asm.mov_ri64(SCRATCH, target);
        asm.jmp_r(SCRATCH);
    }

    fn emit_call_absolute(&self, buf: &mut CodeBuffer, target: u64) {
        let mut asm = X86_64Assembler::new(buf);
        asm.mov_ri64(SCRATCH, target);
        asm.call_r(SCRATCH);
    }

    fn emit_jump_via_method(&self, buf: &mut CodeBuffer, entry_offset: i32) {
        X86_64Assembler::new(buf).jmp_m(METHOD_REG, entry_offset);
    }

    fn emit_receiver_check(&self, buf: &mut CodeBuffer, miss: u64) {
        let receiver = gp(JAVA_INT_ARGS[0]);
        let mut asm = X86_64Assembler::new(buf);
        asm.mov_rm(Reg::R10, receiver, CLASS_WORD_OFFSET);
        asm.cmp_rr(Reg::R10, IC_DATA_REG);
        asm.je_label("ic_hit");
        asm.mov_ri64(SCRATCH, miss);
        asm.jmp_r(SCRATCH);
        buf.define_label("ic_hit");
    }

    fn emit_frame_enter(&self, buf: &mut CodeBuffer, frame_bytes: u32) {
        let mut asm = X86_64Assembler::new(buf);
        asm.push(Reg::Rbp);
        asm.mov_rr(Reg::Rbp, Reg::Rsp);
        if frame_bytes > 0 {
            asm.add_ri32(Reg::Rsp, -(frame_bytes as i32));
        }
    }

    fn emit_frame_leave_and_return(&self, buf: &mut CodeBuffer) {
        let mut asm = X86_64Assembler::new(buf);
        asm.mov_rr(Reg::Rsp, Reg::Rbp);
        asm.pop(Reg::Rbp);
        asm.ret();
    }

    fn method_register(&self) -> VReg {
        VReg::Gp(METHOD_REG as u8)
    }

    fn return_address_size(&self) -> i32 {
        8
    }

    fn emit_patchable_call(&self, buf: &mut CodeBuffer) -> usize {
        // rel32 field on a 4-byte boundary
        while (buf.offset() + 1) % 4 != 0 {
            buf.emit_u8(0x90);
        }
        let offset = buf.offset();
        buf.emit_u8(0xE8);
        buf.emit_u32(0);
        offset
    }

    fn emit_patchable_constant(&self, buf: &mut CodeBuffer, reg: VReg, value: u64) -> usize {
        let offset = buf.offset();
        X86_64Assembler::new(buf).mov_ri64(gp(reg), value);
        offset
    }

    fn emit_return(&self, buf: &mut CodeBuffer) {
        X86_64Assembler::new(buf).ret();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PC: u64 = 0x7F00_0000_1000;

    #[test]
    fn test_mov_rr() {
        let mut buf = CodeBuffer::new();
        X86_64Assembler::new(&mut buf).mov_rr(Reg::Rax, Reg::Rbx);
        assert_eq!(buf.code(), &[0x48, 0x89, 0xD8]);
    }

    #[test]
    fn test_mov_ri64_r11() {
        let mut buf = CodeBuffer::new();
        X86_64Assembler::new(&mut buf).mov_ri64(Reg::R11, 42);
        assert_eq!(
            buf.code(),
            &[0x49, 0xBB, 0x2A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_memory_operands() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.mov_rm(Reg::Rax, Reg::Rsp, 8);
        asm.mov_mr(Reg::R13, 0, Reg::Rcx);
        asm.jmp_m(Reg::Rbx, 0);
        assert_eq!(
            buf.code(),
            &[
                0x48, 0x8B, 0x44, 0x24, 0x08, // mov rax, [rsp+8]
                0x49, 0x89, 0x4D, 0x00, // mov [r13+0], rcx
                0xFF, 0x23, // jmp [rbx]
            ]
        );
    }

    #[test]
    fn test_sse_moves() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.movs_xm(1, Reg::Rsp, 16, true);
        asm.movs_mx(Reg::R13, 8, 0, false);
        assert_eq!(
            buf.code(),
            &[
                0xF2, 0x0F, 0x10, 0x4C, 0x24, 0x10, // movsd xmm1, [rsp+16]
                0xF3, 0x41, 0x0F, 0x11, 0x45, 0x08, // movss [r13+8], xmm0
            ]
        );
    }

    #[test]
    fn test_direct_call_round_trip() {
        let mut code = vec![0xE8, 0, 0, 0, 0];
        let target = PC + 0x1234;
        X86_64Backend.patch_call(&mut code, 0, PC, target).unwrap();
        assert_eq!(X86_64Backend.call_target(&code, 0, PC).unwrap(), target);
        assert_eq!(&code[1..], &(0x1234i32 - 5).to_le_bytes());
    }

    #[test]
    fn test_direct_call_out_of_range() {
        let mut code = vec![0xE8, 0, 0, 0, 0];
        let err = X86_64Backend
            .patch_call(&mut code, 0, PC, PC + 0x1_0000_0000)
            .unwrap_err();
        assert!(matches!(err, InstallError::OutOfRange { .. }));
    }

    #[test]
    fn test_indirect_call_form() {
        // mov r11, imm64; call r11
        let mut code = vec![0x49, 0xBB, 0, 0, 0, 0, 0, 0, 0, 0, 0x41, 0xFF, 0xD3];
        assert_eq!(
            X86_64Backend.call_form(&code, 0).unwrap(),
            CallForm::Indirect
        );
        X86_64Backend
            .patch_call(&mut code, 0, PC, 0xDEAD_BEEF_0000)
            .unwrap();
        assert_eq!(
            X86_64Backend.call_target(&code, 0, PC).unwrap(),
            0xDEAD_BEEF_0000
        );
    }

    #[test]
    fn test_constant_mismatch_is_fatal() {
        let mut code = vec![0x90; 16];
        let err = X86_64Backend
            .patch_constant(&mut code, 0, 1, ConstantWidth::Wide)
            .unwrap_err();
        assert!(matches!(
            err,
            InstallError::EncodingMismatch {
                expected: "mov r64, imm64",
                ..
            }
        ));
    }

    #[test]
    fn test_narrow_constant() {
        // mov r8d, imm32
        let mut code = vec![0x41, 0xB8, 0, 0, 0, 0];
        X86_64Backend
            .patch_constant(&mut code, 0, 0x1234_5678, ConstantWidth::Narrow)
            .unwrap();
        assert_eq!(
            X86_64Backend
                .read_constant(&code, 0, ConstantWidth::Narrow)
                .unwrap(),
            0x1234_5678
        );
        assert!(
            X86_64Backend
                .patch_constant(&mut code, 0, 1 << 32, ConstantWidth::Narrow)
                .is_err()
        );
    }

    #[test]
    fn test_rip_relative_forms() {
        // lea rax, [rip+0]; movsd xmm0, [rip+0]
        let mut code = vec![
            0x48, 0x8D, 0x05, 0, 0, 0, 0, //
            0xF2, 0x0F, 0x10, 0x05, 0, 0, 0, 0,
        ];
        X86_64Backend
            .patch_data_reference(&mut code, 0, PC, PC + 0x100)
            .unwrap();
        X86_64Backend
            .patch_data_reference(&mut code, 7, PC + 7, PC + 0x108)
            .unwrap();
        assert_eq!(
            X86_64Backend.data_reference_target(&code, 0, PC).unwrap(),
            PC + 0x100
        );
        assert_eq!(
            X86_64Backend
                .data_reference_target(&code, 7, PC + 7)
                .unwrap(),
            PC + 0x108
        );
        assert_eq!(read_u32(&code, 3).unwrap(), 0x100 - 7);
    }

    #[test]
    fn test_unrecognized_literal_load() {
        // mov rax, [rbx]: not rip-relative
        let mut code = vec![0x48, 0x8B, 0x03, 0, 0, 0, 0];
        assert!(
            X86_64Backend
                .patch_data_reference(&mut code, 0, PC, PC)
                .is_err()
        );
    }

    #[test]
    fn test_polls() {
        // test [rip+0], eax
        let mut near = vec![0x85, 0x05, 0, 0, 0, 0];
        let page = PC - 0x10_0000;
        X86_64Backend
            .patch_poll(&mut near, 0, PC, page, PollMode::Near)
            .unwrap();
        assert_eq!(
            X86_64Backend
                .poll_target(&near, 0, PC, PollMode::Near)
                .unwrap(),
            page
        );

        let mut far = vec![0x49, 0xBA, 0, 0, 0, 0, 0, 0, 0, 0];
        X86_64Backend
            .patch_poll(&mut far, 0, PC, page, PollMode::ReturnFar)
            .unwrap();
        assert_eq!(
            X86_64Backend
                .poll_target(&far, 0, PC, PollMode::ReturnFar)
                .unwrap(),
            page
        );

        // a lea is rip-relative but not a poll
        let mut lea = vec![0x48, 0x8D, 0x05, 0, 0, 0, 0];
        assert!(
            X86_64Backend
                .patch_poll(&mut lea, 0, PC, page, PollMode::Near)
                .is_err()
        );
    }

    #[test]
    fn test_to_interp_stub_word_alignment() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        let layout = X86_64Backend.emit_to_interp_stub(&mut buf, 0x1122_3344_5566);
        assert_eq!(layout.jump_word % 8, 0);
        assert_eq!(
            read_u64(buf.code(), layout.method_constant + 2).unwrap(),
            0x1122_3344_5566
        );
    }

    #[test]
    fn test_receiver_check_label() {
        let mut buf = CodeBuffer::new();
        X86_64Backend.emit_receiver_check(&mut buf, 0x4000);
        buf.patch_forward_refs().unwrap();
        // mov r10, [rsi+8] (4) + cmp (3) + je (6), then 13 bytes of miss path
        let je_field = 4 + 3 + 2;
        assert_eq!(read_u32(buf.code(), je_field).unwrap(), 13);
    }

    proptest! {
        #[test]
        fn rel32_call_round_trips(disp in i32::MIN as i64..=i32::MAX as i64) {
            let mut code = vec![0xE8, 0, 0, 0, 0];
            let target = (PC as i64 + 5 + disp) as u64;
            X86_64Backend.patch_call(&mut code, 0, PC, target).unwrap();
            prop_assert_eq!(X86_64Backend.call_target(&code, 0, PC).unwrap(), target);
        }

        #[test]
        fn wide_constant_round_trips(value in any::<u64>(), reg in 0u8..16) {
            let mut code = vec![0x48 | (reg >> 3), 0xB8 + (reg & 7), 0, 0, 0, 0, 0, 0, 0, 0];
            X86_64Backend.patch_constant(&mut code, 0, value, ConstantWidth::Wide).unwrap();
            prop_assert_eq!(X86_64Backend.read_constant(&code, 0, ConstantWidth::Wide).unwrap(), value);
        }
    }
}
