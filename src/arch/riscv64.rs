//! RISC-V (RV64GC) back end.
//!
//! Wide constants use the 48-bit `movptr` shape: `lui; addi; slli 11; addi;
//! slli 6; <op>` where the final instruction (an `addi`, `jalr` or `ld`)
//! carries the low six bits. Patchable calls are `jal` bound once to a
//! per-call trampoline whose data word sits at `start + 12`.

use super::{
    ArgRegisters, Arch, CallForm, CallingConvention, Loc, MacroAssembler, MoveKind, Relocator,
    ToInterpLayout, TrampolineLayout, VReg, read_u32, sign_extend, write_u32,
};
use crate::callsite::PatchSite;
use crate::code::codebuf::{CodeBuffer, ReferenceSize};
use crate::error::InstallError;
use crate::reloc::{ConstantWidth, PollMode};
use crate::stubs::StubShape;

pub const ZERO: u8 = 0;
pub const RA: u8 = 1;
pub const SP: u8 = 2;
pub const T0: u8 = 5;
pub const T1: u8 = 6;
pub const T2: u8 = 7;
pub const FP: u8 = 8;
pub const A0: u8 = 10;
pub const A1: u8 = 11;

pub const METHOD_REG: u8 = 31;
pub const IC_DATA_REG: u8 = T1;
pub const INTERP_ESP: u8 = 18;
pub const CLASS_WORD_OFFSET: i32 = 8;

const NOP: u32 = 0x0000_0013;

const OP_LUI: u32 = 0x37;
const OP_AUIPC: u32 = 0x17;
const OP_JAL: u32 = 0x6F;
const OP_JALR: u32 = 0x67;
const OP_IMM: u32 = 0x13;
const OP_IMM_32: u32 = 0x1B;
const OP_LOAD: u32 = 0x03;
const OP_LOAD_FP: u32 = 0x07;
const OP_STORE: u32 = 0x23;
const OP_STORE_FP: u32 = 0x27;
const OP_BRANCH: u32 = 0x63;
const OP_REG: u32 = 0x33;
const OP_FP: u32 = 0x53;

/// Largest value a `movptr` sequence can hold.
const MOVPTR_LIMIT: u64 = 1 << 47;

const JAVA_INT_ARGS: [VReg; 8] = [
    VReg::Gp(11),
    VReg::Gp(12),
    VReg::Gp(13),
    VReg::Gp(14),
    VReg::Gp(15),
    VReg::Gp(16),
    VReg::Gp(17),
    VReg::Gp(10),
];
const C_INT_ARGS: [VReg; 8] = [
    VReg::Gp(10),
    VReg::Gp(11),
    VReg::Gp(12),
    VReg::Gp(13),
    VReg::Gp(14),
    VReg::Gp(15),
    VReg::Gp(16),
    VReg::Gp(17),
];
const FLOAT_ARGS: [VReg; 8] = [
    VReg::Fp(10),
    VReg::Fp(11),
    VReg::Fp(12),
    VReg::Fp(13),
    VReg::Fp(14),
    VReg::Fp(15),
    VReg::Fp(16),
    VReg::Fp(17),
];

fn i_type(opcode: u32, funct3: u32, rd: u8, rs1: u8, imm: i32) -> u32 {
    (((imm as u32) & 0xFFF) << 20) | ((rs1 as u32) << 15) | (funct3 << 12) | ((rd as u32) << 7) | opcode
}

fn s_type(opcode: u32, funct3: u32, rs1: u8, rs2: u8, imm: i32) -> u32 {
    let imm = imm as u32;
    (((imm >> 5) & 0x7F) << 25)
        | ((rs2 as u32) << 20)
        | ((rs1 as u32) << 15)
        | (funct3 << 12)
        | ((imm & 0x1F) << 7)
        | opcode
}

fn u_type(opcode: u32, rd: u8, imm20: u32) -> u32 {
    ((imm20 & 0xF_FFFF) << 12) | ((rd as u32) << 7) | opcode
}

fn opcode(inst: u32) -> u32 {
    inst & 0x7F
}

fn funct3(inst: u32) -> u32 {
    (inst >> 12) & 0x7
}

fn i_imm(inst: u32) -> i64 {
    sign_extend((inst >> 20) as u64, 12)
}

fn set_i_imm(inst: u32, imm: i64) -> u32 {
    (inst & 0x000F_FFFF) | (((imm as u32) & 0xFFF) << 20)
}

fn u_imm(inst: u32) -> i64 {
    sign_extend((inst & 0xFFFF_F000) as u64, 32)
}

fn set_u_imm(inst: u32, imm20: i64) -> u32 {
    (inst & 0xFFF) | (((imm20 as u32) & 0xF_FFFF) << 12)
}

/// The low 12 bits of `value`, sign-extended.
fn low12(value: i64) -> i64 {
    sign_extend(value as u64 & 0xFFF, 12)
}

fn is_i_type(inst: u32, op: u32, f3: u32) -> bool {
    opcode(inst) == op && funct3(inst) == f3
}

fn is_slli(inst: u32, shamt: u32) -> bool {
    is_i_type(inst, OP_IMM, 1) && (inst >> 20) & 0x3F == shamt && inst >> 26 == 0
}

/// RISC-V assembler over a code buffer.
pub struct Riscv64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> Riscv64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    pub fn emit_raw(&mut self, inst: u32) {
        self.buf.emit_u32(inst);
    }

    pub fn lui(&mut self, rd: u8, imm20: u32) {
        self.emit_raw(u_type(OP_LUI, rd, imm20));
    }

    pub fn auipc(&mut self, rd: u8, imm20: u32) {
        self.emit_raw(u_type(OP_AUIPC, rd, imm20));
    }

    pub fn addi(&mut self, rd: u8, rs1: u8, imm: i32) {
        self.emit_raw(i_type(OP_IMM, 0, rd, rs1, imm));
    }

    pub fn addiw(&mut self, rd: u8, rs1: u8, imm: i32) {
        self.emit_raw(i_type(OP_IMM_32, 0, rd, rs1, imm));
    }

    pub fn slli(&mut self, rd: u8, rs1: u8, shamt: u32) {
        self.emit_raw(i_type(OP_IMM, 1, rd, rs1, (shamt & 0x3F) as i32));
    }

    pub fn add(&mut self, rd: u8, rs1: u8, rs2: u8) {
        self.emit_raw(((rs2 as u32) << 20) | ((rs1 as u32) << 15) | ((rd as u32) << 7) | OP_REG);
    }

    pub fn mv(&mut self, rd: u8, rs: u8) {
        self.addi(rd, rs, 0);
    }

    pub fn ld(&mut self, rd: u8, rs1: u8, imm: i32) {
        self.emit_raw(i_type(OP_LOAD, 3, rd, rs1, imm));
    }

    pub fn sd(&mut self, rs2: u8, rs1: u8, imm: i32) {
        self.emit_raw(s_type(OP_STORE, 3, rs1, rs2, imm));
    }

    /// `fld`/`flw`
    pub fn fload(&mut self, rd: u8, rs1: u8, imm: i32, double: bool) {
        self.emit_raw(i_type(OP_LOAD_FP, if double { 3 } else { 2 }, rd, rs1, imm));
    }

    /// `fsd`/`fsw`
    pub fn fstore(&mut self, rs2: u8, rs1: u8, imm: i32, double: bool) {
        self.emit_raw(s_type(OP_STORE_FP, if double { 3 } else { 2 }, rs1, rs2, imm));
    }

    /// Register moves involving the FP register file.
    pub fn fmv(&mut self, to: VReg, from: VReg, double: bool) {
        let funct7: u32 = match (to, from, double) {
            (VReg::Fp(_), VReg::Fp(_), true) => 0x11,
            (VReg::Fp(_), VReg::Fp(_), false) => 0x10,
            (VReg::Fp(_), VReg::Gp(_), true) => 0x79,
            (VReg::Fp(_), VReg::Gp(_), false) => 0x78,
            (VReg::Gp(_), VReg::Fp(_), true) => 0x71,
            (VReg::Gp(_), VReg::Fp(_), false) => 0x70,
            (VReg::Gp(rd), VReg::Gp(rs), _) => return self.mv(rd, rs),
        };
        let (rd, rs) = (reg_num(to), reg_num(from));
        // fsgnj duplicates the source as rs2; the moves to/from x use rs2 = 0
        let rs2 = if matches!((to, from), (VReg::Fp(_), VReg::Fp(_))) { rs } else { 0 };
        self.emit_raw((funct7 << 25) | ((rs2 as u32) << 20) | ((rs as u32) << 15) | ((rd as u32) << 7) | OP_FP);
    }

    pub fn jalr(&mut self, rd: u8, rs1: u8, imm: i32) {
        self.emit_raw(i_type(OP_JALR, 0, rd, rs1, imm));
    }

    pub fn jr(&mut self, rs: u8) {
        self.jalr(ZERO, rs, 0);
    }

    pub fn ret(&mut self) {
        self.jalr(ZERO, RA, 0);
    }

    /// `beq rs1, rs2, label`
    pub fn beq_label(&mut self, rs1: u8, rs2: u8, label: &str) {
        let at = self.buf.offset();
        self.emit_raw(((rs2 as u32) << 20) | ((rs1 as u32) << 15) | OP_BRANCH);
        self.buf.add_forward_ref(at, label, ReferenceSize::RiscvBranch);
    }

    pub fn nop(&mut self) {
        self.emit_raw(NOP);
    }

    /// `lui` + `addiw`, or a single `addi` for small values.
    pub fn li32(&mut self, rd: u8, value: i32) {
        let lower = low12(value as i64);
        let upper = (value as i64 - lower) as i32;
        if upper == 0 {
            self.addi(rd, ZERO, lower as i32);
        } else {
            self.lui(rd, (upper as u32) >> 12);
            self.addiw(rd, rd, lower as i32);
        }
    }

    /// Load an arbitrary 64-bit value.
    pub fn li(&mut self, rd: u8, value: i64) {
        if value == value as i32 as i64 {
            self.li32(rd, value as i32);
            return;
        }
        let lower = low12(value);
        let upper = value.wrapping_sub(lower) >> 12;
        self.li(rd, upper);
        self.slli(rd, rd, 12);
        if lower != 0 {
            self.addi(rd, rd, lower as i32);
        }
    }

    /// Fixed six-instruction load of a value below 2^47.
    pub fn movptr(&mut self, rd: u8, value: u64) {
        debug_assert!(value < MOVPTR_LIMIT);
        let [i0, i1, i2, i3, i4, i5] = movptr_words(rd, value);
        for inst in [i0, i1, i2, i3, i4, i5] {
            self.emit_raw(inst);
        }
    }
}

fn reg_num(reg: VReg) -> u8 {
    match reg {
        VReg::Gp(r) | VReg::Fp(r) => r,
    }
}

fn movptr_words(rd: u8, value: u64) -> [u32; 6] {
    let imm = (value >> 17) as i64;
    let lower = low12(imm);
    let upper = imm - lower;
    [
        u_type(OP_LUI, rd, (upper >> 12) as u32),
        i_type(OP_IMM, 0, rd, rd, lower as i32),
        i_type(OP_IMM, 1, rd, rd, 11),
        i_type(OP_IMM, 0, rd, rd, ((value >> 6) & 0x7FF) as i32),
        i_type(OP_IMM, 1, rd, rd, 6),
        i_type(OP_IMM, 0, rd, rd, (value & 0x3F) as i32),
    ]
}

fn mismatch(offset: usize, expected: &'static str, found: u32) -> InstallError {
    InstallError::EncodingMismatch {
        arch: Arch::Riscv64,
        offset,
        expected,
        found,
    }
}

/// Check the `movptr` shape at `offset`. The final instruction may be any
/// I-type consumer of the low bits.
fn check_movptr(code: &[u8], offset: usize) -> Result<[u32; 6], InstallError> {
    let mut insts = [0u32; 6];
    for (i, slot) in insts.iter_mut().enumerate() {
        *slot = read_u32(code, offset + 4 * i)?;
    }
    let [lui, addi, sll11, addi2, sll6, last] = insts;
    let last_ok = is_i_type(last, OP_IMM, 0) || is_i_type(last, OP_JALR, 0) || is_i_type(last, OP_LOAD, 3);
    if opcode(lui) != OP_LUI
        || !is_i_type(addi, OP_IMM, 0)
        || !is_slli(sll11, 11)
        || !is_i_type(addi2, OP_IMM, 0)
        || !is_slli(sll6, 6)
        || !last_ok
    {
        return Err(mismatch(offset, "movptr", lui));
    }
    Ok(insts)
}

fn data_pair_ok(next: u32) -> bool {
    is_i_type(next, OP_IMM, 0)
        || is_i_type(next, OP_LOAD, 3)
        || is_i_type(next, OP_LOAD, 2)
        || is_i_type(next, OP_LOAD_FP, 3)
        || is_i_type(next, OP_LOAD_FP, 2)
}

fn encode_jal(inst: u32, delta: i64) -> u32 {
    let imm = delta as u32;
    (inst & 0xFFF)
        | (((imm >> 20) & 0x1) << 31)
        | (((imm >> 1) & 0x3FF) << 21)
        | (((imm >> 11) & 0x1) << 20)
        | (((imm >> 12) & 0xFF) << 12)
}

fn decode_jal(inst: u32) -> i64 {
    let imm = (((inst >> 31) & 0x1) << 20)
        | (((inst >> 21) & 0x3FF) << 1)
        | (((inst >> 20) & 0x1) << 11)
        | (((inst >> 12) & 0xFF) << 12);
    sign_extend(imm as u64, 21)
}

pub struct Riscv64Backend;

impl Relocator for Riscv64Backend {
    fn arch(&self) -> Arch {
        Arch::Riscv64
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
                let insts = check_movptr(code, offset)?;
                if value >= MOVPTR_LIMIT {
                    return Err(InstallError::ValueTooWide {
                        offset,
                        value,
                        form: "movptr 47-bit constant",
                    });
                }
                let rd = ((insts[0] >> 7) & 0x1F) as u8;
                let fresh = movptr_words(rd, value);
                for (i, (old, new)) in insts.iter().zip(fresh).enumerate() {
                    // keep the consumer's opcode and registers, replace immediates only
                    let patched = if i == 0 {
                        set_u_imm(*old, (new >> 12) as i64)
                    } else {
                        set_i_imm(*old, i_imm(new))
                    };
                    write_u32(code, offset + 4 * i, patched)?;
                }
                Ok(())
            }
            ConstantWidth::Narrow => {
                let lui = read_u32(code, offset)?;
                let addiw = read_u32(code, offset + 4)?;
                if opcode(lui) != OP_LUI || !is_i_type(addiw, OP_IMM_32, 0) {
                    return Err(mismatch(offset, "lui; addiw", lui));
                }
                let narrow = u32::try_from(value).map_err(|_| InstallError::ValueTooWide {
                    offset,
                    value,
                    form: "lui/addiw 32-bit constant",
                })? as i32 as i64;
                let lower = low12(narrow);
                let upper = narrow - lower;
                write_u32(code, offset, set_u_imm(lui, upper >> 12))?;
                write_u32(code, offset + 4, set_i_imm(addiw, lower))
            }
        }
    }

    fn read_constant(&self, code: &[u8], offset: usize, width: ConstantWidth) -> Result<u64, InstallError> {
        match width {
            ConstantWidth::Wide => {
                let [lui, addi, _, addi2, _, last] = check_movptr(code, offset)?;
                let high = u_imm(lui) + i_imm(addi);
                let value = (high << 17) + ((i_imm(addi2) & 0x7FF) << 6) + (i_imm(last) & 0x3F);
                Ok(value as u64)
            }
            ConstantWidth::Narrow => {
                let lui = read_u32(code, offset)?;
                let addiw = read_u32(code, offset + 4)?;
                if opcode(lui) != OP_LUI || !is_i_type(addiw, OP_IMM_32, 0) {
                    return Err(mismatch(offset, "lui; addiw", lui));
                }
                Ok((u_imm(lui) as u32).wrapping_add(i_imm(addiw) as u32) as u64)
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
        let auipc = read_u32(code, offset)?;
        let next = read_u32(code, offset + 4)?;
        if opcode(auipc) != OP_AUIPC || !data_pair_ok(next) {
            return Err(mismatch(offset, "auipc + addi/ld/fld", auipc));
        }
        let delta = target.wrapping_sub(pc) as i64;
        let lower = low12(delta);
        let upper = (delta - lower) >> 12;
        if !(-(1 << 19)..(1 << 19)).contains(&upper) {
            return Err(InstallError::OutOfRange {
                offset,
                target,
                form: "auipc pair",
            });
        }
        write_u32(code, offset, set_u_imm(auipc, upper))?;
        write_u32(code, offset + 4, set_i_imm(next, lower))
    }

    fn data_reference_target(&self, code: &[u8], offset: usize, pc: u64) -> Result<u64, InstallError> {
        let auipc = read_u32(code, offset)?;
        let next = read_u32(code, offset + 4)?;
        if opcode(auipc) != OP_AUIPC || !data_pair_ok(next) {
            return Err(mismatch(offset, "auipc + addi/ld/fld", auipc));
        }
        Ok(pc.wrapping_add((u_imm(auipc) + i_imm(next)) as u64))
    }

    fn call_form(&self, code: &[u8], offset: usize) -> Result<CallForm, InstallError> {
        let inst = read_u32(code, offset)?;
        if opcode(inst) == OP_JAL {
            return Ok(CallForm::Direct);
        }
        if let Ok(insts) = check_movptr(code, offset) {
            if is_i_type(insts[5], OP_JALR, 0) {
                return Ok(CallForm::Indirect);
            }
            if read_u32(code, offset + 24).is_ok_and(|next| is_i_type(next, OP_JALR, 0)) {
                return Ok(CallForm::Indirect);
            }
        }
        Err(mismatch(offset, "jal or movptr + jalr", inst))
    }

    fn patch_call(&self, code: &mut [u8], offset: usize, pc: u64, target: u64) -> Result<(), InstallError> {
        match self.call_form(code, offset)? {
            CallForm::Direct => {
                let delta = target.wrapping_sub(pc) as i64;
                if delta % 2 != 0 || !(-(1 << 20)..(1 << 20)).contains(&delta) {
                    return Err(InstallError::OutOfRange {
                        offset,
                        target,
                        form: "jal imm20",
                    });
                }
                let inst = read_u32(code, offset)?;
                write_u32(code, offset, encode_jal(inst, delta))
            }
            CallForm::Indirect => self.patch_constant(code, offset, target, ConstantWidth::Wide),
        }
    }

    fn call_target(&self, code: &[u8], offset: usize, pc: u64) -> Result<u64, InstallError> {
        match self.call_form(code, offset)? {
            CallForm::Direct => Ok(pc.wrapping_add(decode_jal(read_u32(code, offset)?) as u64)),
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
                arch: Arch::Riscv64,
                mode,
            });
        }
        self.patch_constant(code, offset, poll_page, ConstantWidth::Wide)
    }

    fn poll_target(&self, code: &[u8], offset: usize, _pc: u64, mode: PollMode) -> Result<u64, InstallError> {
        if mode.is_near() {
            return Err(InstallError::UnsupportedPollMode {
                arch: Arch::Riscv64,
                mode,
            });
        }
        self.read_constant(code, offset, ConstantWidth::Wide)
    }
}

impl CallingConvention for Riscv64Backend {
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

    fn c_floats_use_int_registers(&self) -> bool {
        true
    }
}

/// Base register and displacement for a memory operand, materializing the
/// address in t0 when the displacement exceeds 12 bits.
fn mem_operand(asm: &mut Riscv64Assembler<'_>, loc: Loc) -> (u8, i32) {
    let (base, disp) = match loc {
        Loc::Sp(disp) => (SP, disp),
        Loc::Interp(disp) => (INTERP_ESP, disp),
        Loc::Reg(_) => (SP, 0),
    };
    if (-2048..2048).contains(&disp) {
        (base, disp)
    } else {
        asm.li32(T0, disp);
        asm.add(T0, base, T0);
        (T0, 0)
    }
}

impl MacroAssembler for Riscv64Backend {
    fn nop(&self) -> &'static [u8] {
        &[0x13, 0x00, 0x00, 0x00]
    }

    fn uses_call_trampolines(&self) -> bool {
        true
    }

    fn emit_call_trampoline(&self, buf: &mut CodeBuffer) -> TrampolineLayout {
        while (buf.offset() + 12) % 8 != 0 {
            buf.emit_bytes(self.nop());
        }
        let start = buf.offset();
        let mut asm = Riscv64Assembler::new(buf);
        asm.auipc(T0, 0);
        asm.ld(T0, T0, 12);
        asm.jr(T0);
        buf.emit_u64(0);
        TrampolineLayout {
            start,
            data: start + 12,
        }
    }

    fn emit_to_interp_stub(&self, buf: &mut CodeBuffer, method: u64) -> ToInterpLayout {
        let start = buf.offset();
        Riscv64Assembler::new(buf).li(METHOD_REG, method as i64);
        let jump = self.emit_call_trampoline(buf);
        ToInterpLayout {
            start,
            method_constant: start,
            jump_word: jump.data,
        }
    }

    fn emit_runtime_stub(&self, buf: &mut CodeBuffer, shape: StubShape, service: u64) {
        let mut asm = Riscv64Assembler::new(buf);
        if shape == StubShape::TailJump {
            asm.li(T0, service as i64);
            asm.jr(T0);
            return;
        }
        asm.addi(SP, SP, -16);
        asm.sd(RA, SP, 8);
        asm.sd(FP, SP, 0);
        asm.mv(FP, SP);
        asm.li(T0, service as i64);
        asm.jalr(RA, T0, 0);
        asm.ld(RA, SP, 8);
        asm.ld(FP, SP, 0);
        asm.addi(SP, SP, 16);
        if shape == StubShape::CallAndJump {
            asm.jr(A0);
        } else {
            asm.ret();
        }
    }

    fn emit_move(&self, buf: &mut CodeBuffer, from: Loc, to: Loc, kind: MoveKind) {
        let double = kind != MoveKind::Float;
        let mut asm = Riscv64Assembler::new(buf);
        match (from, to) {
            (Loc::Reg(src), Loc::Reg(dst)) => {
                if src != dst {
                    asm.fmv(dst, src, double);
                }
            }
            (src, Loc::Reg(dst)) => {
                let (base, disp) = mem_operand(&mut asm, src);
                match dst {
                    VReg::Gp(rd) => asm.ld(rd, base, disp),
                    VReg::Fp(rd) => asm.fload(rd, base, disp, double),
                }
            }
            (Loc::Reg(src), dst) => {
                let (base, disp) = mem_operand(&mut asm, dst);
                match src {
                    VReg::Gp(rs) => asm.sd(rs, base, disp),
                    VReg::Fp(rs) => asm.fstore(rs, base, disp, double),
                }
            }
            (src, dst) => {
                let (base, disp) = mem_operand(&mut asm, src);
                asm.ld(T2, base, disp);
                let (base, disp) = mem_operand(&mut asm, dst);
                asm.sd(T2, base, disp);
            }
        }
    }

    fn emit_load_constant(&self, buf: &mut CodeBuffer, reg: VReg, value: u64) {
        if let VReg::Gp(rd) = reg {
            Riscv64Assembler::new(buf).li(rd, value as i64);
        }
    }

    fn emit_adjust_sp(&self, buf: &mut CodeBuffer, delta: i32) {
        let mut asm = Riscv64Assembler::new(buf);
        let mut remaining = delta;
        while remaining != 0 {
            let step = remaining.clamp(-2032, 2032);
            asm.addi(SP, SP, step);
            remaining -= step;
        }
    }

    fn emit_jump_absolute(&self, buf: &mut CodeBuffer, target: u64) {
        let mut asm = Riscv64Assembler::new(buf);
        asm.li(T0, target as i64);
        asm.jr(T0);
    }

    fn emit_call_absolute(&self, buf: &mut CodeBuffer, target: u64) {
        let mut asm = Riscv64Assembler::new(buf);
        asm.li(T0, target as i64);
        asm.jalr(RA, T0, 0);
    }

    fn emit_jump_via_method(&self, buf: &mut CodeBuffer, entry_offset: i32) {
        let mut asm = Riscv64Assembler::new(buf);
        asm.ld(T0, METHOD_REG, entry_offset);
        asm.jr(T0);
    }

    fn emit_receiver_check(&self, buf: &mut CodeBuffer, miss: u64) {
        let mut asm = Riscv64Assembler::new(buf);
        asm.ld(T2, A1, CLASS_WORD_OFFSET);
        asm.beq_label(T2, IC_DATA_REG, "ic_hit");
        asm.li(T0, miss as i64);
        asm.jr(T0);
        buf.define_label("ic_hit");
    }

    fn emit_frame_enter(&self, buf: &mut CodeBuffer, frame_bytes: u32) {
        {
            let mut asm = Riscv64Assembler::new(buf);
            asm.addi(SP, SP, -16);
            asm.sd(RA, SP, 8);
            asm.sd(FP, SP, 0);
            asm.mv(FP, SP);
        }
        let frame = (frame_bytes + 15) & !15;
        self.emit_adjust_sp(buf, -(frame as i32));
    }

    fn emit_frame_leave_and_return(&self, buf: &mut CodeBuffer) {
        let mut asm = Riscv64Assembler::new(buf);
        asm.mv(SP, FP);
        asm.ld(RA, SP, 8);
        asm.ld(FP, SP, 0);
        asm.addi(SP, SP, 16);
        asm.ret();
    }

    fn method_register(&self) -> VReg {
        VReg::Gp(METHOD_REG)
    }

    fn emit_patchable_call(&self, buf: &mut CodeBuffer) -> usize {
        let offset = buf.offset();
        Riscv64Assembler::new(buf).emit_raw(u_type(OP_JAL, RA, 0));
        offset
    }

    /// Values at or above 2^47 do not fit the sequence; the relocator
    /// rejects them when the constant is patched.
    fn emit_patchable_constant(&self, buf: &mut CodeBuffer, reg: VReg, value: u64) -> usize {
        let offset = buf.offset();
        Riscv64Assembler::new(buf).movptr(reg_num(reg), value & (MOVPTR_LIMIT - 1));
        offset
    }

    fn emit_return(&self, buf: &mut CodeBuffer) {
        Riscv64Assembler::new(buf).ret();
    }
}
