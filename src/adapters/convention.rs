//! Argument placement for the managed and native conventions.
//!
//! Stack slots are 4-byte units. Managed arguments are placed in order: a
//! general register while any remain, otherwise the next even stack slot.
//! Ints and floats take one slot, longs, doubles and references two.

use serde::Serialize;

use crate::arch::{ArgLocation, ArgRegisters};
use crate::signature::BasicType;

/// Where each argument slot of a signature goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArgLayout {
    pub locations: Vec<ArgLocation>,
    /// Outgoing stack slots used, rounded up to an even count
    pub stack_slots: u32,
}

impl ArgLayout {
    pub fn stack_bytes(&self) -> u32 {
        self.stack_slots * 4
    }
}

fn align2(slots: u32) -> u32 {
    (slots + 1) & !1
}

/// Lay out arguments under the managed convention.
pub fn java_calling_convention(types: &[BasicType], regs: ArgRegisters) -> ArgLayout {
    let mut int_args = 0;
    let mut fp_args = 0;
    let mut stk = 0u32;
    let mut locations = Vec::with_capacity(types.len());

    for &ty in types {
        let location = match ty {
            BasicType::Void => ArgLocation::Unused,
            BasicType::Float | BasicType::Double => {
                if let Some(&reg) = regs.float.get(fp_args) {
                    fp_args += 1;
                    ArgLocation::Reg(reg)
                } else {
                    stk = align2(stk);
                    let slot = stk;
                    stk += if ty == BasicType::Float { 1 } else { 2 };
                    ArgLocation::Stack(slot)
                }
            }
            _ => {
                if let Some(&reg) = regs.int.get(int_args) {
                    int_args += 1;
                    ArgLocation::Reg(reg)
                } else {
                    stk = align2(stk);
                    let slot = stk;
                    stk += if is_narrow_int(ty) { 1 } else { 2 };
                    ArgLocation::Stack(slot)
                }
            }
        };
        locations.push(location);
    }

    ArgLayout {
        locations,
        stack_slots: align2(stk),
    }
}

/// Lay out arguments under the platform C convention. Every stack argument
/// takes a full 8-byte word.
pub fn c_calling_convention(types: &[BasicType], regs: ArgRegisters, floats_use_int_registers: bool) -> ArgLayout {
    let mut int_args = 0;
    let mut fp_args = 0;
    let mut stk = 0u32;
    let mut locations = Vec::with_capacity(types.len());

    for &ty in types {
        let location = match ty {
            BasicType::Void => ArgLocation::Unused,
            BasicType::Float | BasicType::Double => {
                if let Some(&reg) = regs.float.get(fp_args) {
                    fp_args += 1;
                    ArgLocation::Reg(reg)
                } else if let Some(&reg) = regs.int.get(int_args).filter(|_| floats_use_int_registers) {
                    int_args += 1;
                    ArgLocation::Reg(reg)
                } else {
                    let slot = stk;
                    stk += 2;
                    ArgLocation::Stack(slot)
                }
            }
            _ => {
                if let Some(&reg) = regs.int.get(int_args) {
                    int_args += 1;
                    ArgLocation::Reg(reg)
                } else {
                    let slot = stk;
                    stk += 2;
                    ArgLocation::Stack(slot)
                }
            }
        };
        locations.push(location);
    }

    ArgLayout {
        locations,
        stack_slots: stk,
    }
}

fn is_narrow_int(ty: BasicType) -> bool {
    matches!(
        ty,
        BasicType::Boolean | BasicType::Char | BasicType::Byte | BasicType::Short | BasicType::Int
    )
}
