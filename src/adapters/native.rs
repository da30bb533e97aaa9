//! Wrappers that let compiled code call native methods.
//!
//! A wrapper is entered like compiled code, builds a frame large enough for
//! the native call's stack arguments, shuffles the managed arguments into the
//! platform C convention behind a leading environment pointer (and the class
//! mirror for static methods), and calls the bound native function.

use std::fmt;

use crate::arch::{ArgLocation, Backend, Loc, VReg};
use crate::code::cache::{BlobKind, CodeBlob, CodeCache};
use crate::code::codebuf::CodeBuffer;
use crate::error::AdapterError;
use crate::metadata::{Method, MethodId};
use crate::signature::BasicType;

use super::{Fingerprint, MAX_ARGUMENT_SLOTS, align16, c_calling_convention, java_calling_convention, move_kind};

/// Saved frame pointer and return address between a wrapper's frame and its
/// incoming stack arguments.
const FRAME_RECORD_SIZE: i32 = 16;

pub struct NativeWrapper {
    method: MethodId,
    function: u64,
    frame_bytes: u32,
    blob: CodeBlob,
}

impl NativeWrapper {
    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn entry(&self) -> u64 {
        self.blob.start
    }

    /// The native function the wrapper calls.
    pub fn function(&self) -> u64 {
        self.function
    }

    pub fn frame_bytes(&self) -> u32 {
        self.frame_bytes
    }

    pub fn blob(&self) -> &CodeBlob {
        &self.blob
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.blob.contains(addr)
    }
}

impl fmt::Debug for NativeWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeWrapper")
            .field("method", &self.method)
            .field("entry", &format_args!("{:#x}", self.entry()))
            .field("function", &format_args!("{:#x}", self.function))
            .finish()
    }
}

pub(super) fn generate(
    backend: &'static dyn Backend,
    cache: &CodeCache,
    method: &Method,
    env: u64,
    mirror: u64,
) -> Result<NativeWrapper, AdapterError> {
    let function = method
        .native_function()
        .ok_or(AdapterError::UnboundNative(method.id()))?;
    let is_static = method.is_static();
    let in_types = method.signature().to_slot_types(!is_static);
    let unrepresentable = |reason: &str| AdapterError::Unrepresentable {
        fingerprint: Fingerprint::from_slot_types(&in_types).to_string(),
        reason: reason.to_string(),
    };

    let hidden = if is_static { 2 } else { 1 };
    let mut out_types = Vec::with_capacity(in_types.len() + hidden);
    out_types.push(BasicType::Address);
    if is_static {
        out_types.push(BasicType::Object);
    }
    out_types.extend_from_slice(&in_types);
    if out_types.len() > MAX_ARGUMENT_SLOTS {
        return Err(unrepresentable("too many argument slots"));
    }

    let in_layout = java_calling_convention(&in_types, backend.java_registers());
    let c_regs = backend.c_registers();
    let out_layout = c_calling_convention(&out_types, c_regs, backend.c_floats_use_int_registers());
    let frame_bytes = align16(out_layout.stack_bytes());

    let mut buf = CodeBuffer::new();
    backend.emit_frame_enter(&mut buf, frame_bytes);

    // Highest argument first: each C register is also the managed register
    // of a later argument, which by then has been read.
    let mut written: Vec<VReg> = Vec::new();
    for i in (0..in_types.len()).rev() {
        let ty = in_types[i];
        let src = match in_layout.locations[i] {
            ArgLocation::Reg(reg) => {
                if written.contains(&reg) {
                    return Err(unrepresentable("argument shuffle cycle"));
                }
                Loc::Reg(reg)
            }
            ArgLocation::Stack(slot) => Loc::Sp(frame_bytes as i32 + FRAME_RECORD_SIZE + slot as i32 * 4),
            ArgLocation::Unused => continue,
        };
        let dst = match out_layout.locations[i + hidden] {
            ArgLocation::Reg(reg) => {
                written.push(reg);
                Loc::Reg(reg)
            }
            ArgLocation::Stack(slot) => Loc::Sp(slot as i32 * 4),
            ArgLocation::Unused => continue,
        };
        if src != dst {
            backend.emit_move(&mut buf, src, dst, move_kind(ty));
        }
    }

    backend.emit_load_constant(&mut buf, c_regs.int[0], env);
    if is_static {
        backend.emit_load_constant(&mut buf, c_regs.int[1], mirror);
    }
    backend.emit_call_absolute(&mut buf, function);
    backend.emit_frame_leave_and_return(&mut buf);

    let code = buf.into_code();
    let slot = cache.allocate(code.len(), 16)?;
    let blob = cache.commit(
        slot,
        &code,
        BlobKind::NativeWrapper,
        format!("native {}", method.name()),
        None,
    )?;
    Ok(NativeWrapper {
        method: method.id(),
        function,
        frame_bytes,
        blob,
    })
}
