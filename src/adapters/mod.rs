//! The adapter library.
//!
//! Interpreted frames pass every argument on the expression stack, compiled
//! code passes them in registers first. An adapter blob bridges the two for
//! one [`Fingerprint`]:
//!
//! - `i2c`: entered by the interpreter, loads each argument into its compiled
//!   location and jumps to the method's current compiled entry
//! - `c2i_unverified`: entered from a monomorphic inline cache, checks the
//!   receiver's class and falls into `c2i` on a hit
//! - `c2i`: entered from compiled code, spills every argument to the
//!   interpreter's layout and jumps to the interpreter
//!
//! Adapters are shared by every method with the same fingerprint and live as
//! long as the code cache does.

pub mod convention;
pub mod fingerprint;
pub mod native;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::arch::{ArgLocation, Backend, Loc, MoveKind};
use crate::code::cache::{BlobKind, CodeBlob, CodeCache};
use crate::code::codebuf::CodeBuffer;
use crate::error::AdapterError;
use crate::metadata::{COMPILED_ENTRY_OFFSET, Method, MethodId};
use crate::signature::BasicType;

pub use convention::{ArgLayout, c_calling_convention, java_calling_convention};
pub use fingerprint::Fingerprint;
pub use native::NativeWrapper;

/// Argument slots a fingerprint may describe.
pub const MAX_ARGUMENT_SLOTS: usize = 255;

/// Size of one interpreter expression stack element.
const STACK_ELEMENT_SIZE: i32 = 8;

const ENTRY_ALIGNMENT: usize = 16;

/// A generated adapter blob.
pub struct AdapterEntry {
    fingerprint: Fingerprint,
    layout: ArgLayout,
    i2c_entry: u64,
    c2i_entry: u64,
    c2i_unverified_entry: u64,
    blob: CodeBlob,
}

impl AdapterEntry {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Compiled-convention locations of each argument slot.
    pub fn layout(&self) -> &ArgLayout {
        &self.layout
    }

    pub fn i2c_entry(&self) -> u64 {
        self.i2c_entry
    }

    pub fn c2i_entry(&self) -> u64 {
        self.c2i_entry
    }

    pub fn c2i_unverified_entry(&self) -> u64 {
        self.c2i_unverified_entry
    }

    pub fn blob(&self) -> &CodeBlob {
        &self.blob
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.blob.contains(addr)
    }
}

impl fmt::Debug for AdapterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterEntry")
            .field("fingerprint", &format_args!("{}", self.fingerprint))
            .field("i2c", &format_args!("{:#x}", self.i2c_entry))
            .field("c2i", &format_args!("{:#x}", self.c2i_entry))
            .field("c2i_unverified", &format_args!("{:#x}", self.c2i_unverified_entry))
            .finish()
    }
}

fn align16(bytes: u32) -> u32 {
    (bytes + 15) & !15
}

fn move_kind(ty: BasicType) -> MoveKind {
    match ty {
        BasicType::Float => MoveKind::Float,
        BasicType::Double => MoveKind::Double,
        _ => MoveKind::Word,
    }
}

/// Offset of slot `index` from the interpreter's expression stack pointer.
/// The last argument is on top; a wide value lives in its second element.
fn interpreter_offset(index: usize, total: usize, ty: BasicType) -> i32 {
    let off = (total - index - 1) as i32 * STACK_ELEMENT_SIZE;
    if ty.is_wide() { off - STACK_ELEMENT_SIZE } else { off }
}

fn unrepresentable(fingerprint: &Fingerprint, reason: impl Into<String>) -> AdapterError {
    AdapterError::Unrepresentable {
        fingerprint: fingerprint.to_string(),
        reason: reason.into(),
    }
}

/// Process-wide table of adapters and native wrappers.
pub struct AdapterLibrary {
    backend: &'static dyn Backend,
    interpreter_entry: u64,
    ic_miss_entry: u64,
    max_stack_slots: u32,
    trace: bool,
    adapters: Mutex<HashMap<Fingerprint, Arc<AdapterEntry>>>,
    wrappers: Mutex<HashMap<MethodId, Arc<NativeWrapper>>>,
}

impl AdapterLibrary {
    pub fn new(
        backend: &'static dyn Backend,
        interpreter_entry: u64,
        ic_miss_entry: u64,
        max_stack_slots: u32,
        trace: bool,
    ) -> Self {
        Self {
            backend,
            interpreter_entry,
            ic_miss_entry,
            max_stack_slots,
            trace,
            adapters: Mutex::new(HashMap::new()),
            wrappers: Mutex::new(HashMap::new()),
        }
    }

    /// The shared adapter for `fingerprint`, generating it on first use.
    ///
    /// The table stays locked while a missing adapter is generated, so
    /// concurrent requests for one fingerprint produce a single blob.
    pub fn get_or_create(
        &self,
        cache: &CodeCache,
        fingerprint: &Fingerprint,
    ) -> Result<Arc<AdapterEntry>, AdapterError> {
        let mut adapters = self.adapters.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = adapters.get(fingerprint) {
            return Ok(entry.clone());
        }
        let entry = Arc::new(self.generate(cache, fingerprint)?);
        if self.trace {
            info!(fingerprint = %fingerprint, i2c = format_args!("{:#x}", entry.i2c_entry), c2i = format_args!("{:#x}", entry.c2i_entry), "adapter generated");
        } else {
            debug!(fingerprint = %fingerprint, i2c = format_args!("{:#x}", entry.i2c_entry), c2i = format_args!("{:#x}", entry.c2i_entry), "adapter generated");
        }
        adapters.insert(fingerprint.clone(), entry.clone());
        Ok(entry)
    }

    /// The adapter for `method`, recorded on the method after the first call.
    pub fn get_for_method(&self, cache: &CodeCache, method: &Method) -> Result<Arc<AdapterEntry>, AdapterError> {
        if let Some(entry) = method.adapter() {
            return Ok(entry.clone());
        }
        let fingerprint = Fingerprint::for_signature(method.signature(), method.is_static());
        let entry = self.get_or_create(cache, &fingerprint)?;
        Ok(method.set_adapter(entry))
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<Arc<AdapterEntry>> {
        self.adapters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fingerprint)
            .cloned()
    }

    /// The adapter whose code contains `addr`.
    pub fn find_by_address(&self, addr: u64) -> Option<Arc<AdapterEntry>> {
        self.adapters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|entry| entry.contains(addr))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The native wrapper for `method`, generating it on first use.
    pub fn native_wrapper(
        &self,
        cache: &CodeCache,
        method: &Method,
        env: u64,
        mirror: u64,
    ) -> Result<Arc<NativeWrapper>, AdapterError> {
        let mut wrappers = self.wrappers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(wrapper) = wrappers.get(&method.id()) {
            return Ok(wrapper.clone());
        }
        let wrapper = Arc::new(native::generate(self.backend, cache, method, env, mirror)?);
        if self.trace {
            info!(method = %method.name(), entry = format_args!("{:#x}", wrapper.entry()), "native wrapper generated");
        } else {
            debug!(method = %method.name(), entry = format_args!("{:#x}", wrapper.entry()), "native wrapper generated");
        }
        wrappers.insert(method.id(), wrapper.clone());
        Ok(wrapper)
    }

    pub fn find_wrapper_by_address(&self, addr: u64) -> Option<Arc<NativeWrapper>> {
        self.wrappers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|w| w.contains(addr))
            .cloned()
    }

    fn generate(&self, cache: &CodeCache, fingerprint: &Fingerprint) -> Result<AdapterEntry, AdapterError> {
        let types = fingerprint.slot_types();
        if types.len() > MAX_ARGUMENT_SLOTS {
            return Err(unrepresentable(
                fingerprint,
                format!("{} argument slots exceed the limit of {MAX_ARGUMENT_SLOTS}", types.len()),
            ));
        }
        let layout = java_calling_convention(&types, self.backend.java_registers());
        if layout.stack_slots > self.max_stack_slots {
            return Err(unrepresentable(
                fingerprint,
                format!("{} outgoing stack slots exceed the limit of {}", layout.stack_slots, self.max_stack_slots),
            ));
        }

        let mut buf = CodeBuffer::new();
        let nop = self.backend.nop();
        self.gen_i2c(&mut buf, &types, &layout);
        buf.align_with(ENTRY_ALIGNMENT, nop);
        let c2i_unverified = buf.offset();
        self.backend.emit_receiver_check(&mut buf, self.ic_miss_entry);
        let c2i = buf.offset();
        self.gen_c2i(&mut buf, &types, &layout);
        buf.patch_forward_refs()
            .map_err(|e| unrepresentable(fingerprint, e.to_string()))?;

        let code = buf.into_code();
        let slot = cache.allocate(code.len(), ENTRY_ALIGNMENT)?;
        let blob = cache.commit(slot, &code, BlobKind::Adapter, format!("adapter{fingerprint}"), None)?;
        Ok(AdapterEntry {
            fingerprint: fingerprint.clone(),
            layout,
            i2c_entry: blob.start,
            c2i_entry: blob.start + c2i as u64,
            c2i_unverified_entry: blob.start + c2i_unverified as u64,
            blob,
        })
    }

    fn gen_i2c(&self, buf: &mut CodeBuffer, types: &[BasicType], layout: &ArgLayout) {
        let masm = self.backend;
        let ret = masm.return_address_size();
        let comp_bytes = align16(layout.stack_bytes()) as i32;
        if comp_bytes > 0 {
            masm.emit_adjust_sp(buf, -comp_bytes);
            if ret > 0 {
                // keep the return address on top of the outgoing arguments
                masm.emit_move(buf, Loc::Sp(comp_bytes), Loc::Sp(0), MoveKind::Word);
            }
        }
        for (i, (&ty, &location)) in types.iter().zip(&layout.locations).enumerate() {
            let dst = match location {
                ArgLocation::Reg(reg) => Loc::Reg(reg),
                ArgLocation::Stack(slot) => Loc::Sp(ret + slot as i32 * 4),
                ArgLocation::Unused => continue,
            };
            let src = Loc::Interp(interpreter_offset(i, types.len(), ty));
            masm.emit_move(buf, src, dst, move_kind(ty));
        }
        masm.emit_jump_via_method(buf, COMPILED_ENTRY_OFFSET);
    }

    fn gen_c2i(&self, buf: &mut CodeBuffer, types: &[BasicType], layout: &ArgLayout) {
        let masm = self.backend;
        let ret = masm.return_address_size();
        let extraspace = align16(types.len() as u32 * STACK_ELEMENT_SIZE as u32) as i32;
        masm.emit_adjust_sp(buf, -extraspace);
        for (i, (&ty, &location)) in types.iter().zip(&layout.locations).enumerate() {
            let src = match location {
                ArgLocation::Reg(reg) => Loc::Reg(reg),
                ArgLocation::Stack(slot) => Loc::Sp(extraspace + ret + slot as i32 * 4),
                ArgLocation::Unused => continue,
            };
            let dst = Loc::Sp(interpreter_offset(i, types.len(), ty));
            masm.emit_move(buf, src, dst, move_kind(ty));
        }
        masm.emit_jump_absolute(buf, self.interpreter_entry);
    }
}

impl fmt::Debug for AdapterLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterLibrary")
            .field("arch", &self.backend.arch())
            .field("adapters", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Arch, backend_for};
    use crate::metadata::{MetadataRegistry, MethodFlags};
    use crate::signature::Signature;
    use std::thread;

    fn library(arch: Arch) -> (CodeCache, AdapterLibrary) {
        let cache = CodeCache::new(256 * 1024, false).unwrap();
        let lib = AdapterLibrary::new(backend_for(arch), 0x7000_1000, 0x7000_2000, 256, false);
        (cache, lib)
    }

    fn fp(desc: &str, is_static: bool) -> Fingerprint {
        Fingerprint::for_signature(&Signature::parse(desc).unwrap(), is_static)
    }

    #[test]
    fn test_shared_by_fingerprint() {
        let (cache, lib) = library(Arch::X86_64);
        let a = lib.get_or_create(&cache, &fp("(IZ)V", false)).unwrap();
        let b = lib.get_or_create(&cache, &fp("(BC)J", false)).unwrap();
        let c = lib.get_or_create(&cache, &fp("(IF)V", false)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(lib.len(), 2);
    }

    #[test]
    fn test_entry_layout() {
        for arch in Arch::ALL {
            let (cache, lib) = library(arch);
            let entry = lib.get_or_create(&cache, &fp("(JDLjava/lang/Object;)V", false)).unwrap();
            assert_eq!(entry.i2c_entry(), entry.blob().start);
            assert_eq!(entry.c2i_unverified_entry() % ENTRY_ALIGNMENT as u64, 0);
            assert!(entry.c2i_unverified_entry() < entry.c2i_entry());
            assert!(entry.contains(entry.c2i_entry()));
            assert_eq!(cache.find_blob(entry.c2i_entry()).unwrap().kind, BlobKind::Adapter);
            assert!(Arc::ptr_eq(&lib.find_by_address(entry.c2i_entry()).unwrap(), &entry));
        }
    }

    #[test]
    fn test_stack_budget() {
        let cache = CodeCache::new(256 * 1024, false).unwrap();
        let lib = AdapterLibrary::new(backend_for(Arch::X86_64), 0x1000, 0x2000, 4, false);
        // 6 integer registers; the remaining 4 longs need 8 slots
        let err = lib.get_or_create(&cache, &fp("(JJJJJJJJJJ)V", true)).unwrap_err();
        assert!(matches!(err, AdapterError::Unrepresentable { .. }));
        assert!(lib.is_empty());
        assert!(lib.get_or_create(&cache, &fp("(JJJJJJJJ)V", true)).is_ok());
    }

    #[test]
    fn test_slot_limit() {
        let (cache, lib) = library(Arch::Aarch64);
        let types = vec![BasicType::Int; MAX_ARGUMENT_SLOTS + 1];
        let err = lib
            .get_or_create(&cache, &Fingerprint::from_slot_types(&types))
            .unwrap_err();
        assert!(err.to_string().contains("argument slots"));
    }

    #[test]
    fn test_recorded_on_method() {
        let (cache, lib) = library(Arch::Riscv64);
        let registry = MetadataRegistry::new();
        let k = registry.add_class("K", None).unwrap();
        let m = registry
            .add_method(k, "f", Signature::parse("(I)I").unwrap(), MethodFlags::INSTANCE)
            .unwrap();
        let method = registry.method(m).unwrap();
        let first = lib.get_for_method(&cache, &method).unwrap();
        let again = lib.get_for_method(&cache, &method).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(Arc::ptr_eq(method.adapter().unwrap(), &first));
        assert_eq!(first.fingerprint(), &fp("(I)V", false));
    }

    #[test]
    fn test_concurrent_requests_generate_once() {
        let (cache, lib) = library(Arch::X86_64);
        let fingerprint = fp("(ILjava/lang/String;D)V", false);
        let entries: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| s.spawn(|| lib.get_or_create(&cache, &fingerprint).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(Arc::ptr_eq(&entries[0], &entries[1]));
        let adapters = cache.blobs().into_iter().filter(|b| b.kind == BlobKind::Adapter).count();
        assert_eq!(adapters, 1);
    }
}
