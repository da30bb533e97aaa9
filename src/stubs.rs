//! The runtime stub table.
//!
//! Each runtime service compiled code can call gets one persistent stub in
//! the code cache, generated once at start-up. The table is declared with
//! [`runtime_stubs!`]; generation either produces every stub or none.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use crate::arch::Backend;
use crate::code::cache::{BlobKind, CodeCache, CodeSlot};
use crate::code::codebuf::CodeBuffer;
use crate::error::StubError;

/// How a stub hands control to and back from its service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StubShape {
    /// Call the service in a small frame and return its result
    CallAndReturn,
    /// Call the service, then jump to the address it returns
    CallAndJump,
    /// Jump straight to the service
    TailJump,
}

macro_rules! runtime_stubs {
    ($( $variant:ident => $name:literal, $shape:ident, $signature:literal; )*) => {
        /// A named runtime service.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(rename_all = "snake_case")]
        pub enum RuntimeStubId {
            $( $variant, )*
        }

        impl RuntimeStubId {
            pub const ALL: &'static [RuntimeStubId] = &[$( RuntimeStubId::$variant, )*];

            pub fn name(self) -> &'static str {
                match self {
                    $( RuntimeStubId::$variant => $name, )*
                }
            }

            pub fn shape(self) -> StubShape {
                match self {
                    $( RuntimeStubId::$variant => StubShape::$shape, )*
                }
            }

            /// Abstract signature of the service, for diagnostics.
            pub fn signature(self) -> &'static str {
                match self {
                    $( RuntimeStubId::$variant => $signature, )*
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $( $name => Some(RuntimeStubId::$variant), )*
                    _ => None,
                }
            }
        }
    };
}

runtime_stubs! {
    ResolveStaticCall => "resolve_static_call", CallAndJump, "(thread) -> entry";
    ResolveOptVirtualCall => "resolve_opt_virtual_call", CallAndJump, "(thread) -> entry";
    ResolveVirtualCall => "resolve_virtual_call", CallAndJump, "(thread, receiver) -> entry";
    ResolveInterfaceCall => "resolve_interface_call", CallAndJump, "(thread, receiver) -> entry";
    IcMiss => "ic_miss", CallAndJump, "(thread, receiver) -> entry";
    HandleWrongMethod => "handle_wrong_method", CallAndJump, "(thread) -> entry";
    VtableDispatch => "vtable_dispatch", CallAndJump, "(thread, receiver) -> entry";
    ItableDispatch => "itable_dispatch", CallAndJump, "(thread, receiver) -> entry";
    InterpreterEntry => "interpreter_entry", TailJump, "(method, esp) -> result";
    NewInstance => "new_instance", CallAndReturn, "(thread, klass) -> oop";
    NewArray => "new_array", CallAndReturn, "(thread, klass, int) -> oop";
    MonitorEnter => "monitor_enter", CallAndReturn, "(thread, oop, lock) -> void";
    MonitorExit => "monitor_exit", CallAndReturn, "(thread, oop, lock) -> void";
    ArrayCopy => "arraycopy", CallAndReturn, "(src, int, dst, int, int) -> int";
    PreWriteBarrier => "pre_write_barrier", CallAndReturn, "(oop, thread) -> void";
    PostWriteBarrier => "post_write_barrier", CallAndReturn, "(card, thread) -> void";
    SafepointHandler => "safepoint_handler", CallAndReturn, "(thread) -> void";
    Deoptimize => "deoptimize", CallAndJump, "(thread) -> entry";
    ForwardException => "forward_exception", TailJump, "(thread, oop) -> void";
}

impl fmt::Display for RuntimeStubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Supplies the implementation address of each runtime service.
pub trait RuntimeServices {
    fn service_address(&self, id: RuntimeStubId) -> Option<u64>;
}

/// A [`RuntimeServices`] backed by a map.
#[derive(Debug, Clone, Default)]
pub struct ServiceTable {
    addresses: HashMap<RuntimeStubId, u64>,
}

extern "C" fn unavailable_service() {
    std::process::abort();
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: RuntimeStubId, address: u64) -> Self {
        self.addresses.insert(id, address);
        self
    }

    pub fn insert(&mut self, id: RuntimeStubId, address: u64) {
        self.addresses.insert(id, address);
    }

    /// Every service bound to a routine that aborts the process.
    ///
    /// Used by tooling and tests that link code without running it.
    pub fn synthetic() -> Self {
        let address = unavailable_service as usize as u64;
        Self {
            addresses: RuntimeStubId::ALL.iter().map(|&id| (id, address)).collect(),
        }
    }
}

impl RuntimeServices for ServiceTable {
    fn service_address(&self, id: RuntimeStubId) -> Option<u64> {
        self.addresses.get(&id).copied()
    }
}

/// One generated stub.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStub {
    pub id: RuntimeStubId,
    pub name: &'static str,
    pub signature: &'static str,
    pub shape: StubShape,
    pub entry: u64,
    pub size: usize,
    pub service: u64,
}

impl RuntimeStub {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.entry && addr < self.entry + self.size as u64
    }
}

#[derive(Debug)]
pub struct RuntimeStubTable {
    stubs: Vec<RuntimeStub>,
}

impl RuntimeStubTable {
    /// Generate every stub into `cache`.
    ///
    /// Nothing is published unless every stub could be generated.
    pub fn generate(
        cache: &CodeCache,
        backend: &dyn Backend,
        services: &dyn RuntimeServices,
        trace: bool,
    ) -> Result<Self, StubError> {
        let mut bodies = Vec::with_capacity(RuntimeStubId::ALL.len());
        for &id in RuntimeStubId::ALL {
            let service = services
                .service_address(id)
                .ok_or(StubError::MissingService(id.name()))?;
            let mut buf = CodeBuffer::new();
            backend.emit_runtime_stub(&mut buf, id.shape(), service);
            bodies.push((id, service, buf.into_code()));
        }

        let mark = cache.mark();
        let mut pending = Vec::with_capacity(bodies.len());
        for (id, service, code) in bodies {
            match cache.allocate(code.len(), 16) {
                Ok(slot) => pending.push((id, service, code, slot)),
                Err(source) => {
                    cache.unwind(mark);
                    return Err(StubError::Generation { name: id.name(), source });
                }
            }
        }
        let stubs = Self::publish(cache, mark, pending, trace)?;
        Ok(Self { stubs })
    }

    /// Commit every allocated stub, unwinding the cache back to `mark` if any
    /// commit fails.
    fn publish(
        cache: &CodeCache,
        mark: usize,
        pending: Vec<(RuntimeStubId, u64, Vec<u8>, CodeSlot)>,
        trace: bool,
    ) -> Result<Vec<RuntimeStub>, StubError> {
        let mut stubs = Vec::with_capacity(pending.len());
        for (id, service, code, slot) in pending {
            let blob = match cache.commit(slot, &code, BlobKind::RuntimeStub, id.name(), None) {
                Ok(blob) => blob,
                Err(source) => {
                    cache.unwind(mark);
                    return Err(StubError::Generation { name: id.name(), source });
                }
            };
            if trace {
                info!(stub = id.name(), entry = format_args!("{:#x}", blob.start), size = code.len(), "runtime stub generated");
            } else {
                debug!(stub = id.name(), entry = format_args!("{:#x}", blob.start), size = code.len(), "runtime stub generated");
            }
            stubs.push(RuntimeStub {
                id,
                name: id.name(),
                signature: id.signature(),
                shape: id.shape(),
                entry: blob.start,
                size: code.len(),
                service,
            });
        }
        Ok(stubs)
    }

    pub fn get(&self, id: RuntimeStubId) -> &RuntimeStub {
        &self.stubs[id as usize]
    }

    pub fn entry(&self, id: RuntimeStubId) -> u64 {
        self.get(id).entry
    }

    /// Linear lookup by name; diagnostics only.
    pub fn find_by_name(&self, name: &str) -> Option<&RuntimeStub> {
        self.stubs.iter().find(|s| s.name == name)
    }

    /// The stub whose code contains `addr`.
    pub fn find_by_address(&self, addr: u64) -> Option<&RuntimeStub> {
        self.stubs.iter().find(|s| s.contains(addr))
    }

    /// The stub whose entry is exactly `addr`.
    pub fn stub_at(&self, addr: u64) -> Option<RuntimeStubId> {
        self.stubs.iter().find(|s| s.entry == addr).map(|s| s.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuntimeStub> {
        self.stubs.iter()
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }
}
