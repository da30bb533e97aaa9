//! Static and optimized-virtual call sites.
//!
//! A direct call is bound to exactly one method, so there is nothing to
//! speculate on. The site is in one of three states, read off its
//! destination:
//!
//! - clean: the kind's resolve stub
//! - interpreted: the site's own to-interpreter stub, which loads the callee
//!   into the method register and jumps through a patchable word
//! - compiled: anything else, the callee's verified entry
//!
//! Once the callee gets compiled code, the stub's jump word is retargeted
//! instead of the call site, so callers bound to the interpreter start running
//! compiled code without being touched.

use std::fmt;

use serde::Serialize;

use crate::callsite::CallSite;
use crate::code::cache::CodeCache;
use crate::error::PatchError;
use crate::guard::PatchScope;

/// A to-interpreter stub in an artifact's stub section, by offset from the
/// artifact's start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToInterpStub {
    pub start: u32,
    pub method_constant: u32,
    /// 8-byte aligned jump destination
    pub jump_word: u32,
}

impl ToInterpStub {
    pub fn start_address(&self, base: u64) -> u64 {
        base + self.start as u64
    }

    pub fn jump_word_address(&self, base: u64) -> u64 {
        base + self.jump_word as u64
    }

    /// Where the stub currently jumps. Lock-free.
    pub fn target(&self, cache: &CodeCache, base: u64) -> Result<u64, PatchError> {
        Ok(cache.load_u64(self.jump_word_address(base))?)
    }

    pub fn set_target(
        &self,
        cache: &CodeCache,
        base: u64,
        target: u64,
        _scope: &PatchScope<'_>,
    ) -> Result<(), PatchError> {
        Ok(cache.store_u64(self.jump_word_address(base), target)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectCallState {
    Clean,
    Interpreted,
    Compiled,
}

impl fmt::Display for DirectCallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DirectCallState::Clean => "clean",
            DirectCallState::Interpreted => "interpreted",
            DirectCallState::Compiled => "compiled",
        };
        f.write_str(name)
    }
}

/// A static or optimized-virtual call site.
#[derive(Clone, Copy)]
pub struct DirectCall<'a> {
    site: CallSite<'a>,
    stub: &'a ToInterpStub,
    resolve_stub: u64,
}

impl<'a> DirectCall<'a> {
    /// `None` unless `site` carries a to-interpreter stub.
    pub fn new(site: CallSite<'a>, resolve_stub: u64) -> Option<Self> {
        let stub = site.to_interp_stub()?;
        Some(Self {
            site,
            stub,
            resolve_stub,
        })
    }

    pub fn site(&self) -> &CallSite<'a> {
        &self.site
    }

    fn base(&self) -> u64 {
        self.site.artifact().start()
    }

    pub fn stub_address(&self) -> u64 {
        self.stub.start_address(self.base())
    }

    /// Where the to-interpreter stub currently jumps.
    pub fn stub_target(&self) -> Result<u64, PatchError> {
        self.stub.target(self.site.cache(), self.base())
    }

    pub fn state(&self) -> Result<DirectCallState, PatchError> {
        let destination = self.site.destination()?;
        Ok(if destination == self.resolve_stub {
            DirectCallState::Clean
        } else if destination == self.stub_address() {
            DirectCallState::Interpreted
        } else {
            DirectCallState::Compiled
        })
    }

    /// Send the next call back through resolution. Returns whether the
    /// destination changed.
    ///
    /// The stub keeps its jump word, so a call already past the site
    /// finishes against the old target.
    pub fn set_to_clean(&self, scope: &PatchScope<'_>) -> Result<bool, PatchError> {
        if self.site.destination()? == self.resolve_stub {
            return Ok(false);
        }
        self.site.set_destination(self.resolve_stub, scope)?;
        Ok(true)
    }

    /// Bind the call to the interpreter through the stub.
    ///
    /// The stub is complete before the call site points at it.
    pub fn set_to_interpreted(&self, entry: u64, scope: &PatchScope<'_>) -> Result<(), PatchError> {
        self.stub.set_target(self.site.cache(), self.base(), entry, scope)?;
        self.site.set_destination(self.stub_address(), scope)
    }

    /// Retarget the stub only; the call site keeps pointing at it.
    pub fn retarget_stub(&self, entry: u64, scope: &PatchScope<'_>) -> Result<(), PatchError> {
        self.stub.set_target(self.site.cache(), self.base(), entry, scope)
    }

    /// Bind the call straight to compiled code.
    pub fn set_to_compiled(&self, entry: u64, scope: &PatchScope<'_>) -> Result<(), PatchError> {
        self.site.set_destination(entry, scope)
    }
}

impl fmt::Debug for DirectCall<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectCall")
            .field("site", &self.site)
            .field("stub", &format_args!("{:#x}", self.stub_address()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Arch, backend_for};
    use crate::gc::HeapRefTable;
    use crate::guard::PatchingLock;
    use crate::installer::{InstallEnv, Installer};
    use crate::metadata::{MetadataRegistry, MethodFlags};
    use crate::reloc::{CallKind, CompilationResult, RelocationKind};
    use crate::signature::Signature;
    use crate::stubs::{RuntimeStubId, RuntimeStubTable, ServiceTable};

    struct Fixture {
        cache: CodeCache,
        stubs: RuntimeStubTable,
        registry: MetadataRegistry,
        gc: HeapRefTable,
        lock: PatchingLock,
    }

    impl Fixture {
        fn new(arch: Arch) -> Self {
            let cache = CodeCache::new(256 * 1024, false).unwrap();
            let stubs = RuntimeStubTable::generate(&cache, backend_for(arch), &ServiceTable::synthetic(), false).unwrap();
            Self {
                cache,
                stubs,
                registry: MetadataRegistry::new(),
                gc: HeapRefTable::new(),
                lock: PatchingLock::new(),
            }
        }

        fn env(&self) -> InstallEnv<'_> {
            InstallEnv {
                cache: &self.cache,
                stubs: &self.stubs,
                metadata: &self.registry,
                gc: &self.gc,
            }
        }
    }

    /// x86_64 caller: three nops then `call rel32` with its field 4-aligned.
    fn static_caller(callee: crate::metadata::MethodId) -> CompilationResult {
        let code = vec![0x90, 0x90, 0x90, 0xE8, 0, 0, 0, 0, 0xC3];
        CompilationResult::new("caller", callee, code).relocate(
            3,
            RelocationKind::MethodCall {
                callee,
                kind: CallKind::Static,
            },
        )
    }

    #[test]
    fn test_state_walk() {
        let fx = Fixture::new(Arch::X86_64);
        let k = fx.registry.add_class("K", None).unwrap();
        let callee = fx
            .registry
            .add_method(k, "f", Signature::parse("()V").unwrap(), MethodFlags::STATIC)
            .unwrap();
        let installer = Installer::new(backend_for(Arch::X86_64), None, None, false);
        let artifact = installer.install(&fx.env(), &static_caller(callee)).unwrap();
        let resolve = fx.stubs.entry(RuntimeStubId::ResolveStaticCall);
        let site = CallSite::new(&artifact, 0, &fx.cache, backend_for(Arch::X86_64)).unwrap();
        let call = DirectCall::new(site, resolve).unwrap();

        assert_eq!(call.state().unwrap(), DirectCallState::Clean);
        let scope = fx.lock.lock();
        assert!(!call.set_to_clean(&scope).unwrap());

        call.set_to_interpreted(0x7000_0000, &scope).unwrap();
        assert_eq!(call.state().unwrap(), DirectCallState::Interpreted);
        assert_eq!(call.stub_target().unwrap(), 0x7000_0000);
        assert!(artifact.contains(call.stub_address()));

        let compiled = artifact.verified_entry();
        call.set_to_compiled(compiled, &scope).unwrap();
        assert_eq!(call.state().unwrap(), DirectCallState::Compiled);

        assert!(call.set_to_clean(&scope).unwrap());
        assert!(!call.set_to_clean(&scope).unwrap());
        assert_eq!(call.state().unwrap(), DirectCallState::Clean);
        // an in-flight call through the stub still lands somewhere valid
        assert_eq!(call.stub_target().unwrap(), 0x7000_0000);
    }

    #[test]
    fn test_trampoline_architectures() {
        for arch in [Arch::Aarch64, Arch::Riscv64] {
            let fx = Fixture::new(arch);
            let k = fx.registry.add_class("K", None).unwrap();
            let callee = fx
                .registry
                .add_method(k, "g", Signature::parse("(I)V").unwrap(), MethodFlags::STATIC)
                .unwrap();
            // bl / jal with a zero offset, then ret
            let code = match arch {
                Arch::Aarch64 => [0x9400_0000u32, 0xD65F_03C0],
                _ => [0x0000_00EFu32, 0x0000_8067],
            };
            let bytes = code.iter().flat_map(|w| w.to_le_bytes()).collect();
            let result = CompilationResult::new("caller", callee, bytes).relocate(
                0,
                RelocationKind::MethodCall {
                    callee,
                    kind: CallKind::OptVirtual,
                },
            );
            let installer = Installer::new(backend_for(arch), None, None, false);
            let artifact = installer.install(&fx.env(), &result).unwrap();
            let resolve = fx.stubs.entry(RuntimeStubId::ResolveOptVirtualCall);
            let site = CallSite::new(&artifact, 0, &fx.cache, backend_for(arch)).unwrap();
            let call = DirectCall::new(site, resolve).unwrap();
            assert_eq!(call.state().unwrap(), DirectCallState::Clean);

            let scope = fx.lock.lock();
            call.set_to_interpreted(0x1234_5678, &scope).unwrap();
            assert_eq!(call.state().unwrap(), DirectCallState::Interpreted);
            call.retarget_stub(0x9999_0000, &scope).unwrap();
            assert_eq!(call.stub_target().unwrap(), 0x9999_0000);
            assert_eq!(call.state().unwrap(), DirectCallState::Interpreted);
        }
    }
}
