//! The code installer.
//!
//! Turns a [`CompilationResult`] into a [`CompiledArtifact`]. The artifact's
//! slot is laid out as
//!
//! ```text
//! | instructions | stub section | literal area |
//! ```
//!
//! where the stub section holds the call trampolines and to-interpreter stubs
//! the installer generates for method call sites. The whole image is assembled
//! and patched in a private buffer, then committed to the code cache in one
//! step: nothing is visible to other threads until every relocation has been
//! applied. Any failure releases the slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, info, trace};

use crate::arch::{Backend, ToInterpLayout, TrampolineLayout};
use crate::callsite::{CallSiteKind, CallSiteRecord, PatchSite};
use crate::code::artifact::{ArtifactId, ArtifactLayout, ArtifactParts, CompiledArtifact};
use crate::code::cache::{BlobKind, CodeCache, CodeSlot};
use crate::code::codebuf::CodeBuffer;
use crate::config::CompressedEncoding;
use crate::direct_call::ToInterpStub;
use crate::error::InstallError;
use crate::gc::GcHooks;
use crate::ic::InlineCache;
use crate::metadata::{MetadataRef, MetadataResolver};
use crate::reloc::{CallKind, CompilationResult, ConstantWidth, ForeignTarget, RelocationKind};
use crate::stubs::{RuntimeStubId, RuntimeStubTable};

const ARTIFACT_ALIGNMENT: usize = 64;

/// The resolve stub a clean call site of `kind` is bound to.
pub fn resolve_stub_for(kind: CallKind) -> RuntimeStubId {
    match kind {
        CallKind::Static => RuntimeStubId::ResolveStaticCall,
        CallKind::OptVirtual => RuntimeStubId::ResolveOptVirtualCall,
        CallKind::Virtual => RuntimeStubId::ResolveVirtualCall,
        CallKind::Interface => RuntimeStubId::ResolveInterfaceCall,
    }
}

/// Shared state an installation reads.
#[derive(Clone, Copy)]
pub struct InstallEnv<'a> {
    pub cache: &'a CodeCache,
    pub stubs: &'a RuntimeStubTable,
    pub metadata: &'a dyn MetadataResolver,
    pub gc: &'a dyn GcHooks,
}

/// Stub-section code generated for one method call relocation.
#[derive(Debug, Clone, Copy, Default)]
struct CallStubs {
    trampoline: Option<TrampolineLayout>,
    to_interp: Option<ToInterpLayout>,
}

/// A heap reference to register once the artifact is published.
struct PendingReference {
    offset: usize,
    value: u64,
    narrow: bool,
}

/// A patch to re-decode when verification is enabled.
#[cfg_attr(not(feature = "verify"), allow(dead_code))]
enum Check {
    Constant { offset: usize, width: ConstantWidth, expected: u64 },
    Data { offset: usize, expected: u64 },
    Call { offset: usize, expected: u64 },
    Poll { offset: usize, mode: crate::reloc::PollMode, expected: u64 },
}

pub struct Installer {
    backend: &'static dyn Backend,
    compressed_oops: Option<CompressedEncoding>,
    compressed_class_pointers: Option<CompressedEncoding>,
    trace: bool,
    next_id: AtomicU32,
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

impl Installer {
    pub fn new(
        backend: &'static dyn Backend,
        compressed_oops: Option<CompressedEncoding>,
        compressed_class_pointers: Option<CompressedEncoding>,
        trace: bool,
    ) -> Self {
        Self {
            backend,
            compressed_oops,
            compressed_class_pointers,
            trace,
            next_id: AtomicU32::new(1),
        }
    }

    pub fn backend(&self) -> &'static dyn Backend {
        self.backend
    }

    pub fn compressed_oops(&self) -> Option<CompressedEncoding> {
        self.compressed_oops
    }

    /// Install `result`. On error nothing is published.
    pub fn install(&self, env: &InstallEnv<'_>, result: &CompilationResult) -> Result<CompiledArtifact, InstallError> {
        let code_size = result.code.len();
        if result.verified_entry >= code_size {
            return Err(InstallError::BadEntryPoint {
                offset: result.verified_entry,
                len: code_size,
            });
        }
        for reloc in &result.relocations {
            if reloc.offset >= code_size {
                return Err(InstallError::OffsetOutOfBounds {
                    offset: reloc.offset,
                    len: code_size,
                });
            }
        }

        let (stub_code, call_stubs) = self.emit_stub_section(env, result)?;
        let stub_offset = align_up(code_size, 8);
        let data_alignment = result.data_alignment.max(8).next_power_of_two();
        let data_offset = align_up(stub_offset + stub_code.len(), data_alignment);
        let layout = ArtifactLayout {
            code_size,
            stub_offset,
            data_offset,
            data_size: result.data.len(),
        };
        let total = (data_offset + result.data.len()).max(1);

        let slot = env.cache.allocate(total, ARTIFACT_ALIGNMENT.max(data_alignment))?;
        match self.build(env, result, layout, &slot, &stub_code, &call_stubs) {
            Ok((image, call_sites, references)) => {
                let id = ArtifactId(self.next_id.fetch_add(1, Ordering::Relaxed));
                let base = slot.start();
                let blob = env
                    .cache
                    .commit(slot, &image, BlobKind::Artifact, result.name.clone(), Some(id))?;
                for r in references {
                    env.gc
                        .register_code_reference(id, base + r.offset as u64, r.value, r.narrow);
                }
                let artifact = CompiledArtifact::new(ArtifactParts {
                    id,
                    method: result.method,
                    blob,
                    layout,
                    verified_entry: result.verified_entry,
                    frame_size: result.frame_size,
                    oop_maps: result.oop_maps.clone(),
                    exception_handlers: result.exception_handlers.clone(),
                    dependencies: result.dependencies.clone(),
                    call_sites,
                });
                if self.trace {
                    info!(artifact = %id, name = %result.name, start = format_args!("{:#x}", base), size = total, call_sites = artifact.call_sites().len(), "artifact installed");
                } else {
                    debug!(artifact = %id, name = %result.name, start = format_args!("{:#x}", base), size = total, "artifact installed");
                }
                Ok(artifact)
            }
            Err(e) => {
                debug!(name = %result.name, error = %e, "installation failed");
                env.cache.release(slot);
                Err(e)
            }
        }
    }

    /// Generate trampolines and to-interpreter stubs for every method call.
    fn emit_stub_section(
        &self,
        env: &InstallEnv<'_>,
        result: &CompilationResult,
    ) -> Result<(Vec<u8>, HashMap<usize, CallStubs>), InstallError> {
        let mut buf = CodeBuffer::new();
        let mut stubs = HashMap::new();
        for (index, reloc) in result.relocations.iter().enumerate() {
            let RelocationKind::MethodCall { callee, kind } = reloc.kind else {
                continue;
            };
            let mut entry = CallStubs::default();
            if self.backend.uses_call_trampolines() {
                entry.trampoline = Some(self.backend.emit_call_trampoline(&mut buf));
            }
            if kind.is_direct() {
                let method = env
                    .metadata
                    .resolve_metadata(MetadataRef::Method(callee))
                    .ok_or(InstallError::UnresolvedMetadata(MetadataRef::Method(callee)))?;
                buf.align_with(4, self.backend.nop());
                entry.to_interp = Some(self.backend.emit_to_interp_stub(&mut buf, method));
            }
            stubs.insert(index, entry);
        }
        Ok((buf.into_code(), stubs))
    }

    #[allow(clippy::type_complexity)]
    fn build(
        &self,
        env: &InstallEnv<'_>,
        result: &CompilationResult,
        layout: ArtifactLayout,
        slot: &CodeSlot,
        stub_code: &[u8],
        call_stubs: &HashMap<usize, CallStubs>,
    ) -> Result<(Vec<u8>, Vec<CallSiteRecord>, Vec<PendingReference>), InstallError> {
        let base = slot.start();
        let stub_base = layout.stub_offset;
        let mut image = vec![0u8; slot.size()];
        image[..layout.code_size].copy_from_slice(&result.code);
        image[stub_base..stub_base + stub_code.len()].copy_from_slice(stub_code);
        image[layout.data_offset..layout.data_offset + result.data.len()].copy_from_slice(&result.data);

        let mut call_sites = Vec::new();
        let mut references = Vec::new();
        let mut checks = Vec::new();

        for (index, reloc) in result.relocations.iter().enumerate() {
            let offset = reloc.offset;
            let pc = base + offset as u64;
            trace!(offset, kind = ?reloc.kind, "relocation");
            match reloc.kind {
                RelocationKind::HeapReference { value, compressed } => {
                    let (encoded, width) = self.encode(self.compressed_oops, value, compressed, offset)?;
                    self.backend.patch_constant(&mut image, offset, encoded, width)?;
                    checks.push(Check::Constant {
                        offset,
                        width,
                        expected: encoded,
                    });
                    references.push(PendingReference {
                        offset,
                        value,
                        narrow: compressed,
                    });
                }
                RelocationKind::MetadataReference { reference, compressed } => {
                    let address = env
                        .metadata
                        .resolve_metadata(reference)
                        .ok_or(InstallError::UnresolvedMetadata(reference))?;
                    let (encoded, width) =
                        self.encode(self.compressed_class_pointers, address, compressed, offset)?;
                    self.backend.patch_constant(&mut image, offset, encoded, width)?;
                    checks.push(Check::Constant {
                        offset,
                        width,
                        expected: encoded,
                    });
                }
                RelocationKind::DataReference { data_offset } => {
                    if data_offset >= layout.data_size {
                        return Err(InstallError::DataOffsetOutOfBounds {
                            data_offset,
                            len: layout.data_size,
                        });
                    }
                    let target = base + (layout.data_offset + data_offset) as u64;
                    self.backend.patch_data_reference(&mut image, offset, pc, target)?;
                    checks.push(Check::Data { offset, expected: target });
                }
                RelocationKind::ForeignCall { target } => {
                    let target = match target {
                        ForeignTarget::Stub(id) => env.stubs.entry(id),
                        ForeignTarget::Address(address) => address,
                    };
                    let form = self.backend.call_form(&image, offset)?;
                    self.backend.patch_call(&mut image, offset, pc, target)?;
                    checks.push(Check::Call { offset, expected: target });
                    let mut site = self.backend.call_patch_site(form, offset);
                    if !site.is_aligned() {
                        // runtime calls are never repointed
                        site = PatchSite::Fixed;
                    }
                    call_sites.push(CallSiteRecord {
                        offset: offset as u32,
                        kind: CallSiteKind::Runtime,
                        callee: None,
                        site,
                        to_interp: None,
                        ic: None,
                    });
                }
                RelocationKind::MethodCall { callee, kind } => {
                    let stubs = call_stubs.get(&index).copied().unwrap_or_default();
                    let resolve = env.stubs.entry(resolve_stub_for(kind));
                    let site = match stubs.trampoline {
                        Some(trampoline) => {
                            let start = base + (stub_base + trampoline.start) as u64;
                            self.backend.patch_call(&mut image, offset, pc, start)?;
                            checks.push(Check::Call { offset, expected: start });
                            PatchSite::Word {
                                field: (stub_base + trampoline.data) as u32,
                            }
                        }
                        None => {
                            let form = self.backend.call_form(&image, offset)?;
                            let site = self.backend.call_patch_site(form, offset);
                            if !site.is_patchable() {
                                return Err(InstallError::UnpatchableCallSite { offset });
                            }
                            if !site.is_aligned() {
                                return Err(InstallError::MisalignedCallSite { offset });
                            }
                            site
                        }
                    };
                    site.encode(&mut image, base, resolve)?;
                    let to_interp = stubs.to_interp.map(|stub| {
                        let to_interp = ToInterpStub {
                            start: (stub_base + stub.start) as u32,
                            method_constant: (stub_base + stub.method_constant) as u32,
                            jump_word: (stub_base + stub.jump_word) as u32,
                        };
                        // until resolution binds it, the stub re-resolves too
                        PatchSite::Word {
                            field: to_interp.jump_word,
                        }
                        .encode(&mut image, base, resolve)
                        .map(|()| to_interp)
                    });
                    let to_interp = to_interp.transpose()?;
                    call_sites.push(CallSiteRecord {
                        offset: offset as u32,
                        kind: CallSiteKind::from(kind),
                        callee: Some(callee),
                        site,
                        to_interp,
                        ic: (!kind.is_direct()).then(|| InlineCache::new(kind == CallKind::Interface)),
                    });
                }
                RelocationKind::SafepointPoll { mode } => {
                    let poll_page = env.cache.poll_page();
                    self.backend.patch_poll(&mut image, offset, pc, poll_page, mode)?;
                    checks.push(Check::Poll {
                        offset,
                        mode,
                        expected: poll_page,
                    });
                    call_sites.push(CallSiteRecord {
                        offset: offset as u32,
                        kind: CallSiteKind::SafepointPoll,
                        callee: None,
                        site: PatchSite::Fixed,
                        to_interp: None,
                        ic: None,
                    });
                }
            }
        }

        #[cfg(feature = "verify")]
        self.verify(&image, base, &checks)?;
        #[cfg(not(feature = "verify"))]
        drop(checks);

        call_sites.sort_by_key(|r| r.offset);
        Ok((image, call_sites, references))
    }

    fn encode(
        &self,
        encoding: Option<CompressedEncoding>,
        value: u64,
        compressed: bool,
        offset: usize,
    ) -> Result<(u64, ConstantWidth), InstallError> {
        if !compressed {
            return Ok((value, ConstantWidth::Wide));
        }
        let encoding = encoding.ok_or(InstallError::NoCompressedEncoding { offset })?;
        let narrow = encoding
            .encode(value)
            .ok_or(InstallError::Uncompressible { value })?;
        Ok((narrow as u64, ConstantWidth::Narrow))
    }

    #[cfg(feature = "verify")]
    fn verify(&self, image: &[u8], base: u64, checks: &[Check]) -> Result<(), InstallError> {
        for check in checks {
            let (offset, expected, found) = match *check {
                Check::Constant { offset, width, expected } => {
                    (offset, expected, self.backend.read_constant(image, offset, width)?)
                }
                Check::Data { offset, expected } => (
                    offset,
                    expected,
                    self.backend
                        .data_reference_target(image, offset, base + offset as u64)?,
                ),
                Check::Call { offset, expected } => (
                    offset,
                    expected,
                    self.backend.call_target(image, offset, base + offset as u64)?,
                ),
                Check::Poll { offset, mode, expected } => (
                    offset,
                    expected,
                    self.backend.poll_target(image, offset, base + offset as u64, mode)?,
                ),
            };
            if found != expected {
                return Err(InstallError::VerificationFailed {
                    offset,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Arch, backend_for};
    use crate::callsite::CallSite;
    use crate::gc::HeapRefTable;
    use crate::ic::CacheState;
    use crate::metadata::{MetadataRegistry, MethodFlags, MethodId};
    use crate::reloc::PollMode;
    use crate::signature::Signature;
    use crate::stubs::ServiceTable;

    struct Fixture {
        cache: CodeCache,
        stubs: RuntimeStubTable,
        registry: MetadataRegistry,
        gc: HeapRefTable,
        method: MethodId,
    }

    impl Fixture {
        fn new(arch: Arch) -> Self {
            let cache = CodeCache::new(256 * 1024, false).unwrap();
            let stubs = RuntimeStubTable::generate(&cache, backend_for(arch), &ServiceTable::synthetic(), false).unwrap();
            let registry = MetadataRegistry::new();
            let k = registry.add_class("K", None).unwrap();
            let method = registry
                .add_method(k, "m", Signature::parse("()V").unwrap(), MethodFlags::INSTANCE)
                .unwrap();
            Self {
                cache,
                stubs,
                registry,
                gc: HeapRefTable::new(),
                method,
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

    fn movabs_rax() -> Vec<u8> {
        vec![0x48, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0]
    }

    #[test]
    fn test_x86_full_artifact() {
        let fx = Fixture::new(Arch::X86_64);
        let mut code = Vec::new();
        code.extend(movabs_rax()); // 0: heap reference
        code.extend([0x48, 0x8B, 0x05, 0, 0, 0, 0]); // 10: mov rax, [rip+disp]
        code.extend([0x90; 4]);
        code.extend([0xE8, 0, 0, 0, 0]); // 21: runtime call, field at 22
        // the virtual call's field must be 4-aligned
        while (code.len() + 1) % 4 != 0 {
            code.push(0x90);
        }
        let virtual_call = code.len();
        code.extend([0xE8, 0, 0, 0, 0]);
        let poll = code.len();
        code.extend([0x85, 0x05, 0, 0, 0, 0]); // test [rip+disp], eax
        code.push(0xC3);

        let result = CompilationResult::new("full", fx.method, code)
            .with_data(vec![0xAA; 16], 16)
            .relocate(0, RelocationKind::HeapReference {
                value: 0xDEAD_0000_BEEF,
                compressed: false,
            })
            .relocate(10, RelocationKind::DataReference { data_offset: 8 })
            .relocate(21, RelocationKind::ForeignCall {
                target: ForeignTarget::Stub(RuntimeStubId::NewInstance),
            })
            .relocate(virtual_call, RelocationKind::MethodCall {
                callee: fx.method,
                kind: CallKind::Virtual,
            })
            .relocate(poll, RelocationKind::SafepointPoll { mode: PollMode::Near });

        let installer = Installer::new(backend_for(Arch::X86_64), None, None, false);
        let artifact = installer.install(&fx.env(), &result).unwrap();
        let bytes = fx.cache.read(artifact.start(), artifact.code_size()).unwrap();
        let backend = backend_for(Arch::X86_64);

        assert_eq!(backend.read_constant(&bytes, 0, ConstantWidth::Wide).unwrap(), 0xDEAD_0000_BEEF);
        assert_eq!(
            backend.data_reference_target(&bytes, 10, artifact.start() + 10).unwrap(),
            artifact.data_address() + 8
        );
        assert_eq!(artifact.data_address() % 16, 0);
        assert_eq!(fx.cache.read(artifact.data_address(), 1).unwrap(), vec![0xAA]);
        assert_eq!(
            backend.poll_target(&bytes, poll, artifact.start() + poll as u64, PollMode::Near).unwrap(),
            fx.cache.poll_page()
        );

        let kinds: Vec<_> = artifact.call_sites().iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![CallSiteKind::Runtime, CallSiteKind::Virtual, CallSiteKind::SafepointPoll]);

        let runtime = CallSite::new(&artifact, 0, &fx.cache, backend).unwrap();
        assert_eq!(runtime.destination().unwrap(), fx.stubs.entry(RuntimeStubId::NewInstance));
        // call field at 22 is misaligned: kept, but never repointed
        assert_eq!(artifact.call_sites()[0].site, PatchSite::Fixed);

        let call = CallSite::new(&artifact, 1, &fx.cache, backend).unwrap();
        assert_eq!(call.destination().unwrap(), fx.stubs.entry(RuntimeStubId::ResolveVirtualCall));
        assert_eq!(call.inline_cache().unwrap().state(), CacheState::Clean);
        assert!(call.to_interp_stub().is_none());

        let refs = fx.gc.references_of(artifact.id());
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].address, artifact.start());
        assert_eq!(fx.cache.find_blob(artifact.start()).unwrap().artifact, Some(artifact.id()));
    }

    #[test]
    fn test_misaligned_method_call_is_fatal() {
        let fx = Fixture::new(Arch::X86_64);
        let code = vec![0xE8, 0, 0, 0, 0, 0xC3];
        let result = CompilationResult::new("bad", fx.method, code).relocate(0, RelocationKind::MethodCall {
            callee: fx.method,
            kind: CallKind::Static,
        });
        let used = fx.cache.used();
        let installer = Installer::new(backend_for(Arch::X86_64), None, None, false);
        let err = installer.install(&fx.env(), &result).unwrap_err();
        assert!(matches!(err, InstallError::MisalignedCallSite { offset: 0 }));
        assert_eq!(fx.cache.used(), used);
    }

    #[test]
    fn test_encoding_mismatch_publishes_nothing() {
        let fx = Fixture::new(Arch::X86_64);
        let blobs = fx.cache.blobs().len();
        let result = CompilationResult::new("bad", fx.method, vec![0x90; 16]).relocate(
            4,
            RelocationKind::HeapReference {
                value: 1,
                compressed: false,
            },
        );
        let installer = Installer::new(backend_for(Arch::X86_64), None, None, false);
        let err = installer.install(&fx.env(), &result).unwrap_err();
        assert!(matches!(err, InstallError::EncodingMismatch { .. }));
        assert_eq!(fx.cache.blobs().len(), blobs);
        assert!(fx.gc.is_empty());
    }

    #[test]
    fn test_near_poll_on_far_only_arch() {
        for arch in [Arch::Aarch64, Arch::Riscv64] {
            let fx = Fixture::new(arch);
            let code = vec![0x13, 0, 0, 0, 0x13, 0, 0, 0];
            let result =
                CompilationResult::new("poll", fx.method, code).relocate(0, RelocationKind::SafepointPoll {
                    mode: PollMode::ReturnNear,
                });
            let installer = Installer::new(backend_for(arch), None, None, false);
            let err = installer.install(&fx.env(), &result).unwrap_err();
            assert!(matches!(err, InstallError::UnsupportedPollMode { .. }));
        }
    }

    #[test]
    fn test_compressed_references() {
        let fx = Fixture::new(Arch::X86_64);
        let oops = CompressedEncoding {
            base: 0x8_0000_0000,
            shift: 3,
        };
        let code = vec![0xB8, 0, 0, 0, 0, 0xC3];
        let result = CompilationResult::new("narrow", fx.method, code.clone()).relocate(
            0,
            RelocationKind::HeapReference {
                value: 0x8_0000_0100,
                compressed: true,
            },
        );
        let installer = Installer::new(backend_for(Arch::X86_64), Some(oops), None, false);
        let artifact = installer.install(&fx.env(), &result).unwrap();
        let bytes = fx.cache.read(artifact.start(), 5).unwrap();
        assert_eq!(
            backend_for(Arch::X86_64).read_constant(&bytes, 0, ConstantWidth::Narrow).unwrap(),
            0x20
        );
        assert!(fx.gc.references_of(artifact.id())[0].narrow);

        let unencodable = CompilationResult::new("narrow", fx.method, code.clone()).relocate(
            0,
            RelocationKind::HeapReference {
                value: 0x1000,
                compressed: true,
            },
        );
        assert!(matches!(
            installer.install(&fx.env(), &unencodable),
            Err(InstallError::Uncompressible { value: 0x1000 })
        ));

        let plain = Installer::new(backend_for(Arch::X86_64), None, None, false);
        assert!(matches!(
            plain.install(&fx.env(), &result),
            Err(InstallError::NoCompressedEncoding { offset: 0 })
        ));
    }

    #[test]
    fn test_metadata_reference() {
        let fx = Fixture::new(Arch::Aarch64);
        // movz x0 + 3x movk, then ret
        let code: Vec<u8> = [0xD280_0000u32, 0xF2A0_0000, 0xF2C0_0000, 0xF2E0_0000, 0xD65F_03C0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let result = CompilationResult::new("meta", fx.method, code).relocate(
            0,
            RelocationKind::MetadataReference {
                reference: MetadataRef::Method(fx.method),
                compressed: false,
            },
        );
        let installer = Installer::new(backend_for(Arch::Aarch64), None, None, false);
        let artifact = installer.install(&fx.env(), &result).unwrap();
        let bytes = fx.cache.read(artifact.start(), artifact.code_size()).unwrap();
        let expected = fx.registry.method(fx.method).unwrap().address();
        assert_eq!(
            backend_for(Arch::Aarch64).read_constant(&bytes, 0, ConstantWidth::Wide).unwrap(),
            expected
        );
        // metadata never reaches the collector
        assert!(fx.gc.is_empty());

        let missing = CompilationResult::new("meta", fx.method, result.code.clone()).relocate(
            0,
            RelocationKind::MetadataReference {
                reference: MetadataRef::Method(MethodId(999)),
                compressed: false,
            },
        );
        assert!(matches!(
            installer.install(&fx.env(), &missing),
            Err(InstallError::UnresolvedMetadata(_))
        ));
    }

    #[test]
    fn test_bounds() {
        let fx = Fixture::new(Arch::X86_64);
        let installer = Installer::new(backend_for(Arch::X86_64), None, None, false);
        let mut result = CompilationResult::new("b", fx.method, vec![0x90; 4]);
        result.verified_entry = 4;
        assert!(matches!(
            installer.install(&fx.env(), &result),
            Err(InstallError::BadEntryPoint { .. })
        ));

        let result = CompilationResult::new("b", fx.method, vec![0x48, 0x8B, 0x05, 0, 0, 0, 0])
            .with_data(vec![0; 8], 8)
            .relocate(0, RelocationKind::DataReference { data_offset: 8 });
        assert!(matches!(
            installer.install(&fx.env(), &result),
            Err(InstallError::DataOffsetOutOfBounds { data_offset: 8, len: 8 })
        ));

        let result = CompilationResult::new("b", fx.method, vec![0x90; 4])
            .relocate(9, RelocationKind::SafepointPoll { mode: PollMode::Far });
        assert!(matches!(
            installer.install(&fx.env(), &result),
            Err(InstallError::OffsetOutOfBounds { offset: 9, .. })
        ));
    }

    #[test]
    fn test_ids_are_unique() {
        let fx = Fixture::new(Arch::Riscv64);
        let installer = Installer::new(backend_for(Arch::Riscv64), None, None, false);
        let ret = 0x0000_8067u32.to_le_bytes().to_vec();
        let a = installer
            .install(&fx.env(), &CompilationResult::new("a", fx.method, ret.clone()))
            .unwrap();
        let b = installer
            .install(&fx.env(), &CompilationResult::new("b", fx.method, ret))
            .unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.start() % ARTIFACT_ALIGNMENT as u64, 0);
        assert!(b.start() > a.start());
    }
}
