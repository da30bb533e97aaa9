//! Process-scoped link state.
//!
//! [`LinkRuntime`] owns the code cache, the runtime stub table, the adapter
//! library and every installed artifact, and implements the slow paths that
//! the resolve and miss stubs would call into: resolving a clean call site,
//! updating an inline cache on a miss, re-resolving a site whose target was
//! retired. Dispatch through a site that is already bound reads its
//! destination without taking the patching lock.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::adapters::{AdapterEntry, AdapterLibrary, NativeWrapper};
use crate::arch::Backend;
use crate::arch::backend_for;
use crate::callsite::{CallSite, CallSiteKind};
use crate::code::artifact::{ArtifactId, CompiledArtifact};
use crate::code::cache::CodeCache;
use crate::config::LinkerConfig;
use crate::direct_call::{DirectCall, DirectCallState};
use crate::error::{CodeCacheError, InitError, InstallError, LinkError, PatchError};
use crate::gc::{GcHooks, HeapRefTable};
use crate::guard::{self, PatchScope, PatchingLock};
use crate::ic::{CacheState, ItablePair};
use crate::installer::{InstallEnv, Installer, resolve_stub_for};
use crate::metadata::{ClassId, ClassUnloadListener, Method, MethodId, MetadataRegistry};
use crate::reloc::{CallKind, CompilationResult, ConstantWidth};
use crate::stubs::{RuntimeServices, RuntimeStubId, RuntimeStubTable, ServiceTable};

/// Longest instruction sequence a constant relocation covers.
const CONSTANT_WINDOW: usize = 32;

/// How a dispatch reached its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPath {
    /// The site was already bound; no patching
    Hit,
    /// A clean site was resolved and bound
    Resolved,
    /// The inline cache speculation failed and the site was rebound
    Miss,
    /// Table dispatch through a megamorphic site
    Megamorphic,
    /// The site pointed into retired code and was re-resolved
    WrongMethod,
}

impl fmt::Display for DispatchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchPath::Hit => "hit",
            DispatchPath::Resolved => "resolved",
            DispatchPath::Miss => "miss",
            DispatchPath::Megamorphic => "megamorphic",
            DispatchPath::WrongMethod => "wrong-method",
        };
        f.write_str(name)
    }
}

/// The outcome of one call through a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dispatch {
    /// Address control transfers to
    pub target: u64,
    pub method: MethodId,
    pub path: DispatchPath,
}

/// Observable state of a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum SiteState {
    Inline(CacheState),
    Direct(DirectCallState),
    Runtime,
    SafepointPoll,
}

impl fmt::Display for SiteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SiteState::Inline(state) => write!(f, "inline cache {state}"),
            SiteState::Direct(state) => write!(f, "direct call {state}"),
            SiteState::Runtime => f.write_str("runtime call"),
            SiteState::SafepointPoll => f.write_str("safepoint poll"),
        }
    }
}

/// What owns a code address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CodeOwner {
    Artifact { id: u32, name: String, offset: u64 },
    RuntimeStub { name: &'static str, offset: u64 },
    Adapter { fingerprint: String, offset: u64 },
    NativeWrapper { method: MethodId, offset: u64 },
    PollPage,
}

impl fmt::Display for CodeOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeOwner::Artifact { id, name, offset } => write!(f, "{name} (artifact#{id}) +{offset:#x}"),
            CodeOwner::RuntimeStub { name, offset } => write!(f, "stub {name} +{offset:#x}"),
            CodeOwner::Adapter { fingerprint, offset } => write!(f, "adapter {fingerprint} +{offset:#x}"),
            CodeOwner::NativeWrapper { method, offset } => write!(f, "native wrapper for {method} +{offset:#x}"),
            CodeOwner::PollPage => f.write_str("safepoint poll page"),
        }
    }
}

/// A direct call site bound to a callee's to-interpreter stub.
struct InterpretedCaller {
    artifact: Arc<CompiledArtifact>,
    site: usize,
}

pub struct LinkRuntime {
    config: LinkerConfig,
    backend: &'static dyn Backend,
    cache: CodeCache,
    stubs: RuntimeStubTable,
    adapters: AdapterLibrary,
    installer: Installer,
    metadata: Arc<MetadataRegistry>,
    gc: HeapRefTable,
    lock: PatchingLock,
    artifacts: RwLock<BTreeMap<ArtifactId, Arc<CompiledArtifact>>>,
    interpreted_callers: Mutex<HashMap<MethodId, Vec<InterpretedCaller>>>,
}

impl LinkRuntime {
    /// Build the code cache, generate the runtime stubs, and register for
    /// class unload notifications.
    pub fn new(
        config: LinkerConfig,
        metadata: Arc<MetadataRegistry>,
        services: &dyn RuntimeServices,
    ) -> Result<Arc<Self>, InitError> {
        config.validate()?;
        let backend = backend_for(config.arch);
        let cache = CodeCache::new(config.code_cache_size, config.map_executable)?;
        let gc = HeapRefTable::new();
        gc.register_code_region(cache.range());
        let stubs = RuntimeStubTable::generate(&cache, backend, services, config.trace_install)?;
        let adapters = AdapterLibrary::new(
            backend,
            stubs.entry(RuntimeStubId::InterpreterEntry),
            stubs.entry(RuntimeStubId::IcMiss),
            config.max_adapter_stack_slots,
            config.trace_adapters,
        );
        let installer = Installer::new(
            backend,
            config.compressed_oops,
            config.compressed_class_pointers,
            config.trace_install,
        );
        debug!(arch = %config.arch, code_cache = config.code_cache_size, stubs = stubs.len(), "link runtime initialized");

        let runtime = Arc::new(Self {
            config,
            backend,
            cache,
            stubs,
            adapters,
            installer,
            metadata: metadata.clone(),
            gc,
            lock: PatchingLock::new(),
            artifacts: RwLock::new(BTreeMap::new()),
            interpreted_callers: Mutex::new(HashMap::new()),
        });
        let weak: Weak<LinkRuntime> = Arc::downgrade(&runtime);
        let listener: Weak<dyn ClassUnloadListener> = weak;
        metadata.add_unload_listener(listener);
        Ok(runtime)
    }

    /// A runtime over a fresh registry whose services abort when called.
    ///
    /// For tooling that links code without running it.
    pub fn synthetic(config: LinkerConfig) -> Result<Arc<Self>, InitError> {
        Self::new(config, Arc::new(MetadataRegistry::new()), &ServiceTable::synthetic())
    }

    pub fn config(&self) -> &LinkerConfig {
        &self.config
    }

    pub fn backend(&self) -> &'static dyn Backend {
        self.backend
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    pub fn stubs(&self) -> &RuntimeStubTable {
        &self.stubs
    }

    pub fn adapters(&self) -> &AdapterLibrary {
        &self.adapters
    }

    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        &self.metadata
    }

    pub fn heap_references(&self) -> &HeapRefTable {
        &self.gc
    }

    pub fn patching_lock(&self) -> &PatchingLock {
        &self.lock
    }

    fn env(&self) -> InstallEnv<'_> {
        InstallEnv {
            cache: &self.cache,
            stubs: &self.stubs,
            metadata: &*self.metadata,
            gc: &self.gc,
        }
    }

    pub fn artifact(&self, id: ArtifactId) -> Option<Arc<CompiledArtifact>> {
        self.artifacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn artifacts(&self) -> Vec<Arc<CompiledArtifact>> {
        self.artifacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// The artifact whose slot contains `addr`.
    pub fn artifact_at(&self, addr: u64) -> Option<Arc<CompiledArtifact>> {
        let id = self.cache.find_blob(addr)?.artifact?;
        self.artifact(id)
    }

    /// Install a compilation and publish it as its method's compiled code.
    ///
    /// The artifact is registered before the method's entry changes, and
    /// callers bound to the method's interpreter stub are retargeted last.
    pub fn install(&self, result: &CompilationResult) -> Result<Arc<CompiledArtifact>, InstallError> {
        let artifact = Arc::new(self.installer.install(&self.env(), result)?);
        self.artifacts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(artifact.id(), artifact.clone());

        match self.metadata.method(artifact.method()) {
            Ok(method) => {
                let entry = artifact.verified_entry();
                method.set_compiled_entry(entry);
                self.retarget_interpreted_callers(&method, entry);
            }
            Err(_) => warn!(artifact = %artifact.id(), method = %artifact.method(), "installed code for an unknown method"),
        }
        Ok(artifact)
    }

    /// Generate a native wrapper for `method` and publish it as the
    /// method's compiled entry.
    pub fn install_native(&self, method: MethodId, env: u64, mirror: u64) -> Result<Arc<NativeWrapper>, LinkError> {
        let method = self.metadata.method(method)?;
        let wrapper = self.adapters.native_wrapper(&self.cache, &method, env, mirror)?;
        method.set_compiled_entry(wrapper.entry());
        self.retarget_interpreted_callers(&method, wrapper.entry());
        Ok(wrapper)
    }

    /// The adapter for `method`, generated on first use.
    pub fn adapter_for(&self, method: MethodId) -> Result<Arc<AdapterEntry>, LinkError> {
        let method = self.metadata.method(method)?;
        Ok(self.adapters.get_for_method(&self.cache, &method)?)
    }

    fn call_site<'a>(&'a self, artifact: &'a CompiledArtifact, index: usize) -> Result<CallSite<'a>, LinkError> {
        CallSite::new(artifact, index, &self.cache, self.backend).ok_or(LinkError::NoSuchCallSite(index))
    }

    fn direct_call<'a>(&self, site: CallSite<'a>, kind: CallKind) -> Result<DirectCall<'a>, LinkError> {
        let index = site.index();
        DirectCall::new(site, self.stubs.entry(resolve_stub_for(kind))).ok_or(LinkError::NotAMethodCall(index))
    }

    pub fn site_state(&self, artifact: &CompiledArtifact, index: usize) -> Result<SiteState, LinkError> {
        let site = self.call_site(artifact, index)?;
        Ok(match site.kind() {
            CallSiteKind::Runtime => SiteState::Runtime,
            CallSiteKind::SafepointPoll => SiteState::SafepointPoll,
            kind => match (site.inline_cache(), kind.call_kind()) {
                (Some(ic), _) => SiteState::Inline(ic.state()),
                (None, Some(call)) => SiteState::Direct(self.direct_call(site, call)?.state()?),
                (None, None) => return Err(LinkError::NotAMethodCall(index)),
            },
        })
    }

    /// Where compiled code enters `method`: its compiled code if any,
    /// otherwise the compiled-to-interpreted adapter.
    fn entry_for(&self, method: &Method) -> Result<u64, LinkError> {
        match method.compiled_entry() {
            Some(entry) => Ok(entry),
            None => Ok(self.adapters.get_for_method(&self.cache, method)?.c2i_entry()),
        }
    }

    fn points_into_retired_code(&self, addr: u64) -> bool {
        self.artifact_at(addr).is_some_and(|a| a.is_not_entrant())
    }

    /// Perform one call through call site `index` of `artifact` with a
    /// receiver of class `receiver`.
    ///
    /// A bound site is read without locking. A clean site, an inline cache
    /// miss, or a site bound to retired code takes the slow path, which
    /// selects the target outside the patching lock and patches under it.
    pub fn dispatch(
        &self,
        artifact: &Arc<CompiledArtifact>,
        index: usize,
        receiver: Option<ClassId>,
    ) -> Result<Dispatch, LinkError> {
        let site = self.call_site(artifact, index)?;
        let kind = site.kind().call_kind().ok_or(LinkError::NotAMethodCall(index))?;
        let callee = site.callee().ok_or(LinkError::NotAMethodCall(index))?;

        let mut wrong_method = false;
        if self.points_into_retired_code(site.destination()?) {
            guard::checkpoint();
            let scope = self.lock.lock();
            // another thread may have re-resolved in the meantime
            if self.points_into_retired_code(site.destination()?) {
                self.clean_site(&site, kind, &scope)?;
                debug!(artifact = %artifact.id(), site = index, "call into retired code re-resolved");
            }
            wrong_method = true;
        }

        let dispatch = if kind.is_direct() {
            self.dispatch_direct(artifact, site, kind, callee, receiver)?
        } else {
            self.dispatch_virtual(site, kind, callee, receiver)?
        };
        Ok(if wrong_method {
            Dispatch {
                path: DispatchPath::WrongMethod,
                ..dispatch
            }
        } else {
            dispatch
        })
    }

    fn dispatch_direct(
        &self,
        artifact: &Arc<CompiledArtifact>,
        site: CallSite<'_>,
        kind: CallKind,
        callee: MethodId,
        receiver: Option<ClassId>,
    ) -> Result<Dispatch, LinkError> {
        if kind == CallKind::OptVirtual && receiver.is_none() {
            return Err(LinkError::NullReceiver);
        }
        let index = site.index();
        let call = self.direct_call(site, kind)?;
        match call.state()? {
            DirectCallState::Compiled => {
                return Ok(Dispatch {
                    target: call.site().destination()?,
                    method: callee,
                    path: DispatchPath::Hit,
                });
            }
            DirectCallState::Interpreted => {
                return Ok(Dispatch {
                    target: call.stub_target()?,
                    method: callee,
                    path: DispatchPath::Hit,
                });
            }
            DirectCallState::Clean => {}
        }

        guard::checkpoint();
        let method = self.metadata.method(callee)?;
        // generated before the lock: the adapter must exist before the stub
        // can jump to it
        let adapter = match method.compiled_entry() {
            Some(_) => None,
            None => Some(self.adapters.get_for_method(&self.cache, &method)?),
        };

        let scope = self.lock.lock();
        if call.state()? != DirectCallState::Clean {
            drop(scope);
            return self.dispatch_direct(artifact, *call.site(), kind, callee, receiver);
        }
        let target = match (method.compiled_entry(), adapter) {
            (Some(entry), _) => {
                call.set_to_compiled(entry, &scope)?;
                entry
            }
            (None, Some(adapter)) => {
                call.set_to_interpreted(adapter.c2i_entry(), &scope)?;
                let mut callers = self.interpreted_callers.lock().unwrap_or_else(PoisonError::into_inner);
                let list = callers.entry(callee).or_default();
                // a site cleaned and resolved again is already on the list
                if !list.iter().any(|c| c.artifact.id() == artifact.id() && c.site == index) {
                    list.push(InterpretedCaller {
                        artifact: artifact.clone(),
                        site: index,
                    });
                }
                adapter.c2i_entry()
            }
            // compiled code went away between the two reads
            (None, None) => {
                drop(scope);
                return self.dispatch_direct(artifact, *call.site(), kind, callee, receiver);
            }
        };
        drop(scope);
        self.trace_transition(artifact.id(), index, "direct call bound", target);
        Ok(Dispatch {
            target,
            method: callee,
            path: DispatchPath::Resolved,
        })
    }

    fn dispatch_virtual(
        &self,
        site: CallSite<'_>,
        kind: CallKind,
        callee: MethodId,
        receiver: Option<ClassId>,
    ) -> Result<Dispatch, LinkError> {
        let receiver = receiver.ok_or(LinkError::NullReceiver)?;
        let ic = site.inline_cache().ok_or(LinkError::NotAMethodCall(site.index()))?;
        let handle = self.metadata.handle(receiver)?;
        let table_stub = self.stubs.entry(if kind == CallKind::Interface {
            RuntimeStubId::ItableDispatch
        } else {
            RuntimeStubId::VtableDispatch
        });
        let destination = site.destination()?;

        if let Some((method, entry)) = ic.lookup(handle) {
            if destination == entry {
                return Ok(Dispatch {
                    target: entry,
                    method,
                    path: DispatchPath::Hit,
                });
            }
        }
        let select = |receiver: ClassId| match kind {
            CallKind::Interface => self.metadata.select_interface(receiver, callee),
            _ => self.metadata.select_virtual(receiver, callee),
        };
        if ic.state() == CacheState::Megamorphic && destination == table_stub {
            let selected = self.metadata.method(select(receiver)?)?;
            return Ok(Dispatch {
                target: self.entry_for(&selected)?,
                method: selected.id(),
                path: DispatchPath::Megamorphic,
            });
        }

        guard::checkpoint();
        let before = ic.state();
        let selected = self.metadata.method(select(receiver)?)?;
        let entry = self.entry_for(&selected)?;
        let itable = (kind == CallKind::Interface).then(|| {
            let declared = self.metadata.method(callee).map(|m| m.holder()).unwrap_or(selected.holder());
            ItablePair {
                refc: declared,
                defc: selected.holder(),
            }
        });

        let scope = self.lock.lock();
        ic.update(handle, selected.id(), entry, itable, &scope);
        let (bound, path) = match ic.cell() {
            Some(cell) if cell.state() == CacheState::Monomorphic => (
                cell.entry(),
                if before == CacheState::Clean {
                    DispatchPath::Resolved
                } else {
                    DispatchPath::Miss
                },
            ),
            _ => (table_stub, if before == CacheState::Megamorphic {
                DispatchPath::Megamorphic
            } else {
                DispatchPath::Miss
            }),
        };
        if site.destination()? != bound {
            site.set_destination(bound, &scope)?;
        }
        drop(scope);

        if before != ic.state() {
            let artifact = site.artifact();
            if self.config.trace_ic {
                info!(artifact = %artifact.id(), site = site.index(), receiver = %receiver, from = %before, to = %ic.state(), "inline cache transition");
            } else {
                debug!(artifact = %artifact.id(), site = site.index(), receiver = %receiver, from = %before, to = %ic.state(), "inline cache transition");
            }
        }
        Ok(Dispatch {
            target: entry,
            method: selected.id(),
            path,
        })
    }

    fn trace_transition(&self, artifact: ArtifactId, site: usize, what: &str, target: u64) {
        if self.config.trace_ic {
            info!(artifact = %artifact, site, target = format_args!("{:#x}", target), "{what}");
        } else {
            debug!(artifact = %artifact, site, target = format_args!("{:#x}", target), "{what}");
        }
    }

    fn clean_site(&self, site: &CallSite<'_>, kind: CallKind, scope: &PatchScope<'_>) -> Result<bool, PatchError> {
        let resolve = self.stubs.entry(resolve_stub_for(kind));
        match site.inline_cache() {
            Some(ic) => {
                let cleared = ic.set_to_clean(scope);
                let moved = site.destination()? != resolve;
                if moved {
                    site.set_destination(resolve, scope)?;
                }
                Ok(cleared || moved)
            }
            None => match DirectCall::new(*site, resolve) {
                Some(call) => call.set_to_clean(scope),
                None => Ok(false),
            },
        }
    }

    /// Return call site `index` of `artifact` to its clean state. Idempotent.
    pub fn set_to_clean(&self, artifact: &CompiledArtifact, index: usize) -> Result<bool, LinkError> {
        let site = self.call_site(artifact, index)?;
        let kind = site.kind().call_kind().ok_or(LinkError::NotAMethodCall(index))?;
        let scope = self.lock.lock();
        Ok(self.clean_site(&site, kind, &scope)?)
    }

    fn retarget_interpreted_callers(&self, method: &Method, entry: u64) {
        // same order as the resolution path: patching lock, then the registry
        let scope = self.lock.lock();
        let mut callers = self.interpreted_callers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = callers.get_mut(&method.id()) else {
            return;
        };
        list.retain(|c| !c.artifact.is_not_entrant());
        for caller in list.iter() {
            let Ok(site) = self.call_site(&caller.artifact, caller.site) else {
                continue;
            };
            let Some(kind) = site.kind().call_kind() else {
                continue;
            };
            let Ok(call) = self.direct_call(site, kind) else {
                continue;
            };
            if let Err(e) = call.retarget_stub(entry, &scope) {
                warn!(artifact = %caller.artifact.id(), site = caller.site, error = %e, "could not retarget interpreter stub");
            }
        }
        drop(scope);
        if self.config.trace_install {
            info!(method = %method.name(), callers = list.len(), entry = format_args!("{:#x}", entry), "interpreted callers retargeted");
        } else {
            debug!(method = %method.name(), callers = list.len(), entry = format_args!("{:#x}", entry), "interpreted callers retargeted");
        }
    }

    /// Retire an artifact. New calls stop entering it; call sites bound to
    /// it re-resolve on their next call. Returns false if it was already
    /// retired.
    pub fn make_not_entrant(&self, artifact: &CompiledArtifact) -> bool {
        if !artifact.make_not_entrant() {
            return false;
        }
        let Ok(method) = self.metadata.method(artifact.method()) else {
            return true;
        };
        if method.clear_compiled_entry(artifact.verified_entry()) {
            // interpreter-bound callers go back through the adapter
            if let Ok(adapter) = self.adapters.get_for_method(&self.cache, &method) {
                self.retarget_interpreted_callers(&method, adapter.c2i_entry());
            }
        }
        if self.config.trace_install {
            info!(artifact = %artifact.id(), name = %artifact.name(), "artifact made not entrant");
        } else {
            debug!(artifact = %artifact.id(), name = %artifact.name(), "artifact made not entrant");
        }
        true
    }

    /// Re-patch every registered heap reference that `forward` moves.
    ///
    /// Runs with the world stopped, after a moving collection. Returns the
    /// number of constants rewritten.
    pub fn fix_heap_references(&self, forward: impl Fn(u64) -> Option<u64>) -> Result<usize, InstallError> {
        let _scope = self.lock.lock();
        let mut patched = 0;
        for reference in self.gc.references() {
            let old = reference.value();
            let Some(new) = forward(old).filter(|&new| new != old) else {
                continue;
            };
            let Some(artifact) = self.artifact(reference.artifact) else {
                continue;
            };
            let code_end = artifact.start() + artifact.code_size() as u64;
            let len = CONSTANT_WINDOW.min((code_end - reference.address) as usize);
            let mut window = self
                .cache
                .read(reference.address, len)
                .map_err(CodeCacheError::from)?;
            let (encoded, width) = if reference.narrow {
                let encoding = self
                    .config
                    .compressed_oops
                    .ok_or(InstallError::NoCompressedEncoding {
                        offset: (reference.address - artifact.start()) as usize,
                    })?;
                let narrow = encoding.encode(new).ok_or(InstallError::Uncompressible { value: new })?;
                (narrow as u64, ConstantWidth::Narrow)
            } else {
                (new, ConstantWidth::Wide)
            };
            self.backend.patch_constant(&mut window, 0, encoded, width)?;
            self.cache
                .rewrite(reference.address, &window)
                .map_err(CodeCacheError::from)?;
            reference.set_value(new);
            patched += 1;
        }
        debug!(patched, "heap references fixed up");
        Ok(patched)
    }

    /// The heap reference currently materialized by the instruction at
    /// `offset` of `artifact`.
    pub fn read_heap_constant(
        &self,
        artifact: &CompiledArtifact,
        offset: usize,
        narrow: bool,
    ) -> Result<u64, InstallError> {
        let len = CONSTANT_WINDOW.min(artifact.code_size().saturating_sub(offset));
        let window = self
            .cache
            .read(artifact.start() + offset as u64, len)
            .map_err(CodeCacheError::from)?;
        if !narrow {
            return self.backend.read_constant(&window, 0, ConstantWidth::Wide);
        }
        let encoding = self
            .config
            .compressed_oops
            .ok_or(InstallError::NoCompressedEncoding { offset })?;
        let value = self.backend.read_constant(&window, 0, ConstantWidth::Narrow)?;
        Ok(encoding.decode(value as u32))
    }

    /// Free inline cache cells retired by past transitions.
    ///
    /// # Safety
    ///
    /// Every thread that dispatches through installed code must be stopped,
    /// so that none still holds a cell it loaded before the cell was retired.
    pub unsafe fn purge_retired_cells(&self) -> usize {
        let _scope = self.lock.lock();
        let mut freed = 0;
        for artifact in self.artifacts() {
            for record in artifact.call_sites() {
                if let Some(ic) = &record.ic {
                    // SAFETY: the caller guarantees no reader is active.
                    freed += unsafe { ic.purge_retired() };
                }
            }
        }
        debug!(freed, "retired inline cache cells purged");
        freed
    }

    /// Map a code address to what owns it. Diagnostics only.
    pub fn find_code(&self, addr: u64) -> Option<CodeOwner> {
        let poll = self.cache.poll_page();
        if (poll..poll + self.cache.page_size() as u64).contains(&addr) {
            return Some(CodeOwner::PollPage);
        }
        if let Some(artifact) = self.artifact_at(addr) {
            return Some(CodeOwner::Artifact {
                id: artifact.id().0,
                name: artifact.name().to_string(),
                offset: addr - artifact.start(),
            });
        }
        if let Some(stub) = self.stubs.find_by_address(addr) {
            return Some(CodeOwner::RuntimeStub {
                name: stub.name,
                offset: addr - stub.entry,
            });
        }
        if let Some(adapter) = self.adapters.find_by_address(addr) {
            return Some(CodeOwner::Adapter {
                fingerprint: adapter.fingerprint().to_string(),
                offset: addr - adapter.blob().start,
            });
        }
        self.adapters
            .find_wrapper_by_address(addr)
            .map(|wrapper| CodeOwner::NativeWrapper {
                method: wrapper.method(),
                offset: addr - wrapper.entry(),
            })
    }
}

impl ClassUnloadListener for LinkRuntime {
    fn class_unloaded(&self, class: ClassId) {
        let artifacts = self.artifacts();
        let mut invalidated = 0;
        {
            let scope = self.lock.lock();
            for artifact in &artifacts {
                for record in artifact.call_sites() {
                    if let Some(ic) = &record.ic {
                        if ic.invalidate_if_speculating(class, &scope) {
                            invalidated += 1;
                        }
                    }
                }
            }
        }
        let mut retired = 0;
        for artifact in artifacts.iter().filter(|a| a.depends_on(class)) {
            if self.make_not_entrant(artifact) {
                retired += 1;
            }
        }
        if self.config.trace_ic {
            info!(class = %class, invalidated, retired, "class unload processed");
        } else {
            debug!(class = %class, invalidated, retired, "class unload processed");
        }
    }
}

impl fmt::Debug for LinkRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkRuntime")
            .field("arch", &self.config.arch)
            .field("cache", &self.cache)
            .field("artifacts", &self.artifacts.read().unwrap_or_else(PoisonError::into_inner).len())
            .field("adapters", &self.adapters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Arch, VReg};
    use crate::code::codebuf::CodeBuffer;
    use crate::metadata::MethodFlags;
    use crate::reloc::RelocationKind;
    use crate::signature::Signature;

    const R: u64 = 0x0000_1234_5678_9AB8;

    struct World {
        runtime: Arc<LinkRuntime>,
        dog: ClassId,
        cat: ClassId,
        speak: MethodId,
        bark: MethodId,
        meow: MethodId,
        helper: MethodId,
        main: MethodId,
    }

    fn world(arch: Arch) -> World {
        let registry = Arc::new(MetadataRegistry::new());
        let sig = || Signature::parse("(I)I").unwrap();
        let animal = registry.add_class("Animal", None).unwrap();
        let speak = registry.add_method(animal, "speak", sig(), MethodFlags::INSTANCE).unwrap();
        let dog = registry.add_class("Dog", Some(animal)).unwrap();
        let bark = registry.add_method(dog, "speak", sig(), MethodFlags::INSTANCE).unwrap();
        let cat = registry.add_class("Cat", Some(animal)).unwrap();
        let meow = registry.add_method(cat, "speak", sig(), MethodFlags::INSTANCE).unwrap();
        let helper = registry
            .add_method(animal, "helper", Signature::parse("(JD)V").unwrap(), MethodFlags::STATIC)
            .unwrap();
        let main = registry
            .add_method(animal, "main", Signature::parse("()V").unwrap(), MethodFlags::STATIC)
            .unwrap();
        let config = LinkerConfig {
            arch,
            code_cache_size: 1024 * 1024,
            ..LinkerConfig::default()
        };
        let runtime = LinkRuntime::new(config, registry, &ServiceTable::synthetic()).unwrap();
        World {
            runtime,
            dog,
            cat,
            speak,
            bark,
            meow,
            helper,
            main,
        }
    }

    /// Code for `owner` making one call of `kind` to `callee`, then loading
    /// the heap constant `R`. Returns the result and the constant's offset.
    fn caller(rt: &LinkRuntime, owner: MethodId, callee: MethodId, kind: CallKind) -> (CompilationResult, usize) {
        let backend = rt.backend();
        let mut buf = CodeBuffer::new();
        let call = backend.emit_patchable_call(&mut buf);
        let constant = backend.emit_patchable_constant(&mut buf, VReg::Gp(0), 0);
        backend.emit_return(&mut buf);
        let result = CompilationResult::new("caller", owner, buf.into_code())
            .relocate(call, RelocationKind::MethodCall { callee, kind })
            .relocate(constant, RelocationKind::HeapReference {
                value: R,
                compressed: false,
            });
        (result, constant)
    }

    fn body(rt: &LinkRuntime, name: &str, method: MethodId) -> CompilationResult {
        let mut buf = CodeBuffer::new();
        rt.backend().emit_return(&mut buf);
        CompilationResult::new(name, method, buf.into_code())
    }

    #[test]
    fn test_monomorphic_then_megamorphic() {
        for arch in Arch::ALL {
            let w = world(arch);
            let rt = &w.runtime;
            let (result, constant) = caller(rt, w.main, w.speak, CallKind::Virtual);
            let artifact = rt.install(&result).unwrap();
            assert_eq!(rt.site_state(&artifact, 0).unwrap(), SiteState::Inline(CacheState::Clean));

            let first = rt.dispatch(&artifact, 0, Some(w.dog)).unwrap();
            assert_eq!(first.path, DispatchPath::Resolved);
            assert_eq!(first.method, w.bark);
            assert_eq!(rt.site_state(&artifact, 0).unwrap(), SiteState::Inline(CacheState::Monomorphic));
            let cell = artifact.call_sites()[0].ic.as_ref().unwrap().cell().unwrap();
            assert_eq!(cell.speculated_class().unwrap().id(), w.dog);

            let again = rt.dispatch(&artifact, 0, Some(w.dog)).unwrap();
            assert_eq!(again.path, DispatchPath::Hit);
            assert_eq!(again.target, first.target);

            let miss = rt.dispatch(&artifact, 0, Some(w.cat)).unwrap();
            assert_eq!(miss.path, DispatchPath::Miss);
            assert_eq!(miss.method, w.meow);
            assert_eq!(rt.site_state(&artifact, 0).unwrap(), SiteState::Inline(CacheState::Megamorphic));
            let site = CallSite::new(&artifact, 0, rt.cache(), rt.backend()).unwrap();
            assert_eq!(site.destination().unwrap(), rt.stubs().entry(RuntimeStubId::VtableDispatch));

            let table = rt.dispatch(&artifact, 0, Some(w.dog)).unwrap();
            assert_eq!(table.path, DispatchPath::Megamorphic);
            assert_eq!(table.method, w.bark);

            assert_eq!(rt.read_heap_constant(&artifact, constant, false).unwrap(), R);
        }
    }

    #[test]
    fn test_install_publishes_compiled_entry() {
        let w = world(Arch::X86_64);
        let rt = &w.runtime;
        let helper = rt.metadata().method(w.helper).unwrap();
        let code = rt.install(&body(rt, "helper", w.helper)).unwrap();
        assert_eq!(helper.compiled_entry(), Some(code.verified_entry()));

        let (result, _) = caller(rt, w.main, w.helper, CallKind::Static);
        let artifact = rt.install(&result).unwrap();
        let first = rt.dispatch(&artifact, 0, None).unwrap();
        assert_eq!(first.path, DispatchPath::Resolved);
        assert_eq!(first.target, code.verified_entry());
        assert_eq!(rt.site_state(&artifact, 0).unwrap(), SiteState::Direct(DirectCallState::Compiled));
        assert_eq!(rt.dispatch(&artifact, 0, None).unwrap().path, DispatchPath::Hit);

        assert!(rt.make_not_entrant(&code));
        assert!(!rt.make_not_entrant(&code));
        assert_eq!(helper.compiled_entry(), None);

        let next = rt.dispatch(&artifact, 0, None).unwrap();
        assert_eq!(next.path, DispatchPath::WrongMethod);
        assert_eq!(next.target, rt.adapter_for(w.helper).unwrap().c2i_entry());
        assert_eq!(rt.site_state(&artifact, 0).unwrap(), SiteState::Direct(DirectCallState::Interpreted));
    }

    #[test]
    fn test_interpreted_callers_are_retargeted() {
        let w = world(Arch::Aarch64);
        let rt = &w.runtime;
        let (result, _) = caller(rt, w.main, w.helper, CallKind::Static);
        let artifact = rt.install(&result).unwrap();

        let first = rt.dispatch(&artifact, 0, None).unwrap();
        assert_eq!(first.path, DispatchPath::Resolved);
        let adapter = rt.adapter_for(w.helper).unwrap();
        assert_eq!(first.target, adapter.c2i_entry());
        assert_eq!(rt.site_state(&artifact, 0).unwrap(), SiteState::Direct(DirectCallState::Interpreted));

        let compiled = rt.install(&body(rt, "helper", w.helper)).unwrap();
        let after = rt.dispatch(&artifact, 0, None).unwrap();
        assert_eq!(after.path, DispatchPath::Hit);
        assert_eq!(after.target, compiled.verified_entry());
        // only the stub moved; the call site still points at it
        assert_eq!(rt.site_state(&artifact, 0).unwrap(), SiteState::Direct(DirectCallState::Interpreted));

        rt.make_not_entrant(&compiled);
        let back = rt.dispatch(&artifact, 0, None).unwrap();
        assert_eq!(back.target, adapter.c2i_entry());
    }

    #[test]
    fn test_re_resolving_a_cleaned_site_records_it_once() {
        let w = world(Arch::X86_64);
        let rt = &w.runtime;
        let (result, _) = caller(rt, w.main, w.helper, CallKind::Static);
        let artifact = rt.install(&result).unwrap();

        for _ in 0..50 {
            rt.dispatch(&artifact, 0, None).unwrap();
            rt.set_to_clean(&artifact, 0).unwrap();
        }
        rt.dispatch(&artifact, 0, None).unwrap();
        let recorded = rt
            .interpreted_callers
            .lock()
            .unwrap()
            .get(&w.helper)
            .map_or(0, Vec::len);
        assert_eq!(recorded, 1);

        let compiled = rt.install(&body(rt, "helper", w.helper)).unwrap();
        assert_eq!(rt.dispatch(&artifact, 0, None).unwrap().target, compiled.verified_entry());
    }

    #[test]
    fn test_opt_virtual_needs_receiver() {
        let w = world(Arch::Riscv64);
        let rt = &w.runtime;
        let (result, _) = caller(rt, w.main, w.bark, CallKind::OptVirtual);
        let artifact = rt.install(&result).unwrap();
        assert!(matches!(rt.dispatch(&artifact, 0, None), Err(LinkError::NullReceiver)));
        let resolved = rt.dispatch(&artifact, 0, Some(w.dog)).unwrap();
        assert_eq!(resolved.method, w.bark);
    }

    #[test]
    fn test_wrong_method_re_resolves() {
        let w = world(Arch::Riscv64);
        let rt = &w.runtime;
        let bark_code = rt.install(&body(rt, "Dog.speak", w.bark)).unwrap();
        let (result, _) = caller(rt, w.main, w.speak, CallKind::Virtual);
        let artifact = rt.install(&result).unwrap();

        let first = rt.dispatch(&artifact, 0, Some(w.dog)).unwrap();
        assert_eq!(first.target, bark_code.verified_entry());

        rt.make_not_entrant(&bark_code);
        let next = rt.dispatch(&artifact, 0, Some(w.dog)).unwrap();
        assert_eq!(next.path, DispatchPath::WrongMethod);
        assert_eq!(next.target, rt.adapter_for(w.bark).unwrap().c2i_entry());
        assert_eq!(rt.site_state(&artifact, 0).unwrap(), SiteState::Inline(CacheState::Monomorphic));
    }

    #[test]
    fn test_class_unload() {
        let w = world(Arch::X86_64);
        let rt = &w.runtime;
        let dependent = rt
            .install(&body(rt, "Cat.speak", w.meow).depends_on(w.cat))
            .unwrap();
        let (result, _) = caller(rt, w.main, w.speak, CallKind::Virtual);
        let artifact = rt.install(&result).unwrap();

        rt.dispatch(&artifact, 0, Some(w.cat)).unwrap();
        rt.metadata().unload_class(w.cat).unwrap();

        let ic = artifact.call_sites()[0].ic.as_ref().unwrap();
        assert_eq!(ic.state(), CacheState::Clean);
        assert!(dependent.is_not_entrant());
        assert!(matches!(
            rt.dispatch(&artifact, 0, Some(w.cat)),
            Err(LinkError::ClassUnloaded(_))
        ));
        // a live receiver rebinds lazily
        let next = rt.dispatch(&artifact, 0, Some(w.dog)).unwrap();
        assert_eq!(next.method, w.bark);
        assert_eq!(ic.state(), CacheState::Monomorphic);
    }

    #[test]
    fn test_set_to_clean_is_idempotent() {
        let w = world(Arch::X86_64);
        let rt = &w.runtime;
        let (result, _) = caller(rt, w.main, w.speak, CallKind::Virtual);
        let artifact = rt.install(&result).unwrap();
        rt.dispatch(&artifact, 0, Some(w.dog)).unwrap();

        assert!(rt.set_to_clean(&artifact, 0).unwrap());
        let state = rt.site_state(&artifact, 0).unwrap();
        assert!(!rt.set_to_clean(&artifact, 0).unwrap());
        assert_eq!(rt.site_state(&artifact, 0).unwrap(), state);
        assert_eq!(state, SiteState::Inline(CacheState::Clean));
        assert!(matches!(rt.set_to_clean(&artifact, 1), Err(LinkError::NoSuchCallSite(1))));
    }

    #[test]
    fn test_fix_heap_references() {
        let w = world(Arch::Aarch64);
        let rt = &w.runtime;
        let (result, constant) = caller(rt, w.main, w.speak, CallKind::Virtual);
        let artifact = rt.install(&result).unwrap();
        let moved = R + 0x1000;
        assert_eq!(rt.fix_heap_references(|v| (v == R).then_some(moved)).unwrap(), 1);
        assert_eq!(rt.read_heap_constant(&artifact, constant, false).unwrap(), moved);
        assert_eq!(rt.heap_references().references_of(artifact.id())[0].value(), moved);
        assert_eq!(rt.fix_heap_references(Some).unwrap(), 0);
    }

    #[test]
    fn test_find_code() {
        let w = world(Arch::X86_64);
        let rt = &w.runtime;
        let (result, _) = caller(rt, w.main, w.speak, CallKind::Virtual);
        let artifact = rt.install(&result).unwrap();
        assert!(matches!(
            rt.find_code(artifact.start() + 2),
            Some(CodeOwner::Artifact { offset: 2, .. })
        ));
        let stub = rt.stubs().entry(RuntimeStubId::IcMiss);
        assert_eq!(
            rt.find_code(stub).unwrap(),
            CodeOwner::RuntimeStub {
                name: "ic_miss",
                offset: 0
            }
        );
        let adapter = rt.adapter_for(w.helper).unwrap();
        assert!(matches!(rt.find_code(adapter.i2c_entry()), Some(CodeOwner::Adapter { .. })));
        let poll = rt.cache().poll_page();
        assert_eq!(rt.find_code(poll), Some(CodeOwner::PollPage));
        let last = poll + rt.cache().page_size() as u64 - 1;
        assert_eq!(rt.find_code(last), Some(CodeOwner::PollPage));
        assert_eq!(rt.find_code(1), None);
    }

    #[test]
    fn test_native_install() {
        let w = world(Arch::Riscv64);
        let rt = &w.runtime;
        let k = rt.metadata().add_class("Natives", None).unwrap();
        let flags = MethodFlags {
            is_static: true,
            is_native: true,
            is_abstract: false,
        };
        let id = rt
            .metadata()
            .add_method(k, "now", Signature::parse("()J").unwrap(), flags)
            .unwrap();
        assert!(matches!(rt.install_native(id, 1, 2), Err(LinkError::Adapter(_))));
        rt.metadata().method(id).unwrap().set_native_function(0x4000);
        let wrapper = rt.install_native(id, 1, 2).unwrap();
        assert_eq!(rt.metadata().method(id).unwrap().compiled_entry(), Some(wrapper.entry()));
        assert_eq!(
            rt.find_code(wrapper.entry()),
            Some(CodeOwner::NativeWrapper { method: id, offset: 0 })
        );
    }

    #[test]
    fn test_retired_cells_are_purged() {
        let w = world(Arch::X86_64);
        let rt = &w.runtime;
        let (result, _) = caller(rt, w.main, w.speak, CallKind::Virtual);
        let artifact = rt.install(&result).unwrap();
        rt.dispatch(&artifact, 0, Some(w.dog)).unwrap();
        rt.dispatch(&artifact, 0, Some(w.cat)).unwrap();
        // SAFETY: no other thread dispatches in this test.
        assert_eq!(unsafe { rt.purge_retired_cells() }, 1);
        assert_eq!(unsafe { rt.purge_retired_cells() }, 0);
    }
}
