//! In-process integration tests.
//!
//! These drive the public linking API end to end: install compiled code,
//! dispatch through its call sites, retire artifacts, and unload classes.

use std::io::Write;
use std::sync::Arc;

use stitch::arch::VReg;
use stitch::code::CodeBuffer;
use stitch::direct_call::DirectCallState;
use stitch::error::InstallError;
use stitch::ic::{CacheState, ItablePair};
use stitch::stubs::{RuntimeStubId, ServiceTable};
use stitch::{
    Arch, CallKind, ClassId, CodeOwner, CompilationResult, DispatchPath, LinkError, LinkRuntime, LinkerConfig,
    MetadataRegistry, MethodFlags, MethodId, RelocationKind, Signature, SiteState,
};

const R: u64 = 0x0000_0BAD_CAFE_0008;

struct Program {
    runtime: Arc<LinkRuntime>,
    a: ClassId,
    b: ClassId,
    run: MethodId,
    a_run: MethodId,
    b_run: MethodId,
    helper: MethodId,
    main: MethodId,
}

fn program(arch: Arch) -> Program {
    let registry = Arc::new(MetadataRegistry::new());
    let sig = || Signature::parse("(J)I").unwrap();
    let base = registry.add_class("Base", None).unwrap();
    let run = registry.add_method(base, "run", sig(), MethodFlags::INSTANCE).unwrap();
    let a = registry.add_class("A", Some(base)).unwrap();
    let a_run = registry.add_method(a, "run", sig(), MethodFlags::INSTANCE).unwrap();
    let b = registry.add_class("B", Some(base)).unwrap();
    let b_run = registry.add_method(b, "run", sig(), MethodFlags::INSTANCE).unwrap();
    let helper = registry
        .add_method(base, "helper", Signature::parse("(IF)V").unwrap(), MethodFlags::STATIC)
        .unwrap();
    let main = registry
        .add_method(base, "main", Signature::parse("()V").unwrap(), MethodFlags::STATIC)
        .unwrap();
    let config = LinkerConfig {
        arch,
        code_cache_size: 512 * 1024,
        ..LinkerConfig::default()
    };
    let runtime = LinkRuntime::new(config, registry, &ServiceTable::synthetic()).unwrap();
    Program {
        runtime,
        a,
        b,
        run,
        a_run,
        b_run,
        helper,
        main,
    }
}

/// One call of `kind` to `callee` followed by a heap constant `R`.
fn caller(rt: &LinkRuntime, callee: MethodId, kind: CallKind, owner: MethodId) -> (CompilationResult, usize) {
    let backend = rt.backend();
    let mut buf = CodeBuffer::new();
    let call = backend.emit_patchable_call(&mut buf);
    let constant = backend.emit_patchable_constant(&mut buf, VReg::Gp(1), 0);
    backend.emit_return(&mut buf);
    let result = CompilationResult::new("caller", owner, buf.into_code())
        .relocate(call, RelocationKind::MethodCall { callee, kind })
        .relocate(constant, RelocationKind::HeapReference {
            value: R,
            compressed: false,
        });
    (result, constant)
}

fn leaf(rt: &LinkRuntime, name: &str, method: MethodId) -> CompilationResult {
    let mut buf = CodeBuffer::new();
    rt.backend().emit_return(&mut buf);
    CompilationResult::new(name, method, buf.into_code())
}

#[test]
fn test_virtual_site_goes_monomorphic_then_megamorphic() {
    for arch in Arch::ALL {
        let p = program(arch);
        let rt = &p.runtime;
        let (result, constant) = caller(rt, p.run, CallKind::Virtual, p.main);
        let artifact = rt.install(&result).unwrap();
        assert_eq!(rt.read_heap_constant(&artifact, constant, false).unwrap(), R);

        let first = rt.dispatch(&artifact, 0, Some(p.a)).unwrap();
        assert_eq!(first.method, p.a_run);
        assert_eq!(rt.site_state(&artifact, 0).unwrap(), SiteState::Inline(CacheState::Monomorphic));
        let cell = artifact.call_sites()[0].ic.as_ref().unwrap().cell().unwrap();
        assert_eq!(cell.speculated_class().map(|c| c.id()), Some(p.a));
        assert_eq!(rt.read_heap_constant(&artifact, constant, false).unwrap(), R);

        let second = rt.dispatch(&artifact, 0, Some(p.b)).unwrap();
        assert_eq!(second.method, p.b_run);
        assert_eq!(second.path, DispatchPath::Miss);
        assert_eq!(rt.site_state(&artifact, 0).unwrap(), SiteState::Inline(CacheState::Megamorphic));
        assert_eq!(rt.read_heap_constant(&artifact, constant, false).unwrap(), R, "{arch}");
    }
}

#[test]
fn test_static_call_follows_callee_lifecycle() {
    let p = program(Arch::X86_64);
    let rt = &p.runtime;
    let (result, _) = caller(rt, p.helper, CallKind::Static, p.main);
    let artifact = rt.install(&result).unwrap();
    assert_eq!(rt.site_state(&artifact, 0).unwrap(), SiteState::Direct(DirectCallState::Clean));

    // no compiled code yet: bound to the interpreter through the adapter
    let c2i = rt.adapter_for(p.helper).unwrap().c2i_entry();
    let first = rt.dispatch(&artifact, 0, None).unwrap();
    assert_eq!(first.path, DispatchPath::Resolved);
    assert_eq!(first.target, c2i);
    assert_eq!(rt.site_state(&artifact, 0).unwrap(), SiteState::Direct(DirectCallState::Interpreted));

    // installing the callee retargets the stub, not the call site
    let compiled = rt.install(&leaf(rt, "Base.helper", p.helper)).unwrap();
    let second = rt.dispatch(&artifact, 0, None).unwrap();
    assert_eq!(second.path, DispatchPath::Hit);
    assert_eq!(second.target, compiled.verified_entry());
    assert_eq!(rt.site_state(&artifact, 0).unwrap(), SiteState::Direct(DirectCallState::Interpreted));

    // retiring it sends the stub back to the adapter
    assert!(rt.make_not_entrant(&compiled));
    assert!(!rt.make_not_entrant(&compiled));
    assert_eq!(rt.dispatch(&artifact, 0, None).unwrap().target, c2i);
}

#[test]
fn test_opt_virtual_call_into_retired_code_re_resolves() {
    let p = program(Arch::Riscv64);
    let rt = &p.runtime;
    let compiled = rt.install(&leaf(rt, "A.run", p.a_run)).unwrap();
    let (result, _) = caller(rt, p.a_run, CallKind::OptVirtual, p.main);
    let artifact = rt.install(&result).unwrap();

    let bound = rt.dispatch(&artifact, 0, Some(p.a)).unwrap();
    assert_eq!(bound.target, compiled.verified_entry());
    assert_eq!(rt.site_state(&artifact, 0).unwrap(), SiteState::Direct(DirectCallState::Compiled));

    rt.make_not_entrant(&compiled);
    let again = rt.dispatch(&artifact, 0, Some(p.a)).unwrap();
    assert_eq!(again.path, DispatchPath::WrongMethod);
    assert_eq!(again.target, rt.adapter_for(p.a_run).unwrap().c2i_entry());
    assert_eq!(rt.site_state(&artifact, 0).unwrap(), SiteState::Direct(DirectCallState::Interpreted));
}

#[test]
fn test_interface_call_records_itable_pair() {
    let p = program(Arch::Aarch64);
    let rt = &p.runtime;
    let registry = rt.metadata();
    let runnable = registry.add_interface("Runnable");
    let go = registry
        .add_method(runnable, "go", Signature::parse("()V").unwrap(), MethodFlags::ABSTRACT)
        .unwrap();
    let a_go = registry
        .add_method(p.a, "go", Signature::parse("()V").unwrap(), MethodFlags::INSTANCE)
        .unwrap();
    registry.implement_interface(p.a, runnable).unwrap();

    let (result, _) = caller(rt, go, CallKind::Interface, p.main);
    let artifact = rt.install(&result).unwrap();
    let dispatch = rt.dispatch(&artifact, 0, Some(p.a)).unwrap();
    assert_eq!(dispatch.method, a_go);
    let cell = artifact.call_sites()[0].ic.as_ref().unwrap().cell().unwrap();
    assert_eq!(
        cell.itable(),
        Some(ItablePair {
            refc: runnable,
            defc: p.a,
        })
    );

    assert!(matches!(
        rt.dispatch(&artifact, 0, Some(p.b)),
        Err(LinkError::IncompatibleClassChange { .. })
    ));
    assert!(matches!(rt.dispatch(&artifact, 0, None), Err(LinkError::NullReceiver)));
}

#[test]
fn test_unloading_a_class_retires_dependents() {
    let p = program(Arch::X86_64);
    let rt = &p.runtime;
    let dependent = rt.install(&leaf(rt, "B.run", p.b_run).depends_on(p.b)).unwrap();
    let unrelated = rt.install(&leaf(rt, "A.run", p.a_run).depends_on(p.a)).unwrap();
    let (result, _) = caller(rt, p.run, CallKind::Virtual, p.main);
    let artifact = rt.install(&result).unwrap();
    rt.dispatch(&artifact, 0, Some(p.b)).unwrap();

    rt.metadata().unload_class(p.b).unwrap();
    assert!(dependent.is_not_entrant());
    assert!(!unrelated.is_not_entrant());
    assert_eq!(rt.site_state(&artifact, 0).unwrap(), SiteState::Inline(CacheState::Clean));
    assert_eq!(rt.dispatch(&artifact, 0, Some(p.a)).unwrap().target, unrelated.verified_entry());
}

#[test]
fn test_rejected_install_publishes_nothing() {
    let p = program(Arch::X86_64);
    let rt = &p.runtime;
    let used = rt.cache().used();
    let result = leaf(rt, "bad", p.main).relocate(64, RelocationKind::HeapReference {
        value: R,
        compressed: false,
    });
    assert!(matches!(
        rt.install(&result),
        Err(InstallError::OffsetOutOfBounds { offset: 64, .. })
    ));

    // narrow reference without a configured encoding
    let (mut result, constant) = caller(rt, p.run, CallKind::Virtual, p.main);
    result.relocations.retain(|r| r.offset != constant);
    let result = result.relocate(constant, RelocationKind::HeapReference {
        value: R,
        compressed: true,
    });
    assert!(rt.install(&result).is_err());

    assert!(rt.artifacts().is_empty());
    assert!(rt.heap_references().is_empty());
    assert_eq!(rt.cache().used(), used);
}

#[test]
fn test_find_code_names_every_owner() {
    let p = program(Arch::Aarch64);
    let rt = &p.runtime;
    let (result, _) = caller(rt, p.run, CallKind::Virtual, p.main);
    let artifact = rt.install(&result).unwrap();
    let adapter = rt.adapter_for(p.b_run).unwrap();

    assert_eq!(rt.find_code(rt.cache().poll_page()), Some(CodeOwner::PollPage));
    assert!(matches!(
        rt.find_code(artifact.start() + 4),
        Some(CodeOwner::Artifact { offset: 4, .. })
    ));
    let miss = rt.stubs().entry(RuntimeStubId::IcMiss);
    assert_eq!(
        rt.find_code(miss),
        Some(CodeOwner::RuntimeStub {
            name: "ic_miss",
            offset: 0
        })
    );
    match rt.find_code(adapter.c2i_entry()) {
        Some(CodeOwner::Adapter { fingerprint, .. }) => assert_eq!(fingerprint, adapter.fingerprint().to_string()),
        other => panic!("expected an adapter, got {other:?}"),
    }
    assert_eq!(rt.find_code(0x10), None);
}

#[test]
fn test_runtime_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "arch = \"riscv64\"\ncode_cache_size = 262144\ntrace_install = true\ntrace_ic = true"
    )
    .unwrap();
    let config = LinkerConfig::load(file.path()).unwrap();
    let rt = LinkRuntime::synthetic(config).unwrap();
    assert_eq!(rt.config().arch, Arch::Riscv64);
    assert_eq!(rt.backend().arch(), Arch::Riscv64);
    assert_eq!(rt.stubs().len(), RuntimeStubId::ALL.len());
    for stub in rt.stubs().iter() {
        assert!(matches!(
            rt.find_code(stub.entry),
            Some(CodeOwner::RuntimeStub { name, .. }) if name == stub.name
        ));
    }
}

#[test]
fn test_heap_references_follow_a_moving_collection() {
    for arch in Arch::ALL {
        let p = program(arch);
        let rt = &p.runtime;
        let (result, constant) = caller(rt, p.run, CallKind::Virtual, p.main);
        let artifact = rt.install(&result).unwrap();
        rt.dispatch(&artifact, 0, Some(p.a)).unwrap();

        let moved = R + 0x1000;
        let patched = rt
            .fix_heap_references(|old| (old == R).then_some(moved))
            .unwrap();
        assert_eq!(patched, 1);
        assert_eq!(rt.read_heap_constant(&artifact, constant, false).unwrap(), moved);
        // call site state survives the fix-up
        assert_eq!(rt.site_state(&artifact, 0).unwrap(), SiteState::Inline(CacheState::Monomorphic));
    }
}
