use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use stitch::adapters::ArgLayout;
use stitch::arch::VReg;
use stitch::code::CodeBuffer;
use stitch::ic::CacheState;
use stitch::stubs::RuntimeStub;
use stitch::{
    Arch, CallKind, CompilationResult, LinkRuntime, LinkerConfig, MetadataRegistry, MethodFlags, RelocationKind,
    Signature, SiteState,
};
use tracing_subscriber::EnvFilter;

/// Heap reference embedded in the demo caller.
const DEMO_CONSTANT: u64 = 0x0000_7F00_DEAD_BEE8;

/// Code cache size for the inspection commands.
const TOOL_CACHE_SIZE: usize = 1024 * 1024;

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ArchArg {
    #[value(name = "x86_64")]
    X86_64,
    Aarch64,
    Riscv64,
}

impl From<ArchArg> for Arch {
    fn from(arg: ArchArg) -> Self {
        match arg {
            ArchArg::X86_64 => Arch::X86_64,
            ArchArg::Aarch64 => Arch::Aarch64,
            ArchArg::Riscv64 => Arch::Riscv64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum FormatArg {
    #[default]
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "stitch")]
#[command(about = "Install JIT code and link its call sites", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the runtime stub table and list it
    Stubs {
        /// Target architecture (defaults to the host)
        #[arg(long, value_enum)]
        arch: Option<ArchArg>,
        /// Output format (human or json)
        #[arg(long, value_enum, default_value = "human")]
        format: FormatArg,
    },
    /// Generate the adapter for a method descriptor
    Adapter {
        /// Method descriptor, e.g. "(IJLjava/lang/Object;)V"
        #[arg(long)]
        sig: String,
        /// The method is static, so there is no receiver slot
        #[arg(long = "static")]
        is_static: bool,
        /// Target architecture (defaults to the host)
        #[arg(long, value_enum)]
        arch: Option<ArchArg>,
        /// Output format (human or json)
        #[arg(long, value_enum, default_value = "human")]
        format: FormatArg,
    },
    /// Install a caller, drive its inline cache, and print every transition
    Demo {
        /// Target architecture (overrides the configuration file)
        #[arg(long, value_enum)]
        arch: Option<ArchArg>,
        /// Linker configuration file (TOML)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Promote install, inline cache and adapter events to info
        #[arg(long)]
        trace: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Stubs { arch, format } => {
            init_tracing(false);
            run_stubs(tool_config(arch), format)
        }
        Commands::Adapter {
            sig,
            is_static,
            arch,
            format,
        } => {
            init_tracing(false);
            run_adapter(tool_config(arch), &sig, is_static, format)
        }
        Commands::Demo { arch, config, trace } => {
            init_tracing(trace);
            demo_config(arch, config, trace).and_then(run_demo)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Log to stderr. `RUST_LOG` wins over the default level.
fn init_tracing(trace: bool) {
    let default = if trace { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn tool_config(arch: Option<ArchArg>) -> LinkerConfig {
    LinkerConfig {
        arch: arch.map(Arch::from).unwrap_or_else(Arch::host),
        code_cache_size: TOOL_CACHE_SIZE,
        ..LinkerConfig::default()
    }
}

/// The file configuration, with command-line flags applied on top.
fn demo_config(arch: Option<ArchArg>, path: Option<PathBuf>, trace: bool) -> Result<LinkerConfig, String> {
    let mut config = match path {
        Some(path) => LinkerConfig::load(&path).map_err(|e| format!("{}: {}", path.display(), e))?,
        None => tool_config(None),
    };
    if let Some(arch) = arch {
        config.arch = arch.into();
    }
    if trace {
        config.trace_install = true;
        config.trace_ic = true;
        config.trace_adapters = true;
    }
    Ok(config)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", text);
    Ok(())
}

fn run_stubs(config: LinkerConfig, format: FormatArg) -> Result<(), String> {
    let arch = config.arch;
    let runtime = LinkRuntime::synthetic(config).map_err(|e| e.to_string())?;
    let stubs: Vec<&RuntimeStub> = runtime.stubs().iter().collect();

    if format == FormatArg::Json {
        return print_json(&stubs);
    }
    println!("{} runtime stubs for {}", stubs.len(), arch);
    for stub in stubs {
        println!(
            "{:<26} {:<38} {:#014x} {:>4} bytes",
            stub.name, stub.signature, stub.entry, stub.size
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct AdapterReport<'a> {
    arch: Arch,
    signature: String,
    is_static: bool,
    fingerprint: String,
    slots: Vec<String>,
    layout: &'a ArgLayout,
    i2c_entry: u64,
    c2i_entry: u64,
    c2i_unverified_entry: u64,
    size: usize,
}

fn run_adapter(config: LinkerConfig, descriptor: &str, is_static: bool, format: FormatArg) -> Result<(), String> {
    let signature = Signature::parse(descriptor).map_err(|e| e.to_string())?;
    let arch = config.arch;
    let runtime = LinkRuntime::synthetic(config).map_err(|e| e.to_string())?;
    let metadata = runtime.metadata();
    let holder = metadata.add_class("Adapter", None).map_err(|e| e.to_string())?;
    let flags = if is_static {
        MethodFlags::STATIC
    } else {
        MethodFlags::INSTANCE
    };
    let method = metadata
        .add_method(holder, "target", signature.clone(), flags)
        .map_err(|e| e.to_string())?;
    let adapter = runtime.adapter_for(method).map_err(|e| e.to_string())?;

    let report = AdapterReport {
        arch,
        signature: signature.to_string(),
        is_static,
        fingerprint: adapter.fingerprint().to_string(),
        slots: adapter
            .fingerprint()
            .slot_types()
            .iter()
            .map(|ty| ty.descriptor_char().to_string())
            .collect(),
        layout: adapter.layout(),
        i2c_entry: adapter.i2c_entry(),
        c2i_entry: adapter.c2i_entry(),
        c2i_unverified_entry: adapter.c2i_unverified_entry(),
        size: adapter.blob().size,
    };

    if format == FormatArg::Json {
        return print_json(&report);
    }
    println!("signature:   {} ({})", report.signature, if is_static { "static" } else { "instance" });
    println!("fingerprint: {}", report.fingerprint);
    println!("layout ({} outgoing stack bytes):", report.layout.stack_bytes());
    for (i, (slot, location)) in report.slots.iter().zip(&report.layout.locations).enumerate() {
        println!("  slot {:>3} {}  {:?}", i, slot, location);
    }
    println!("i2c entry:            {:#x}", report.i2c_entry);
    println!("c2i entry:            {:#x}", report.c2i_entry);
    println!("c2i unverified entry: {:#x}", report.c2i_unverified_entry);
    println!("blob size:            {} bytes ({})", report.size, arch);
    Ok(())
}

/// Install a caller with one virtual call and one heap constant, then
/// dispatch through it with two receiver classes.
fn run_demo(config: LinkerConfig) -> Result<(), String> {
    let arch = config.arch;
    let metadata = Arc::new(MetadataRegistry::new());
    let link_err = |e: stitch::LinkError| e.to_string();
    let sig = Signature::parse("(I)I").map_err(|e| e.to_string())?;
    let shape = metadata.add_class("Shape", None).map_err(link_err)?;
    let area = metadata
        .add_method(shape, "area", sig.clone(), MethodFlags::INSTANCE)
        .map_err(link_err)?;
    let square = metadata.add_class("A", Some(shape)).map_err(link_err)?;
    let square_area = metadata
        .add_method(square, "area", sig.clone(), MethodFlags::INSTANCE)
        .map_err(link_err)?;
    let circle = metadata.add_class("B", Some(shape)).map_err(link_err)?;
    metadata
        .add_method(circle, "area", sig, MethodFlags::INSTANCE)
        .map_err(link_err)?;
    let main = metadata
        .add_method(shape, "main", Signature::parse("()V").map_err(|e| e.to_string())?, MethodFlags::STATIC)
        .map_err(link_err)?;

    let services = stitch::stubs::ServiceTable::synthetic();
    let runtime = LinkRuntime::new(config, metadata.clone(), &services).map_err(|e| e.to_string())?;
    let backend = runtime.backend();
    println!("arch: {}", arch);

    // one compiled callee, so the first dispatch binds to compiled code
    let mut buf = CodeBuffer::new();
    backend.emit_return(&mut buf);
    let callee = CompilationResult::new("A.area", square_area, buf.into_code());
    let callee = runtime.install(&callee).map_err(|e| e.to_string())?;
    println!("installed {} at {:#x}", callee.name(), callee.verified_entry());

    let mut buf = CodeBuffer::new();
    let call = backend.emit_patchable_call(&mut buf);
    let constant = backend.emit_patchable_constant(&mut buf, VReg::Gp(0), 0);
    backend.emit_return(&mut buf);
    let caller = CompilationResult::new("Shape.main", main, buf.into_code())
        .relocate(
            call,
            RelocationKind::MethodCall {
                callee: area,
                kind: CallKind::Virtual,
            },
        )
        .relocate(
            constant,
            RelocationKind::HeapReference {
                value: DEMO_CONSTANT,
                compressed: false,
            },
        );
    let artifact = runtime.install(&caller).map_err(|e| e.to_string())?;
    println!(
        "installed {} at {:#x} ({} bytes, {} call site)",
        artifact.name(),
        artifact.start(),
        artifact.size(),
        artifact.call_sites().len()
    );

    let report_site = |label: &str| -> Result<SiteState, String> {
        let state = runtime.site_state(&artifact, 0).map_err(|e| e.to_string())?;
        let value = runtime
            .read_heap_constant(&artifact, constant, false)
            .map_err(|e| e.to_string())?;
        println!("{:<22} site: {:<28} constant: {:#x}", label, state.to_string(), value);
        if value != DEMO_CONSTANT {
            return Err(format!("heap constant changed to {:#x}", value));
        }
        Ok(state)
    };
    report_site("after install")?;

    for (label, receiver) in [("dispatch receiver=A", square), ("dispatch receiver=A", square), ("dispatch receiver=B", circle)] {
        let dispatch = runtime
            .dispatch(&artifact, 0, Some(receiver))
            .map_err(|e| e.to_string())?;
        let method = metadata.method(dispatch.method).map_err(link_err)?;
        let holder = metadata.class(method.holder()).map_err(link_err)?;
        let owner = runtime
            .find_code(dispatch.target)
            .map(|owner| owner.to_string())
            .unwrap_or_else(|| "unknown code".to_string());
        println!(
            "{:<22} {} -> {}.{} at {:#x} [{}]",
            label,
            dispatch.path,
            holder.name(),
            method.name(),
            dispatch.target,
            owner
        );
        let state = report_site("")?;
        if state == SiteState::Inline(CacheState::Monomorphic) {
            let speculated = artifact.call_sites()[0]
                .ic
                .as_ref()
                .and_then(|ic| ic.cell())
                .and_then(|cell| cell.speculated_class())
                .and_then(|handle| metadata.class(handle.id()).ok());
            if let Some(class) = speculated {
                println!("{:<22} speculating on class {}", "", class.name());
            }
        }
    }

    // two threads asking for one fingerprint get one adapter
    let before = runtime.adapters().len();
    let fingerprint_sig = "(JLjava/lang/Object;D)V";
    let twins = (0..2)
        .map(|i| {
            metadata
                .add_method(
                    shape,
                    &format!("twin{}", i),
                    Signature::parse(fingerprint_sig).map_err(|e| e.to_string())?,
                    MethodFlags::STATIC,
                )
                .map_err(link_err)
        })
        .collect::<Result<Vec<_>, _>>()?;
    let rt = &runtime;
    let entries = thread::scope(|s| {
        let handles: Vec<_> = twins
            .iter()
            .map(|&method| s.spawn(move || rt.adapter_for(method)))
            .collect();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err("adapter thread panicked".to_string()),
            })
            .collect::<Result<Vec<_>, _>>()
    })?;
    let generated = runtime.adapters().len() - before;
    let shared = entries.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1]));
    println!(
        "concurrent adapter requests for {}: {} generated, shared entry {} ({:#x})",
        entries[0].fingerprint(),
        generated,
        if shared { "yes" } else { "no" },
        entries[0].c2i_entry()
    );
    if generated != 1 || !shared {
        return Err("concurrent adapter requests produced more than one adapter".to_string());
    }
    Ok(())
}
