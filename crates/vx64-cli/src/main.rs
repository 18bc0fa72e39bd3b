#![forbid(unsafe_code)]

// Native-only runner. Keep a stub `main` so `--target wasm32-unknown-unknown --workspace` builds.
#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
mod recorder;

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::fs::File;
    use std::io::BufWriter;
    use std::path::{Path, PathBuf};
    use std::process::ExitCode;
    use std::sync::Arc;

    use anyhow::{bail, Context, Result};
    use clap::Parser;
    use tracing::{debug, info};
    use vx64_cpu_core::{BatchExit, BatchResult, Engine, EngineConfig};
    use vx64_mem::{checked_round_to_page_size, Permissions, Segment, VirtualMemory};
    use vx64_trace::{Location, Record, SystemLog, TraceWriter};
    use vx64_types::Gpr;
    use vx64_x86::IntrinsicId;

    use crate::recorder::Recorder;

    const SLICE_INST_BUDGET: u64 = 100_000;
    const SYS_EXIT: u64 = 60;
    const SYS_EXIT_GROUP: u64 = 231;

    fn parse_u64(s: &str) -> Result<u64, String> {
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
            None => s.replace('_', "").parse(),
        };
        parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
    }

    fn parse_intrinsic(s: &str) -> Result<(IntrinsicId, u64), String> {
        let (name, addr) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=ADDR, got {s:?}"))?;
        let id =
            IntrinsicId::from_name(name).ok_or_else(|| format!("unknown intrinsic {name:?}"))?;
        Ok((id, parse_u64(addr)?))
    }

    #[derive(Debug, Parser)]
    #[command(
        name = "vx64",
        about = "Run a flat x86-64 code image in user mode until it exits, halts or faults"
    )]
    pub struct Args {
        /// Raw machine code, mapped read+execute at `--base`.
        image: PathBuf,

        /// Guest address the image is loaded at.
        #[arg(long, value_parser = parse_u64, default_value = "0x400000")]
        base: u64,

        /// Initial RIP (defaults to `--base`).
        #[arg(long, value_parser = parse_u64)]
        entry: Option<u64>,

        /// Bytes of read+write memory mapped directly after the image. RDI points at it on entry.
        #[arg(long, value_parser = parse_u64, default_value = "0")]
        heap_size: u64,

        /// Top of the guest stack.
        #[arg(long, value_parser = parse_u64, default_value = "0x7ffffffff000")]
        stack_address: u64,

        /// Guest stack size in bytes.
        #[arg(long, value_parser = parse_u64, default_value = "0x800000")]
        stack_size: u64,

        /// Stop after executing at most N guest instructions.
        #[arg(long, default_value_t = 100_000_000)]
        max_insts: u64,

        /// Install an intrinsic, e.g. `strlen=0x401000`. May be repeated.
        #[arg(long = "intrinsic", value_name = "NAME=ADDR", value_parser = parse_intrinsic)]
        intrinsics: Vec<(IntrinsicId, u64)>,

        /// Record a binary execution trace to this path.
        #[arg(long)]
        trace: Option<PathBuf>,

        /// Print the final CPU state as JSON on stdout.
        #[arg(long)]
        dump_state: bool,
    }

    /// How the guest stopped.
    enum Stop {
        Exit(u64),
        Halt,
        Limit,
    }

    fn load(args: &Args) -> Result<Engine> {
        let image = std::fs::read(&args.image)
            .with_context(|| format!("failed to read image {}", args.image.display()))?;
        if image.is_empty() {
            bail!("image {} is empty", args.image.display());
        }
        let image_end = checked_round_to_page_size(image.len() as u64)
            .and_then(|len| args.base.checked_add(len))
            .context("image does not fit in the address space")?;

        let memory = Arc::new(VirtualMemory::new());
        memory
            .map_with_data(
                Segment::new(args.base, image_end, Permissions::RX, "[image]"),
                &image,
            )
            .context("failed to map image")?;

        if args.heap_size > 0 {
            let heap_end = checked_round_to_page_size(args.heap_size)
                .and_then(|len| image_end.checked_add(len))
                .context("heap does not fit in the address space")?;
            memory
                .map(Segment::new(image_end, heap_end, Permissions::RW, "[heap]"))
                .context("failed to map heap")?;
        }

        let config = EngineConfig {
            stack_address: args.stack_address,
            stack_size: args.stack_size,
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(memory, config).context("failed to set up stack")?;
        for &(id, addr) in &args.intrinsics {
            engine.register_intrinsic(addr, id);
        }
        let state = engine.state_mut();
        state.set_rip(args.entry.unwrap_or(args.base));
        if args.heap_size > 0 {
            state.set_gpr(Gpr::Rdi, image_end);
        }
        debug!("address space:\n{}", engine.memory().maps());
        Ok(engine)
    }

    fn open_trace(path: &Path) -> Result<Recorder<BufWriter<File>>> {
        let file = File::create(path)
            .with_context(|| format!("failed to create trace {}", path.display()))?;
        Ok(Recorder::new(TraceWriter::new(BufWriter::new(file))))
    }

    fn run(
        args: &Args,
        engine: &mut Engine,
        recorder: &mut Option<Recorder<BufWriter<File>>>,
    ) -> Result<(Stop, u64)> {
        let mut total: u64 = 0;
        loop {
            if total >= args.max_insts {
                return Ok((Stop::Limit, total));
            }
            let budget = (args.max_insts - total).min(SLICE_INST_BUDGET);
            let BatchResult { executed, exit } = match recorder.as_mut() {
                Some(r) => r.run(engine, budget)?,
                None => engine.run(budget),
            };
            total += executed;

            match exit {
                BatchExit::Completed => {}
                BatchExit::Halted => return Ok((Stop::Halt, total)),
                BatchExit::Syscall => {
                    let state = engine.state();
                    let nr = state.gpr(Gpr::Rax);
                    match nr {
                        SYS_EXIT | SYS_EXIT_GROUP => {
                            let status = state.gpr(Gpr::Rdi);
                            if let Some(r) = recorder.as_mut() {
                                r.write(&Record::SystemLog(SystemLog {
                                    pc: state.rip(),
                                    tid: 1,
                                    message: format!("exit({status})"),
                                }))?;
                            }
                            return Ok((Stop::Exit(status), total));
                        }
                        _ => bail!(
                            "unsupported syscall {nr} at {:#x}",
                            state.rip().wrapping_sub(2)
                        ),
                    }
                }
                BatchExit::Fault(err) => {
                    return Err(err)
                        .with_context(|| format!("guest fault after {total} instructions"));
                }
            }
        }
    }

    pub fn main() -> Result<ExitCode> {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();

        let args = Args::parse();
        let mut engine = load(&args)?;

        let mut recorder = args.trace.as_deref().map(open_trace).transpose()?;
        if let Some(r) = &mut recorder {
            let entry = engine.state().rip();
            r.write(&Record::Location(Location {
                filename: args
                    .image
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned()),
                symbol: None,
                offset: entry.wrapping_sub(args.base),
                pc: entry,
            }))?;
        }

        let result = run(&args, &mut engine, &mut recorder);
        // Keep the partial trace even when the guest faulted.
        if let Some(r) = recorder {
            r.finish(&mut engine)?;
        }
        let (stop, executed) = result?;

        if args.dump_state {
            let snapshot = engine.state_mut().snapshot();
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }

        Ok(match stop {
            Stop::Exit(status) => {
                info!(executed, status, "guest exited");
                ExitCode::from(status as u8)
            }
            Stop::Halt => {
                let rip = engine.state().rip();
                info!(executed, rip = format_args!("{rip:#x}"), "guest halted");
                ExitCode::SUCCESS
            }
            Stop::Limit => {
                eprintln!("instruction limit reached after {executed} instructions");
                ExitCode::from(2)
            }
        })
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn main() -> anyhow::Result<std::process::ExitCode> {
    native::main()
}
