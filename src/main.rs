use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use otohle::{Emulator, EmulatorConfig, LoadOptions, ProcessState, TimeSourceKind};

#[derive(Parser, Debug)]
#[command(name = "otohle", version, about = "Run a flat RV32 guest image")]
struct Args {
    /// Guest image (plain, gzip or zstd)
    image: PathBuf,

    /// Emulated cores
    #[arg(long, default_value_t = 4)]
    cores: usize,

    /// Interpret every instruction instead of translating blocks
    #[arg(long)]
    interpreter: bool,

    /// Instructions per scheduling slice
    #[arg(long, default_value_t = 10_000)]
    slice_budget: u64,

    /// Upper bound on instructions per translated block
    #[arg(long, default_value_t = 64)]
    max_block_insts: usize,

    /// Load address
    #[arg(long, value_parser = parse_u32, default_value = "0x10000")]
    base: u32,

    /// Offset of the writable part of the image
    #[arg(long, value_parser = parse_u32)]
    rw_offset: Option<u32>,

    /// Zeroed bytes after the image
    #[arg(long, value_parser = parse_u32, default_value = "0")]
    bss: u32,

    /// Use a manual clock and run on this thread, stepping cores in turn
    #[arg(long)]
    deterministic: bool,

    /// Stop a deterministic run after this many slices
    #[arg(long, default_value_t = 10_000_000)]
    max_slices: usize,

    /// Write the crash report here if the process faults
    #[arg(long)]
    crash_report: Option<PathBuf>,
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("OTOHLE_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = EmulatorConfig {
        cores: args.cores,
        interpreter_only: args.interpreter,
        slice_budget: args.slice_budget,
        max_block_insts: args.max_block_insts,
        time_source: if args.deterministic { TimeSourceKind::Manual } else { TimeSourceKind::Host },
        ..EmulatorConfig::default()
    };
    let emulator = Emulator::new(config)?;

    let data = fs::read(&args.image)?;
    let name = args.image.file_stem().and_then(|s| s.to_str()).unwrap_or("guest");
    let opts = LoadOptions { base: args.base, rw_offset: args.rw_offset, bss_size: args.bss, ..LoadOptions::default() };
    let loaded = emulator.load_flat_image(name, &data, &opts)?;

    if args.deterministic {
        let slices = emulator.run_until_idle(args.max_slices);
        info!("ran {slices} slices");
    } else {
        let stop = AtomicBool::new(false);
        emulator.run_threaded(&stop);
    }

    let output = emulator.debug_output(loaded.process);
    if !output.is_empty() {
        let mut stdout = io::stdout().lock();
        stdout.write_all(output.as_bytes())?;
        stdout.flush()?;
    }

    let state = emulator.process_state(loaded.process);
    if let Some(reason) = emulator.exit_reason(loaded.process) {
        info!("process {reason}");
    }
    if let (Some(path), Some(report)) = (&args.crash_report, emulator.crash_report(loaded.process)) {
        fs::write(path, report.to_bytes()?)?;
        info!("crash report written to {}", path.display());
    }
    Ok(match state {
        Some(ProcessState::Exited) => ExitCode::SUCCESS,
        Some(ProcessState::Running) => {
            info!("process still running after {} slices", args.max_slices);
            ExitCode::from(2)
        }
        _ => ExitCode::FAILURE,
    })
}
