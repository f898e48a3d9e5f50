//! Command-line front-end: load an ELF, run it under an instruction
//! budget, report the guest's exit code.

use std::fs;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use riscv_core::{Machine, MachineOptions};

/// Run a RISC-V user-space binary under the emulator core.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the ELF binary to load and run.
    binary: String,

    /// Maximum number of instructions to execute before giving up.
    #[arg(long, default_value_t = 10_000_000)]
    max_instructions: u64,

    /// Guest heap/stack size overrides, in bytes.
    #[arg(long, default_value_t = 64 << 20)]
    memory_max: u64,

    /// Print every `ebreak` the guest hits instead of ignoring it.
    #[arg(long)]
    trace_ebreak: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("riscv-run: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<u64> {
    let args = Args::parse();

    let binary = fs::read(&args.binary).with_context(|| format!("reading {}", args.binary))?;

    let options = MachineOptions { memory_max: args.memory_max, ..MachineOptions::default() };

    let mut machine = Machine::new(binary, options).context("loading ELF image")?;
    machine.set_printer(Box::new(|bytes| {
        use std::io::Write;
        let _ = std::io::stdout().write_all(bytes);
    }));
    if args.trace_ebreak {
        machine.set_debug_printer(Box::new(|bytes| {
            use std::io::Write;
            let _ = std::io::stderr().write_all(bytes);
        }));
    }

    machine.simulate(args.max_instructions).context("running guest program")?;
    Ok(machine.return_value())
}
