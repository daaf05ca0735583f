//! Emulator command-line front end.
//!
//! This binary provides the entry point for userspace emulation runs:
//! 1. **Run:** Load a 32-bit guest ELF (MIPS or x86, detected from the
//!    header) and emulate it to completion.
//! 2. **Redirection:** Optional stdin/stdout files for the guest.
//! 3. **Timing:** Optional memory-hierarchy description (JSON) routing
//!    guest data accesses through the coherence engine.

use std::process;

use clap::{Parser, Subcommand};

use mcsim_core::loader::Loader;
use mcsim_core::{Config, Emu};

#[derive(Parser, Debug)]
#[command(
    name = "mcsim",
    author,
    version,
    about = "Userspace multi-ISA emulator with a coherent memory-hierarchy model",
    long_about = "Run a 32-bit little-endian guest ELF against a simulated Linux ABI.\n\nExamples:\n  mcsim run tests/bin/hello\n  mcsim run --stdout out.txt benchmarks/qsort input.dat\n  mcsim run --hierarchy two-level.json --report benchmarks/fft"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a guest program to completion.
    Run {
        /// Guest ELF executable.
        exe: String,

        /// Arguments passed to the guest (argv[1:]).
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Redirect guest stdin from a file.
        #[arg(long)]
        stdin: Option<String>,

        /// Redirect guest stdout/stderr to a file.
        #[arg(long)]
        stdout: Option<String>,

        /// Memory-hierarchy description (JSON config).
        #[arg(long)]
        hierarchy: Option<String>,

        /// Stop after this many guest instructions.
        #[arg(long, default_value_t = 0)]
        max_inst: u64,

        /// Print the statistics report at exit.
        #[arg(long)]
        report: bool,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            exe,
            args,
            stdin,
            stdout,
            hierarchy,
            max_inst,
            report,
        } => cmd_run(exe, args, stdin, stdout, hierarchy, max_inst, report),
    }
}

fn cmd_run(
    exe: String,
    args: Vec<String>,
    stdin: Option<String>,
    stdout: Option<String>,
    hierarchy: Option<String>,
    max_inst: u64,
    report: bool,
) {
    let config = match &hierarchy {
        Some(path) => {
            let text = std::fs::read_to_string(path).unwrap_or_else(|e| {
                eprintln!("mcsim: cannot read hierarchy config '{}': {}", path, e);
                process::exit(1);
            });
            Config::from_json(&text).unwrap_or_else(|e| {
                eprintln!("mcsim: bad hierarchy config '{}': {}", path, e);
                process::exit(1);
            })
        }
        None => Config::default(),
    };

    let mut ld = Loader {
        exe: exe.clone(),
        cwd: std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        stdin_path: stdin,
        stdout_path: stdout,
        ..Loader::default()
    };
    ld.args = std::iter::once(exe).chain(args).collect();
    ld.env = vec![
        "PATH=/usr/bin:/bin".to_string(),
        "HOME=/root".to_string(),
        format!("PWD={}", ld.cwd),
    ];

    let mut emu = Emu::new();
    if max_inst > 0 {
        emu.max_instructions = max_inst;
    } else if config.max_instructions > 0 {
        emu.max_instructions = config.max_instructions;
    }

    // Wire up the hierarchy and point the first context's accesses at the
    // first L1-like module (one with no uppers listed).
    let first_l1 = config.hierarchy.as_ref().and_then(|h| {
        let ids = h.build(&mut emu.engine).unwrap_or_else(|e| {
            eprintln!("mcsim: {}", e);
            process::exit(1);
        });
        h.modules
            .iter()
            .find(|m| m.uppers.is_empty() && !m.main_memory)
            .and_then(|m| ids.iter().find(|(n, _)| *n == m.name).map(|(_, id)| *id))
    });

    let pid = match emu.load(ld) {
        Ok(pid) => pid,
        Err(e) => {
            eprintln!("mcsim: {}", e);
            process::exit(1);
        }
    };
    if let Some(module) = first_l1 {
        emu.attach_timing(pid, module);
    }

    match emu.run() {
        Ok(code) => {
            if report {
                print!("{}", emu.stats.report(&emu.engine));
            }
            process::exit(code & 0xff);
        }
        Err(e) => {
            eprintln!("mcsim: fatal: {}", e);
            process::exit(1);
        }
    }
}
