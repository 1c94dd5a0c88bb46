//! Command-line front-end: boot a guest executable and run it headless.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::info;

use muon_arm7::CoreEngine;
use muon_kernel::{Runtime, RuntimeOptions};

/// User-space emulator for Prime OS ARM handheld executables.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Guest executable to run (PE32 or 32-bit ARM ELF).
    executable: PathBuf,

    /// Directory searched for dependency DLLs.
    #[arg(long, default_value = "prime_data/A/WINDOW/SYSTEM")]
    system_dir: PathBuf,

    /// Kernel ROM blob mapped at the platform base, skipped when absent.
    #[arg(long, default_value = "PRIME_OS.ROM")]
    rom: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let opts = RuntimeOptions {
        executable: cli.executable.clone(),
        system_dir: cli.system_dir,
        rom: Some(cli.rom),
    };
    let mut runtime = Runtime::new(CoreEngine::new(), &opts)
        .with_context(|| format!("booting {}", cli.executable.display()))?;

    info!("starting {}", cli.executable.display());
    runtime.run();
    Ok(())
}
