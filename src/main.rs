use std::path::PathBuf;

use clap::Parser;
use log::error;

use micsim::arch::Arch;
use micsim::sim::config::SimConfig;
use micsim::sim::top::System;

/// Software emulator for the Intel MIC (Knights Corner / Knights Landing)
/// coprocessors.
#[derive(Parser)]
#[command(version, about)]
struct MicsimArgs {
    #[arg(help = "Path to the MIC ELF binary")]
    binary: PathBuf,

    #[arg(short, long, help = "Enable the interactive debugger")]
    debug: bool,
    #[arg(short, long, help = "Enable performance counters and final report")]
    performance: bool,
    #[arg(short, long, help = "Enable the ring bus simulator")]
    ring_bus: bool,
    #[arg(short, long, value_enum, help = "Target architecture")]
    arch: Option<Arch>,
    #[arg(short, long, help = "Number of cores to simulate (default: arch max)")]
    cores: Option<usize>,
    #[arg(short, long, help = "Memory size in MiB (default: arch max)")]
    memory: Option<u64>,
    #[arg(short = 'f', long, help = "Configuration file (TOML)")]
    config: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let args = MicsimArgs::parse();

    let mut config = args
        .config
        .as_deref()
        .map(SimConfig::from_file)
        .unwrap_or_default();

    // --arch resets cores and memory to the selected architecture's
    // defaults; explicit --cores/--memory still win afterwards
    if let Some(arch) = args.arch {
        config.arch = arch;
        config.cores = 0;
        config.memory_mb = 0;
    }
    if let Some(cores) = args.cores {
        config.cores = cores;
    }
    if let Some(memory) = args.memory {
        config.memory_mb = memory;
    }
    config.debug |= args.debug;
    config.performance |= args.performance;
    config.ring_bus |= args.ring_bus;

    let profile = config.arch.profile();
    println!("micsim - Many Integrated Core software emulator");
    println!("Binary: {}", args.binary.display());
    println!("Architecture: {}", profile.name);
    println!("Cores: {}", config.effective_cores());
    println!("Memory: {} MiB", config.effective_memory_size() >> 20);

    let code = match System::new(&config).and_then(|system| system.run_binary(&args.binary)) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            eprintln!("micsim: {err}");
            1
        }
    };
    std::process::exit(code);
}
