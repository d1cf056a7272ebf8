#![forbid(unsafe_code)]

use std::path::PathBuf;

use chronodb::cli::{self, Command};
use chronodb::{Engine, EngineConfig, Strategy};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "chronodb", version, about = "chronodb benchmark CLI", long_about = None)]
struct Cli {
    /// Data directory (overrides config file / default).
    #[arg(long, help = "Data root directory")]
    root: Option<PathBuf>,
    /// Storage strategy: wal-only | wal-to-page | memory-only | memory-plus-page.
    #[arg(long, help = "Storage strategy")]
    strategy: Option<String>,
    /// Byte budget for the in-memory chunk table.
    #[arg(long, help = "In-memory byte budget")]
    memory_limit: Option<usize>,
    /// Open read-only; write-oriented subcommands are rejected.
    #[arg(long, help = "Open read-only")]
    readonly: bool,
    #[arg(long, help = "Path to a chronodb.toml config file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(name = "bench-write", about = "Append synthetic measurements and report throughput")]
    BenchWrite {
        #[arg(long, default_value_t = 100_000, help = "Number of measurements to append")]
        count: u64,
        #[arg(long, default_value_t = 16, help = "Number of distinct series ids to spread writes across")]
        series: u32,
    },
    #[command(name = "bench-read", about = "Run repeated interval scans and report sample counts")]
    BenchRead {
        #[arg(long, default_value_t = 100, help = "Number of interval scans to run")]
        runs: u32,
        #[arg(long, default_value_t = 1000, help = "Width in ms of each scan window")]
        window_ms: u64,
    },
    #[command(about = "Rebuild the manifest from a directory scan, dropping unverifiable pages")]
    Fsck,
    #[command(about = "Merge every page overlapping [from, to] into one")]
    Compact {
        #[arg(help = "Inclusive lower time bound")]
        from: u64,
        #[arg(help = "Inclusive upper time bound")]
        to: u64,
    },
}

fn parse_strategy(s: &str) -> Option<Strategy> {
    match s {
        "wal-only" => Some(Strategy::WalOnly),
        "wal-to-page" => Some(Strategy::WalToPage),
        "memory-only" => Some(Strategy::MemoryOnly),
        "memory-plus-page" => Some(Strategy::MemoryPlusPage),
        _ => None,
    }
}

fn build_config(cli: &Cli) -> Result<EngineConfig, String> {
    let mut cfg = chronodb::config::load(cli.config.as_deref());
    if let Some(root) = &cli.root {
        cfg.root = root.clone();
    }
    if let Some(s) = &cli.strategy {
        cfg.strategy = parse_strategy(s).ok_or_else(|| format!("unknown strategy {s:?}"))?;
    }
    if let Some(limit) = cli.memory_limit {
        cfg.memory_limit = limit;
    }
    cfg.readonly = cfg.readonly || cli.readonly;
    Ok(cfg)
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = chronodb::logger::init_for_root(cli.root.as_deref().unwrap_or_else(|| std::path::Path::new("chronodb-data"))) {
        eprintln!("warning: logging not initialized: {e}");
    }

    let config = match build_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let write_command = matches!(cli.command, Commands::BenchWrite { .. });
    if config.readonly && write_command {
        eprintln!("error: bench-write is unavailable with --readonly");
        std::process::exit(1);
    }

    let engine = match Engine::open(config) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let command = match cli.command {
        Commands::BenchWrite { count, series } => Command::BenchWrite { count, series },
        Commands::BenchRead { runs, window_ms } => Command::BenchRead { runs, window_ms },
        Commands::Fsck => Command::Fsck,
        Commands::Compact { from, to } => Command::Compact { from, to },
    };

    match cli::run(&engine, command) {
        Ok(report) => {
            println!("{} ({}ms)", report.summary, report.elapsed_ms);
            if let Err(e) = engine.stop() {
                eprintln!("error during shutdown: {e}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
