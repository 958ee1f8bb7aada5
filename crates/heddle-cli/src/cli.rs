use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "heddle")]
#[command(about = "Dependency-aware task orchestration", long_about = None)]
pub struct Cli {
    #[arg(long, global = true, help = "Config file (default: ~/.heddle/heddle.toml)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "SQLite state file (overrides [storage] path)")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run two dependent tasks end to end and print the emitted events")]
    Demo,

    #[command(about = "Register the tasks of a plan file and print their execution order")]
    Plan {
        #[arg(help = "Plan file ([[tasks]] with key, type, priority, after, payload)")]
        file: PathBuf,

        #[arg(long, help = "Dispatch the plan to echo services after registering it")]
        run: bool,
    },

    #[command(about = "Show lease conflicts and expiry on a simulated clock")]
    Locks,
}
