use clap::Parser;
use std::path::PathBuf;

/// Bench instrumentation acquisition daemon
#[derive(Parser, Debug)]
#[command(name = "benchtap", version, about)]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Delete all stored readings and sessions, then exit
    #[arg(long)]
    reset_db: bool,

    /// Print partition row counts, then exit
    #[arg(long)]
    check_db: bool,

    /// Override the WebSocket bind address
    #[arg(long)]
    bind: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    let options = benchtap_lib::RunOptions {
        config: cli.config,
        bind: cli.bind,
        check_db: cli.check_db,
        reset_db: cli.reset_db,
    };

    if let Err(e) = benchtap_lib::run(options) {
        eprintln!("benchtap: {}", e);
        std::process::exit(1);
    }
}
