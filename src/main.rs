//! Entry point: parse CLI args, load configuration, run the supervisor.
//!
//! CLI surface follows `websites-prometheus`'s `clap::Parser` usage: a single required
//! positional config path, no per-run overrides: the config file is the sole source of
//! runtime parameters.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "wardend", about = "Inline intrusion prevention system")]
struct Args {
    /// Path to the YAML configuration file.
    config: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let cfg = match warden::config::load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("failed to load config {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    match warden::supervisor::run(cfg, ".") {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
