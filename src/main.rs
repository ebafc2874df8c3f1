//! Entry point: parses CLI arguments, configures logging, and runs the
//! supervisor to completion, mapping its result onto a process exit code.
//!
//! Ground truth: `examples/original_source/src/BaseApp.cpp`'s `main()` (the
//! `EXIT_OK` / `EXIT_SOFTWARE` split between success and a caught exception), and
//! `examples/easternanemone-rust-daq/src/main.rs` for the `env_logger` +
//! `RUST_LOG` initialization pattern.

use clap::Parser;
use log::{error, LevelFilter};

use grid_supervisor::config::CliArgs;
use grid_supervisor::error::SupervisorError;
use grid_supervisor::supervisor;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG_ERROR: i32 = 78;
const EXIT_RUNTIME_ERROR: i32 = 70;

fn main() {
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LevelFilter::Info);
    env_logger::Builder::new().filter_level(log_level).init();

    let args = CliArgs::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start async runtime: {e}");
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    };

    let exit_code = match runtime.block_on(supervisor::run(args)) {
        Ok(code) => code,
        Err(SupervisorError::Config(message)) => {
            error!("{message}");
            EXIT_CONFIG_ERROR
        }
        Err(e) => {
            error!("{e}");
            EXIT_RUNTIME_ERROR
        }
    };

    std::process::exit(if exit_code == 0 { EXIT_OK } else { exit_code });
}
