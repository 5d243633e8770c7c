//! CLI entry point: locate `forward.conf` in the current directory, wire up
//! logging, and hand off to [`relayd::run`].
//!
//! Kept deliberately thin: all of the forwarding behavior lives in the
//! library crate so it can be exercised directly from integration tests.

use std::process::ExitCode;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();
}

fn main() -> ExitCode {
    init_logging();

    let config_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::error!("could not determine current directory: {e}");
            return ExitCode::FAILURE;
        }
    };

    match relayd::run(&config_dir) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
