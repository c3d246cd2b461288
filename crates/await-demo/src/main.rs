//!
//! Await demo entry point
//!

use std::{process, sync::Arc};

use await_demo::{Args, Config, StdoutSink};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    // Diagnostics go to stderr; stdout carries only the demo's lines
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from(Args::parse());
    tracing::debug!(?config, "starting demo");

    let exit_code = match await_demo::run(config, Arc::new(StdoutSink)) {
        Ok(abandoned) => {
            tracing::info!(abandoned, "demo finished");
            0
        }
        Err(e) => {
            tracing::error!("demo failed: {e}");
            1
        }
    };

    process::exit(exit_code);
}
