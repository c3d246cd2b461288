//! Command-line configuration.
//!
//! Every flag has a default; with no flags the demo runs ten outer
//! iterations of ten detached children each and abandons whatever is still
//! running when the driver finishes.

use std::time::Duration;

use clap::Parser;

/// Shows that awaiting in sequence is serial and that a missing await is not.
#[derive(Parser, Debug)]
#[command(name = "await-demo")]
pub struct Args {
    /// Worker threads in the pool [default: available CPUs, at least 2]
    #[arg(long)]
    pub workers: Option<usize>,

    /// Outer iterations, awaited one after another
    #[arg(long, default_value_t = 10)]
    pub outer: usize,

    /// Children launched per outer iteration
    #[arg(long, default_value_t = 10)]
    pub inner: usize,

    /// Suspension inside every operation, in milliseconds
    #[arg(long, default_value_t = 50)]
    pub delay_ms: u64,

    /// How long to wait for unfinished children before exiting, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub grace_ms: u64,

    /// Await each child instead of detaching it; output becomes serial
    #[arg(long)]
    pub await_inner: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub workers: Option<usize>,
    pub outer: usize,
    pub inner: usize,
    pub delay: Duration,
    pub grace: Duration,
    pub await_inner: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: None,
            outer: 10,
            inner: 10,
            delay: Duration::from_millis(50),
            grace: Duration::ZERO,
            await_inner: false,
        }
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Config {
            workers: args.workers,
            outer: args.outer,
            inner: args.inner,
            delay: Duration::from_millis(args.delay_ms),
            grace: Duration::from_millis(args.grace_ms),
            await_inner: args.await_inner,
        }
    }
}
