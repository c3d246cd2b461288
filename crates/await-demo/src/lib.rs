//!
//! Sequential awaits do not run in parallel; a missing await does.
//!
//! [`run`] drives the experiment on a fresh [`task::Runtime`] and reports how
//! many detached children were still unfinished when it shut down.
//!

use std::sync::Arc;

use task::Builder;

pub mod config;
pub mod demo;
pub mod error;
pub mod event;

pub use config::{Args, Config};
pub use demo::Demo;
pub use error::DemoError;
pub use event::{Direction, EventSink, Line, LogEvent, Recorder, StdoutSink};

/// Runs the demo to completion and returns the number of abandoned tasks.
///
/// Children still running once the driver finishes get `config.grace` to
/// complete; whatever remains is dropped.
pub fn run(config: Config, sink: Arc<dyn EventSink>) -> Result<usize, DemoError> {
    let mut builder = Builder::new().thread_name("demo-worker");
    if let Some(workers) = config.workers {
        builder = builder.workers(workers);
    }
    let runtime = builder.build()?;

    let grace = config.grace;
    let demo = Demo::new(config, sink, runtime.handle());
    let outcome = runtime.block_on(demo.run());

    let abandoned = runtime.shutdown(grace);
    outcome??;
    Ok(abandoned)
}
