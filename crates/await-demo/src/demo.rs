//!
//! The experiment: a driver awaiting `first` ten times, and `first`
//! launching ten `inner` children it never waits for.
//!
//! `first` runs inline in the driver's task, so all of its events share the
//! driver's task id. Every child is its own task.
//!

use std::sync::Arc;

use task::{Handle, sleep};

use crate::{
    config::Config,
    error::DemoError,
    event::{Direction, EventSink, Line, LogEvent},
};

pub const FIRST: &str = "First";
pub const INNER: &str = "Inner";

#[derive(Clone)]
pub struct Demo {
    config: Arc<Config>,
    sink: Arc<dyn EventSink>,
    handle: Handle,
}

impl Demo {
    pub fn new(config: Config, sink: Arc<dyn EventSink>, handle: Handle) -> Self {
        Demo {
            config: Arc::new(config),
            sink,
            handle,
        }
    }

    /// Outer driver: each `first` is awaited before the next starts.
    pub async fn run(self) -> Result<(), DemoError> {
        self.sink.record(Line::Starting);
        for i in 0..self.config.outer {
            self.first(i).await?;
        }
        self.sink.record(Line::Exiting);
        Ok(())
    }

    pub async fn first(&self, i: usize) -> Result<(), DemoError> {
        self.log(Direction::Enter, FIRST, i, 0);
        sleep(self.config.delay).await;

        for j in 0..self.config.inner {
            let child = self.clone().inner(i, j);
            if self.config.await_inner {
                self.handle.spawn(child).await?;
            } else {
                // Not awaited: the child races this task and its siblings
                self.handle.spawn_detached(child);
            }
        }

        self.log(Direction::Leave, FIRST, i, 0);
        Ok(())
    }

    pub async fn inner(self, i: usize, j: usize) {
        self.log(Direction::Enter, INNER, i, j);
        sleep(self.config.delay).await;
        self.log(Direction::Leave, INNER, i, j);
    }

    fn log(&self, direction: Direction, operation: &'static str, outer: usize, inner: usize) {
        self.sink.record(Line::Event(LogEvent::capture(
            direction, operation, outer, inner,
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Recorder;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use task::Builder;

    fn config(outer: usize, inner: usize) -> Config {
        Config {
            workers: Some(2),
            outer,
            inner,
            delay: Duration::from_millis(5),
            grace: Duration::from_secs(5),
            await_inner: false,
        }
    }

    #[test]
    fn inner_logs_enter_then_leave_in_one_task() {
        let runtime = Builder::new().workers(2).build().expect("runtime");
        let recorder = Arc::new(Recorder::new());
        let demo = Demo::new(config(1, 1), recorder.clone(), runtime.handle());

        runtime.block_on(demo.inner(3, 4)).expect("inner");
        runtime.shutdown(Duration::ZERO);

        let events: Vec<_> = recorder
            .lines()
            .iter()
            .filter_map(|l| l.event().cloned())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(
            (events[0].direction, events[0].operation, events[0].outer, events[0].inner),
            (Direction::Enter, INNER, 3, 4)
        );
        assert_eq!(
            (events[1].direction, events[1].operation, events[1].outer, events[1].inner),
            (Direction::Leave, INNER, 3, 4)
        );
        assert_eq!(events[0].task, events[1].task);
    }

    #[test]
    fn first_leaves_without_waiting_for_children() {
        let runtime = Builder::new().workers(2).build().expect("runtime");
        let recorder = Arc::new(Recorder::new());
        let mut config = config(1, 3);
        // Long enough that no child can finish before first leaves
        config.delay = Duration::from_millis(20);
        let demo = Demo::new(config, recorder.clone(), runtime.handle());

        runtime
            .block_on(async move { demo.first(0).await })
            .expect("driver")
            .expect("first");

        let lines = recorder.lines();
        let leave = lines
            .iter()
            .position(|l| {
                l.event()
                    .is_some_and(|e| e.operation == FIRST && e.direction == Direction::Leave)
            })
            .expect("first left");
        let child_leaves_before = lines[..leave]
            .iter()
            .filter_map(Line::event)
            .filter(|e| e.operation == INNER && e.direction == Direction::Leave)
            .count();
        assert_eq!(child_leaves_before, 0);
        runtime.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn awaited_children_finish_before_first_leaves() {
        let runtime = Builder::new().workers(2).build().expect("runtime");
        let recorder = Arc::new(Recorder::new());
        let mut config = config(1, 3);
        config.await_inner = true;
        let demo = Demo::new(config, recorder.clone(), runtime.handle());

        runtime
            .block_on(async move { demo.first(0).await })
            .expect("driver")
            .expect("first");
        assert_eq!(runtime.shutdown(Duration::ZERO), 0);

        let last = recorder
            .lines()
            .last()
            .and_then(|l| l.event().cloned())
            .expect("event");
        assert_eq!((last.direction, last.operation), (Direction::Leave, FIRST));
    }
}
