//! Log events and where they are written.

use std::{
    fmt,
    io::{self, Write},
    sync::{Mutex, PoisonError},
};

use task::{TaskId, WorkerId, current_task_id, current_worker_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Enter,
    Leave,
}

impl Direction {
    fn marker(self) -> &'static str {
        match self {
            Direction::Enter => ">>>",
            Direction::Leave => "<<<",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Enter => f.write_str("Enter"),
            Direction::Leave => f.write_str("Leave"),
        }
    }
}

/// One Enter or Leave, tagged with whatever the executor was running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub direction: Direction,
    pub operation: &'static str,
    pub outer: usize,
    pub inner: usize,
    pub task: Option<TaskId>,
    pub worker: Option<WorkerId>,
}

impl LogEvent {
    /// Builds an event for the task and worker current on this thread.
    pub fn capture(
        direction: Direction,
        operation: &'static str,
        outer: usize,
        inner: usize,
    ) -> Self {
        LogEvent {
            direction,
            operation,
            outer,
            inner,
            task: current_task_id(),
            worker: current_worker_id(),
        }
    }
}

struct OrDash<T>(Option<T>);

impl<T: fmt::Display> fmt::Display for OrDash<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(value) => fmt::Display::fmt(value, f),
            None => f.write_str("-"),
        }
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}-{}.{} {} {}",
            self.direction.marker(),
            self.direction,
            self.operation,
            self.outer,
            self.inner,
            OrDash(self.task),
            OrDash(self.worker),
        )
    }
}

/// A single line of demo output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Starting,
    Exiting,
    Event(LogEvent),
}

impl Line {
    pub fn event(&self) -> Option<&LogEvent> {
        match self {
            Line::Event(event) => Some(event),
            Line::Starting | Line::Exiting => None,
        }
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Line::Starting => f.write_str("Starting"),
            Line::Exiting => f.write_str("Exiting"),
            Line::Event(event) => fmt::Display::fmt(event, f),
        }
    }
}

/// Receives demo output. Implementations must never fail or block for long.
pub trait EventSink: Send + Sync {
    fn record(&self, line: Line);
}

/// Writes each line whole under the stdout lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl EventSink for StdoutSink {
    fn record(&self, line: Line) {
        let mut out = io::stdout().lock();
        // A closed stdout is not the demo's problem
        let _ = writeln!(out, "{line}");
    }
}

/// Keeps every line in arrival order.
#[derive(Debug, Default)]
pub struct Recorder {
    lines: Mutex<Vec<Line>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<Line> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for Recorder {
    fn record(&self, line: Line) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case(Direction::Enter, "First", 3, 0, ">>> Enter First-3.0 - -")]
    #[case(Direction::Leave, "First", 9, 0, "<<< Leave First-9.0 - -")]
    #[case(Direction::Enter, "Inner", 2, 7, ">>> Enter Inner-2.7 - -")]
    #[case(Direction::Leave, "Inner", 0, 9, "<<< Leave Inner-0.9 - -")]
    fn off_pool_events_print_dashes(
        #[case] direction: Direction,
        #[case] operation: &'static str,
        #[case] outer: usize,
        #[case] inner: usize,
        #[case] expected: &str,
    ) {
        let event = LogEvent::capture(direction, operation, outer, inner);
        assert_eq!(event.to_string(), expected);
    }

    #[test]
    fn captured_event_carries_task_and_worker() {
        let runtime = task::Builder::new().workers(2).build().expect("runtime");
        let event = runtime
            .block_on(async { LogEvent::capture(Direction::Enter, "Inner", 4, 5) })
            .expect("task");
        runtime.shutdown(Duration::ZERO);

        let task = event.task.expect("task id");
        let worker = event.worker.expect("worker id");
        assert_eq!(event.to_string(), format!(">>> Enter Inner-4.5 {task} {worker}"));
    }

    #[test]
    fn banners_are_literal() {
        assert_eq!(Line::Starting.to_string(), "Starting");
        assert_eq!(Line::Exiting.to_string(), "Exiting");
        assert!(Line::Starting.event().is_none());
    }

    #[test]
    fn recorder_keeps_arrival_order() {
        let recorder = Recorder::new();
        recorder.record(Line::Starting);
        recorder.record(Line::Event(LogEvent::capture(Direction::Enter, "First", 0, 0)));
        recorder.record(Line::Exiting);

        let lines = recorder.lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], Line::Starting);
        assert_eq!(lines[2], Line::Exiting);
    }
}
