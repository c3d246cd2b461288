//!
//! Per-thread view of what the executor is currently running
//!
//! Worker threads record their [`WorkerId`] and runtime handle once at start;
//! the task id is set for the duration of each poll. A task's worker is not
//! part of its identity and may differ after every suspension point.
//!

use std::{
    cell::{Cell, RefCell},
    fmt,
};

use crate::{TaskId, executor::Handle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(usize);

impl WorkerId {
    pub(crate) fn new(index: usize) -> Self {
        WorkerId(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

thread_local! {
    static WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
    static TASK: Cell<Option<TaskId>> = const { Cell::new(None) };
    static HANDLE: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

/// Id of the task being polled on this thread, if any.
pub fn current_task_id() -> Option<TaskId> {
    TASK.with(Cell::get)
}

/// Id of the pool worker this thread belongs to; `None` off the pool.
pub fn current_worker_id() -> Option<WorkerId> {
    WORKER.with(Cell::get)
}

pub(crate) fn current_handle() -> Option<Handle> {
    HANDLE.with(|handle| handle.borrow().clone())
}

pub(crate) fn enter_worker(worker: WorkerId, handle: Handle) {
    WORKER.with(|cell| cell.set(Some(worker)));
    HANDLE.with(|cell| *cell.borrow_mut() = Some(handle));
}

pub(crate) fn exit_worker() {
    WORKER.with(|cell| cell.set(None));
    // Drop the handle so the runtime's shared state can be freed
    let handle = HANDLE.with(|cell| cell.borrow_mut().take());
    drop(handle);
}

/// Marks `task` as current until dropped.
pub(crate) struct TaskGuard {
    previous: Option<TaskId>,
}

impl TaskGuard {
    pub(crate) fn enter(task: TaskId) -> Self {
        let previous = TASK.with(|cell| cell.replace(Some(task)));
        TaskGuard { previous }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        TASK.with(|cell| cell.set(self.previous));
    }
}
