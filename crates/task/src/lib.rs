//!
//! Multi-worker async executor used by the await demo
//!
//! Tasks are boxed futures with a process-unique [`TaskId`]. Workers pull
//! runnable tasks from a shared queue; wakers push them back.
//!

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

pub mod context;
pub mod error;
pub mod executor;
pub mod timer;

pub use context::{WorkerId, current_task_id, current_worker_id};
pub use error::{Error, JoinError};
pub use executor::{Builder, Handle, JoinHandle, Runtime};
pub use timer::{Sleep, sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn new() -> Self {
        // Ids start at 1 and are never reused
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A unit of scheduled work.
///
/// The future sits behind a mutex so any worker may poll it. Once it
/// completes (or is cancelled) the slot is emptied and later polls are no-ops.
pub struct Task {
    id: TaskId,
    future: Mutex<Option<BoxFuture>>,
}

impl Task {
    pub fn new(future: impl Future<Output = ()> + Send + 'static) -> Task {
        Task {
            id: TaskId::new(),
            future: Mutex::new(Some(Box::pin(future))),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Polls the future once.
    ///
    /// Returns `Ready` only on the poll that finishes the future; a stale
    /// wakeup for a finished task reports `Pending` and does nothing.
    pub(crate) fn poll(&self, context: &mut Context) -> Poll<()> {
        let mut slot = self.future.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(future) = slot.as_mut() else {
            return Poll::Pending;
        };
        match future.as_mut().poll(context) {
            Poll::Ready(()) => {
                *slot = None;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Drops the future without running it to completion.
    pub(crate) fn cancel(&self) {
        let future = self
            .future
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // Dropped outside the lock: the future may own wakers for this task
        drop(future);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("id", &self.id).finish_non_exhaustive()
    }
}
