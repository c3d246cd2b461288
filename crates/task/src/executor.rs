use std::{
    collections::BTreeMap,
    future::Future,
    mem,
    panic::AssertUnwindSafe,
    pin::{Pin, pin},
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, Wake, Waker},
    thread::{self, Thread},
    time::Duration,
};

use crossbeam_queue::SegQueue;
use futures_util::{FutureExt, task::AtomicWaker};

use crate::{
    Error, JoinError, Task, TaskId,
    context::{self, TaskGuard, WorkerId},
    error::panic_message,
    timer,
};

const DEFAULT_THREAD_NAME: &str = "task-worker";

/// Configures and starts a [`Runtime`].
#[derive(Debug, Clone)]
pub struct Builder {
    workers: usize,
    thread_name: String,
}

impl Builder {
    /// One worker per available CPU, at least two.
    pub fn new() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .max(2);
        Builder {
            workers,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn build(self) -> Result<Runtime, Error> {
        if self.workers == 0 {
            return Err(Error::NoWorkers);
        }
        timer::ensure_started()?;

        let shared = Arc::new(Shared::new());
        let mut runtime = Runtime {
            shared: Arc::clone(&shared),
            workers: Vec::with_capacity(self.workers),
        };
        for index in 0..self.workers {
            let name = format!("{}-{}", self.thread_name, index);
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || run_worker(worker_shared, WorkerId::new(index)));
            match spawned {
                Ok(join) => runtime.workers.push(join),
                // Dropping `runtime` stops the workers already started
                Err(source) => return Err(Error::SpawnThread { name, source }),
            }
        }
        tracing::debug!(workers = self.workers, "runtime started");
        Ok(runtime)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the worker threads. Dropping it shuts down with no grace period.
pub struct Runtime {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Runtime {
    pub fn handle(&self) -> Handle {
        Handle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs `future` as a task on the pool and blocks this thread until it
    /// completes.
    ///
    /// Must not be called from a worker thread: it would park a worker.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output, JoinError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        park_on(self.handle().spawn(future))
    }

    /// Waits up to `grace` for every live task to finish, then stops the
    /// workers. Returns how many tasks were abandoned unfinished.
    pub fn shutdown(mut self, grace: Duration) -> usize {
        self.shutdown_inner(grace)
    }

    fn shutdown_inner(&mut self, grace: Duration) -> usize {
        let live = self.shared.wait_drained(grace);
        if live > 0 {
            tracing::debug!(live, ?grace, "grace period over with tasks still live");
        }

        self.shared.stop();
        for worker in mem::take(&mut self.workers) {
            if worker.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }

        let abandoned = self.shared.cancel_all();
        tracing::debug!(abandoned, "runtime stopped");
        abandoned
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown_inner(Duration::ZERO);
        }
    }
}

/// Cloneable reference to a running [`Runtime`], used to spawn tasks.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// Handle of the runtime polling the current task.
    pub fn current() -> Result<Handle, Error> {
        context::current_handle().ok_or(Error::NoRuntime)
    }

    /// Spawns `future` and returns a handle resolving to its output.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let state = Arc::new(JoinState::new());
        let completer = Completer {
            state: Some(Arc::clone(&state)),
        };
        let task = Task::new(async move {
            let output = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .map_err(JoinError::from_panic);
            completer.complete(output);
        });
        let id = task.id();
        self.shared.submit(task);
        JoinHandle { id, state }
    }

    /// Spawns `future` without any way to observe it.
    ///
    /// The caller learns neither when the task completes nor whether it
    /// panicked. A panic is caught and only recorded as a debug event.
    pub fn spawn_detached<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shared.submit(Task::new(async move {
            if let Err(payload) = AssertUnwindSafe(future).catch_unwind().await {
                tracing::debug!(
                    task_id = ?context::current_task_id(),
                    "detached task panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }));
    }

    /// Number of tasks spawned and not yet finished.
    pub fn live_tasks(&self) -> usize {
        self.shared.lock_tasks().len()
    }
}

struct Shared {
    // Runnable tasks; a task may appear more than once
    run_queue: SegQueue<Arc<Task>>,
    // Every live task, so shutdown can drop what never finished
    tasks: Mutex<BTreeMap<TaskId, Arc<Task>>>,
    drained: Condvar,
    idle: Mutex<()>,
    wakeup: Condvar,
    stopped: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Shared {
            run_queue: SegQueue::new(),
            tasks: Mutex::new(BTreeMap::new()),
            drained: Condvar::new(),
            idle: Mutex::new(()),
            wakeup: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, BTreeMap<TaskId, Arc<Task>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_idle(&self) -> MutexGuard<'_, ()> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn submit(&self, task: Task) {
        let task = Arc::new(task);
        {
            // Checked under the lock so shutdown cannot miss a late insert
            let mut tasks = self.lock_tasks();
            if self.is_stopped() {
                tracing::debug!(task_id = %task.id(), "runtime stopped, dropping spawned task");
                return;
            }
            tasks.insert(task.id(), Arc::clone(&task));
        }
        tracing::trace!(task_id = %task.id(), "spawn");
        self.schedule(task);
    }

    fn schedule(&self, task: Arc<Task>) {
        self.run_queue.push(task);
        // Taking the idle lock orders this notify after a worker's empty check
        let _idle = self.lock_idle();
        self.wakeup.notify_one();
    }

    fn run_task(self: &Arc<Self>, task: Arc<Task>) {
        let waker = TaskWaker::new(Arc::clone(&task), Arc::downgrade(self));
        let mut context = Context::from_waker(&waker);
        let poll = {
            let _current = TaskGuard::enter(task.id());
            task.poll(&mut context)
        };
        if poll.is_ready() {
            self.finish(task.id());
        }
    }

    fn finish(&self, task_id: TaskId) {
        let mut tasks = self.lock_tasks();
        tasks.remove(&task_id);
        if tasks.is_empty() {
            self.drained.notify_all();
        }
    }

    /// Blocks until no task is live or `grace` elapses; returns the live count.
    fn wait_drained(&self, grace: Duration) -> usize {
        let tasks = self.lock_tasks();
        let (tasks, _) = self
            .drained
            .wait_timeout_while(tasks, grace, |tasks| !tasks.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        tasks.len()
    }

    fn stop(&self) {
        let _tasks = self.lock_tasks();
        let _idle = self.lock_idle();
        self.stopped.store(true, Ordering::Release);
        self.wakeup.notify_all();
    }

    fn cancel_all(&self) -> usize {
        let abandoned = mem::take(&mut *self.lock_tasks());
        let count = abandoned.len();
        for task in abandoned.into_values() {
            task.cancel();
        }
        while self.run_queue.pop().is_some() {}
        count
    }
}

fn run_worker(shared: Arc<Shared>, worker: WorkerId) {
    context::enter_worker(
        worker,
        Handle {
            shared: Arc::clone(&shared),
        },
    );
    tracing::trace!(%worker, "worker started");

    loop {
        if shared.is_stopped() {
            break;
        }
        if let Some(task) = shared.run_queue.pop() {
            shared.run_task(task);
            continue;
        }

        let idle = shared.lock_idle();
        if shared.is_stopped() {
            break;
        }
        if !shared.run_queue.is_empty() {
            continue;
        }
        drop(
            shared
                .wakeup
                .wait(idle)
                .unwrap_or_else(PoisonError::into_inner),
        );
    }

    tracing::trace!(%worker, "worker stopped");
    context::exit_worker();
}

/// Re-queues its task on wake. Holds the runtime weakly so a stray waker
/// outliving the runtime does nothing.
struct TaskWaker {
    task: Arc<Task>,
    shared: Weak<Shared>,
}

impl TaskWaker {
    fn new(task: Arc<Task>, shared: Weak<Shared>) -> Waker {
        Waker::from(Arc::new(TaskWaker { task, shared }))
    }

    fn wake_task(&self) {
        if let Some(shared) = self.shared.upgrade() {
            if !shared.is_stopped() {
                shared.schedule(Arc::clone(&self.task));
            }
        }
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_task()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_task()
    }
}

struct JoinState<T> {
    output: Mutex<Option<Result<T, JoinError>>>,
    waker: AtomicWaker,
}

impl<T> JoinState<T> {
    fn new() -> Self {
        JoinState {
            output: Mutex::new(None),
            waker: AtomicWaker::new(),
        }
    }

    fn set(&self, output: Result<T, JoinError>) {
        *self.output.lock().unwrap_or_else(PoisonError::into_inner) = Some(output);
        self.waker.wake();
    }

    fn take(&self) -> Option<Result<T, JoinError>> {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Writes a task's output into its join state; reports cancellation if the
/// task is dropped first.
struct Completer<T> {
    state: Option<Arc<JoinState<T>>>,
}

impl<T> Completer<T> {
    fn complete(mut self, output: Result<T, JoinError>) {
        if let Some(state) = self.state.take() {
            state.set(output);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.set(Err(JoinError::Cancelled));
        }
    }
}

/// Resolves to the output of a task started with [`Handle::spawn`].
///
/// Dropping the handle does not stop the task.
pub struct JoinHandle<T> {
    id: TaskId,
    state: Arc<JoinState<T>>,
}

impl<T> JoinHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        if let Some(output) = self.state.take() {
            return Poll::Ready(output);
        }
        self.state.waker.register(cx.waker());
        match self.state.take() {
            Some(output) => Poll::Ready(output),
            None => Poll::Pending,
        }
    }
}

/// Wakes a thread parked in [`park_on`].
struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark()
    }
}

/// Drives `future` on the calling thread, parking between polls.
fn park_on<F: Future>(future: F) -> F::Output {
    let mut future = pin!(future);
    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut context = Context::from_waker(&waker);
    loop {
        match future.as_mut().poll(&mut context) {
            Poll::Ready(output) => return output,
            Poll::Pending => thread::park(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{current_task_id, current_worker_id, sleep};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::{
        collections::BTreeSet,
        sync::atomic::AtomicUsize,
        time::Instant,
    };

    fn runtime(workers: usize) -> Runtime {
        Builder::new().workers(workers).build().expect("runtime")
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(matches!(
            Builder::new().workers(0).build(),
            Err(Error::NoWorkers)
        ));
    }

    #[test]
    fn default_builder_has_at_least_two_workers() {
        assert!(Builder::new().workers >= 2);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(4)]
    fn block_on_returns_output(#[case] workers: usize) {
        let rt = runtime(workers);
        assert_eq!(rt.block_on(async { 40 + 2 }), Ok(42));
        assert_eq!(rt.shutdown(Duration::ZERO), 0);
    }

    #[test]
    fn spawned_tasks_can_be_joined() {
        let rt = runtime(2);
        let sum = rt
            .block_on(async {
                let handle = Handle::current().expect("inside runtime");
                let joins: Vec<_> = (0..8_u32)
                    .map(|n| {
                        handle.spawn(async move {
                            sleep(Duration::from_millis(5)).await;
                            n
                        })
                    })
                    .collect();
                let mut sum = 0;
                for join in joins {
                    sum += join.await.expect("joined");
                }
                sum
            })
            .expect("driver");
        assert_eq!(sum, 28);
        rt.shutdown(Duration::ZERO);
    }

    #[test]
    fn panic_surfaces_through_join_handle() {
        let rt = runtime(2);
        let result = rt.block_on(async {
            panic!("boom");
        });
        assert_eq!(result, Err(JoinError::Panicked("boom".to_string())));
        // The pool keeps working afterwards
        assert_eq!(rt.block_on(async { 1 }), Ok(1));
        rt.shutdown(Duration::ZERO);
    }

    #[test]
    fn detached_panic_is_not_reported_to_caller() {
        let rt = runtime(2);
        let result = rt.block_on(async {
            let handle = Handle::current().expect("inside runtime");
            handle.spawn_detached(async {
                panic!("lost");
            });
            sleep(Duration::from_millis(20)).await;
            "caller finished"
        });
        assert_eq!(result, Ok("caller finished"));
        assert_eq!(rt.shutdown(Duration::from_secs(1)), 0);
    }

    #[test]
    fn ids_are_visible_only_inside_tasks() {
        assert_eq!(current_task_id(), None);
        assert_eq!(current_worker_id(), None);
        assert!(matches!(Handle::current(), Err(Error::NoRuntime)));

        let rt = runtime(2);
        let handle = rt.handle().spawn(async { (current_task_id(), current_worker_id()) });
        let spawned_id = handle.id();
        let (task, worker) = rt.block_on(handle).expect("driver").expect("task");
        assert_eq!(task, Some(spawned_id));
        assert!(worker.is_some_and(|w| w.index() < 2));
        rt.shutdown(Duration::ZERO);
    }

    #[test]
    fn task_id_is_stable_across_suspension() {
        let rt = runtime(4);
        let (before, after) = rt
            .block_on(async {
                let before = current_task_id();
                sleep(Duration::from_millis(5)).await;
                (before, current_task_id())
            })
            .expect("driver");
        assert!(before.is_some());
        assert_eq!(before, after);
        rt.shutdown(Duration::ZERO);
    }

    #[test]
    fn tasks_spread_across_workers() {
        let rt = runtime(4);
        let workers = rt
            .block_on(async {
                let handle = Handle::current().expect("inside runtime");
                let joins: Vec<_> = (0..32)
                    .map(|_| {
                        handle.spawn(async {
                            let mut seen = BTreeSet::new();
                            seen.extend(current_worker_id());
                            // Busy long enough that idle workers pick up siblings
                            let start = Instant::now();
                            while start.elapsed() < Duration::from_millis(2) {}
                            sleep(Duration::from_millis(5)).await;
                            seen.extend(current_worker_id());
                            seen
                        })
                    })
                    .collect();
                let mut all = BTreeSet::new();
                for join in joins {
                    all.extend(join.await.expect("joined"));
                }
                all
            })
            .expect("driver");
        assert!(workers.len() > 1, "only saw workers {workers:?}");
        rt.shutdown(Duration::ZERO);
    }

    #[test]
    fn grace_period_lets_detached_tasks_drain() {
        let rt = runtime(2);
        let done = Arc::new(AtomicUsize::new(0));
        let handle = rt.handle();
        for _ in 0..10 {
            let done = Arc::clone(&done);
            handle.spawn_detached(async move {
                sleep(Duration::from_millis(20)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(rt.shutdown(Duration::from_secs(5)), 0);
        assert_eq!(done.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn shutdown_without_grace_abandons_pending_tasks() {
        let rt = runtime(2);
        let done = Arc::new(AtomicUsize::new(0));
        let handle = rt.handle();
        for _ in 0..3 {
            let done = Arc::clone(&done);
            handle.spawn_detached(async move {
                sleep(Duration::from_secs(30)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(handle.live_tasks(), 3);
        assert_eq!(rt.shutdown(Duration::ZERO), 3);
        assert_eq!(done.load(Ordering::SeqCst), 0);
        assert_eq!(handle.live_tasks(), 0);
    }

    #[test]
    fn abandoned_join_handle_reports_cancelled() {
        let rt = runtime(1);
        let join = rt.handle().spawn(async {
            sleep(Duration::from_secs(30)).await;
            7
        });
        assert_eq!(rt.shutdown(Duration::ZERO), 1);
        assert_eq!(park_on(join), Err(JoinError::Cancelled));
    }

    #[test]
    fn spawn_after_shutdown_is_cancelled() {
        let rt = runtime(1);
        let handle = rt.handle();
        rt.shutdown(Duration::ZERO);
        assert_eq!(park_on(handle.spawn(async { 1 })), Err(JoinError::Cancelled));
    }
}
