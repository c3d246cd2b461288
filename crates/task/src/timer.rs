use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
    thread,
    time::{Duration, Instant},
};

use conquer_once::OnceCell;
use futures_util::task::AtomicWaker;

use crate::Error;

/// Deadlines shared by every runtime in the process, served by one thread.
static TIMER: OnceCell<Timer> = OnceCell::uninit();

const TIMER_THREAD: &str = "task-timer";

/// Completes once `duration` has elapsed.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        deadline: Instant::now() + duration,
        state: None,
    }
}

#[derive(Debug)]
pub struct Sleep {
    deadline: Instant,
    // Registered with the timer on the first pending poll
    state: Option<Arc<SleepState>>,
}

impl Sleep {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let this = self.get_mut();
        let deadline = this.deadline;
        if Instant::now() >= deadline {
            return Poll::Ready(());
        }

        let state = this.state.get_or_insert_with(|| {
            let state = Arc::new(SleepState::default());
            global().register(deadline, Arc::clone(&state));
            state
        });

        // Register before checking so a firing between the two is not lost
        state.waker.register(cx.waker());
        if state.fired.load(Ordering::Acquire) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[derive(Debug, Default)]
struct SleepState {
    fired: AtomicBool,
    waker: AtomicWaker,
}

impl SleepState {
    fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        self.waker.wake();
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    state: Arc<SleepState>,
}

// BinaryHeap is a max-heap; order entries so the earliest deadline is on top
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Entry {}

struct Timer {
    entries: Mutex<BinaryHeap<Entry>>,
    changed: Condvar,
    next_seq: AtomicU64,
    started: AtomicBool,
}

impl Timer {
    fn new() -> Self {
        Timer {
            entries: Mutex::new(BinaryHeap::new()),
            changed: Condvar::new(),
            next_seq: AtomicU64::new(0),
            started: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&'static self, deadline: Instant, state: Arc<SleepState>) {
        if let Err(err) = self.start() {
            tracing::error!("timer unavailable, sleep will not wake: {err}");
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.lock().push(Entry {
            deadline,
            seq,
            state,
        });
        self.changed.notify_one();
    }

    fn start(&'static self) -> Result<(), Error> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        match thread::Builder::new()
            .name(TIMER_THREAD.to_string())
            .spawn(move || self.run())
        {
            Ok(_) => {
                tracing::debug!("timer thread started");
                Ok(())
            }
            Err(source) => {
                self.started.store(false, Ordering::Release);
                Err(Error::SpawnThread {
                    name: TIMER_THREAD.to_string(),
                    source,
                })
            }
        }
    }

    fn run(&self) {
        let mut entries = self.lock();
        loop {
            let now = Instant::now();
            let mut due = Vec::new();
            while entries.peek().is_some_and(|entry| entry.deadline <= now) {
                if let Some(entry) = entries.pop() {
                    due.push(entry.state);
                }
            }

            if !due.is_empty() {
                // Wake outside the lock; waking reschedules tasks on the pool
                drop(entries);
                for state in due {
                    state.fire();
                }
                entries = self.lock();
                continue;
            }

            let next = entries.peek().map(|entry| entry.deadline - now);
            entries = match next {
                Some(timeout) => {
                    self.changed
                        .wait_timeout(entries, timeout)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .changed
                    .wait(entries)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

fn global() -> &'static Timer {
    TIMER.get_or_init(Timer::new)
}

/// Starts the timer thread if it is not running yet.
pub(crate) fn ensure_started() -> Result<(), Error> {
    global().start()
}
