/// Scheduler Service
/// Runs deferred work after a delay behind a cancelable handle.
/// `TokioScheduler` uses the runtime clock; `ManualScheduler` only moves
/// when told to, for hosts and tests that drive time themselves.
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::AbortHandle;

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const FIRED: u8 = 2;

pub trait Scheduler: Send + Sync {
    /// Run `task` once `delay` has elapsed unless the handle is cancelled first.
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TaskHandle;
}

/// Handle to a scheduled task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    state: Arc<AtomicU8>,
    abort: Option<AbortHandle>,
}

impl TaskHandle {
    fn new(abort: Option<AbortHandle>) -> (Self, Arc<AtomicU8>) {
        let state = Arc::new(AtomicU8::new(PENDING));
        (
            Self {
                state: Arc::clone(&state),
                abort,
            },
            state,
        )
    }

    /// Prevent the task from running. Returns true only for the call that
    /// actually cancelled it; later calls, or calls after it fired, do nothing.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            if let Some(abort) = &self.abort {
                abort.abort();
            }
        }
        cancelled
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }
}

/// Claim the right to run; loses against a concurrent cancel.
fn try_fire(state: &AtomicU8) -> bool {
    state
        .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TaskHandle {
        let state = Arc::new(AtomicU8::new(PENDING));
        let fire_state = Arc::clone(&state);

        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if try_fire(&fire_state) {
                task.await;
            }
        });

        TaskHandle {
            state,
            abort: Some(join.abort_handle()),
        }
    }
}

struct Scheduled {
    due: Duration,
    seq: u64,
    state: Arc<AtomicU8>,
    task: BoxFuture<'static, ()>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    seq: u64,
    queue: Vec<Scheduled>,
}

/// Scheduler whose clock only moves through `advance`
#[derive(Clone, Default)]
pub struct ManualScheduler {
    inner: Arc<Mutex<ManualState>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Time elapsed since creation
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Tasks neither fired nor cancelled
    pub fn pending_tasks(&self) -> usize {
        self.lock()
            .queue
            .iter()
            .filter(|t| t.state.load(Ordering::Acquire) == PENDING)
            .count()
    }

    /// Move the clock forward and run every task that came due, in due order.
    /// Returns how many ran.
    pub async fn advance(&self, by: Duration) -> usize {
        let mut due = {
            let mut state = self.lock();
            state.now += by;
            let now = state.now;
            let (due, waiting): (Vec<_>, Vec<_>) =
                state.queue.drain(..).partition(|t| t.due <= now);
            state.queue = waiting;
            due
        };
        due.sort_by_key(|t| (t.due, t.seq));

        let mut fired = 0;
        for scheduled in due {
            if try_fire(&scheduled.state) {
                scheduled.task.await;
                fired += 1;
            }
        }
        fired
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TaskHandle {
        let (handle, state) = TaskHandle::new(None);

        let mut inner = self.lock();
        let due = inner.now + delay;
        let seq = inner.seq;
        inner.seq += 1;
        inner.queue.push(Scheduled {
            due,
            seq,
            state,
            task,
        });

        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>) -> BoxFuture<'static, ()> {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    }

    #[tokio::test]
    async fn test_manual_scheduler_fires_when_due() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = scheduler.schedule(Duration::from_secs(5), counter_task(&counter));

        assert_eq!(scheduler.advance(Duration::from_millis(4_999)).await, 0);
        assert!(handle.is_pending());

        assert_eq!(scheduler.advance(Duration::from_millis(1)).await, 1);
        assert!(!handle.is_pending());
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Fired tasks cannot be cancelled
        assert!(!handle.cancel());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = scheduler.schedule(Duration::from_secs(1), counter_task(&counter));
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(!handle.clone().cancel());

        assert_eq!(scheduler.advance(Duration::from_secs(10)).await, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn test_manual_scheduler_runs_in_due_order() {
        let scheduler = ManualScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, delay) in [("late", 3), ("early", 1), ("middle", 2)] {
            let order = Arc::clone(&order);
            scheduler.schedule(
                Duration::from_secs(delay),
                async move {
                    order.lock().unwrap().push(label);
                }
                .boxed(),
            );
        }

        scheduler.advance(Duration::from_secs(3)).await;
        assert_eq!(*order.lock().unwrap(), vec!["early", "middle", "late"]);
    }

    #[tokio::test]
    async fn test_tokio_scheduler_cancel_prevents_run() {
        let scheduler = TokioScheduler;
        let counter = Arc::new(AtomicUsize::new(0));

        let cancelled = scheduler.schedule(Duration::from_millis(20), counter_task(&counter));
        let kept = scheduler.schedule(Duration::from_millis(20), counter_task(&counter));
        assert!(cancelled.cancel());

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!kept.is_pending());
        // Already fired
        assert!(!kept.cancel());
    }
}
