//! Deferred execution used for connect attempts and reconnection backoff.
//!
//! Every delay in the crate goes through a [`Scheduler`], so time can be replaced in tests:
//! [`TokioScheduler`] runs tasks on the tokio runtime, while [`ManualScheduler`] keeps them
//! queued against a virtual clock until the test advances it.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// A unit of deferred work.
pub type Task = BoxFuture<'static, ()>;

/// Runs a task after a delay.
///
/// Implementations must not run the task synchronously inside [`Scheduler::after`]: callers may
/// hold internal locks while scheduling.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `task` once `delay` has elapsed, unless the returned token is cancelled first.
    fn after(&self, delay: Duration, task: Task) -> CancelToken;
}

/// Cancels a task handed to a [`Scheduler`].
///
/// Cancelling is idempotent. Dropping the token does *not* cancel the task.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(CancellationToken);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// [`Scheduler`] backed by `tokio::spawn` and `tokio::time::sleep`.
///
/// Must be used from within a tokio runtime. Cancelling the token also aborts a task that is
/// already running, at its next await point.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, task: Task) -> CancelToken {
        let token = CancelToken::new();
        let cancelled = token.0.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = cancelled.cancelled() => {}
                () = async move {
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    task.await;
                } => {}
            }
        });

        token
    }
}

struct Pending {
    due: Duration,
    seq: u64,
    token: CancelToken,
    task: Task,
}

#[derive(Default)]
struct Clock {
    now: Duration,
    seq: u64,
    pending: Vec<Pending>,
}

impl Clock {
    /// Removes and returns the earliest live task due at or before `deadline`.
    fn pop_due(&mut self, deadline: Duration) -> Option<Pending> {
        self.pending.retain(|p| !p.token.is_cancelled());
        let index = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, p)| p.due <= deadline)
            .min_by_key(|(_, p)| (p.due, p.seq))
            .map(|(i, _)| i)?;
        Some(self.pending.swap_remove(index))
    }
}

/// [`Scheduler`] driven by a virtual clock.
///
/// Tasks never run on their own: [`ManualScheduler::advance`] moves the clock forward and runs
/// every task that has become due, in due order, to completion on the caller's task. Tasks
/// scheduled by those tasks run in the same call if they fall due before the new time.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    clock: Arc<Mutex<Clock>>,
}

impl ManualScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since creation.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Number of scheduled tasks that have not run and were not cancelled.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock()
            .pending
            .iter()
            .filter(|p| !p.token.is_cancelled())
            .count()
    }

    /// Time until the earliest live task is due, if any.
    #[must_use]
    pub fn next_due(&self) -> Option<Duration> {
        let clock = self.lock();
        clock
            .pending
            .iter()
            .filter(|p| !p.token.is_cancelled())
            .map(|p| p.due.saturating_sub(clock.now))
            .min()
    }

    /// Advances the clock by `by` and runs every task due by then. Returns how many ran.
    pub async fn advance(&self, by: Duration) -> usize {
        let deadline = self.now().saturating_add(by);
        let mut ran = 0;

        loop {
            let next = {
                let mut clock = self.lock();
                let next = clock.pop_due(deadline);
                if let Some(pending) = &next {
                    clock.now = clock.now.max(pending.due);
                }
                next
            };

            let Some(pending) = next else {
                break;
            };
            pending.task.await;
            ran += 1;
        }

        let mut clock = self.lock();
        clock.now = clock.now.max(deadline);
        ran
    }

    /// Runs every task that is already due without moving the clock.
    pub async fn run_due(&self) -> usize {
        self.advance(Duration::ZERO).await
    }

    /// Advances exactly to the earliest pending task and runs it, together with anything else
    /// due at that instant. Returns `false` when nothing is pending.
    pub async fn advance_to_next(&self) -> bool {
        match self.next_due() {
            Some(delay) => self.advance(delay).await > 0,
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Clock> {
        // The clock holds no invariant that a panicking task could break halfway.
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for ManualScheduler {
    fn after(&self, delay: Duration, task: Task) -> CancelToken {
        let token = CancelToken::new();
        let mut clock = self.lock();
        clock.seq += 1;
        let pending = Pending {
            due: clock.now.saturating_add(delay),
            seq: clock.seq,
            token: token.clone(),
            task,
        };
        clock.pending.push(pending);
        token
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("now", &self.now())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt as _;

    use super::*;

    fn counting(counter: &Arc<AtomicUsize>) -> Task {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    }

    #[tokio::test]
    async fn manual_runs_tasks_only_when_due() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let _token = scheduler.after(Duration::from_secs(2), counting(&counter));
        assert_eq!(scheduler.next_due(), Some(Duration::from_secs(2)));

        assert_eq!(scheduler.advance(Duration::from_secs(1)).await, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert_eq!(scheduler.advance(Duration::from_secs(1)).await, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.now(), Duration::from_secs(2));
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn manual_skips_cancelled_tasks() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let token = scheduler.after(Duration::ZERO, counting(&counter));
        token.cancel();

        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.run_due().await, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn manual_runs_in_due_order() {
        let scheduler = ManualScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, secs) in [("late", 3), ("early", 1), ("middle", 2)] {
            let order = Arc::clone(&order);
            let _token = scheduler.after(
                Duration::from_secs(secs),
                async move { order.lock().unwrap().push(label) }.boxed(),
            );
        }

        assert!(scheduler.advance_to_next().await);
        assert_eq!(scheduler.advance(Duration::from_secs(5)).await, 2);
        assert_eq!(*order.lock().unwrap(), vec!["early", "middle", "late"]);
    }

    #[tokio::test]
    async fn tokio_scheduler_honours_cancellation() {
        let counter = Arc::new(AtomicUsize::new(0));

        let token = TokioScheduler.after(Duration::from_millis(50), counting(&counter));
        token.cancel();
        let _ran = TokioScheduler.after(Duration::ZERO, counting(&counter));

        sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
