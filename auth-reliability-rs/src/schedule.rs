//! # Scheduled Tasks
//!
//! Cancellable handles for the two kinds of timers the tracker owns: one-shot
//! retry delays and periodic reporting loops. Each handle has a single
//! `cancel()`; dropping a handle cancels it as well, so a component that
//! forgets to stop its timers cannot leak them past its own lifetime.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::trace;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// How a pending delay finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayOutcome {
    Elapsed,
    Cancelled,
}

#[derive(Debug)]
enum TaskInner {
    Delay(oneshot::Sender<()>),
    Spawned(JoinHandle<()>),
}

/// Token for a live timer
#[derive(Debug)]
pub struct ScheduledTask {
    id: u64,
    inner: Option<TaskInner>,
}

/// The waiting half of [`ScheduledTask::delay`]
#[derive(Debug)]
pub struct PendingDelay {
    duration: Duration,
    cancelled: oneshot::Receiver<()>,
}

impl PendingDelay {
    /// Waits for the delay to elapse or for its handle to be cancelled or dropped
    pub async fn wait(self) -> DelayOutcome {
        let PendingDelay {
            duration,
            mut cancelled,
        } = self;

        tokio::select! {
            _ = time::sleep(duration) => DelayOutcome::Elapsed,
            _ = &mut cancelled => DelayOutcome::Cancelled,
        }
    }
}

impl ScheduledTask {
    fn next_id() -> u64 {
        NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
    }

    /// Creates a one-shot delay. The returned future resolves when the
    /// duration elapses, or early with [`DelayOutcome::Cancelled`].
    pub fn delay(duration: Duration) -> (Self, PendingDelay) {
        let (tx, rx) = oneshot::channel();
        let task = Self {
            id: Self::next_id(),
            inner: Some(TaskInner::Delay(tx)),
        };
        (
            task,
            PendingDelay {
                duration,
                cancelled: rx,
            },
        )
    }

    /// Spawns a loop that calls `tick` every `period`, starting one period
    /// from now, until `tick` breaks or the handle is cancelled.
    pub fn every<F>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let id = Self::next_id();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                if tick().is_break() {
                    trace!(task_id = id, "Periodic task finished");
                    break;
                }
            }
        });

        Self {
            id,
            inner: Some(TaskInner::Spawned(handle)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once a spawned loop has exited; delays report false until cancelled
    pub fn is_finished(&self) -> bool {
        match &self.inner {
            Some(TaskInner::Spawned(handle)) => handle.is_finished(),
            Some(TaskInner::Delay(tx)) => tx.is_closed(),
            None => true,
        }
    }

    /// Cancels the timer
    pub fn cancel(mut self) {
        self.cancel_inner();
    }

    fn cancel_inner(&mut self) {
        match self.inner.take() {
            Some(TaskInner::Delay(tx)) => {
                let _ = tx.send(());
            }
            Some(TaskInner::Spawned(handle)) => handle.abort(),
            None => {}
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_delay_elapses() {
        let (_task, pending) = ScheduledTask::delay(Duration::from_millis(500));
        assert_eq!(pending.wait().await, DelayOutcome::Elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wakes_delay() {
        let (task, pending) = ScheduledTask::delay(Duration::from_secs(60));
        let waiter = tokio::spawn(pending.wait());

        task.cancel();
        assert_eq!(waiter.await.unwrap(), DelayOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_delay() {
        let (task, pending) = ScheduledTask::delay(Duration::from_secs(60));
        drop(task);
        assert_eq!(pending.wait().await, DelayOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_ticks_until_cancelled() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let task = ScheduledTask::every(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        });

        time::sleep(Duration::from_millis(350)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        task.cancel();
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_stops_on_break() {
        let task = ScheduledTask::every(Duration::from_millis(10), || ControlFlow::Break(()));
        time::sleep(Duration::from_millis(50)).await;
        assert!(task.is_finished());
    }

    #[test]
    fn test_ids_are_unique() {
        let (a, _pa) = ScheduledTask::delay(Duration::from_millis(1));
        let (b, _pb) = ScheduledTask::delay(Duration::from_millis(1));
        assert_ne!(a.id(), b.id());
    }
}
