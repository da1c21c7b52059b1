//! Monotonic clock and delayed-task scheduling.
//!
//! Every timing decision in the consensus core reads [`MonoClock`];
//! there is no wall-clock dependency. [`BackgroundWorker`] is a serial
//! executor for delayed housekeeping (election ticks, status polling):
//! jobs run one at a time in submission order, while their delays
//! elapse concurrently.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Monotonic millisecond clock, anchored at construction.
#[derive(Debug, Clone, Copy)]
pub struct MonoClock {
    origin: Instant,
}

impl MonoClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock was created.
    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl Default for MonoClock {
    fn default() -> Self {
        Self::new()
    }
}

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A serial executor for background housekeeping tasks.
///
/// Tasks submitted through [`add_task`](Self::add_task) run strictly
/// one at a time, in arrival order. [`add_delay_task`](Self::add_delay_task)
/// enqueues the task only once its delay has elapsed, so a long delay
/// never blocks the queue.
#[derive(Clone)]
pub struct BackgroundWorker {
    tx: mpsc::UnboundedSender<Job>,
}

impl BackgroundWorker {
    /// Spawn the worker loop on the current tokio runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        Self { tx }
    }

    /// Run a task on the worker as soon as the queue drains.
    pub fn add_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // The send only fails after shutdown, when dropping the task
        // is the right outcome anyway.
        let _ = self.tx.send(Box::pin(task));
    }

    /// Enqueue a task after `delay` has elapsed.
    pub fn add_delay_task<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Box::pin(task));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_mono_clock_monotonic() {
        let clock = MonoClock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }

    #[tokio::test]
    async fn test_worker_runs_tasks_in_order() {
        let worker = BackgroundWorker::spawn();
        let seen = Arc::new(AtomicU32::new(0));
        for i in 1..=3u32 {
            let seen = Arc::clone(&seen);
            worker.add_task(async move {
                // Each task observes the previous task's update.
                let prev = seen.swap(i, Ordering::SeqCst);
                assert_eq!(prev, i - 1);
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_task_waits() {
        let worker = BackgroundWorker::spawn();
        let seen = Arc::new(AtomicU32::new(0));
        let mark = Arc::clone(&seen);
        worker.add_delay_task(Duration::from_millis(500), async move {
            mark.store(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
