//! Flush Schedulers
//!
//! A scheduler decides *when* a batching window closes. The request queue
//! hands it one flush task per window and everything enqueued before the
//! task runs goes out together.
//!
//! Schedulers only back delayed or custom batching. The immediate policy
//! needs no scheduler at all: the queue flushes on the caller's own task
//! the first time one of the window's requests is awaited (see
//! [`RequestQueue::immediate`](super::RequestQueue::immediate)).

use std::fmt;
use std::time::Duration;

/// Work the queue wants run once the window closes.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs a flush task at some later point.
pub trait Scheduler: Send + Sync + fmt::Debug {
    fn schedule(&self, task: Task);
}

/// Flushes a fixed delay after the first request of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelayScheduler {
    delay: Duration,
}

impl FixedDelayScheduler {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Scheduler for FixedDelayScheduler {
    fn schedule(&self, task: Task) {
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    /// Runs each task on the spot and counts them.
    #[derive(Debug, Default)]
    struct Inline(AtomicUsize);

    impl Scheduler for Inline {
        fn schedule(&self, task: Task) {
            self.0.fetch_add(1, Ordering::SeqCst);
            task();
        }
    }

    #[test]
    fn custom_schedulers_run_what_they_are_given() {
        let scheduler = Arc::new(Inline::default());
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        scheduler.schedule(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(scheduler.0.load(Ordering::SeqCst), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_delay_waits() {
        let (tx, mut rx) = oneshot::channel();
        FixedDelayScheduler::from_millis(50).schedule(Box::new(move || {
            let _ = tx.send(());
        }));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_ok());
    }
}
