//! Cancellable one-shot timers that deliver a message to a component queue.
//!
//! Every scheduled timer carries a unique token. The message built for the
//! queue receives that token so the owning component can tell a live timer
//! from one that was superseded after its message was already enqueued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type TimerToken = u64;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Handle to a pending timer. Dropping the handle cancels the timer.
#[derive(Debug)]
pub struct TimerHandle {
    token: TimerToken,
    task: Option<JoinHandle<()>>,
}

impl TimerHandle {
    pub fn token(&self) -> TimerToken {
        self.token
    }

    /// True if `token` was produced by this timer and it has not been cancelled.
    pub fn matches(&self, token: TimerToken) -> bool {
        self.task.is_some() && self.token == token
    }

    /// Stops the timer. Safe to call repeatedly and after the timer fired.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_none()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Sends `make(token)` to `queue` once `delay` has elapsed.
pub fn schedule<M, F>(delay: Duration, queue: &mpsc::UnboundedSender<M>, make: F) -> TimerHandle
where
    M: Send + 'static,
    F: FnOnce(TimerToken) -> M + Send + 'static,
{
    let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    let queue = queue.clone();

    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        // The owner may have shut down in the meantime.
        let _ = queue.send(make(token));
    });

    TimerHandle {
        token,
        task: Some(task),
    }
}
