//! Request-scoped cancellation and deadlines.
//!
//! Every public operation takes a [`Ctx`]. Cancellation is observable at
//! every suspension point: semaphore acquire, pool take, channel sends, and
//! the scheduler tick. Native decode calls are never interrupted mid-call;
//! a cancelled request is dropped at the next check.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::error::Error;

/// A cancellable context with an optional deadline.
///
/// Cloning is cheap; all clones observe the same cancel signal.
#[derive(Debug, Clone)]
pub struct Ctx {
    deadline: Option<Instant>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl Ctx {
    /// A context that never expires and is only done when cancelled.
    pub fn background() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            deadline: None,
            cancel_tx: Arc::new(tx),
            cancel_rx: rx,
        }
    }

    /// A context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        let mut ctx = Self::background();
        ctx.deadline = Some(Instant::now() + timeout);
        ctx
    }

    /// Derive a context sharing this one's cancel signal but bounded by
    /// `timeout` if this context carries no tighter deadline.
    pub fn with_fallback_timeout(&self, timeout: Duration) -> Self {
        let mut ctx = self.clone();
        if ctx.deadline.is_none() {
            ctx.deadline = Some(Instant::now() + timeout);
        }
        ctx
    }

    /// The absolute deadline, if one was set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and every clone of it.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Non-blocking check used from synchronous code (the scheduler loop).
    pub fn is_done(&self) -> bool {
        if *self.cancel_rx.borrow() {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// The error this context is currently done with, if any.
    pub fn err(&self) -> Option<Error> {
        if *self.cancel_rx.borrow() {
            return Some(Error::Canceled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// Suspend until the context is cancelled or its deadline fires,
    /// returning the corresponding error.
    pub async fn done(&self) -> Error {
        let mut rx = self.cancel_rx.clone();
        if *rx.borrow() {
            return Error::Canceled;
        }

        let cancelled = async {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return;
                }
            }
            // Sender dropped without cancelling; never resolves.
            std::future::pending::<()>().await;
        };

        match self.deadline {
            Some(d) => {
                tokio::select! {
                    _ = cancelled => Error::Canceled,
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(d)) => {
                        Error::DeadlineExceeded
                    }
                }
            }
            None => {
                cancelled.await;
                Error::Canceled
            }
        }
    }
}
