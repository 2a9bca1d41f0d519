//! Execution budgets for store operations.
//!
//! A [`Context`] bounds how long a store call may take and lets the caller
//! abandon it early. Store backends race their I/O against the context with
//! [`Context::run`]; an expired or cancelled context surfaces as
//! [`TurnstileError::ContextCancelled`].

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Result, TurnstileError};

const DEADLINE_EXCEEDED: &str = "deadline exceeded";
const CANCELLED: &str = "cancelled by caller";

/// A deadline plus an optional cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancelled: Option<watch::Receiver<bool>>,
}

/// Cancels every [`Context`] derived from the `with_cancel` call that
/// produced it.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // send_replace never fails, even with no receivers left.
        self.tx.send_replace(true);
    }
}

impl Context {
    /// A context with no deadline that is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancelled: None,
        }
    }

    /// Attach a cancellation signal, keeping the current deadline.
    pub fn with_cancel(self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            deadline: self.deadline,
            cancelled: Some(rx),
        };
        (ctx, CancelHandle { tx })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.as_ref().map_or(false, |rx| *rx.borrow())
    }

    /// Fail fast if the context is already done.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(TurnstileError::ContextCancelled(CANCELLED));
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(TurnstileError::ContextCancelled(DEADLINE_EXCEEDED))
            }
            _ => Ok(()),
        }
    }

    /// Drive `fut` to completion unless the deadline passes or the caller
    /// cancels first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        let cancelled = async {
            match self.cancelled.clone() {
                Some(mut rx) => loop {
                    if *rx.borrow_and_update() {
                        break;
                    }
                    if rx.changed().await.is_err() {
                        // Handle dropped without cancelling.
                        std::future::pending::<()>().await;
                    }
                },
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            result = fut => result,
            _ = cancelled => Err(TurnstileError::ContextCancelled(CANCELLED)),
            _ = deadline => Err(TurnstileError::ContextCancelled(DEADLINE_EXCEEDED)),
        }
    }
}
