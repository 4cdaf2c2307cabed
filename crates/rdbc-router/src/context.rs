//! Deadlines and cancellation for `*_with_context` calls
//!
//! A [`Context`] bounds one router call. The wrapped driver future is dropped
//! when the deadline passes or the token fires, which is how cancellation
//! reaches the driver.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Deadline and cancellation signal for a single call
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl Context {
    /// A context that never expires and is only cancelled explicitly
    pub fn background() -> Self {
        Self::default()
    }

    /// Expire `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Expire at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            token: CancellationToken::new(),
        }
    }

    /// Cancel when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// A child context sharing this deadline, cancelled with this one
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            token: self.token.child_token(),
        }
    }

    /// Cancel every call bound to this context
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the context was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline (None = no deadline)
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if the context has already ended
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(Error::timeout("context deadline exceeded"))
            }
            _ => Ok(()),
        }
    }

    /// Drive `fut` to completion unless the context ends first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled),
            _ = expired => Err(Error::timeout("context deadline exceeded")),
            res = fut => res,
        }
    }
}
