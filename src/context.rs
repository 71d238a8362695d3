//! # Query Context
//!
//! Carries a caller's cancellation signal and optional deadline through every
//! blocking step: pool lease, query start, row reads and retry backoff.

use crate::error::{ClientError, ClientResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl QueryContext {
    /// Unbounded context, cancelled only explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Tighten the deadline. A later deadline than the current one is ignored.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Derive a child that is cancelled with this context and additionally
    /// bounded by `timeout` (`None` keeps the parent's deadline).
    pub fn child_with_timeout(&self, timeout: Option<Duration>) -> Self {
        let child = Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        };
        match timeout {
            Some(timeout) => child.with_deadline(Instant::now() + timeout),
            None => child,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }

    /// Fail fast if the context is already cancelled or past its deadline.
    pub fn check(&self) -> ClientResult<()> {
        if self.token.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ClientError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context is cancelled or expires
    /// first. The future is dropped on cancellation.
    pub async fn run<F, T>(&self, fut: F) -> ClientResult<T>
    where
        F: Future<Output = ClientResult<T>>,
    {
        self.check()?;
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ClientError::Cancelled),
            _ = expired => Err(ClientError::DeadlineExceeded),
            result = fut => result,
        }
    }

    /// Sleep for `duration`, returning early with an error on cancellation.
    pub async fn sleep(&self, duration: Duration) -> ClientResult<()> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}
