//! Per-request context threaded through every engine call.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;
use wallet_common::{Result, WalletError};

/// Caller-supplied request metadata.
///
/// The deadline bounds the whole call chain. When it elapses the in-flight
/// future is dropped, which rolls back any open store transaction.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation ID recorded on every span of the request.
    pub request_id: Uuid,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Create a context without a deadline.
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            deadline: None,
        }
    }

    /// Create a context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline_at(Instant::now() + timeout)
    }

    /// Set an absolute deadline.
    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Use a request ID supplied by the caller.
    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }

    /// Time left before the deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Drive `operation` to completion or until the deadline elapses.
    pub async fn run<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, operation)
                .await
                .map_err(|_| {
                    warn!(request_id = %self.request_id, "Deadline exceeded, operation abandoned");
                    WalletError::DeadlineExceeded
                })?,
            None => operation.await,
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_run_without_deadline() {
        let ctx = RequestContext::new();
        let value = ctx.run(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(ctx.remaining().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_past_deadline() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(50));
        let err = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_request_id_and_remaining_time() {
        let request_id = Uuid::now_v7();
        let ctx = RequestContext::with_timeout(Duration::from_secs(2)).with_request_id(request_id);
        assert_eq!(ctx.request_id, request_id);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(ctx.remaining(), Some(Duration::from_millis(1500)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }
}
