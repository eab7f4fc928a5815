//! Cancellation and deadline carried by every provider operation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::SandboxError;

/// A cancellable, deadline-bearing operation context.
///
/// Cloning shares the cancellation token; [`OpContext::child`] derives a
/// context that is cancelled with its parent but can be cancelled alone.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    budget: Option<Duration>,
}

impl OpContext {
    /// A context with no deadline that is never cancelled unless asked to.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
            budget: Some(timeout),
        }
    }

    /// Returns a copy of this context whose deadline is at most `timeout` away.
    #[must_use]
    pub fn timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        match self.deadline {
            Some(existing) if existing < candidate => self.clone(),
            _ => Self {
                token: self.token.clone(),
                deadline: Some(candidate),
                budget: Some(timeout),
            },
        }
    }

    /// A child context cancelled together with this one.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            budget: self.budget,
        }
    }

    /// Cancels this context and all its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the context is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fails fast if the context is already cancelled or expired.
    pub fn check(&self) -> Result<(), SandboxError> {
        if self.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        if let Some(remaining) = self.remaining() {
            if remaining.is_zero() {
                return Err(self.expired());
            }
        }
        Ok(())
    }

    /// Drives `fut` until it completes, the context is cancelled, or the
    /// deadline passes, whichever comes first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, SandboxError>
    where
        F: Future<Output = Result<T, SandboxError>>,
    {
        self.check()?;
        let deadline = self.deadline;
        let sleep = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(SandboxError::Cancelled),
            () = sleep => Err(self.expired()),
            result = fut => result,
        }
    }

    fn expired(&self) -> SandboxError {
        SandboxError::timeout(self.budget.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = OpContext::background();
        let value = ctx.run(async { Ok::<_, SandboxError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_returns_cancelled() {
        let ctx = OpContext::background();
        let child = ctx.child();
        let handle = tokio::spawn(async move {
            child
                .run(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, SandboxError>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_returns_timeout() {
        let ctx = OpContext::with_timeout(Duration::from_millis(20));
        let err = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, SandboxError>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_check_after_cancel() {
        let ctx = OpContext::background();
        assert!(ctx.check().is_ok());
        ctx.cancel();
        assert!(ctx.check().unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_on_parent_cancel() {
        let ctx = OpContext::background();
        let child = ctx.child();
        let waiter = tokio::spawn(async move { child.cancelled().await });
        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_timeout_never_extends_deadline() {
        let ctx = OpContext::with_timeout(Duration::from_secs(1));
        let narrowed = ctx.timeout(Duration::from_secs(60));
        assert_eq!(narrowed.deadline(), ctx.deadline());
    }
}
