//! Cancellation Watcher (C13, `spec.md` §4.9).
//!
//! One `CancellationToken` per request. Every suspension point in the
//! research loop and tool loop selects on it alongside its I/O future, so
//! cancellation is a first-class signal rather than the original
//! exception-driven design note's disallowed pattern.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Best-effort deadline given to in-flight auxiliary requests to drain once
/// cancellation fires (`spec.md` §5).
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

pub struct CancellationGuard {
    pub token: CancellationToken,
}

impl CancellationGuard {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Spawns a watcher that cancels the token when `body_closed` resolves,
    /// which axum resolves once the client socket is no longer being read
    /// from (disconnect) or the handler's future is dropped.
    pub fn watch(&self, body_closed: impl std::future::Future<Output = ()> + Send + 'static) {
        let token = self.token.clone();
        tokio::spawn(async move {
            body_closed.await;
            token.cancel();
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for CancellationGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Races `fut` against the cancellation token and a hard drain deadline,
/// used for in-flight auxiliary calls once cancellation has fired.
pub async fn drain_or_abandon<F, T>(token: &CancellationToken, fut: F) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        biased;
        result = tokio::time::timeout(DRAIN_DEADLINE, fut) => result.ok(),
        _ = token.cancelled() => None,
    }
}

/// Same race as [`drain_or_abandon`], but for a fallible future: a real
/// error still propagates through `?`, while abandonment collapses to
/// `Ok(None)` so callers can treat "client gone" as a graceful stop rather
/// than a backend failure.
pub async fn drain_or_give_up<T, E>(
    token: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T, E>>,
) -> Result<Option<T>, E> {
    match drain_or_abandon(token, fut).await {
        Some(Ok(value)) => Ok(Some(value)),
        Some(Err(err)) => Err(err),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watch_cancels_token_when_body_closes() {
        let guard = CancellationGuard::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        guard.watch(async move {
            let _ = rx.await;
        });
        assert!(!guard.is_cancelled());
        tx.send(()).unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(guard.is_cancelled());
    }

    #[tokio::test]
    async fn drain_or_give_up_propagates_real_errors() {
        let token = CancellationToken::new();
        let result: Result<Option<u32>, &'static str> =
            drain_or_give_up(&token, async { Err("boom") }).await;
        assert_eq!(result, Err("boom"));
    }

    #[tokio::test]
    async fn drain_or_give_up_collapses_cancellation_to_none() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<Option<u32>, &'static str> =
            drain_or_give_up(&token, std::future::pending()).await;
        assert_eq!(result, Ok(None));
    }
}
