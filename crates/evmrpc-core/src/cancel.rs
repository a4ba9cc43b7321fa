//! Caller-driven cancellation for transport futures.

use std::future::Future;

use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// Race a transport future against a [`CancellationToken`].
///
/// When the token fires first the inner future is dropped on the spot,
/// which releases whatever it held (pending-map slots, batch waiters,
/// backoff timers), and the call resolves to [`TransportError::Cancelled`].
#[async_trait]
pub trait CancelExt<T>: Future<Output = Result<T, TransportError>> + Sized {
    async fn with_cancel(self, token: &CancellationToken) -> Result<T, TransportError>;
}

#[async_trait]
impl<F, T> CancelExt<T> for F
where
    F: Future<Output = Result<T, TransportError>> + Send,
    T: Send,
{
    async fn with_cancel(self, token: &CancellationToken) -> Result<T, TransportError> {
        if token.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(TransportError::Cancelled),
            res = self => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn completes_when_not_cancelled() {
        let token = CancellationToken::new();
        let res = async { Ok::<_, TransportError>(7) }.with_cancel(&token).await;
        assert_eq!(res.unwrap(), 7);
    }

    #[tokio::test]
    #[allow(unreachable_code)]
    async fn already_cancelled_never_polls() {
        let token = CancellationToken::new();
        token.cancel();
        let fut = async {
            panic!("polled");
            Ok::<(), TransportError>(())
        };
        let res = fut.with_cancel(&token).await;
        assert!(matches!(res, Err(TransportError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_long_sleep() {
        let token = CancellationToken::new();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            t.cancel();
        });
        let start = tokio::time::Instant::now();
        let res = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, TransportError>(())
        }
        .with_cancel(&token)
        .await;
        assert!(matches!(res, Err(TransportError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
