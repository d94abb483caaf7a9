use crate::error::ServiceError;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A caller-supplied cancellation signal: an optional token, an optional
/// deadline, or both.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    token: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl Cancellation {
    /// Never fires.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: None,
            deadline: Some(deadline),
        }
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token: Some(token),
            deadline: None,
        }
    }

    /// Derives a child token from `parent` so that cancelling the parent (for
    /// example on shutdown) also fires this signal.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self::with_token(parent.child_token())
    }

    pub fn and_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the error to report if the signal has already fired.
    pub fn is_fired(&self) -> Option<ServiceError> {
        if let Some(token) = &self.token {
            if token.is_cancelled() {
                return Some(ServiceError::Cancelled);
            }
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(ServiceError::DeadlineExceeded)
            }
            _ => None,
        }
    }

    /// Resolves once the token is cancelled or the deadline elapses. A signal
    /// that has already fired resolves on the first poll.
    pub async fn fired(&self) -> ServiceError {
        if let Some(err) = self.is_fired() {
            return err;
        }
        let cancelled = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => ServiceError::Cancelled,
            _ = expired => ServiceError::DeadlineExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;

    #[tokio::test]
    async fn expired_deadline_is_reported_immediately() {
        let cancel = Cancellation::with_deadline(Instant::now());
        assert!(matches!(
            cancel.is_fired(),
            Some(ServiceError::DeadlineExceeded)
        ));
        assert!(matches!(cancel.fired().await, ServiceError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn past_deadline_is_ready_on_first_poll() {
        let cancel = Cancellation::with_deadline(Instant::now() - Duration::from_millis(1));
        let fired = std::pin::pin!(cancel.fired());
        let polled = poll_once(fired).await;
        assert!(matches!(polled, Some(ServiceError::DeadlineExceeded)));
    }

    async fn poll_once<F: Future + Unpin>(mut fut: F) -> Option<F::Output> {
        std::future::poll_fn(|cx| {
            std::task::Poll::Ready(match Future::poll(std::pin::Pin::new(&mut fut), cx) {
                std::task::Poll::Ready(v) => Some(v),
                std::task::Poll::Pending => None,
            })
        })
        .await
    }

    #[tokio::test]
    async fn token_cancellation_wins_over_deadline() {
        let token = CancellationToken::new();
        let cancel = Cancellation::with_token(token.clone())
            .and_deadline(Instant::now() + Duration::from_secs(60));
        assert!(cancel.is_fired().is_none());

        token.cancel();
        assert!(matches!(cancel.is_fired(), Some(ServiceError::Cancelled)));
        assert!(matches!(cancel.fired().await, ServiceError::Cancelled));
    }

    #[tokio::test]
    async fn none_never_fires() {
        let cancel = Cancellation::none();
        assert!(cancel.is_fired().is_none());
        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            cancel.fired(),
        )
        .await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn child_follows_parent() {
        let parent = CancellationToken::new();
        let cancel = Cancellation::child_of(&parent);
        parent.cancel();
        assert!(matches!(cancel.is_fired(), Some(ServiceError::Cancelled)));
    }

    #[test]
    fn and_deadline_keeps_the_earliest() {
        let now = Instant::now();
        let early = now + Duration::from_secs(1);
        let late = now + Duration::from_secs(10);
        let cancel = Cancellation::with_deadline(early).and_deadline(late);
        assert_eq!(cancel.deadline(), Some(early));
    }
}
