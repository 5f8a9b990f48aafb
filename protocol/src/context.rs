//! Caller-supplied deadlines and their composition with operation timeouts.
//!
//! Every protocol call runs under the tighter of two bounds: the deadline the
//! caller attached to its [`CallContext`] and the operation timeout computed
//! by [`TimeoutConfig`](crate::timeout::TimeoutConfig). Whichever expires
//! first, the caller sees `Participant/PeerResponseTimedOut`.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::client::ClientError;
use crate::error::APIError;

/// Per-call options from the API caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallContext {
    deadline: Option<Instant>,
}

impl CallContext {
    /// No caller deadline; only the operation timeout applies.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The effective deadline for an operation bounded by `op_timeout`.
    pub fn bound(&self, op_timeout: Duration) -> Instant {
        let now = Instant::now();
        let op_deadline = now.checked_add(op_timeout).unwrap_or_else(far_future);
        match self.deadline {
            Some(d) => d.min(op_deadline),
            None => op_deadline,
        }
    }

    /// Run a backend call under the composed deadline and classify the
    /// outcome. Expiry maps to `PeerResponseTimedOut` for `peer_alias`.
    pub async fn run<T, F>(
        &self,
        op_timeout: Duration,
        peer_alias: &str,
        call: F,
    ) -> Result<T, APIError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        let started = Instant::now();
        let deadline = self.bound(op_timeout);
        match tokio::time::timeout_at(deadline, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(APIError::from_client(e, peer_alias)),
            Err(_) => Err(APIError::peer_response_timed_out(
                peer_alias,
                deadline.saturating_duration_since(started),
            )),
        }
    }
}

fn far_future() -> Instant {
    // Roughly 30 years; tokio clamps anything larger anyway.
    Instant::now() + Duration::from_secs(86_400 * 365 * 30)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[tokio::test(start_paused = true)]
    async fn caller_deadline_wins_when_tighter() {
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        let bound = ctx.bound(Duration::from_secs(60));
        assert_eq!(bound, ctx.deadline().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn operation_timeout_wins_when_tighter() {
        let ctx = CallContext::with_timeout(Duration::from_secs(60));
        let bound = ctx.bound(Duration::from_secs(1));
        assert_eq!(bound, Instant::now() + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_surfaces_as_peer_timeout() {
        let ctx = CallContext::background();
        let err = ctx
            .run(Duration::from_secs(5), "bob", async {
                std::future::pending::<Result<(), ClientError>>().await
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PeerResponseTimedOut);
    }

    #[tokio::test]
    async fn backend_errors_are_classified() {
        let ctx = CallContext::background();
        let err = ctx
            .run(Duration::from_secs(5), "bob", async {
                Err::<(), _>(ClientError::Rejected("busy".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RejectedByPeer);
    }

    #[tokio::test]
    async fn huge_timeouts_do_not_overflow() {
        let ctx = CallContext::background();
        let value = ctx
            .run(Duration::MAX, "bob", async { Ok::<_, ClientError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
