//! Bounded polling
//!
//! Handshake waits, tunnel readiness checks, process-exit waits and the
//! scheduler startup check all go through [`poll_until`].

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Result of a bounded poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The probe produced a value
    Ready(T),
    /// The timeout elapsed first
    TimedOut { waited: Duration, attempts: u32 },
}

impl<T> PollOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            PollOutcome::Ready(value) => Some(value),
            PollOutcome::TimedOut { .. } => None,
        }
    }
}

/// Call `probe` every `interval` until it yields `Some` or `timeout` elapses.
///
/// The probe always runs at least once, and once more right at the deadline,
/// so a zero timeout degenerates to a single check.
pub async fn poll_until<T, F, Fut>(interval: Duration, timeout: Duration, mut probe: F) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let Some(value) = probe().await {
            return PollOutcome::Ready(value);
        }

        let waited = start.elapsed();
        if waited >= timeout {
            tracing::trace!(attempts, waited_ms = waited.as_millis() as u64, "Poll timed out");
            return PollOutcome::TimedOut { waited, attempts };
        }

        tokio::time::sleep(interval.min(timeout - waited)).await;
    }
}
