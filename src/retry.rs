//! Deadlines and exponential backoff shared by every waiting loop
//!
//! Submission retries, inclusion waiting, post-condition polling and
//! confirmation polling all go through [`poll_until`], so cancellation and
//! sleep behaviour is identical everywhere.

use crate::error::{TransactorError, TransactorResult};

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Exponential backoff shape: `initial`, multiplied by `multiplier` after
/// every delay and saturating at `max`.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
}

impl BackoffPolicy {
    /// Policy that always waits the same interval
    pub fn fixed(interval: Duration) -> Self {
        let ms = interval.as_millis() as u64;
        Self {
            initial_ms: ms,
            multiplier: 1.0,
            max_ms: ms,
        }
    }

    /// Start a fresh sequence of delays
    pub fn delays(&self) -> Backoff {
        Backoff {
            next_ms: self.initial_ms.min(self.max_ms),
            policy: *self,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            multiplier: 1.6,
            max_ms: 30_000,
        }
    }
}

/// Infinite sequence of delays produced by a [`BackoffPolicy`]
#[derive(Debug, Clone)]
pub struct Backoff {
    next_ms: u64,
    policy: BackoffPolicy,
}

impl Backoff {
    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let current = self.next_ms;
        let grown = (current as f64 * self.policy.multiplier) as u64;
        self.next_ms = grown.min(self.policy.max_ms);
        Duration::from_millis(current)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

/// Absolute deadline paired with an explicit cancellation signal
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    cancel: CancellationToken,
}

impl Deadline {
    /// Deadline `timeout` from now
    pub fn after(timeout: Duration) -> Self {
        Self::with_token(timeout, CancellationToken::new())
    }

    /// Deadline `timeout` from now that is also cancelled by `token`
    pub fn with_token(timeout: Duration, token: CancellationToken) -> Self {
        Self {
            at: Instant::now() + timeout,
            cancel: token,
        }
    }

    /// Nested deadline: expires at the earlier of the parent and `timeout`
    /// from now, and is cancelled together with the parent.
    pub fn child(&self, timeout: Duration) -> Self {
        Self {
            at: self.at.min(Instant::now() + timeout),
            cancel: self.cancel.child_token(),
        }
    }

    /// Cancel this deadline and every child derived from it
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Fail fast if the deadline has already been reached
    pub fn check(&self) -> TransactorResult<()> {
        if self.cancel.is_cancelled() {
            return Err(TransactorError::Cancelled);
        }
        if Instant::now() >= self.at {
            return Err(TransactorError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the deadline fires first
    pub async fn run<F: Future>(&self, fut: F) -> TransactorResult<F::Output> {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransactorError::Cancelled),
            _ = sleep_until(self.at) => Err(TransactorError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `delay`, waking early with an error if the deadline fires
    pub async fn sleep(&self, delay: Duration) -> TransactorResult<()> {
        self.run(sleep(delay)).await
    }
}

/// Repeatedly evaluate `poll` until it yields a value, sleeping between
/// evaluations according to `policy`. Bounded only by `deadline`.
pub async fn poll_until<T, F, Fut>(
    deadline: &Deadline,
    policy: &BackoffPolicy,
    mut poll: F,
) -> TransactorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let mut delays = policy.delays();
    loop {
        if let Some(value) = deadline.run(poll()).await? {
            return Ok(value);
        }
        deadline.sleep(delays.next_delay()).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_backoff_sequence_saturates() {
        let delays: Vec<u64> = BackoffPolicy::default()
            .delays()
            .take(11)
            .map(|d| d.as_millis() as u64)
            .collect();

        assert_eq!(
            delays,
            vec![1000, 1600, 2560, 4096, 6553, 10484, 16774, 26838, 30000, 30000, 30000]
        );
    }

    #[test]
    fn test_fixed_policy_never_grows() {
        let mut delays = BackoffPolicy::fixed(Duration::from_millis(5)).delays();
        for _ in 0..5 {
            assert_eq!(delays.next_delay(), Duration::from_millis(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_sleeps_along_backoff() {
        let start = Instant::now();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let deadline = Deadline::after(Duration::from_secs(600));

        let value = poll_until(&deadline, &BackoffPolicy::default(), || {
            let seen = seen.clone();
            async move {
                let mut seen = seen.lock().unwrap();
                seen.push(start.elapsed().as_millis() as u64);
                if seen.len() == 5 {
                    Some(seen.len())
                } else {
                    None
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 5);
        // Cumulative offsets of 1000, 1600, 2560, 4096
        assert_eq!(*seen.lock().unwrap(), vec![0, 1000, 2600, 5160, 9256]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_stops_at_deadline() {
        let start = Instant::now();
        let calls = AtomicU32::new(0);
        let deadline = Deadline::after(Duration::from_secs(10));

        let result: TransactorResult<()> = poll_until(&deadline, &BackoffPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { None }
        })
        .await;

        assert!(matches!(result, Err(TransactorError::DeadlineExceeded)));
        assert!(start.elapsed() <= Duration::from_secs(10));
        assert!(calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_cancellation_is_distinguishable() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let child = deadline.child(Duration::from_secs(600));
        assert!(child.instant() <= deadline.instant());

        deadline.cancel();
        assert!(matches!(child.check(), Err(TransactorError::Cancelled)));
        assert!(matches!(
            child.sleep(Duration::from_secs(1)).await,
            Err(TransactorError::Cancelled)
        ));
    }
}
