//! Retry with jittered exponential backoff.
//!
//! Every non-`Ok` result is retried; callers encode non-retryable outcomes
//! by returning success from their operation. Delays follow exponential
//! backoff with a random component, capped at fifteen minutes.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::EngineError;

/// Ceiling for a single backoff delay.
pub const MAX_WAIT: Duration = Duration::from_secs(15 * 60);

const MAX_WAIT_SECS: f64 = 15.0 * 60.0;

/// Executes an operation, retrying failures with exponential backoff.
///
/// `max_retries` does not count the initial attempt; `-1` retries until the
/// cancellation token fires.
pub struct Retry {
    max_retries: i64,
    random: Mutex<StdRng>,
    test_mode: bool,
}

impl Retry {
    pub fn new(max_retries: i64, seed: u64) -> Self {
        Self {
            max_retries,
            random: Mutex::new(StdRng::seed_from_u64(seed)),
            test_mode: false,
        }
    }

    /// Test variant with nanosecond delays.
    pub fn test_mode(max_retries: i64) -> Self {
        Self {
            max_retries,
            random: Mutex::new(StdRng::seed_from_u64(1)),
            test_mode: true,
        }
    }

    pub fn max_retries(&self) -> i64 {
        self.max_retries
    }

    /// Run `op`, retrying failures until it succeeds, the retry budget is
    /// spent, or `cancel` fires.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        desc: &str,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut errs = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if self.max_retries == 0 {
                    return Err(err);
                }
                err
            }
        };

        let mut attempt: u32 = 0;
        loop {
            let wait = self.wait_time(attempt);
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(description = desc, "stopping retry");
                    return Err(EngineError::Cancelled.into());
                }
                _ = tokio::time::sleep(wait) => {}
            }

            attempt += 1;
            if attempt > 1 {
                warn!(attempt_number = attempt, description = desc, "retrying");
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    errs = errs.context(format!("retry attempt #{attempt} failed '{err:#}'"));
                }
            }

            if self.max_retries >= 0 && i64::from(attempt) >= self.max_retries {
                return Err(errs);
            }
        }
    }

    fn wait_time(&self, attempt: u32) -> Duration {
        if self.test_mode {
            return Duration::from_nanos(1);
        }
        let mut random = match self.random.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        wait_time(attempt, &mut *random)
    }
}

/// Backoff delay for an attempt (0-based): `2^a` seconds plus a random
/// offset of up to half the distance to `2^(a+1)`, capped at [`MAX_WAIT`].
pub fn wait_time<R: Rng>(attempt: u32, random: &mut R) -> Duration {
    let a = f64::from(attempt);
    let base = a.exp2();
    if base >= MAX_WAIT_SECS {
        return MAX_WAIT;
    }
    let range = ((a + 1.0).exp2() - base) / 2.0;
    let delay = base + random.random_range(0.0..range);
    if delay >= MAX_WAIT_SECS {
        MAX_WAIT
    } else {
        Duration::from_secs_f64(delay)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn wait_time_follows_backoff_law() {
        let mut random = StdRng::seed_from_u64(7);
        for attempt in 0..6u32 {
            let base = Duration::from_secs(1 << attempt);
            let next = Duration::from_secs(1 << (attempt + 1));
            for _ in 0..50 {
                let delay = wait_time(attempt, &mut random);
                assert!(delay >= base, "attempt {attempt}: {delay:?} < {base:?}");
                assert!(delay < next, "attempt {attempt}: {delay:?} >= {next:?}");
            }
        }
    }

    #[test]
    fn wait_time_caps_at_fifteen_minutes() {
        let mut random = StdRng::seed_from_u64(7);
        // 2^10 = 1024s exceeds the 900s ceiling.
        assert_eq!(wait_time(10, &mut random), MAX_WAIT);
        assert_eq!(wait_time(32, &mut random), MAX_WAIT);
    }

    #[tokio::test]
    async fn first_success_returns_immediately() {
        let retry = Retry::test_mode(3);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result = retry
            .run(
                &cancel,
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(41)
                },
                "unit",
            )
            .await;
        assert_eq!(result.unwrap(), 41);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let retry = Retry::test_mode(0);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry
            .run(
                &cancel,
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("boom"))
                },
                "unit",
            )
            .await;
        assert_eq!(result.unwrap_err().to_string(), "boom");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let retry = Retry::test_mode(5);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result = retry
            .run(
                &cancel,
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(anyhow::anyhow!("boom"))
                    } else {
                        Ok(())
                    }
                },
                "unit",
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_accumulate_attempts() {
        let retry = Retry::test_mode(2);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry
            .run(
                &cancel,
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("boom"))
                },
                "unit",
            )
            .await;
        // Initial attempt plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("retry attempt #2 failed"), "{message}");
        assert!(message.contains("boom"), "{message}");
    }

    #[tokio::test]
    async fn cancellation_stops_unbounded_retries() {
        let retry = Arc::new(Retry::test_mode(-1));
        let cancel = CancellationToken::new();
        let handle = {
            let retry = retry.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                retry
                    .run(
                        &cancel,
                        || async { Err::<(), _>(anyhow::anyhow!("boom")) },
                        "unit",
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("retry should stop after cancellation")
            .unwrap();
        let err = result.unwrap_err();
        assert_eq!(
            err.downcast_ref::<EngineError>(),
            Some(&EngineError::Cancelled)
        );
    }
}
