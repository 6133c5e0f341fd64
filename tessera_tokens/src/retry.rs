//! Bounded retry with exponential backoff

use std::{error, future::Future, time::Duration};

/// Configuration for how often and how patiently to retry an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    attempts: u32,
    initial_delay: Duration,
}

impl Default for RetryConfig {
    /// Default retry configuration
    ///
    /// Makes 3 attempts, waiting 300 ms after the first failure and 600 ms
    /// after the second.
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(300),
        }
    }
}

impl RetryConfig {
    /// Constructs a new retry configuration
    ///
    /// The operation is attempted up to `attempts` times, and at least once.
    /// After the first failure the retry waits `initial_delay`, and every
    /// further wait is twice as long as the previous one.
    pub fn new(attempts: u32, initial_delay: Duration) -> Self {
        Self {
            attempts,
            initial_delay,
        }
    }

    /// The maximum number of attempts
    pub fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// The delay after the first failed attempt
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }
}

/// Runs `operation` until it succeeds or the attempts are exhausted
///
/// Returns the first success, or the error from the final attempt.
pub async fn retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: error::Error + 'static,
{
    let attempts = config.attempts();
    let mut delay = config.initial_delay;
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < attempts => {
                tracing::debug!(
                    error = (&error as &dyn error::Error),
                    attempt,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed, will retry"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(error) => {
                tracing::debug!(
                    error = (&error as &dyn error::Error),
                    attempts,
                    "all attempts failed"
                );
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::atomic::{AtomicU32, Ordering},
    };

    use tokio::time::Instant;

    use super::*;

    fn failure() -> io::Error {
        io::Error::new(io::ErrorKind::NotFound, "nothing yet")
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts_with_doubling_delays() {
        let calls = AtomicU32::new(0);
        let mut seen = Vec::new();
        let start = Instant::now();

        let result: Result<(), io::Error> = retry(&RetryConfig::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            seen.push(start.elapsed());
            async { Err(failure()) }
        })
        .await;

        assert_eq!(result.unwrap_err().to_string(), "nothing yet");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            seen,
            vec![
                Duration::ZERO,
                Duration::from_millis(300),
                Duration::from_millis(900),
            ]
        );
        assert_eq!(start.elapsed(), Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result = retry(&RetryConfig::default(), || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Err(failure())
                } else {
                    Ok(call)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_tries_once() {
        let calls = AtomicU32::new(0);

        let result: Result<(), io::Error> = retry(&RetryConfig::new(0, Duration::from_secs(1)), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(failure()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
