//! Backoff for transient CMS failures.
//!
//! Rate limits, transport errors and 5xx responses are retried. Anything the
//! instance rejected on purpose (auth, validation, not found) fails at once.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Backoff settings of one client.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Wait before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single wait, `Retry-After` included.
    pub max_delay: Duration,
    /// Growth factor between consecutive waits.
    pub backoff_multiplier: f64,
    /// Spread waits by up to a quarter so parallel workers don't retry in lockstep.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Wait before retry number `attempt` (1-based; 0 means no wait).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(exponent) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        let growth = self.backoff_multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        let secs = (self.initial_delay.as_secs_f64() * growth).min(self.max_delay.as_secs_f64());
        let spread = if self.add_jitter {
            secs * 0.25 * jitter_fraction()
        } else {
            0.0
        };
        Duration::from_secs_f64(secs + spread)
    }

    /// Wait before retrying after `error`. A server-provided `Retry-After`
    /// wins over the computed backoff, capped at `max_delay`.
    fn delay_after(&self, attempt: u32, error: &Error) -> Duration {
        let backoff = self.delay_for_attempt(attempt);
        match error {
            Error::RateLimit(secs) => Duration::from_secs(*secs).min(self.max_delay).max(backoff),
            _ => backoff,
        }
    }
}

/// Cheap fraction in `[0.0, 1.0)` taken from the clock.
fn jitter_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos % 1024) / 1024.0
}

/// True for failures worth another attempt.
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::RateLimit(_) | Error::Io(_) => true,
        Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        Error::Client(msg) => {
            let msg = msg.to_lowercase();
            ["http 500", "http 502", "http 503", "http 504", "timeout", "connection reset"]
                .iter()
                .any(|needle| msg.contains(needle))
        }
        _ => false,
    }
}

/// Runs `operation` until it succeeds, fails permanently or runs out of
/// retries. The last error is returned.
///
/// `label` only appears in log lines (e.g. `"list api::article.article"`).
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, label: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        let error = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    debug!("{}: succeeded after {} retries", label, retries);
                }
                return Ok(value);
            }
            Err(e) => e,
        };
        if retries >= config.max_retries || !is_retryable_error(&error) {
            return Err(error);
        }
        retries += 1;
        let delay = config.delay_after(retries, &error);
        warn!(
            "{}: {} (retry {}/{} in {:?})",
            label, error, retries, config.max_retries, delay
        );
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            add_jitter: false,
            ..Default::default()
        }
    }

    /// Runs `with_retry` over a scripted sequence of responses.
    async fn scripted(max_retries: u32, script: Vec<Result<u32>>) -> (Result<u32>, u32) {
        let calls = AtomicU32::new(0);
        let script = parking_lot::Mutex::new(script.into_iter());
        let calls_ref = &calls;
        let script_ref = &script;
        let result = with_retry(&fast_config(max_retries), "list articles", move || async move {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            let next = script_ref.lock().next();
            next.unwrap_or(Ok(0))
        })
        .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            add_jitter: false,
            ..Default::default()
        };

        let delays: Vec<u64> = (0..6)
            .map(|attempt| config.delay_for_attempt(attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![0, 1, 2, 4, 5, 5]);
        assert_eq!(RetryConfig::no_retry().delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn test_rate_limit_delay_honors_retry_after() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            add_jitter: false,
            ..Default::default()
        };

        assert_eq!(
            config.delay_after(1, &Error::RateLimit(3)),
            Duration::from_secs(3)
        );
        assert_eq!(
            config.delay_after(1, &Error::RateLimit(600)),
            Duration::from_secs(10)
        );
        assert_eq!(
            config.delay_after(1, &Error::Client("HTTP 502".to_string())),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable_error(&Error::RateLimit(1)));
        assert!(is_retryable_error(&Error::Client(
            "HTTP 503: Service Unavailable".to_string()
        )));
        assert!(is_retryable_error(&Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))));

        assert!(!is_retryable_error(&Error::Authentication(
            "HTTP 401: Unauthorized".to_string()
        )));
        assert!(!is_retryable_error(&Error::NotFound("missing".to_string())));
        assert!(!is_retryable_error(&Error::Client(
            "HTTP 400: title is required".to_string()
        )));
        assert!(!is_retryable_error(&Error::ConflictDetected {
            content_type: "api::tag.tag".to_string(),
            reason: "slug taken".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (result, calls) = scripted(
            3,
            vec![
                Err(Error::RateLimit(0)),
                Err(Error::Client("HTTP 503: unavailable".to_string())),
                Ok(42),
            ],
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let failures = (0..5)
            .map(|_| Err(Error::Client("HTTP 500: boom".to_string())))
            .collect();
        let (result, calls) = scripted(2, failures).await;

        assert!(matches!(result, Err(Error::Client(_))));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let (result, calls) = scripted(
            5,
            vec![Err(Error::Authentication("HTTP 401: Unauthorized".to_string()))],
        )
        .await;

        assert!(matches!(result, Err(Error::Authentication(_))));
        assert_eq!(calls, 1);
    }
}
