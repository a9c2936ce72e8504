use std::future::Future;
use std::time::Duration;

use regex::Regex;

/// Pure configuration object driving retry decisions, per spec.md §4.8.
/// `retryableErrors` entries are compiled as regexes where possible; a
/// pattern that fails to compile falls back to a literal substring match,
/// logged once at construction (spec.md §4.8: "regex or substring").
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    retryable: Vec<RetryableMatcher>,
}

enum RetryableMatcher {
    Regex(Regex),
    Substring(String),
}

impl RetryableMatcher {
    fn matches(&self, message: &str) -> bool {
        match self {
            RetryableMatcher::Regex(re) => re.is_match(message),
            RetryableMatcher::Substring(s) => message.contains(s.as_str()),
        }
    }
}

impl RetryPolicy {
    pub fn new(enabled: bool, max_attempts: u32, initial_delay: Duration, max_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            enabled,
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
            retryable: Vec::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, 0, Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// Register patterns matched against an error's `Display` text.
    pub fn retryable_errors(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        for p in patterns {
            let p = p.into();
            let matcher = match Regex::new(&p) {
                Ok(re) => RetryableMatcher::Regex(re),
                Err(_) => {
                    log::warn!("retry: pattern {:?} is not a valid regex, falling back to substring match", p);
                    RetryableMatcher::Substring(p)
                }
            };
            self.retryable.push(matcher);
        }
        self
    }

    /// `getDelay(attempt)` = `min(initialDelay * multiplier^attempt, maxDelay)`.
    pub fn get_delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// `shouldRetry(err, attempt)`.
    pub fn should_retry(&self, message: &str, attempt: u32) -> bool {
        if !self.enabled || attempt >= self.max_attempts {
            return false;
        }
        if self.retryable.is_empty() {
            return true;
        }
        self.retryable.iter().any(|m| m.matches(message))
    }

    /// Calls `f`, sleeping for `get_delay` between attempts, surfacing the
    /// last error on exhaustion. Emits a log line on each retry and on final
    /// success after at least one retry, per spec.md §4.8.
    pub async fn execute<F, Fut, T, E>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        log::info!("retry: succeeded on attempt {}", attempt + 1);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let message = e.to_string();
                    if self.should_retry(&message, attempt) {
                        let delay = self.get_delay(attempt);
                        log::warn!("retry: attempt {} failed ({}), retrying in {:?}", attempt + 1, message, delay);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy::new(true, 5, Duration::from_millis(100), Duration::from_secs(1), 2.0);
        assert_eq!(policy.get_delay(0), Duration::from_millis(100));
        assert_eq!(policy.get_delay(1), Duration::from_millis(200));
        assert_eq!(policy.get_delay(2), Duration::from_millis(400));
        assert_eq!(policy.get_delay(10), Duration::from_secs(1));
    }

    #[test]
    fn should_retry_respects_disabled_and_attempt_cap() {
        let policy = RetryPolicy::new(false, 5, Duration::ZERO, Duration::ZERO, 1.0);
        assert!(!policy.should_retry("anything", 0));

        let policy = RetryPolicy::new(true, 2, Duration::ZERO, Duration::ZERO, 1.0);
        assert!(policy.should_retry("anything", 0));
        assert!(policy.should_retry("anything", 1));
        assert!(!policy.should_retry("anything", 2));
    }

    #[test]
    fn should_retry_filters_by_retryable_pattern() {
        let policy = RetryPolicy::new(true, 5, Duration::ZERO, Duration::ZERO, 1.0)
            .retryable_errors(["^ECONNRESET", "timed out"]);
        assert!(policy.should_retry("ECONNRESET: peer closed", 0));
        assert!(policy.should_retry("operation timed out", 0));
        assert!(!policy.should_retry("validation failed", 0));
    }

    #[tokio::test]
    async fn execute_retries_until_success() {
        let policy = RetryPolicy::new(true, 5, Duration::from_millis(1), Duration::from_millis(5), 1.0);
        let attempts = AtomicU32::new(0);
        let result: Result<u32, String> = policy
            .execute(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn execute_surfaces_last_error_on_exhaustion() {
        let policy = RetryPolicy::new(true, 2, Duration::from_millis(1), Duration::from_millis(2), 1.0);
        let result: Result<u32, String> = policy.execute(|| async { Err("boom".to_string()) }).await;
        assert_eq!(result.unwrap_err(), "boom");
    }
}
