//! Transient-failure retry for idempotent requests
//!
//! 429 and 5xx responses to GET/HEAD/PROPFIND/OPTIONS are retried with
//! exponential backoff and jitter, honoring a numeric `Retry-After`. Requests
//! with side effects are sent once. This is separate from the single
//! refresh-and-retry performed on auth failure.

use reqwest::{Client, Method, Request, Response};
use std::time::Duration;

use crate::config::RetryConfig;

/// Longest `Retry-After` we are willing to honor
const MAX_RETRY_AFTER_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable_status(status: u16) -> bool {
        matches!(status, 429 | 500 | 502 | 503 | 504)
    }

    pub fn is_retryable_method(method: &Method) -> bool {
        *method == Method::GET
            || *method == Method::HEAD
            || *method == Method::OPTIONS
            || method.as_str() == "PROPFIND"
    }

    /// Backoff for the given attempt, capped, plus 10-30% jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let jitter = capped * (0.1 + rand::random::<f64>() * 0.2);
        Duration::from_millis((capped + jitter) as u64)
    }
}

fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    let secs = value?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs.min(MAX_RETRY_AFTER_SECS)))
}

/// Send `request`, retrying transient failures when the method is idempotent
pub async fn send_with_retry(
    client: &Client,
    request: Request,
    policy: &RetryPolicy,
) -> Result<Response, reqwest::Error> {
    if !RetryPolicy::is_retryable_method(request.method()) {
        return client.execute(request).await;
    }

    let mut attempt = 0;
    let mut pending = request;
    loop {
        // Bodies on idempotent calls are buffered, so the clone only fails for streams
        let spare = pending.try_clone();
        let response = client.execute(pending).await?;
        let status = response.status().as_u16();

        let Some(next) = spare.filter(|_| attempt < policy.max_retries && RetryPolicy::is_retryable_status(status)) else {
            return Ok(response);
        };

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok());
        let delay = parse_retry_after(retry_after).unwrap_or_else(|| policy.delay_for(attempt));
        tracing::debug!(
            "HTTP {} {} returned {}. Retry {}/{} after {:?}",
            next.method(), next.url(), status, attempt + 1, policy.max_retries, delay
        );

        tokio::time::sleep(delay).await;
        attempt += 1;
        pending = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::from(&RetryConfig::default())
    }

    #[test]
    fn test_is_retryable_status() {
        for status in [429, 500, 502, 503, 504] {
            assert!(RetryPolicy::is_retryable_status(status));
        }
        for status in [200, 400, 401, 403, 404] {
            assert!(!RetryPolicy::is_retryable_status(status));
        }
    }

    #[test]
    fn test_only_idempotent_methods_retry() {
        assert!(RetryPolicy::is_retryable_method(&Method::GET));
        assert!(RetryPolicy::is_retryable_method(&Method::from_bytes(b"PROPFIND").unwrap()));
        assert!(!RetryPolicy::is_retryable_method(&Method::POST));
        assert!(!RetryPolicy::is_retryable_method(&Method::PUT));
    }

    #[test]
    fn test_delay_bounded() {
        let policy = policy();
        for attempt in 0..10 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= policy.base_delay.min(policy.max_delay));
            assert!(delay.as_millis() <= policy.max_delay.as_millis() * 13 / 10 + 1);
        }
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(Some("7")), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after(Some("100000")), Some(Duration::from_secs(MAX_RETRY_AFTER_SECS)));
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct 2015 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(None), None);
    }
}
