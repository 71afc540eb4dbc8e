//! Utility functions for consul-coord

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::time::Duration;

/// Percent-encoding set for KV keys in URL paths. `/` is kept so that keys
/// stay hierarchical.
const KEY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&')
    .add(b'"');

/// Encode a KV key or node name for use in a URL path
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ENCODE_SET).to_string()
}

/// Render a duration the way Consul's API accepts it (`wait`, `LockDelay`).
pub fn consul_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}ms", ms)
    }
}

/// Retry with exponential backoff
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_retries - 1 => {
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}

/// Backoff schedule for loops that must keep going until the backend comes
/// back, doubling up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_encode_key() {
        assert_eq!(encode_key("web/shutdown"), "web/shutdown");
        assert_eq!(encode_key("nodes/node 1/status"), "nodes/node%201/status");
        assert_eq!(encode_key("a?b"), "a%3Fb");
    }

    #[test]
    fn test_consul_duration() {
        assert_eq!(consul_duration(Duration::from_secs(10)), "10s");
        assert_eq!(consul_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(consul_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn test_backoff_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_retries_request_failures() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = retry_with_backoff(
            || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(crate::Error::RequestFailed("500 on /v1/kv/spec".into()))
                } else {
                    Ok(7)
                }
            },
            5,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_stops_on_permanent_error() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: crate::Result<()> = retry_with_backoff(
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(crate::Error::InvalidSpec("ratios".into()))
            },
            5,
            Duration::from_millis(10),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
