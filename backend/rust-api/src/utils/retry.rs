use std::time::Duration;

use crate::config::SyncSettings;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, the first call included.
    pub max_attempts: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_max: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(500),
            jitter_max: Some(Duration::from_millis(25)),
        }
    }
}

impl RetryConfig {
    /// Store retry policy: one initial call plus `store_max_retries` retries.
    pub fn for_store(settings: &SyncSettings) -> Self {
        let base = Duration::from_millis(settings.store_retry_backoff_ms);
        Self {
            max_attempts: settings.store_max_retries as usize + 1,
            base_backoff: base,
            max_backoff: base * 16,
            jitter_max: Some(base / 2),
        }
    }
}

/// Retries only the errors `should_retry` accepts; anything else returns at once.
pub async fn retry_async_when<F, Fut, T, E, P>(
    config: RetryConfig,
    mut f: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempts_left = config.max_attempts.max(1);
    let mut backoff = config.base_backoff;

    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempts_left = attempts_left.saturating_sub(1);
                if attempts_left == 0 || !should_retry(&e) {
                    return Err(e);
                }

                let wait = match config.jitter_max {
                    Some(jitter_max) => {
                        let jitter_ms = jitter_max.as_millis() as u64;
                        let extra = if jitter_ms == 0 {
                            0
                        } else {
                            rand::random::<u64>() % (jitter_ms + 1)
                        };
                        backoff + Duration::from_millis(extra)
                    }
                    None => backoff,
                };
                tracing::debug!(wait_ms = wait.as_millis() as u64, "retrying after backoff");
                tokio::time::sleep(wait).await;

                backoff = std::cmp::min(backoff * 2, config.max_backoff);
            }
        }
    }
}
