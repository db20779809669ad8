use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::registry::errors::RegistryError;
use crate::settings::RetrySettings;

/// Retries `op` on retryable `RegistryError`s with exponential backoff:
/// `min(initial * base^attempt, max)`, optionally jittered. Auth and
/// image-not-found outcomes are returned immediately without consuming a
/// retry attempt.
pub async fn with_retry<T, F, Fut>(settings: &RetrySettings, op_name: &str, mut op: F) -> Result<T, RegistryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RegistryError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                attempt += 1;
                if attempt >= settings.max_attempts {
                    return Err(RegistryError::RetriesExhausted {
                        repository: op_name.to_string(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                let delay = backoff_delay(settings, attempt);
                warn!(op = op_name, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying after transient registry error");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn backoff_delay(settings: &RetrySettings, attempt: u32) -> Duration {
    let raw = settings.initial_delay_secs * settings.exponential_base.powi(attempt as i32 - 1);
    let capped = raw.min(settings.max_delay_secs).max(0.0);
    let seconds = if settings.jitter {
        let mut rng = rand::thread_rng();
        rng.gen_range(0.0..=capped)
    } else {
        capped
    };
    Duration::from_secs_f64(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn settings() -> RetrySettings {
        RetrySettings {
            max_attempts: 3,
            initial_delay_secs: 0.001,
            max_delay_secs: 0.01,
            exponential_base: 2.0,
            jitter: false,
            subprocess_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let result: Result<u32, RegistryError> = with_retry(&settings(), "test", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn does_not_retry_auth_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), RegistryError> = with_retry(&settings(), "test", move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RegistryError::Auth {
                    repository: "r".into(),
                    message: "nope".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_up_to_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), RegistryError> = with_retry(&settings(), "test", move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RegistryError::Transient {
                    repository: "r".into(),
                    message: "timeout".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(RegistryError::RetriesExhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovers_after_transient_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<u32, RegistryError> = with_retry(&settings(), "test", move || {
            let calls = calls2.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 1 {
                    Err(RegistryError::Transient {
                        repository: "r".into(),
                        message: "timeout".into(),
                    })
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }
}
