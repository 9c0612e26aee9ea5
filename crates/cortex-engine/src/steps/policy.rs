//! Per-step error handling: bounded retries, then throw, fallback, or skip.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use cortex_core::error::{CortexError, Result};

/// What to do once retries are exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Propagate; the universal node routes to `error_handler`.
    #[default]
    Throw,
    /// Write the configured fallback value to the step's output.
    Fallback,
    /// Write nothing; later steps see no update.
    Skip,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorPolicy {
    /// Number of retries after the first attempt.
    pub retry: u32,
    /// Base delay; retry n sleeps (n+1) times this.
    #[serde(rename = "retryDelay")]
    pub retry_delay_ms: u64,
    pub on_error: OnError,
    pub fallback_value: Option<Value>,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            retry: 0,
            retry_delay_ms: 500,
            on_error: OnError::Throw,
            fallback_value: None,
        }
    }
}

/// Outcome of running a step body under a policy.
pub enum PolicyOutcome<T> {
    Value(T),
    Fallback(Value),
    Skipped,
}

/// Run `attempt` up to `1 + policy.retry` times, then resolve per policy.
pub async fn with_retries<T, F, Fut>(
    policy: &ErrorPolicy,
    step: &str,
    mut attempt: F,
) -> Result<PolicyOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;

    for n in 0..=policy.retry {
        if n > 0 {
            // Retry n sleeps n * base, with jitter so concurrent failing
            // steps do not retry in lockstep.
            let base = policy.retry_delay_ms.saturating_mul(n as u64);
            let jitter = 0.8 + rand::random::<f64>() * 0.4;
            tokio::time::sleep(Duration::from_millis((base as f64 * jitter) as u64)).await;
        }
        match attempt().await {
            Ok(value) => return Ok(PolicyOutcome::Value(value)),
            Err(e) => {
                warn!(step, attempt = n + 1, error = %e, "Step attempt failed");
                last_err = Some(e);
            }
        }
    }

    let err = last_err.unwrap_or_else(|| CortexError::Step {
        step: step.to_string(),
        message: "all attempts failed".into(),
    });
    match policy.on_error {
        OnError::Throw => Err(err),
        OnError::Fallback => Ok(PolicyOutcome::Fallback(
            policy.fallback_value.clone().unwrap_or(Value::Null),
        )),
        OnError::Skip => Ok(PolicyOutcome::Skipped),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_core::error::CortexError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let policy = ErrorPolicy::default();
        let outcome = with_retries(&policy, "t", || async { Ok(1u32) }).await.unwrap();
        assert!(matches!(outcome, PolicyOutcome::Value(1)));
    }

    #[tokio::test]
    async fn test_retries_then_throws() {
        let policy = ErrorPolicy {
            retry: 2,
            retry_delay_ms: 1,
            ..Default::default()
        };
        let calls = AtomicU32::new(0);
        let result: Result<PolicyOutcome<u32>> = with_retries(&policy, "t", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CortexError::Provider("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fallback_after_exhaustion() {
        let policy = ErrorPolicy {
            retry: 1,
            retry_delay_ms: 1,
            on_error: OnError::Fallback,
            fallback_value: Some(serde_json::json!([])),
        };
        let outcome: PolicyOutcome<u32> = with_retries(&policy, "t", || async {
            Err(CortexError::Provider("down".into()))
        })
        .await
        .unwrap();
        match outcome {
            PolicyOutcome::Fallback(v) => assert_eq!(v, serde_json::json!([])),
            _ => panic!("expected fallback"),
        }
    }

    #[tokio::test]
    async fn test_skip_after_exhaustion() {
        let policy = ErrorPolicy {
            retry: 0,
            on_error: OnError::Skip,
            ..Default::default()
        };
        let outcome: PolicyOutcome<u32> = with_retries(&policy, "t", || async {
            Err(CortexError::Provider("down".into()))
        })
        .await
        .unwrap();
        assert!(matches!(outcome, PolicyOutcome::Skipped));
    }
}
