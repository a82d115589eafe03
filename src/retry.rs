use std::{future::Future, time::Duration};

use tokio_retry::{strategy::FixedInterval, RetryIf};

use crate::types::SourceError;

/// Bounded, fixed-delay retry budget for one class of remote calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    // total attempts, including the first one
    pub attempts: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: usize, delay: Duration) -> Self {
        RetryPolicy { attempts, delay }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            delay: Duration::from_secs(120),
        }
    }
}

/// Runs `op` under `policy`, retrying retryable failures after a constant delay.
///
/// When the budget is spent, or the failure is not retryable, the error is
/// logged and `default` is returned. Callers must read a returned default as
/// "data unavailable for this item".
pub async fn retry_or_default<T, F, Fut>(policy: &RetryPolicy, what: &str, default: T, op: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    if policy.attempts == 0 {
        warn!("no attempts allowed for {}, returning default", what);
        return default;
    }

    let strategy = FixedInterval::new(policy.delay).take(policy.attempts - 1);
    let mut attempt = 0;
    let res = RetryIf::spawn(strategy, op, |e: &SourceError| {
        attempt += 1;
        let retryable = e.is_retryable();
        if retryable && attempt < policy.attempts {
            warn!(
                "{} failed ({}: {}), attempt {}/{}, retrying in {:?}",
                what,
                e.kind(),
                e,
                attempt,
                policy.attempts,
                policy.delay
            );
        }
        retryable
    })
    .await;

    match res {
        Ok(v) => v,
        Err(e) => {
            error!(
                "{} failed permanently ({}: {}), returning default",
                what,
                e.kind(),
                e
            );
            default
        }
    }
}
