//! Retry with a fixed backoff schedule plus jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// An attempt's error and whether trying again may help.
#[derive(Debug)]
pub struct RetryError<E> {
    pub error: E,
    pub retry: bool,
}

impl<E> RetryError<E> {
    pub fn retry(error: E) -> Self {
        Self { error, retry: true }
    }

    pub fn fatal(error: E) -> Self {
        Self {
            error,
            retry: false,
        }
    }
}

/// A successful value and how many retries it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub retries: usize,
}

/// Run `op` until it succeeds, fails fatally, or the schedule runs out.
///
/// Retry `i` waits `delays[i]` plus up to `jitter`; there are at most
/// `delays.len()` retries. `op` receives the attempt index.
pub async fn retry_with_backoff<T, E, F, Fut>(
    delays: &[Duration],
    jitter: Duration,
    mut op: F,
) -> Result<Retried<T>, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, RetryError<E>>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    retries: attempt,
                });
            }
            Err(RetryError { error, retry }) => {
                let Some(delay) = delays.get(attempt).filter(|_| retry) else {
                    return Err(error);
                };
                let wait = *delay + jitter.mul_f64(rand::thread_rng().gen_range(0.0..=1.0));
                warn!(attempt = attempt + 1, wait_ms = wait.as_millis() as u64, error = %error, "Attempt failed, retrying");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const FAST: [Duration; 3] = [
        Duration::from_millis(1),
        Duration::from_millis(1),
        Duration::from_millis(1),
    ];

    #[tokio::test]
    async fn succeeds_after_retries() {
        let result = retry_with_backoff(&FAST, Duration::ZERO, |attempt| async move {
            if attempt < 2 {
                Err(RetryError::retry("flaky"))
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();
        assert_eq!(result.value, 2);
        assert_eq!(result.retries, 2);
    }

    #[tokio::test]
    async fn gives_up_after_schedule() {
        let calls = AtomicUsize::new(0);
        let err = retry_with_backoff(&FAST, Duration::ZERO, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(RetryError::retry("still down")) }
        })
        .await
        .unwrap_err();
        assert_eq!(err, "still down");
        assert_eq!(calls.load(Ordering::SeqCst), FAST.len() + 1);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let err = retry_with_backoff(&FAST, Duration::ZERO, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(RetryError::fatal("bad model")) }
        })
        .await
        .unwrap_err();
        assert_eq!(err, "bad model");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
