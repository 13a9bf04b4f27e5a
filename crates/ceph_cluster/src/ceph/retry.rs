use std::future::Future;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::util::errors::{Error, Result, StdError};

pub const DEFAULT_RETRIES: usize = 5;
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(5);

/// Runs `op` up to `retries` times. A failure is retried only when its exit code is in
/// `retry_on`; any other failure, or the last one, is returned. Cancellation is checked between
/// attempts.
pub async fn execute_with_retry<T, F, Fut>(
    cancel: &CancellationToken,
    description: &str,
    retries: usize,
    retry_on: &[i32],
    wait: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = retries.max(1);
    let mut attempt = 1;
    loop {
        let err = match op().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };

        let retryable = err.exit_code().is_some_and(|code| retry_on.contains(&code));
        if !retryable || attempt >= attempts {
            return Err(err);
        }

        info!(
            "{} failed (attempt {}/{}), retrying in {:?}: {}",
            description, attempt, attempts, wait, err
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::StdError(StdError::Cancelled)),
            _ = tokio::time::sleep(wait) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ceph::command::{CommandError, EINVAL, ENOENT};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn exit(code: i32) -> Error {
        CommandError::Exit {
            summary: "ceph orch set backend rook".to_string(),
            code,
            stderr: String::new(),
        }
        .into()
    }

    #[tokio::test(start_paused = true)]
    async fn retries_listed_exit_codes_until_success() {
        let calls = AtomicUsize::new(0);
        let res = execute_with_retry(
            &CancellationToken::new(),
            "set backend",
            DEFAULT_RETRIES,
            &[EINVAL],
            DEFAULT_RETRY_WAIT,
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(exit(EINVAL))
                } else {
                    Ok("done")
                }
            },
        )
        .await;
        assert_eq!(res.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_last_failure_after_all_attempts() {
        let calls = AtomicUsize::new(0);
        let res: Result<()> = execute_with_retry(
            &CancellationToken::new(),
            "set backend",
            DEFAULT_RETRIES,
            &[EINVAL],
            DEFAULT_RETRY_WAIT,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(exit(EINVAL))
            },
        )
        .await;
        assert_eq!(res.unwrap_err().exit_code(), Some(EINVAL));
        assert_eq!(calls.load(Ordering::SeqCst), DEFAULT_RETRIES);
    }

    #[tokio::test]
    async fn other_exit_codes_fail_immediately() {
        let calls = AtomicUsize::new(0);
        let res: Result<()> = execute_with_retry(
            &CancellationToken::new(),
            "set backend",
            DEFAULT_RETRIES,
            &[EINVAL],
            DEFAULT_RETRY_WAIT,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(exit(ENOENT))
            },
        )
        .await;
        assert_eq!(res.unwrap_err().exit_code(), Some(ENOENT));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_between_attempts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: Result<()> = execute_with_retry(
            &cancel,
            "set backend",
            DEFAULT_RETRIES,
            &[EINVAL],
            Duration::from_secs(3600),
            || async { Err(exit(EINVAL)) },
        )
        .await;
        assert!(matches!(res, Err(Error::StdError(StdError::Cancelled))));
    }
}
