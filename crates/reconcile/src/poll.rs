use std::future::Future;

use keel_core::{Error, ObjectRef, Result, RetryPolicy};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of one poll tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    Ready(T),
    /// Not there yet; the optional reason is reported if the deadline fires.
    Pending(Option<String>),
}

/// Run `check` immediately, then every `policy.interval` until it returns
/// [`Step::Ready`], returns an error, the deadline passes, or `cancel` fires.
///
/// `check` receives the 1-based attempt number. Errors from `check` end the
/// loop as-is; the deadline yields [`Error::DeadlineExceeded`] carrying the
/// attempt count and the last pending reason.
pub async fn poll_immediate<T, F, Fut>(
    target: &ObjectRef,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Step<T>>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempts = 0u32;
    let mut last_error = None;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled { target: target.clone(), attempts });
        }
        attempts += 1;
        match check(attempts).await? {
            Step::Ready(v) => return Ok(v),
            Step::Pending(reason) => {
                if reason.is_some() {
                    last_error = reason;
                }
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::DeadlineExceeded { target: target.clone(), attempts, last_error });
        }
        let nap = policy.interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled { target: target.clone(), attempts }),
            _ = tokio::time::sleep(nap) => {}
        }
    }
}
