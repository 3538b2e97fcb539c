//! Retry and periodic-run helpers.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Call `f` until it succeeds, sleeping `interval` between attempts.
///
/// With `max_retry = Some(n)` at most `n` retries follow the first attempt and
/// the last error is returned; `None` retries forever.
pub async fn retry_every<F, Fut, T, E>(
    interval: Duration,
    max_retry: Option<usize>,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut retries = 0usize;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if max_retry.is_some_and(|max| retries >= max) {
                    warn!(retries, error = %e, "Giving up after retries");
                    return Err(e);
                }
                debug!(attempt = retries + 1, error = %e, "Attempt failed, retrying");
                retries += 1;
                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Run `f` now and then every `interval` until it returns `true`.
pub fn run_every<F, Fut>(interval: Duration, mut f: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if f().await {
                break;
            }
        }
    })
}
