// Fixed-delay, unbounded retry for queue connectivity failures

use std::fmt::Display;
use std::thread;
use std::time::{Duration, Instant};

/// Slice used while sleeping so a cancellation is noticed promptly.
const CANCEL_CHECK: Duration = Duration::from_millis(100);

/// Sleep for `delay` unless `cancelled` turns true first. Returns `false` when cancelled.
pub fn sleep_unless(delay: Duration, cancelled: &dyn Fn() -> bool) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(CANCEL_CHECK.min(deadline - now));
    }
}

/// Run `op` until it succeeds, retrying errors accepted by `retryable` after a
/// fixed `delay`. There is no attempt limit: the pipeline prefers waiting for
/// the queue over failing fast.
///
/// Returns `Ok(None)` if `cancelled` fires while waiting, and the error itself
/// when it is not retryable.
pub fn retry_fixed<T, E, F>(
    what: &str,
    delay: Duration,
    cancelled: &dyn Fn() -> bool,
    retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<Option<T>, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    let mut attempt: u64 = 0;
    loop {
        if cancelled() {
            return Ok(None);
        }
        attempt += 1;
        match op() {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!("{} succeeded after {} attempts", what, attempt);
                }
                return Ok(Some(value));
            }
            Err(e) if retryable(&e) => {
                tracing::warn!(
                    attempt,
                    "{} failed: {}. Retrying in {:?}",
                    what,
                    e,
                    delay
                );
                if !sleep_unless(delay, cancelled) {
                    return Ok(None);
                }
            }
            Err(e) => return Err(e),
        }
    }
}
