//! Shared retry-with-backoff abstraction. Both the taxonomy harmoniser and
//! the geo evaluator's occurrence-download client retry transport failures
//! the same way, so the logic lives here once rather than being duplicated
//! (or worse, entangled) inside each caller's response parser.

use std::thread;
use std::time::Duration;

/// Calls `op` up to `attempts` times (the first call plus `attempts - 1`
/// retries), sleeping `delay` between attempts. Returns the first `Ok`, or
/// the last `Err` if every attempt fails.
pub fn retry<T, E>(attempts: u32, delay: Duration, mut op: impl FnMut() -> Result<T, E>) -> Result<T, E> {
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_err = Some(err);
                if attempt + 1 < attempts {
                    thread::sleep(delay);
                }
            }
        }
    }
    Err(last_err.expect("attempts >= 1 guarantees at least one error recorded"))
}

/// Default retry count used by the harmoniser and geo evaluator (spec design
/// constant `R = 3`).
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default backoff between retries (spec design constant, 30 seconds).
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(30);

/// Poll interval for the occurrence-download state machine (spec design
/// constant, 60 seconds).
pub const DOWNLOAD_POLL_INTERVAL: Duration = Duration::from_secs(60);
