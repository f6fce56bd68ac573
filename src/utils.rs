use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Granularity at which a backoff sleep re-checks for cancellation
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// Whether the shared-memory endpoint currently exists
pub fn endpoint_exists(path: &Path) -> bool {
    path.exists()
}

/// Outcome of [`wait_for_endpoint`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointWait {
    Present,
    /// Still missing after every attempt; a single warning was logged
    Missing,
    Cancelled,
}

/// Poll for `path` up to `attempts` times, sleeping `backoff` between
/// checks. `cancelled` is consulted throughout the sleeps so a concurrent
/// stop ends the wait promptly. The caller proceeds on `Missing`.
pub fn wait_for_endpoint(
    path: &Path,
    attempts: u32,
    backoff: Duration,
    cancelled: impl Fn() -> bool,
) -> EndpointWait {
    for attempt in 1..=attempts {
        if endpoint_exists(path) {
            return EndpointWait::Present;
        }
        info!(
            "Waiting for endpoint {} to appear... ({}/{})",
            path.display(),
            attempt,
            attempts
        );
        if !sleep_unless(backoff, &cancelled) {
            debug!("Endpoint wait cancelled");
            return EndpointWait::Cancelled;
        }
    }

    if endpoint_exists(path) {
        return EndpointWait::Present;
    }
    warn!(
        "Endpoint {} still doesn't exist after waiting, continuing anyway",
        path.display()
    );
    EndpointWait::Missing
}

/// Sleep for `duration`, returning false early if `cancelled` turns true
fn sleep_unless(duration: Duration, cancelled: &impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}

/// Resident set size of this process, from /proc/self/statm
pub fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * page_size::get() as u64)
}
