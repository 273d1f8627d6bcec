// Rate limiter for outgoing API calls.
//
// Accounting is a sliding log of recent call instants: a permit is granted
// only when fewer than `limit` calls happened within the trailing window, so
// the quota holds over any window-length span, not just aligned buckets
// (Discogs enforces its quota over a rolling minute). The log is the only
// shared mutable state and sits behind a single Mutex since it tracks one
// shared quota.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, warn};

use crate::error::CatalogError;

/// How a caller wants to handle an exhausted budget. Interactive callers
/// block with a visible countdown; batch callers fail fast and surface the
/// retry-after hint instead of stalling a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    Block,
    FailFast,
}

struct RateBudget {
    recent: VecDeque<Instant>,
}

impl RateBudget {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.recent.front() {
            match front.checked_add(window) {
                Some(leaves_at) if leaves_at <= now => {
                    self.recent.pop_front();
                }
                _ => break,
            }
        }
    }
}

pub struct RateLimiter {
    limit: usize,
    window: Duration,
    /// Upper bound on how long `Block` mode will wait before giving up.
    max_wait: Duration,
    budget: Mutex<RateBudget>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration, max_wait: Duration) -> Self {
        RateLimiter {
            limit: limit.max(1),
            window,
            max_wait,
            budget: Mutex::new(RateBudget { recent: VecDeque::new() }),
        }
    }

    /// The remote API's published quota: 60 authenticated requests per
    /// rolling minute. Blocked waits give up after two full windows.
    pub fn discogs_default() -> Self {
        let window = Duration::from_secs(60);
        RateLimiter::new(60, window, window * 2)
    }

    /// Acquire one permit. `Block` waits (bounded by `max_wait`, showing a
    /// countdown) for a slot to free; `FailFast` returns
    /// `RateLimitExceeded` immediately with a retry-after hint. A granted
    /// permit is consumed and never refunded.
    pub fn acquire(&self, mode: AcquireMode) -> Result<(), CatalogError> {
        let deadline = Instant::now() + self.max_wait;
        let mut countdown: Option<ProgressBar> = None;

        loop {
            let wait = {
                let mut budget = self
                    .budget
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let now = Instant::now();
                budget.prune(now, self.window);
                if budget.recent.len() < self.limit {
                    budget.recent.push_back(now);
                    if let Some(bar) = countdown.take() {
                        bar.finish_and_clear();
                    }
                    return Ok(());
                }
                // The oldest logged call is the next to leave the window.
                match budget.recent.front() {
                    Some(front) => front
                        .checked_add(self.window)
                        .map(|leaves_at| leaves_at.saturating_duration_since(now))
                        .unwrap_or(self.window),
                    None => Duration::ZERO,
                }
            };

            match mode {
                AcquireMode::FailFast => {
                    debug!(wait_secs = wait.as_secs(), "rate budget exhausted, failing fast");
                    return Err(CatalogError::RateLimitExceeded { retry_after: Some(wait) });
                }
                AcquireMode::Block => {
                    if Instant::now() + wait > deadline {
                        warn!(wait_secs = wait.as_secs(), "rate-limit wait exceeds cap, giving up");
                        if let Some(bar) = countdown.take() {
                            bar.finish_and_clear();
                        }
                        return Err(CatalogError::RateLimitExceeded { retry_after: Some(wait) });
                    }
                    let bar = countdown.get_or_insert_with(|| {
                        let bar = ProgressBar::new_spinner();
                        bar.set_style(
                            ProgressStyle::with_template("{spinner} {msg}")
                                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                        );
                        bar
                    });
                    bar.set_message(format!(
                        "rate limit reached, next slot in {}s",
                        wait.as_secs().max(1)
                    ));
                    bar.tick();
                    std::thread::sleep(wait.min(Duration::from_millis(250)));
                }
            }
        }
    }

    /// Out-of-band correction from the server (a 429): zero the remaining
    /// budget for this window immediately so local accounting never
    /// undercounts relative to server-side truth. With a retry-after hint
    /// the budget stays empty for that long.
    pub fn exhaust_window(&self, retry_after: Option<Duration>) {
        let mut budget = self
            .budget
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        // Logged at an instant chosen so the window frees exactly when the
        // server says it will, whether the hint is shorter or longer than
        // the local window (no hint: a full window from now).
        let logged_at = match retry_after {
            Some(after) => now
                .checked_add(after)
                .and_then(|at| at.checked_sub(self.window))
                .unwrap_or(now),
            None => now,
        };
        budget.recent.clear();
        for _ in 0..self.limit {
            budget.recent.push_back(logged_at);
        }
        warn!(retry_after_secs = retry_after.map(|d| d.as_secs()), "server rate-limit signal, window zeroed");
    }
}
