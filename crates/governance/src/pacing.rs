//! Minimum spacing between upstream call starts
//!
//! The pacer enforces a floor on the interval between the *starts* of
//! consecutive calls, shared by every worker that holds a clone of it.
//! The lock protects only the check-and-advance of the next allowed start
//! time; the wait itself happens outside the lock, so a sleeping worker
//! never blocks the others from taking their turn. Waiters re-check after
//! sleeping and may overtake each other; ordering is not a guarantee,
//! spacing is.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::metrics;

/// Shared pacer for one upstream provider.
pub struct Pacer {
    min_interval: Duration,
    next_start: Mutex<Instant>,
}

impl Pacer {
    /// A pacer allowing one call start per `min_interval`. A zero interval
    /// disables pacing entirely.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_start: Mutex::new(Instant::now()),
        }
    }

    /// Wait until this caller may start its call.
    pub async fn acquire(&self) {
        if self.min_interval.is_zero() {
            return;
        }

        let started = Instant::now();
        let mut slept = false;
        loop {
            let wait = {
                let mut next = self.next_start.lock().await;
                let now = Instant::now();
                if *next <= now {
                    *next = now + self.min_interval;
                    None
                } else {
                    Some(*next - now)
                }
            };

            match wait {
                None => {
                    if slept {
                        let waited = started.elapsed();
                        metrics::record_pacing_wait(waited.as_secs_f64());
                        debug!(waited_ms = waited.as_millis() as u64, "paced call start");
                    }
                    return;
                }
                // Capped sleep: a long queue re-checks every interval
                // instead of oversleeping a stale estimate.
                Some(wait) => {
                    slept = true;
                    tokio::time::sleep(wait.min(self.min_interval)).await;
                }
            }
        }
    }
}
