//! Adaptive pacing for the agent statement loop.
//!
//! A [`Throttle`] inserts sleeps between loop iterations so that the
//! long-run call rate converges to a target. The pacing is a feedback
//! controller: every millisecond the realized per-call interval is measured
//! and the live sleep budget is corrected by the error against the nominal
//! interval. Bursts up to one correction period are expected; this is a
//! convergence heuristic, not a hard rate limit.

use std::time::Duration;

use tokio::time::Instant;

/// Period of the delay-correction tick.
const ADJUST_PERIOD: Duration = Duration::from_millis(1);

/// Feedback controller pacing a loop towards a target iteration rate.
///
/// The caller times each iteration itself and hands the iteration start to
/// [`pace`](Self::pace) once the work is done; the throttle sleeps for
/// whatever remains of the current per-call budget. A rate of zero disables
/// pacing entirely.
#[derive(Debug)]
pub(crate) struct Throttle {
    base_delay: Duration,
    live_delay: Duration,
    window_start: Instant,
    next_adjust: Instant,
    calls: u32,
}

impl Throttle {
    /// Creates a throttle for `rate` iterations per second.
    ///
    /// The nominal interval is `1s / (rate + 1)`: biased slightly short,
    /// since call overhead and measurement error otherwise undershoot the
    /// target.
    pub fn new(rate: u32) -> Self {
        let base_delay = match rate {
            0 => Duration::ZERO,
            rate => Duration::from_secs(1) / (rate + 1),
        };

        let now = Instant::now();
        Self {
            base_delay,
            live_delay: base_delay,
            window_start: now,
            next_adjust: now + ADJUST_PERIOD,
            calls: 0,
        }
    }

    /// Completes one iteration that began at `iter_start`, sleeping for the
    /// remainder of the per-call budget.
    pub async fn pace(&mut self, iter_start: Instant) {
        self.calls += 1;

        let now = Instant::now();
        if now >= self.next_adjust {
            // Correct the live delay by the error between the nominal
            // interval and the realized per-call interval in this window.
            let observed = (now - self.window_start) / self.calls;
            let corrected = self.live_delay.as_nanos() as i64
                + self.base_delay.as_nanos() as i64
                - observed.as_nanos() as i64;
            self.live_delay = Duration::from_nanos(corrected.max(0) as u64);

            self.window_start = now;
            self.next_adjust = now + ADJUST_PERIOD;
            self.calls = 0;
        }

        // Sleep for the remainder of the budget, discounting the time the
        // iteration itself already consumed.
        let sleep_for = self.live_delay.saturating_sub(iter_start.elapsed());
        if !sleep_for.is_zero() {
            tokio::time::sleep(sleep_for).await;
        } else {
            // An unthrottled loop must still yield so sibling tasks and
            // cancellation get a chance to run.
            tokio::task::yield_now().await;
        }
    }
}
