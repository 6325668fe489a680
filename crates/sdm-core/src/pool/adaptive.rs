//! Adaptive connection budget: soft start, error-driven throttling.
//!
//! The budget starts at one connection and grows linearly so a new item
//! doesn't slam the server; any error interval shrinks it and slows future
//! growth. Throughput is the ground truth: received bytes reset the
//! cumulative error count, and only a long errors-without-bytes streak
//! aborts the item.

use std::time::{Duration, Instant};

/// Verdict of one error-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// Cumulative errors hit the ceiling with no intervening throughput.
    Abort,
}

#[derive(Debug)]
pub struct ConnectionController {
    allowed: usize,
    max: usize,
    grow_interval: Duration,
    grow_step: Duration,
    last_change: Instant,
    cumulative_errors: u32,
    ceiling: u32,
    last_downloaded: u64,
}

impl ConnectionController {
    pub fn new(max: usize, grow_step: Duration, ceiling: u32, now: Instant) -> Self {
        Self {
            allowed: 1,
            max: max.max(1),
            grow_interval: grow_step,
            grow_step,
            last_change: now,
            cumulative_errors: 0,
            ceiling,
            last_downloaded: 0,
        }
    }

    /// Current connection budget.
    pub fn allowed(&self) -> usize {
        self.allowed.min(self.max)
    }

    pub fn cumulative_errors(&self) -> u32 {
        self.cumulative_errors
    }

    /// One check of the error window.
    ///
    /// `errors` is the count observed since the previous check and
    /// `downloaded` the item's current byte total. Any error interval drops
    /// the budget by one (never below 1) and lengthens the growth interval;
    /// an error-free interval past the growth interval raises it by one.
    pub fn on_interval(&mut self, now: Instant, errors: u32, downloaded: u64) -> Verdict {
        self.cumulative_errors = self.cumulative_errors.saturating_add(errors);

        if errors >= 1 {
            if self.allowed > 1 {
                self.allowed -= 1;
                self.last_change = now;
                tracing::debug!(allowed = self.allowed, "server errors, budget reduced");
            }
            self.grow_interval += self.grow_step;
        } else if self.allowed < self.max
            && now.duration_since(self.last_change) >= self.grow_interval
        {
            self.allowed += 1;
            self.last_change = now;
            tracing::trace!(allowed = self.allowed, "budget grown");
        }

        // Bytes arrived since last check: the link works, forgive past errors.
        if downloaded > self.last_downloaded {
            self.last_downloaded = downloaded;
            self.cumulative_errors = 0;
        }

        if self.cumulative_errors >= self.ceiling {
            return Verdict::Abort;
        }
        Verdict::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: Duration = Duration::from_millis(500);

    fn controller(max: usize) -> (ConnectionController, Instant) {
        let now = Instant::now();
        (ConnectionController::new(max, STEP, 100, now), now)
    }

    #[test]
    fn grows_linearly_without_errors() {
        let (mut c, mut now) = controller(8);
        assert_eq!(c.allowed(), 1);
        for expected in 2..=8 {
            now += STEP * 4; // well past the grow interval
            assert_eq!(c.on_interval(now, 0, expected as u64), Verdict::Continue);
            assert_eq!(c.allowed(), expected);
        }
        // Capped at max.
        now += STEP * 4;
        c.on_interval(now, 0, 100);
        assert_eq!(c.allowed(), 8);
    }

    #[test]
    fn consecutive_error_intervals_reduce_by_exactly_that_many() {
        let (mut c, mut now) = controller(8);
        // Ramp up to 5 first.
        for i in 0..4 {
            now += STEP * 4;
            c.on_interval(now, 0, i + 1);
        }
        assert_eq!(c.allowed(), 5);

        // k = 3 consecutive intervals with errors: down by exactly 3.
        for _ in 0..3 {
            now += Duration::from_millis(200);
            c.on_interval(now, 1, 5);
        }
        assert_eq!(c.allowed(), 2);

        // More error intervals than budget: floors at 1.
        for _ in 0..5 {
            now += Duration::from_millis(200);
            c.on_interval(now, 2, 5);
        }
        assert_eq!(c.allowed(), 1);
    }

    #[test]
    fn errors_lengthen_the_grow_interval() {
        let (mut c, mut now) = controller(8);
        now += STEP * 4;
        c.on_interval(now, 0, 1);
        assert_eq!(c.allowed(), 2);

        now += Duration::from_millis(200);
        c.on_interval(now, 1, 1);
        assert_eq!(c.allowed(), 1);

        // One base step is no longer enough to grow again.
        now += STEP;
        c.on_interval(now, 0, 2);
        assert_eq!(c.allowed(), 1);
        now += STEP;
        c.on_interval(now, 0, 3);
        assert_eq!(c.allowed(), 2);
    }

    #[test]
    fn throughput_resets_cumulative_errors() {
        let (mut c, mut now) = controller(4);
        for _ in 0..50 {
            now += Duration::from_millis(200);
            assert_eq!(c.on_interval(now, 1, 0), Verdict::Continue);
        }
        assert_eq!(c.cumulative_errors(), 50);
        // Progress forgives everything.
        now += Duration::from_millis(200);
        c.on_interval(now, 0, 1024);
        assert_eq!(c.cumulative_errors(), 0);
    }

    #[test]
    fn error_ceiling_aborts() {
        let (mut c, mut now) = controller(4);
        let mut verdict = Verdict::Continue;
        for _ in 0..100 {
            now += Duration::from_millis(200);
            verdict = c.on_interval(now, 1, 0);
        }
        assert_eq!(verdict, Verdict::Abort);
    }
}
