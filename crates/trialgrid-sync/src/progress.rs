//! Iteration timing: seconds per iteration, ETA and batch speed.

use std::collections::VecDeque;

/// Samples older than this are not averaged.
const WINDOW_SECS: f64 = 60.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Progress {
    pub seconds_per_iteration: f64,
    pub eta: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchProgress {
    /// Fractional iteration, used as the x value of the speed row.
    pub x: f64,
    /// Samples per second.
    pub speed: f64,
    pub seconds_per_iteration: f64,
    pub eta: f64,
}

/// Timestamps are seconds since the epoch, passed in by the caller.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    /// `(when, seconds per iteration)`
    samples: VecDeque<(f64, f64)>,
    last_iteration_at: Option<f64>,
    last_batch_at: Option<f64>,
    seconds_per_iteration: f64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&mut self, now: f64) {
        while self.samples.front().is_some_and(|(when, _)| now - when >= WINDOW_SECS) {
            self.samples.pop_front();
        }
    }

    fn average(&mut self) -> f64 {
        if !self.samples.is_empty() {
            self.seconds_per_iteration =
                self.samples.iter().map(|(_, diff)| diff).sum::<f64>() / self.samples.len() as f64;
        }
        self.seconds_per_iteration
    }

    /// An iteration (epoch) completed.
    pub fn iteration(&mut self, now: f64, iteration: u64, iterations: u64) -> Progress {
        if let Some(last) = self.last_iteration_at {
            self.samples.push_back((now, now - last));
        }
        self.last_iteration_at = Some(now);
        self.last_batch_at = Some(now);
        self.prune(now);

        let seconds_per_iteration = self.average();
        let left = iterations.saturating_sub(iteration);
        Progress {
            seconds_per_iteration,
            eta: seconds_per_iteration * left as f64,
        }
    }

    /// A batch of `size` samples completed; `current` of `total` batches
    /// in the running iteration.
    pub fn batch(&mut self, now: f64, iteration: u64, iterations: u64, current: f64, total: f64, size: f64) -> BatchProgress {
        let fraction = if total > 0.0 { current / total } else { 0.0 };
        let elapsed = self.last_batch_at.map(|last| now - last);

        let speed = match elapsed {
            Some(secs) if secs > 0.0 => size / secs,
            _ => size,
        };
        if let Some(secs) = elapsed {
            self.samples.push_back((now, secs * total));
        }
        self.last_batch_at = Some(now);
        self.prune(now);

        let seconds_per_iteration = self.average();
        let left = iterations.saturating_sub(iteration) as f64 - fraction;
        BatchProgress {
            x: iteration as f64 + fraction,
            speed,
            seconds_per_iteration,
            eta: (seconds_per_iteration * left).max(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterations_average_over_window() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.iteration(1000.0, 0, 10).eta, 0.0);
        let p = tracker.iteration(1010.0, 1, 10);
        assert_eq!(p.seconds_per_iteration, 10.0);
        assert_eq!(p.eta, 90.0);
        let p = tracker.iteration(1030.0, 2, 10);
        assert_eq!(p.seconds_per_iteration, 15.0);

        // Both earlier samples fall out of the 60s window.
        let p = tracker.iteration(1100.0, 3, 10);
        assert_eq!(p.seconds_per_iteration, 70.0);
        assert_eq!(tracker.iteration(1170.0, 10, 10).eta, 0.0);
    }

    #[test]
    fn batch_speed_and_eta() {
        let mut tracker = ProgressTracker::new();
        let first = tracker.batch(100.0, 0, 2, 1.0, 10.0, 32.0);
        assert_eq!(first.speed, 32.0);
        assert_eq!(first.x, 0.1);

        let second = tracker.batch(102.0, 0, 2, 2.0, 10.0, 32.0);
        assert_eq!(second.speed, 16.0);
        assert_eq!(second.seconds_per_iteration, 20.0);
        assert!((second.eta - 20.0 * 1.8).abs() < 1e-9);
    }
}
