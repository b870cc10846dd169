//! CPU utilization from cumulative usage counters.

/// Turns consecutive cumulative counters into a utilization ratio.
///
/// Container runtimes report total CPU time used by the container and by
/// the whole system since boot. Utilization is the ratio of their deltas,
/// scaled to the assigned cores.
#[derive(Debug, Default, Clone)]
pub struct CpuUsageTracker {
    previous: Option<(u64, u64)>,
}

impl CpuUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample and return utilization of the assigned cores
    /// (0 for the first sample).
    pub fn update(&mut self, total_usage: u64, system_usage: u64, online_cpus: u32, assigned_cpus: u32) -> f64 {
        let previous = self.previous.replace((total_usage, system_usage));
        let Some((prev_total, prev_system)) = previous else {
            return 0.0;
        };
        let cpu_delta = total_usage.saturating_sub(prev_total) as f64;
        let system_delta = system_usage.saturating_sub(prev_system) as f64;
        if system_delta <= 0.0 {
            return 0.0;
        }
        (cpu_delta / system_delta) * online_cpus.max(1) as f64 / assigned_cpus.max(1) as f64
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_is_zero() {
        let mut tracker = CpuUsageTracker::new();
        assert_eq!(tracker.update(100, 1000, 8, 2), 0.0);
    }

    #[test]
    fn delta_scaled_to_assigned_cores() {
        let mut tracker = CpuUsageTracker::new();
        tracker.update(0, 0, 8, 2);
        // 1/8 of all system time on an 8-core box is one full core.
        let util = tracker.update(1_000, 8_000, 8, 2);
        assert!((util - 0.5).abs() < 1e-9);
    }

    #[test]
    fn stalled_system_counter() {
        let mut tracker = CpuUsageTracker::new();
        tracker.update(10, 50, 4, 1);
        assert_eq!(tracker.update(20, 50, 4, 1), 0.0);
    }
}
