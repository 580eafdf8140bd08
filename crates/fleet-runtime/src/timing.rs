//! Advisory countdowns. These only drive displayed text and never bound a
//! network call.

use crate::config::CountdownWindows;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CountdownMode {
    Scanning,
    Finding,
    Fixing,
}

impl CountdownMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CountdownMode::Scanning => "scanning",
            CountdownMode::Finding => "finding",
            CountdownMode::Fixing => "fixing",
        }
    }

    fn index(&self) -> usize {
        match self {
            CountdownMode::Scanning => 0,
            CountdownMode::Finding => 1,
            CountdownMode::Fixing => 2,
        }
    }
}

impl fmt::Display for CountdownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    pub mode: CountdownMode,
    pub started_at: Instant,
    pub expires_at: Instant,
    pub total_ms: u64,
}

impl Countdown {
    pub fn start(mode: CountdownMode, estimate: Duration, now: Instant) -> Self {
        Self {
            mode,
            started_at: now,
            expires_at: now + estimate,
            total_ms: estimate.as_millis() as u64,
        }
    }

    pub fn label(&self, now: Instant) -> String {
        if now <= self.expires_at {
            let remaining = self.expires_at - now;
            format!("{} ~{}s", self.mode, ceil_secs(remaining))
        } else {
            let overdue = now - self.expires_at;
            format!("{} (overdue {}s)", self.mode, ceil_secs(overdue))
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let millis = duration.as_millis() as u64;
    millis.div_ceil(1000)
}

/// Exponentially smoothed per-mode latency, clamped to each mode's window.
#[derive(Debug, Clone)]
pub struct LatencyEstimator {
    windows: CountdownWindows,
    smoothing: f64,
    estimates: [Duration; 3],
}

impl LatencyEstimator {
    pub fn new(windows: CountdownWindows, smoothing: f64) -> Self {
        let estimates = [
            windows.scanning.clamp(windows.scanning.initial),
            windows.finding.clamp(windows.finding.initial),
            windows.fixing.clamp(windows.fixing.initial),
        ];
        Self {
            windows,
            smoothing: if smoothing.is_finite() {
                smoothing.clamp(0.01, 1.0)
            } else {
                crate::config::DEFAULT_SMOOTHING
            },
            estimates,
        }
    }

    pub fn estimate(&self, mode: CountdownMode) -> Duration {
        self.estimates[mode.index()]
    }

    pub fn observe(&mut self, mode: CountdownMode, sample: Duration) -> Duration {
        let previous = self.estimate(mode).as_secs_f64();
        let blended = previous * (1.0 - self.smoothing) + sample.as_secs_f64() * self.smoothing;
        let next = self
            .windows
            .get(mode)
            .clamp(Duration::from_secs_f64(blended.max(0.0)));
        self.estimates[mode.index()] = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CountdownWindow;

    #[test]
    fn estimator_blends_and_clamps() {
        let mut estimator = LatencyEstimator::new(CountdownWindows::default(), 0.5);
        assert_eq!(estimator.estimate(CountdownMode::Scanning), Duration::from_secs(20));
        let next = estimator.observe(CountdownMode::Scanning, Duration::from_secs(10));
        assert_eq!(next, Duration::from_secs(15));
        for _ in 0..20 {
            estimator.observe(CountdownMode::Scanning, Duration::from_millis(10));
        }
        assert_eq!(estimator.estimate(CountdownMode::Scanning), Duration::from_secs(5));
        for _ in 0..20 {
            estimator.observe(CountdownMode::Finding, Duration::from_secs(3600));
        }
        assert_eq!(estimator.estimate(CountdownMode::Finding), Duration::from_secs(30));
        assert_eq!(estimator.estimate(CountdownMode::Fixing), Duration::from_secs(45));
    }

    #[test]
    fn estimator_tolerates_unvalidated_windows() {
        let mut windows = CountdownWindows::default();
        windows.fixing = CountdownWindow::new(
            Duration::from_secs(45),
            Duration::from_secs(120),
            Duration::from_secs(10),
        );
        let mut estimator = LatencyEstimator::new(windows, f64::NAN);
        assert_eq!(estimator.estimate(CountdownMode::Fixing), Duration::from_secs(45));
        let next = estimator.observe(CountdownMode::Fixing, Duration::from_secs(500));
        assert!(next <= Duration::from_secs(120));
        assert!(next >= Duration::from_secs(10));
    }

    #[test]
    fn label_switches_to_overdue() {
        let now = Instant::now();
        let countdown = Countdown::start(CountdownMode::Finding, Duration::from_secs(6), now);
        assert_eq!(countdown.total_ms, 6000);
        assert_eq!(countdown.label(now), "finding ~6s");
        assert_eq!(countdown.label(now + Duration::from_millis(4500)), "finding ~2s");
        assert_eq!(countdown.label(now + Duration::from_secs(9)), "finding (overdue 3s)");
    }
}
