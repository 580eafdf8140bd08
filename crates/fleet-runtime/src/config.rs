use crate::error::ConfigError;
use crate::timing::CountdownMode;
use std::time::Duration;
use url::Url;

pub const DEFAULT_PARALLELISM: usize = 8;
pub const MIN_PARALLELISM: usize = 1;
pub const MAX_PARALLELISM: usize = 100;
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_ONLINE_TIMEOUT_SEC: f64 = 5.0;
pub const DEFAULT_COMMAND_TIMEOUT_SEC: f64 = 30.0;
pub const DEFAULT_SMOOTHING: f64 = 0.3;

pub fn clamp_parallelism(value: usize) -> usize {
    value.clamp(MIN_PARALLELISM, MAX_PARALLELISM)
}

/// Bounds and starting point for one countdown mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountdownWindow {
    pub initial: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl CountdownWindow {
    pub const fn new(initial: Duration, min: Duration, max: Duration) -> Self {
        Self { initial, min, max }
    }

    /// Inverted bounds are treated as swapped rather than trusted.
    pub fn clamp(&self, value: Duration) -> Duration {
        let (low, high) = if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        };
        value.clamp(low, high)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountdownWindows {
    pub scanning: CountdownWindow,
    pub finding: CountdownWindow,
    pub fixing: CountdownWindow,
}

impl CountdownWindows {
    pub fn get(&self, mode: CountdownMode) -> CountdownWindow {
        match mode {
            CountdownMode::Scanning => self.scanning,
            CountdownMode::Finding => self.finding,
            CountdownMode::Fixing => self.fixing,
        }
    }
}

impl Default for CountdownWindows {
    fn default() -> Self {
        Self {
            scanning: CountdownWindow::new(
                Duration::from_secs(20),
                Duration::from_secs(5),
                Duration::from_secs(120),
            ),
            finding: CountdownWindow::new(
                Duration::from_secs(6),
                Duration::from_secs(2),
                Duration::from_secs(30),
            ),
            fixing: CountdownWindow::new(
                Duration::from_secs(45),
                Duration::from_secs(10),
                Duration::from_secs(300),
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub backend_url: Url,
    pub parallelism: usize,
    pub poll_interval: Duration,
    pub online_timeout_sec: f64,
    pub command_timeout_sec: f64,
    pub fix_poll_interval: Duration,
    pub fix_settle_delay: Duration,
    pub fix_timeout: Duration,
    pub windows: CountdownWindows,
    /// Weight of the newest latency sample in the countdown estimate.
    pub smoothing: f64,
    pub interactive_terminal: bool,
}

impl RuntimeConfig {
    pub fn new(backend_url: Url) -> Self {
        Self {
            backend_url,
            parallelism: DEFAULT_PARALLELISM,
            poll_interval: DEFAULT_POLL_INTERVAL,
            online_timeout_sec: DEFAULT_ONLINE_TIMEOUT_SEC,
            command_timeout_sec: DEFAULT_COMMAND_TIMEOUT_SEC,
            fix_poll_interval: Duration::from_millis(750),
            fix_settle_delay: Duration::from_millis(1500),
            fix_timeout: Duration::from_secs(600),
            windows: CountdownWindows::default(),
            smoothing: DEFAULT_SMOOTHING,
            interactive_terminal: true,
        }
    }

    pub fn parse_backend_url(raw: &str) -> Result<Url, ConfigError> {
        let url = Url::parse(raw.trim()).map_err(|err| ConfigError::BackendUrl {
            url: raw.to_string(),
            reason: err.to_string(),
        })?;
        check_backend_url(&url)?;
        Ok(url)
    }

    /// Clamps parallelism and smoothing, rejects everything else that is unusable.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        check_backend_url(&self.backend_url)?;
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "poll_interval",
            });
        }
        if self.fix_poll_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "fix_poll_interval",
            });
        }
        if self.online_timeout_sec.is_nan() || self.online_timeout_sec <= 0.0 {
            return Err(ConfigError::Zero {
                field: "online_timeout_sec",
            });
        }
        for mode in [
            CountdownMode::Scanning,
            CountdownMode::Finding,
            CountdownMode::Fixing,
        ] {
            let window = self.windows.get(mode);
            if window.min > window.max {
                return Err(ConfigError::InvertedWindow {
                    mode: mode.as_str(),
                    min_ms: window.min.as_millis(),
                    max_ms: window.max.as_millis(),
                });
            }
        }
        self.parallelism = clamp_parallelism(self.parallelism);
        if !self.smoothing.is_finite() {
            self.smoothing = DEFAULT_SMOOTHING;
        }
        self.smoothing = self.smoothing.clamp(0.01, 1.0);
        Ok(self)
    }
}

fn check_backend_url(url: &Url) -> Result<(), ConfigError> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::BackendUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    if url.host_str().is_none() || url.cannot_be_a_base() {
        return Err(ConfigError::BackendUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(())
}
