//! Console settings, layered as CLI flags > environment > `fleet.toml` >
//! built-in defaults.

use anyhow::Context;
use fleet_runtime::config::{CountdownWindow, DEFAULT_BACKEND_URL};
use fleet_runtime::RuntimeConfig;
use serde::Deserialize;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "fleet.toml";
pub const DEFAULT_LOG_DIR: &str = ".fleet/logs";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub backend_url: Option<String>,
    pub parallelism: Option<usize>,
    pub poll_ms: Option<u64>,
    pub online_timeout_sec: Option<f64>,
    pub command_timeout_sec: Option<f64>,
    pub fix_timeout_sec: Option<u64>,
    pub smoothing: Option<f64>,
    pub countdown: CountdownFile,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CountdownFile {
    pub scanning: Option<WindowFile>,
    pub finding: Option<WindowFile>,
    pub fixing: Option<WindowFile>,
}

/// Seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WindowFile {
    pub initial: u64,
    pub min: u64,
    pub max: u64,
}

impl WindowFile {
    fn to_window(self) -> CountdownWindow {
        CountdownWindow::new(
            Duration::from_secs(self.initial),
            Duration::from_secs(self.min),
            Duration::from_secs(self.max),
        )
    }
}

/// Flags from the command line; `None` defers to the next layer.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backend_url: Option<String>,
    pub parallelism: Option<usize>,
    pub poll_ms: Option<u64>,
    pub config: Option<PathBuf>,
}

/// A missing default file is not an error; a missing explicit one is.
pub fn load_file(path: &Path, explicit: bool) -> anyhow::Result<FileConfig> {
    if !path.exists() {
        if explicit {
            anyhow::bail!("config file {} not found", path.display());
        }
        return Ok(FileConfig::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

pub fn load_config(overrides: &Overrides) -> anyhow::Result<RuntimeConfig> {
    let (path, explicit) = resolve_config_path(overrides);
    let file = load_file(&path, explicit)?;

    let raw_url = overrides
        .backend_url
        .clone()
        .or_else(|| env_string("FLEET_BACKEND_URL"))
        .or_else(|| file.backend_url.clone())
        .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
    let backend_url = RuntimeConfig::parse_backend_url(&raw_url)?;

    let mut config = RuntimeConfig::new(backend_url);
    if let Some(parallelism) = overrides
        .parallelism
        .or_else(|| env_parse("FLEET_PARALLELISM"))
        .or(file.parallelism)
    {
        config.parallelism = parallelism;
    }
    if let Some(poll_ms) = overrides
        .poll_ms
        .or_else(|| env_parse("FLEET_POLL_MS"))
        .or(file.poll_ms)
    {
        config.poll_interval = Duration::from_millis(poll_ms);
    }
    if let Some(timeout) = env_parse("FLEET_ONLINE_TIMEOUT_SEC").or(file.online_timeout_sec) {
        config.online_timeout_sec = timeout;
    }
    if let Some(timeout) = file.command_timeout_sec {
        config.command_timeout_sec = timeout;
    }
    if let Some(timeout) = file.fix_timeout_sec {
        config.fix_timeout = Duration::from_secs(timeout);
    }
    if let Some(smoothing) = file.smoothing {
        config.smoothing = smoothing;
    }
    if let Some(window) = file.countdown.scanning {
        config.windows.scanning = window.to_window();
    }
    if let Some(window) = file.countdown.finding {
        config.windows.finding = window.to_window();
    }
    if let Some(window) = file.countdown.fixing {
        config.windows.fixing = window.to_window();
    }
    config.interactive_terminal = std::io::stdin().is_terminal() && std::io::stdout().is_terminal();

    Ok(config.validate()?)
}

fn resolve_config_path(overrides: &Overrides) -> (PathBuf, bool) {
    if let Some(path) = &overrides.config {
        return (path.clone(), true);
    }
    match env_string("FLEET_CONFIG") {
        Some(path) => (PathBuf::from(path), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    }
}

pub fn resolve_log_dir() -> PathBuf {
    env_string("FLEET_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
}

pub fn resolve_log_stdout() -> bool {
    env_string("FLEET_LOG_STDOUT")
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false)
}

pub fn resolve_log_level() -> String {
    env_string("FLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string())
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_flags() {
        assert_eq!(parse_bool_flag(" YES "), Some(true));
        assert_eq!(parse_bool_flag("off"), Some(false));
        assert_eq!(parse_bool_flag("maybe"), None);
    }

    #[test]
    fn file_config_reads_windows() {
        let file: FileConfig = toml::from_str(
            r#"
backend_url = "http://fleet.local:9000"
parallelism = 12

[countdown.fixing]
initial = 30
min = 5
max = 90
"#,
        )
        .unwrap();
        assert_eq!(file.backend_url.as_deref(), Some("http://fleet.local:9000"));
        assert_eq!(file.parallelism, Some(12));
        let fixing = file.countdown.fixing.unwrap().to_window();
        assert_eq!(fixing.max, Duration::from_secs(90));
        assert!(file.countdown.scanning.is_none());
    }

    #[test]
    fn explicit_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        fs::write(&path, "poll_ms = 250\nsmoothing = 0.5\n").unwrap();
        let file = load_file(&path, true).unwrap();
        assert_eq!(file.poll_ms, Some(250));
        assert_eq!(file.smoothing, Some(0.5));

        fs::write(&path, "poll_ms = \"fast\"\n").unwrap();
        assert!(load_file(&path, true).is_err());
    }

    #[test]
    fn missing_default_file_is_empty() {
        let file = load_file(Path::new("/nonexistent/fleet.toml"), false).unwrap();
        assert!(file.backend_url.is_none());
        assert!(load_file(Path::new("/nonexistent/fleet.toml"), true).is_err());
    }
}
