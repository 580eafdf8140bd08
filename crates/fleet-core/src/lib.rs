pub mod contracts;
pub mod model;
pub mod normalize;
pub mod reachability;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use model::{Activity, CheckResult, RobotRecord, TestDebugEntry};

/// Check id of the fleet connectivity probe.
pub const REACHABILITY_CHECK_ID: &str = "online";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

impl Default for CheckStatus {
    fn default() -> Self {
        Self::Warning
    }
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Ok => "ok",
            CheckStatus::Warning => "warning",
            CheckStatus::Error => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CheckStatus::Error)
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckStatus {
    type Err = String;

    /// Strict parse. Use [`normalize::normalize_status`] for backend payloads.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "ok" => Ok(CheckStatus::Ok),
            "warning" => Ok(CheckStatus::Warning),
            "error" => Ok(CheckStatus::Error),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

/// Identifier scoping remote sessions to one console process.
pub fn new_page_session_id() -> String {
    format!("console-{}", uuid::Uuid::new_v4().simple())
}
