//! Backend wire contracts.
//!
//! Every payload the console receives is decoded exactly once into these
//! types. Loose fields are normalized during deserialization so the runtime
//! never inspects raw JSON.

use crate::model::{Activity, CheckResult};
use crate::normalize::{de_epoch, de_id, de_opt_text, de_opt_u64, de_status, de_text};
use crate::CheckStatus;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

pub const ONLINE_PARALLELISM_MIN: usize = 1;
pub const ONLINE_PARALLELISM_MAX: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PatchError {
    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotSnapshot {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_text")]
    pub name: String,
    #[serde(default, rename = "type", deserialize_with = "de_text")]
    pub robot_type: String,
    #[serde(default, rename = "ip", deserialize_with = "de_text")]
    pub address: String,
    #[serde(default, deserialize_with = "de_checks")]
    pub tests: BTreeMap<String, CheckResult>,
    #[serde(default)]
    pub activity: Option<Activity>,
}

/// Result of decoding `GET /api/robots`. Entries without a usable id are
/// dropped and counted instead of failing the whole snapshot.
#[derive(Debug, Clone, Default)]
pub struct RobotList {
    pub robots: Vec<RobotSnapshot>,
    pub rejected: usize,
}

pub fn decode_robot_list(bytes: &[u8], max_frame_bytes: usize) -> Result<RobotList, FrameError> {
    let raw: Value = decode_frame(bytes, max_frame_bytes)?;
    let entries = match raw {
        Value::Array(entries) => entries,
        Value::Object(mut object) => match object.remove("robots") {
            Some(Value::Array(entries)) => entries,
            _ => return Err(FrameError::Decode("expected a list of robots".to_string())),
        },
        _ => return Err(FrameError::Decode("expected a list of robots".to_string())),
    };
    let mut list = RobotList::default();
    for entry in entries {
        match serde_json::from_value::<RobotSnapshot>(entry) {
            Ok(robot) => list.robots.push(robot),
            Err(_) => list.rejected += 1,
        }
    }
    Ok(list)
}

fn de_checks<'de, D>(deserializer: D) -> Result<BTreeMap<String, CheckResult>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let Value::Object(entries) = value else {
        return Ok(BTreeMap::new());
    };
    Ok(entries
        .into_iter()
        .filter(|(check_id, _)| !check_id.trim().is_empty())
        .filter_map(|(check_id, payload)| {
            if !payload.is_object() {
                return None;
            }
            serde_json::from_value::<CheckResult>(payload)
                .ok()
                .map(|result| (check_id.trim().to_string(), result))
        })
        .collect())
}

fn de_steps<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(steps) => steps,
        _ => Vec::new(),
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_ids: Option<Vec<String>>,
    pub page_session_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunResponse {
    #[serde(default, deserialize_with = "de_opt_text")]
    pub run_id: Option<String>,
    #[serde(default, deserialize_with = "de_epoch")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_epoch")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub results: Vec<TestResultPayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultPayload {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_status")]
    pub status: CheckStatus,
    #[serde(default, deserialize_with = "de_text")]
    pub value: String,
    #[serde(default, deserialize_with = "de_text")]
    pub details: String,
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub ms: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_text")]
    pub source: Option<String>,
    #[serde(default, deserialize_with = "de_steps")]
    pub steps: Vec<Value>,
}

impl TestResultPayload {
    pub fn to_check(&self, checked_at: DateTime<Utc>, default_source: &str) -> CheckResult {
        CheckResult {
            status: self.status,
            value: self.value.clone(),
            details: self.details.clone(),
            source: Some(
                self.source
                    .clone()
                    .unwrap_or_else(|| default_source.to_string()),
            ),
            checked_at: Some(checked_at),
            ms: self.ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineCheckRequest {
    pub robot_ids: Vec<String>,
    pub force_refresh: bool,
    pub timeout_sec: f64,
    pub parallelism: usize,
    pub page_session_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineCheckResponse {
    #[serde(default)]
    pub results: Vec<OnlineResultPayload>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineResultPayload {
    #[serde(deserialize_with = "de_id")]
    pub robot_id: String,
    #[serde(default, deserialize_with = "de_status")]
    pub status: CheckStatus,
    #[serde(default, deserialize_with = "de_text")]
    pub value: String,
    #[serde(default, deserialize_with = "de_text")]
    pub details: String,
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub ms: Option<u64>,
    #[serde(default, deserialize_with = "de_epoch")]
    pub checked_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_opt_text")]
    pub source: Option<String>,
}

impl OnlineResultPayload {
    pub fn to_check(&self, received_at: DateTime<Utc>) -> CheckResult {
        CheckResult {
            status: self.status,
            value: self.value.clone(),
            details: self.details.clone(),
            source: Some(self.source.clone().unwrap_or_else(|| "live".to_string())),
            checked_at: Some(self.checked_at.unwrap_or(received_at)),
            ms: self.ms,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixRunRequest {
    pub page_session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FixJobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

impl FixJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FixJobStatus::Succeeded | FixJobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FixJobStatus::Queued => "queued",
            FixJobStatus::Running => "running",
            FixJobStatus::Succeeded => "succeeded",
            FixJobStatus::Failed => "failed",
            FixJobStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixEvent {
    #[serde(default, deserialize_with = "de_epoch")]
    pub at: Option<DateTime<Utc>>,
    #[serde(default, rename = "type", deserialize_with = "de_text")]
    pub kind: String,
    #[serde(default, deserialize_with = "de_text")]
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixTestRun {
    #[serde(default)]
    pub results: Vec<TestResultPayload>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixJob {
    #[serde(deserialize_with = "de_id")]
    pub run_id: String,
    #[serde(default, deserialize_with = "de_text")]
    pub fix_id: String,
    #[serde(default, deserialize_with = "de_text")]
    pub robot_id: String,
    #[serde(default, deserialize_with = "de_fix_status")]
    pub status: FixJobStatus,
    #[serde(default)]
    pub events: Vec<FixEvent>,
    #[serde(default)]
    pub fix_result: Option<Value>,
    #[serde(default)]
    pub test_run: Option<FixTestRun>,
    #[serde(default, deserialize_with = "de_opt_text")]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "de_epoch")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_epoch")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl FixJob {
    pub fn post_test_results(&self) -> &[TestResultPayload] {
        self.test_run
            .as_ref()
            .map(|run| run.results.as_slice())
            .unwrap_or(&[])
    }
}

fn de_fix_status<'de, D>(deserializer: D) -> Result<FixJobStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or(FixJobStatus::Unknown))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub page_session_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command: String,
    pub page_session_id: String,
    pub robot_id: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    #[serde(default)]
    pub output: String,
    #[serde(default, deserialize_with = "de_exit_code")]
    pub exit_code: Option<i64>,
}

fn de_exit_code<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    OnlineBattery,
    OnlineBatteryTopics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<MonitorMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online_interval_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_interval_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics_interval_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
}

impl MonitorConfigPatch {
    pub fn parallelism(parallelism: usize) -> Self {
        Self {
            parallelism: Some(parallelism),
            ..Self::default()
        }
    }

    /// Mirrors the ranges the backend enforces so bad values fail locally.
    pub fn validate(&self) -> Result<(), PatchError> {
        check_range("topicsIntervalSec", self.topics_interval_sec, 5.0, 300.0)?;
        check_range("onlineIntervalSec", self.online_interval_sec, 0.5, 60.0)?;
        check_range("batteryIntervalSec", self.battery_interval_sec, 0.5, 60.0)?;
        check_range(
            "parallelism",
            self.parallelism.map(|value| value as f64),
            ONLINE_PARALLELISM_MIN as f64,
            ONLINE_PARALLELISM_MAX as f64,
        )
    }
}

fn check_range(field: &'static str, value: Option<f64>, min: f64, max: f64) -> Result<(), PatchError> {
    match value {
        Some(value) if !(min..=max).contains(&value) => Err(PatchError::OutOfRange {
            field,
            value,
            min,
            max,
        }),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    pub mode: MonitorMode,
    pub topics_interval_sec: f64,
    pub online_interval_sec: f64,
    pub battery_interval_sec: f64,
    pub parallelism: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TerminalClientMsg {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TerminalServerMsg {
    Output {
        #[serde(default)]
        data: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    Pong,
    #[serde(other)]
    Other,
}

pub fn encode_client_message(
    message: &TerminalClientMsg,
    max_frame_bytes: usize,
) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(message).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

/// Decodes one text frame from the terminal stream. Text that is not JSON is
/// terminal output in its own right.
pub fn decode_server_message(text: &str, max_frame_bytes: usize) -> Result<TerminalServerMsg, FrameError> {
    if text.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: text.len(),
            max: max_frame_bytes,
        });
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => {
            if !object.contains_key("type") {
                return Ok(TerminalServerMsg::Other);
            }
            serde_json::from_value(Value::Object(object))
                .map_err(|err| FrameError::Decode(err.to_string()))
        }
        Ok(_) | Err(_) => Ok(TerminalServerMsg::Output {
            data: text.to_string(),
        }),
    }
}

pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8], max_frame_bytes: usize) -> Result<T, FrameError> {
    if bytes.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: bytes.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(bytes).map_err(|err| FrameError::Decode(err.to_string()))
}
