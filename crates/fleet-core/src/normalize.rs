//! Coercion of loosely typed backend fields into the closed status
//! vocabulary and safe display strings.
//!
//! The `de_*` helpers are the only place payload shapes are sniffed; they are
//! wired into the contract types with `deserialize_with` so every call site
//! downstream works with already-normalized values.

use crate::CheckStatus;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::OnceLock;

pub fn normalize_status_str(value: &str) -> CheckStatus {
    value.parse().unwrap_or(CheckStatus::Warning)
}

/// Anything other than the exact strings `ok`, `warning`, `error` is a warning.
pub fn normalize_status(value: &Value) -> CheckStatus {
    match value {
        Value::String(raw) => normalize_status_str(raw),
        _ => CheckStatus::Warning,
    }
}

pub fn normalize_text(value: &Value, fallback: &str) -> String {
    let raw = match value {
        Value::Null => return fallback.to_string(),
        Value::String(text) => text.trim().to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    };
    if raw.is_empty() {
        fallback.to_string()
    } else {
        raw
    }
}

pub fn display_text(value: Option<&str>, fallback: &str) -> String {
    match value.map(str::trim) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => fallback.to_string(),
    }
}

pub fn to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Null => false,
        other => matches!(
            normalize_text(other, "").to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "y"
        ),
    }
}

pub fn safe_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.is_finite() && *float >= 0.0)
                .map(|float| float as u64)
        }),
        Value::String(text) => text.trim().parse::<f64>().ok().and_then(|float| {
            if float.is_finite() && float >= 0.0 {
                Some(float as u64)
            } else {
                None
            }
        }),
        _ => None,
    }
}

/// Backend timestamps are epoch seconds, occasionally sent as strings or
/// RFC 3339. Zero and negatives mean "never".
pub fn epoch_secs(value: &Value) -> Option<DateTime<Utc>> {
    let secs = match value {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => {
            let trimmed = text.trim();
            match trimmed.parse::<f64>() {
                Ok(secs) => secs,
                Err(_) => {
                    return DateTime::parse_from_rfc3339(trimmed)
                        .ok()
                        .map(|at| at.with_timezone(&Utc));
                }
            }
        }
        _ => return None,
    };
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    Utc.timestamp_millis_opt((secs * 1000.0).round() as i64)
        .single()
}

pub fn to_epoch_secs(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    static ANSI: OnceLock<Option<Regex>> = OnceLock::new();
    match ANSI.get_or_init(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").ok()) {
        Some(pattern) => pattern.replace_all(text, ""),
        None => Cow::Borrowed(text),
    }
}

pub(crate) fn de_status<'de, D>(deserializer: D) -> Result<CheckStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(normalize_status(&value))
}

pub(crate) fn de_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(normalize_text(&value, ""))
}

pub(crate) fn de_opt_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let text = normalize_text(&value, "");
    Ok(if text.is_empty() { None } else { Some(text) })
}

pub(crate) fn de_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(to_bool(&value))
}

pub(crate) fn de_epoch<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(epoch_secs(&value))
}

pub(crate) fn de_opt_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(safe_u64(&value))
}

/// Deserialize an ID that can be either a string or a number into a String
pub(crate) fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        Value::Number(number) => Ok(number.to_string()),
        _ => Err(serde::de::Error::custom(
            "expected non-empty string or number for id",
        )),
    }
}
