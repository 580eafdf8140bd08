use crate::contracts::RobotSnapshot;
use crate::normalize::{de_epoch, de_flag, de_opt_text, de_opt_u64, de_status, de_text, display_text};
use crate::CheckStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const INFERRED_SOURCE: &str = "inferred";

/// One health check outcome. Decoding is lenient: unknown statuses collapse
/// to warning and blank text decodes to an empty string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    #[serde(default, deserialize_with = "de_status")]
    pub status: CheckStatus,
    #[serde(default, deserialize_with = "de_text")]
    pub value: String,
    #[serde(default, deserialize_with = "de_text")]
    pub details: String,
    #[serde(default, deserialize_with = "de_opt_text", skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, deserialize_with = "de_epoch", skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_opt_u64", skip_serializing_if = "Option::is_none")]
    pub ms: Option<u64>,
}

impl CheckResult {
    pub fn new(status: CheckStatus, value: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            status,
            value: value.into(),
            details: details.into(),
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn checked(mut self, at: DateTime<Utc>) -> Self {
        self.checked_at = Some(at);
        self
    }

    pub fn is_inferred(&self) -> bool {
        self.source.as_deref() == Some(INFERRED_SOURCE)
    }

    pub fn display_value(&self) -> String {
        display_text(Some(&self.value), "n/a")
    }

    pub fn display_details(&self) -> String {
        display_text(Some(&self.details), "No detail available")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(default, deserialize_with = "de_flag")]
    pub searching: bool,
    #[serde(default, deserialize_with = "de_flag")]
    pub testing: bool,
    #[serde(default, deserialize_with = "de_opt_text", skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, deserialize_with = "de_epoch", skip_serializing_if = "Option::is_none")]
    pub last_full_test_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_opt_text", skip_serializing_if = "Option::is_none")]
    pub last_full_test_source: Option<String>,
    #[serde(default, deserialize_with = "de_epoch", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Activity {
    pub fn is_busy(&self) -> bool {
        self.searching || self.testing
    }
}

/// Step trace captured from the last run of a check. Inspection only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDebugEntry {
    pub run_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub status: CheckStatus,
    pub steps: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotRecord {
    pub id: String,
    pub name: String,
    pub robot_type: String,
    pub address: String,
    pub tests: BTreeMap<String, CheckResult>,
    pub activity: Activity,
    pub test_debug: BTreeMap<String, TestDebugEntry>,
}

impl RobotRecord {
    pub fn from_snapshot(snapshot: RobotSnapshot) -> Self {
        let name = display_text(Some(&snapshot.name), &snapshot.id);
        Self {
            id: snapshot.id,
            name,
            robot_type: snapshot.robot_type,
            address: snapshot.address,
            tests: snapshot.tests,
            activity: snapshot.activity.unwrap_or_default(),
            test_debug: BTreeMap::new(),
        }
    }

    pub fn check(&self, check_id: &str) -> Option<&CheckResult> {
        self.tests.get(check_id)
    }

    /// Name, type and address. Always taken from the backend.
    pub fn same_identity(&self, snapshot: &RobotSnapshot) -> bool {
        self.name == display_text(Some(&snapshot.name), &snapshot.id)
            && self.robot_type == snapshot.robot_type
            && self.address == snapshot.address
    }

    pub fn apply_identity(&mut self, snapshot: &RobotSnapshot) {
        self.name = display_text(Some(&snapshot.name), &snapshot.id);
        self.robot_type = snapshot.robot_type.clone();
        self.address = snapshot.address.clone();
    }

    /// Test results and activity, the fields subject to local precedence.
    pub fn same_observed_state(&self, snapshot: &RobotSnapshot) -> bool {
        self.tests == snapshot.tests && self.activity == self.incoming_activity(snapshot)
    }

    pub fn apply_observed_state(&mut self, snapshot: &RobotSnapshot) {
        self.activity = self.incoming_activity(snapshot);
        self.tests = snapshot.tests.clone();
    }

    /// The backend rarely reports full-run stamps; keep the local ones then.
    fn incoming_activity(&self, snapshot: &RobotSnapshot) -> Activity {
        let mut activity = snapshot.activity.clone().unwrap_or_default();
        if activity.last_full_test_at.is_none() {
            activity.last_full_test_at = self.activity.last_full_test_at;
            activity.last_full_test_source = self.activity.last_full_test_source.clone();
        }
        activity
    }

    /// Worst status across all checks, `None` when nothing has been checked.
    pub fn overall_status(&self) -> Option<CheckStatus> {
        self.tests.values().map(|result| result.status).max()
    }
}
