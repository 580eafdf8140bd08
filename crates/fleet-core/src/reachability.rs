//! Indirect reachability evidence from ordinary test results.
//!
//! When a run carries no explicit `online` result, the other checks still
//! tell us whether commands reached the robot. This policy lives alone so it
//! can change without touching the store.

use crate::contracts::TestResultPayload;
use crate::model::{CheckResult, INFERRED_SOURCE};
use crate::{CheckStatus, REACHABILITY_CHECK_ID};
use chrono::{DateTime, Utc};

/// Explicit results younger than this are never overridden by inference.
pub const REACHABILITY_FRESHNESS_MS: i64 = 15_000;

const CONNECTIVITY_DETAIL_MARKERS: [&str; 3] = ["ssh", "connect", "auth"];
const CONNECTIVITY_VALUES: [&str; 2] = ["execution_error", "command_error"];

pub fn is_connectivity_failure(result: &TestResultPayload) -> bool {
    if result.status != CheckStatus::Error {
        return false;
    }
    let details = result.details.to_ascii_lowercase();
    let value = result.value.trim().to_ascii_lowercase();
    CONNECTIVITY_DETAIL_MARKERS
        .iter()
        .any(|marker| details.contains(marker))
        || CONNECTIVITY_VALUES.contains(&value.as_str())
}

pub fn has_fresh_explicit(existing: Option<&CheckResult>, now: DateTime<Utc>) -> bool {
    existing
        .filter(|result| !result.is_inferred())
        .and_then(|result| result.checked_at)
        .map(|checked_at| (now - checked_at).num_milliseconds() <= REACHABILITY_FRESHNESS_MS)
        .unwrap_or(false)
}

/// Returns the `online` result to record, or `None` to leave it untouched.
pub fn infer_reachability(
    results: &[TestResultPayload],
    existing: Option<&CheckResult>,
    now: DateTime<Utc>,
) -> Option<CheckResult> {
    if results.iter().any(|result| result.id == REACHABILITY_CHECK_ID) {
        return None;
    }
    if has_fresh_explicit(existing, now) {
        return None;
    }
    let evidence: Vec<&TestResultPayload> = results
        .iter()
        .filter(|result| result.id != REACHABILITY_CHECK_ID)
        .collect();
    if evidence.is_empty() {
        return None;
    }

    let inferred = if evidence.iter().any(|result| !is_connectivity_failure(result)) {
        CheckResult::new(
            CheckStatus::Ok,
            "reachable",
            "Inferred online: at least one test command executed.",
        )
    } else {
        CheckResult::new(
            CheckStatus::Error,
            "unreachable",
            "Inferred offline: tests failed for SSH/connectivity reasons.",
        )
    };
    Some(inferred.with_source(INFERRED_SOURCE).checked(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn result(id: &str, status: CheckStatus, value: &str, details: &str) -> TestResultPayload {
        TestResultPayload {
            id: id.to_string(),
            status,
            value: value.to_string(),
            details: details.to_string(),
            ..TestResultPayload::default()
        }
    }

    #[test]
    fn execution_error_everywhere_means_unreachable() {
        let now = Utc::now();
        let inferred = infer_reachability(
            &[result("disk", CheckStatus::Error, "execution_error", "")],
            None,
            now,
        )
        .expect("inferred");
        assert_eq!(inferred.status, CheckStatus::Error);
        assert_eq!(inferred.value, "unreachable");
        assert!(inferred.is_inferred());
        assert_eq!(inferred.checked_at, Some(now));
    }

    #[test]
    fn one_executed_check_means_reachable() {
        let inferred = infer_reachability(
            &[
                result("disk", CheckStatus::Ok, "ok", ""),
                result("wifi", CheckStatus::Error, "", "SSH auth failed"),
            ],
            None,
            Utc::now(),
        )
        .expect("inferred");
        assert_eq!(inferred.status, CheckStatus::Ok);
        assert_eq!(inferred.value, "reachable");
    }

    #[test]
    fn non_connectivity_error_still_counts_as_executed() {
        let inferred = infer_reachability(
            &[result("disk", CheckStatus::Error, "92%", "Disk almost full")],
            None,
            Utc::now(),
        )
        .expect("inferred");
        assert_eq!(inferred.status, CheckStatus::Ok);
    }

    #[test]
    fn connectivity_signature_is_case_insensitive() {
        assert!(is_connectivity_failure(&result(
            "disk",
            CheckStatus::Error,
            "",
            "Could not CONNECT to host"
        )));
        assert!(is_connectivity_failure(&result(
            "disk",
            CheckStatus::Error,
            "Command_Error",
            ""
        )));
        assert!(!is_connectivity_failure(&result(
            "disk",
            CheckStatus::Warning,
            "execution_error",
            "ssh"
        )));
    }

    #[test]
    fn explicit_online_result_in_batch_wins() {
        let inferred = infer_reachability(
            &[
                result("online", CheckStatus::Error, "offline", ""),
                result("disk", CheckStatus::Ok, "ok", ""),
            ],
            None,
            Utc::now(),
        );
        assert!(inferred.is_none());
    }

    #[test]
    fn fresh_explicit_result_is_kept_but_stale_or_inferred_is_not() {
        let now = Utc::now();
        let batch = [result("disk", CheckStatus::Ok, "ok", "")];

        let fresh = CheckResult::new(CheckStatus::Error, "offline", "")
            .with_source("live")
            .checked(now - Duration::seconds(5));
        assert!(infer_reachability(&batch, Some(&fresh), now).is_none());

        let stale = fresh.clone().checked(now - Duration::seconds(16));
        assert!(infer_reachability(&batch, Some(&stale), now).is_some());

        let inferred = CheckResult::new(CheckStatus::Error, "unreachable", "")
            .with_source(INFERRED_SOURCE)
            .checked(now);
        assert!(infer_reachability(&batch, Some(&inferred), now).is_some());

        let undated = CheckResult::new(CheckStatus::Error, "offline", "");
        assert!(infer_reachability(&batch, Some(&undated), now).is_some());
    }

    #[test]
    fn empty_batch_leaves_reachability_alone() {
        assert!(infer_reachability(&[], None, Utc::now()).is_none());
    }
}
