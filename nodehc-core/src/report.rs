//! Check results and aggregation
//!
//! One `Evaluation` covers a single field on a single device. A check folds
//! all of its evaluations into one `CheckReport`, the unit handed to the
//! reporting/recommendation layer. The report status is always the
//! highest-severity status among the evaluations.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CheckError;

/// Classified outcome of one evaluation or one whole check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    /// Value matched expectations
    Pass,
    /// Value inside the warning band
    Warn,
    /// Value outside accepted range, or probe/parse failure
    Fail,
    /// Check disabled or not applicable for this shape
    Skip,
    /// Could not determine: execution-level error, not a hardware verdict
    Error,
}

impl HealthStatus {
    /// Severity rank used for aggregation: FAIL > ERROR > WARN > PASS.
    /// SKIP never competes; it only applies when nothing was evaluated.
    fn severity(self) -> u8 {
        match self {
            HealthStatus::Fail => 4,
            HealthStatus::Error => 3,
            HealthStatus::Warn => 2,
            HealthStatus::Pass => 1,
            HealthStatus::Skip => 0,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Pass => write!(f, "PASS"),
            HealthStatus::Warn => write!(f, "WARN"),
            HealthStatus::Fail => write!(f, "FAIL"),
            HealthStatus::Skip => write!(f, "SKIP"),
            HealthStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Result of evaluating one field on one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    /// Device or interface the field belongs to ("node" for host-wide fields)
    pub device: String,
    /// Semantic field name, e.g. "link_speed" or "rx_discards"
    pub field: String,
    /// Classified status
    pub status: HealthStatus,
    /// Detail for non-PASS statuses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Evaluation {
    /// Create a passing evaluation
    pub fn pass(device: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            field: field.into(),
            status: HealthStatus::Pass,
            message: None,
        }
    }

    /// Create a warning evaluation with a message
    pub fn warn(
        device: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            field: field.into(),
            status: HealthStatus::Warn,
            message: Some(message.into()),
        }
    }

    /// Create a failing evaluation with a message
    pub fn fail(
        device: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            field: field.into(),
            status: HealthStatus::Fail,
            message: Some(message.into()),
        }
    }

    fn describe(&self) -> String {
        match &self.message {
            Some(msg) => format!("{}/{}: {}", self.device, self.field, msg),
            None => format!("{}/{}", self.device, self.field),
        }
    }
}

/// Aggregated result of one check for one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReport {
    /// Check name, e.g. "link_check"
    pub name: String,
    /// Check category from configuration, e.g. "LEVEL_1"
    pub category: String,
    /// Overall status
    pub status: HealthStatus,
    /// Human-readable summary
    pub message: String,
    /// Structured detail keyed by device/metric, stable across runs
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub details: BTreeMap<String, serde_json::Value>,
    /// Completion time of the check
    pub timestamp: DateTime<Utc>,
}

impl CheckReport {
    /// Fold per-device/per-field evaluations into one report.
    ///
    /// Precedence: any FAIL makes the report FAIL; absent FAIL, any ERROR
    /// makes it ERROR; then WARN; then PASS. An empty evaluation list means
    /// nothing was measured and is reported as SKIP.
    pub fn aggregate(
        name: impl Into<String>,
        category: impl Into<String>,
        evaluations: Vec<Evaluation>,
    ) -> Self {
        let name = name.into();
        let category = category.into();

        if evaluations.is_empty() {
            return Self {
                name,
                category,
                status: HealthStatus::Skip,
                message: "no evaluations performed".to_string(),
                details: BTreeMap::new(),
                timestamp: Utc::now(),
            };
        }

        let status = evaluations
            .iter()
            .map(|e| e.status)
            .max_by_key(|s| s.severity())
            .unwrap_or(HealthStatus::Skip);

        let offending: Vec<String> = evaluations
            .iter()
            .filter(|e| e.status != HealthStatus::Pass)
            .map(Evaluation::describe)
            .collect();

        let total = evaluations.len();
        let message = if offending.is_empty() {
            format!("all {} evaluations passed", total)
        } else {
            format!(
                "{} of {} evaluations flagged: {}",
                offending.len(),
                total,
                offending.join("; ")
            )
        };

        let mut details = BTreeMap::new();
        details.insert(
            "evaluations".to_string(),
            serde_json::to_value(&evaluations).unwrap_or(serde_json::Value::Null),
        );

        Self {
            name,
            category,
            status,
            message,
            details,
            timestamp: Utc::now(),
        }
    }

    /// Report for a check that is disabled or has no expectation for the
    /// current shape. The evaluator is never invoked in this case.
    pub fn skip(
        name: impl Into<String>,
        category: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            status: HealthStatus::Skip,
            message: reason.into(),
            details: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Report for an execution-level error: "could not determine", distinct
    /// from a hardware FAIL. Parse errors stay FAIL.
    pub fn from_error(
        name: impl Into<String>,
        category: impl Into<String>,
        err: &CheckError,
    ) -> Self {
        let status = if err.is_execution_error() {
            HealthStatus::Error
        } else {
            HealthStatus::Fail
        };
        Self {
            name: name.into(),
            category: category.into(),
            status,
            message: err.to_string(),
            details: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach an extra structured detail entry
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Pass).unwrap(),
            "\"PASS\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Error).unwrap(),
            "\"ERROR\""
        );
    }

    #[test]
    fn test_fail_dominates_aggregation() {
        let evals = vec![
            Evaluation::pass("mlx5_0", "link_state"),
            Evaluation::warn("mlx5_1", "raw_physical_errors_per_lane", "12000"),
            Evaluation::fail("mlx5_2", "link_speed", "100G, expected 200G"),
        ];
        let report = CheckReport::aggregate("link_check", "LEVEL_1", evals);
        assert_eq!(report.status, HealthStatus::Fail);
        assert!(report.message.contains("mlx5_2/link_speed"));
    }

    #[test]
    fn test_warn_without_fail() {
        let evals = vec![
            Evaluation::pass("rdma0", "rx_discards"),
            Evaluation::warn("rdma1", "rx_discards", "near threshold"),
        ];
        let report = CheckReport::aggregate("rx_discards_check", "LEVEL_1", evals);
        assert_eq!(report.status, HealthStatus::Warn);
    }

    #[test]
    fn test_all_pass() {
        let evals = vec![
            Evaluation::pass("gpu0", "count"),
            Evaluation::pass("gpu1", "count"),
        ];
        let report = CheckReport::aggregate("gpu_count_check", "LEVEL_1", evals);
        assert_eq!(report.status, HealthStatus::Pass);
        assert_eq!(report.message, "all 2 evaluations passed");
    }

    #[test]
    fn test_empty_evaluations_is_skip() {
        let report = CheckReport::aggregate("gpu_count_check", "LEVEL_1", Vec::new());
        assert_eq!(report.status, HealthStatus::Skip);
    }

    #[test]
    fn test_offending_devices_preserved() {
        let evals = vec![
            Evaluation::fail("mlx5_4", "link_state", "device mlx5_4 not found"),
            Evaluation::pass("mlx5_5", "link_state"),
        ];
        let report = CheckReport::aggregate("link_check", "LEVEL_1", evals);
        assert!(report.message.contains("mlx5_4"));
        let listed = report.details.get("evaluations").unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_error_report_distinct_from_fail() {
        let report = CheckReport::from_error(
            "link_check",
            "LEVEL_1",
            &CheckError::BinaryMissing("mlxlink".to_string()),
        );
        assert_eq!(report.status, HealthStatus::Error);

        let report = CheckReport::from_error(
            "link_check",
            "LEVEL_1",
            &CheckError::parse("mlxlink output", "bad JSON"),
        );
        assert_eq!(report.status, HealthStatus::Fail);
    }
}
