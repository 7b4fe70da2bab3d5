//! Threshold evaluator
//!
//! Compares normalized fields against a check's configured expectations.
//! Boundary rules: a value exactly at the failure threshold is FAIL, a
//! value exactly at the warning threshold is WARN. No data never passes.

use crate::normalize::{FieldValue, NormalizedField};
use crate::report::Evaluation;

/// Expectation attached to one field
#[derive(Debug, Clone)]
pub enum Expectation {
    /// PASS iff the value equals one of the accepted strings
    ExactMatch { accepted: Vec<String> },
    /// PASS iff the value contains the expected substring. Used for
    /// compound fields like "200G 4X" where only the rate matters.
    Contains { expected: String },
    /// Numeric bands. `v < warn` is PASS; `warn <= v < fail` is WARN;
    /// `v >= fail` is FAIL. Without a warn threshold the WARN band is
    /// skipped.
    Threshold { warn: Option<f64>, fail: f64 },
    /// PASS iff the value is strictly below the bound (BER-style)
    UpperBound { fail: f64 },
}

impl Expectation {
    /// Exact match against a single accepted value
    pub fn equals(accepted: impl Into<String>) -> Self {
        Expectation::ExactMatch {
            accepted: vec![accepted.into()],
        }
    }

    /// Exact match against any of the accepted values
    pub fn one_of<I, S>(accepted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Expectation::ExactMatch {
            accepted: accepted.into_iter().map(Into::into).collect(),
        }
    }

    /// Single failure threshold, no warning band
    pub fn fail_at(fail: f64) -> Self {
        Expectation::Threshold { warn: None, fail }
    }

    /// Dual thresholds: warning band below the failure threshold
    pub fn warn_at_fail_at(warn: f64, fail: f64) -> Self {
        Expectation::Threshold {
            warn: Some(warn),
            fail,
        }
    }
}

/// Evaluate one normalized field for one device
pub fn evaluate_field(
    device: &str,
    field: &NormalizedField,
    expectation: &Expectation,
) -> Evaluation {
    match expectation {
        Expectation::ExactMatch { accepted } => {
            let actual = match &field.value {
                FieldValue::Text(s) => s.clone(),
                FieldValue::Int(n) => n.to_string(),
                FieldValue::Float(f) => f.to_string(),
            };
            if accepted.iter().any(|a| a == &actual) {
                Evaluation::pass(device, &field.name)
            } else {
                Evaluation::fail(
                    device,
                    &field.name,
                    format!("{}, expected {}", actual, accepted.join(" or ")),
                )
            }
        }
        Expectation::Contains { expected } => {
            let actual = match &field.value {
                FieldValue::Text(s) => s.clone(),
                other => {
                    return Evaluation::fail(
                        device,
                        &field.name,
                        format!("{:?}, expected text containing {}", other, expected),
                    )
                }
            };
            if actual.contains(expected.as_str()) {
                Evaluation::pass(device, &field.name)
            } else {
                Evaluation::fail(
                    device,
                    &field.name,
                    format!("{}, expected {}", actual, expected),
                )
            }
        }
        Expectation::Threshold { warn, fail } => {
            let value = match numeric_value(field) {
                Some(v) => v,
                None => {
                    return Evaluation::fail(
                        device,
                        &field.name,
                        "no numeric value to evaluate",
                    )
                }
            };
            if value >= *fail {
                Evaluation::fail(
                    device,
                    &field.name,
                    format!("{} at or above failure threshold {}", value, fail),
                )
            } else if warn.is_some_and(|w| value >= w) {
                Evaluation::warn(
                    device,
                    &field.name,
                    format!(
                        "{} at or above warning threshold {}",
                        value,
                        warn.unwrap_or_default()
                    ),
                )
            } else {
                Evaluation::pass(device, &field.name)
            }
        }
        Expectation::UpperBound { fail } => {
            let value = match numeric_value(field) {
                Some(v) => v,
                None => {
                    return Evaluation::fail(
                        device,
                        &field.name,
                        "no numeric value to evaluate",
                    )
                }
            };
            if value < *fail {
                Evaluation::pass(device, &field.name)
            } else {
                Evaluation::fail(
                    device,
                    &field.name,
                    format!("{:e} not below bound {:e}", value, fail),
                )
            }
        }
    }
}

fn numeric_value(field: &NormalizedField) -> Option<f64> {
    match &field.value {
        FieldValue::Float(f) => Some(*f),
        FieldValue::Int(n) => Some(*n as f64),
        _ => None,
    }
}

/// Evaluate an observed identifier set against an expected one.
///
/// Equality is PASS. A shortfall is reported as "missing" with the absent
/// identities named; a surplus or identity mismatch is reported as
/// "extra/mismatched", since the two imply different remediation.
pub fn evaluate_identity_set(
    scope: &str,
    field: &str,
    expected: &[String],
    actual: &[String],
) -> Evaluation {
    let missing: Vec<&String> = expected.iter().filter(|e| !actual.contains(e)).collect();
    let extra: Vec<&String> = actual.iter().filter(|a| !expected.contains(a)).collect();

    if missing.is_empty() && extra.is_empty() && expected.len() == actual.len() {
        return Evaluation::pass(scope, field);
    }

    if actual.len() < expected.len() {
        let names: Vec<&str> = missing.iter().map(|s| s.as_str()).collect();
        Evaluation::fail(
            scope,
            field,
            format!(
                "missing {} of {}: [{}]",
                expected.len() - actual.len(),
                expected.len(),
                names.join(", ")
            ),
        )
    } else {
        // A duplicate of an expected identity leaves `extra` empty; the
        // missing names still identify the offending device.
        let names: Vec<&str> = extra
            .iter()
            .chain(missing.iter())
            .map(|s| s.as_str())
            .collect();
        Evaluation::fail(
            scope,
            field,
            format!(
                "extra or mismatched identity: expected {}, found {} ([{}])",
                expected.len(),
                actual.len(),
                names.join(", ")
            ),
        )
    }
}

/// Evaluate a bare count against an expected count (no identities known)
pub fn evaluate_count(scope: &str, field: &str, expected: usize, actual: usize) -> Evaluation {
    if actual == expected {
        Evaluation::pass(scope, field)
    } else if actual < expected {
        Evaluation::fail(
            scope,
            field,
            format!("missing {}: expected {}, found {}", expected - actual, expected, actual),
        )
    } else {
        Evaluation::fail(
            scope,
            field,
            format!("extra: expected {}, found {}", expected, actual),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::HealthStatus;

    #[test]
    fn test_exact_match() {
        let field = NormalizedField::text("link_state", "Active");
        let exp = Expectation::equals("Active");
        assert_eq!(evaluate_field("mlx5_0", &field, &exp).status, HealthStatus::Pass);

        let field = NormalizedField::text("link_state", "Down");
        let eval = evaluate_field("mlx5_0", &field, &exp);
        assert_eq!(eval.status, HealthStatus::Fail);
        assert!(eval.message.unwrap().contains("expected Active"));
    }

    #[test]
    fn test_one_of_match() {
        let exp = Expectation::one_of(["LinkUp", "ETH_AN_FSM_ENABLE"]);
        let field = NormalizedField::text("physical_state", "ETH_AN_FSM_ENABLE");
        assert_eq!(evaluate_field("mlx5_0", &field, &exp).status, HealthStatus::Pass);
    }

    #[test]
    fn test_contains_match() {
        let exp = Expectation::Contains {
            expected: "200G".to_string(),
        };
        let field = NormalizedField::text("link_speed", "200G 4X");
        assert_eq!(evaluate_field("mlx5_0", &field, &exp).status, HealthStatus::Pass);

        let field = NormalizedField::text("link_speed", "100G 4X");
        assert_eq!(evaluate_field("mlx5_0", &field, &exp).status, HealthStatus::Fail);
    }

    #[test]
    fn test_dual_threshold_boundaries() {
        let exp = Expectation::warn_at_fail_at(100.0, 1000.0);

        // Below both thresholds
        let field = NormalizedField::int("errors", 99);
        assert_eq!(evaluate_field("gpu0", &field, &exp).status, HealthStatus::Pass);

        // Exactly at warning threshold is WARN, not PASS
        let field = NormalizedField::int("errors", 100);
        assert_eq!(evaluate_field("gpu0", &field, &exp).status, HealthStatus::Warn);

        // One below failure, above warning
        let field = NormalizedField::int("errors", 999);
        assert_eq!(evaluate_field("gpu0", &field, &exp).status, HealthStatus::Warn);

        // Exactly at failure threshold is FAIL (boundary closed on the failing side)
        let field = NormalizedField::int("errors", 1000);
        assert_eq!(evaluate_field("gpu0", &field, &exp).status, HealthStatus::Fail);
    }

    #[test]
    fn test_single_threshold_skips_warn() {
        let exp = Expectation::fail_at(10.0);
        let field = NormalizedField::int("discards", 9);
        assert_eq!(evaluate_field("rdma0", &field, &exp).status, HealthStatus::Pass);

        let field = NormalizedField::int("discards", 10);
        assert_eq!(evaluate_field("rdma0", &field, &exp).status, HealthStatus::Fail);
    }

    #[test]
    fn test_upper_bound() {
        let exp = Expectation::UpperBound { fail: 1e-12 };
        let field = NormalizedField::float("effective_physical_ber", 1e-13);
        assert_eq!(evaluate_field("mlx5_0", &field, &exp).status, HealthStatus::Pass);

        let field = NormalizedField::float("effective_physical_ber", 1e-12);
        assert_eq!(evaluate_field("mlx5_0", &field, &exp).status, HealthStatus::Fail);
    }

    #[test]
    fn test_threshold_on_text_fails() {
        let exp = Expectation::fail_at(5.0);
        let field = NormalizedField::text("errors", "N/A");
        assert_eq!(evaluate_field("gpu0", &field, &exp).status, HealthStatus::Fail);
    }

    #[test]
    fn test_identity_set_exact() {
        let expected: Vec<String> = vec!["0000:0f:00.0".into(), "0000:2d:00.0".into()];
        let actual = expected.clone();
        let eval = evaluate_identity_set("node", "gpu_pci", &expected, &actual);
        assert_eq!(eval.status, HealthStatus::Pass);
    }

    #[test]
    fn test_identity_set_missing_names_devices() {
        let expected: Vec<String> = vec!["0000:0f:00.0".into(), "0000:2d:00.0".into()];
        let actual: Vec<String> = vec!["0000:0f:00.0".into()];
        let eval = evaluate_identity_set("node", "gpu_pci", &expected, &actual);
        assert_eq!(eval.status, HealthStatus::Fail);
        let msg = eval.message.unwrap();
        assert!(msg.contains("missing"));
        assert!(msg.contains("0000:2d:00.0"));
    }

    #[test]
    fn test_identity_set_mismatch_is_extra() {
        let expected: Vec<String> = vec!["0000:0f:00.0".into(), "0000:2d:00.0".into()];
        let actual: Vec<String> = vec!["0000:0f:00.0".into(), "0000:99:00.0".into()];
        let eval = evaluate_identity_set("node", "gpu_pci", &expected, &actual);
        assert_eq!(eval.status, HealthStatus::Fail);
        let msg = eval.message.unwrap();
        assert!(msg.contains("mismatched"));
        assert!(msg.contains("0000:99:00.0"));
    }

    #[test]
    fn test_identity_set_duplicate_names_missing_device() {
        // Same length as expected, but one identity appears twice
        let expected: Vec<String> = vec!["0000:0f:00.0".into(), "0000:2d:00.0".into()];
        let actual: Vec<String> = vec!["0000:0f:00.0".into(), "0000:0f:00.0".into()];
        let eval = evaluate_identity_set("node", "gpu_pci", &expected, &actual);
        assert_eq!(eval.status, HealthStatus::Fail);
        assert!(eval.message.unwrap().contains("0000:2d:00.0"));
    }

    #[test]
    fn test_count_mismatch_direction() {
        let eval = evaluate_count("node", "rdma_nic_count", 16, 15);
        assert_eq!(eval.status, HealthStatus::Fail);
        assert!(eval.message.unwrap().contains("missing 1"));

        let eval = evaluate_count("node", "rdma_nic_count", 16, 17);
        assert!(eval.message.unwrap().contains("extra"));

        let eval = evaluate_count("node", "rdma_nic_count", 16, 16);
        assert_eq!(eval.status, HealthStatus::Pass);
    }
}
