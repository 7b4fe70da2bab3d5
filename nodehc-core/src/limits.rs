//! Per-shape check configuration
//!
//! The limits file maps shape name -> check name -> enabled flag, category,
//! and a free-form threshold value interpreted per check. Loaded once per
//! run and read-only to the engine.
//!
//! File layout:
//! ```json
//! {
//!   "test_limits": {
//!     "BM.GPU.H100.8": {
//!       "rx_discards_check": {
//!         "enabled": true,
//!         "test_category": "LEVEL_1",
//!         "threshold": 100
//!       }
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::CheckError;

/// Configuration of one check for one shape. Immutable once loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckDefinition {
    /// Whether the check runs on this shape
    pub enabled: bool,
    /// Reporting category, e.g. "LEVEL_1"
    #[serde(rename = "test_category", default)]
    pub category: String,
    /// Check-specific expectation data (number, object, or array)
    #[serde(default)]
    pub threshold: Option<serde_json::Value>,
    /// Per-check probe timeout override, e.g. "45s"
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
}

impl CheckDefinition {
    /// Threshold as a plain number
    pub fn threshold_f64(&self) -> Option<f64> {
        self.threshold.as_ref().and_then(serde_json::Value::as_f64)
    }

    /// Named numeric field inside an object threshold
    pub fn threshold_key_f64(&self, key: &str) -> Option<f64> {
        self.threshold
            .as_ref()
            .and_then(|t| t.get(key))
            .and_then(serde_json::Value::as_f64)
    }

    /// Named string field inside an object threshold
    pub fn threshold_key_str(&self, key: &str) -> Option<&str> {
        self.threshold
            .as_ref()
            .and_then(|t| t.get(key))
            .and_then(serde_json::Value::as_str)
    }

    /// Named string-array field inside an object threshold
    pub fn threshold_key_strings(&self, key: &str) -> Option<Vec<String>> {
        let entries = self
            .threshold
            .as_ref()
            .and_then(|t| t.get(key))
            .and_then(serde_json::Value::as_array)?;
        Some(
            entries
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    }

    /// Named object field inside an object threshold
    pub fn threshold_key_object(&self, key: &str) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.threshold
            .as_ref()
            .and_then(|t| t.get(key))
            .and_then(serde_json::Value::as_object)
    }
}

#[derive(Debug, Deserialize)]
struct LimitsFile {
    test_limits: BTreeMap<String, BTreeMap<String, CheckDefinition>>,
}

/// All check definitions for all shapes
#[derive(Debug)]
pub struct ShapeLimits {
    limits: BTreeMap<String, BTreeMap<String, CheckDefinition>>,
}

impl ShapeLimits {
    /// Parse from a JSON string
    pub fn from_json(json: &str) -> Result<Self, CheckError> {
        let file: LimitsFile = serde_json::from_str(json)
            .map_err(|e| CheckError::Config(format!("invalid limits file: {}", e)))?;
        Ok(Self {
            limits: file.test_limits,
        })
    }

    /// Load from a file path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CheckError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CheckError::Config(format!(
                "failed to read limits file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        debug!(path = ?path.as_ref(), "Loaded limits file");
        Self::from_json(&content)
    }

    /// Definition of one check for one shape, if configured
    pub fn definition(&self, shape: &str, check: &str) -> Option<&CheckDefinition> {
        self.limits.get(shape).and_then(|checks| checks.get(check))
    }

    /// Whether a check is configured and enabled for a shape
    pub fn is_enabled(&self, shape: &str, check: &str) -> bool {
        self.definition(shape, check).is_some_and(|d| d.enabled)
    }

    /// Names of enabled checks for a shape, in stable order
    pub fn enabled_checks(&self, shape: &str) -> Vec<&str> {
        self.limits
            .get(shape)
            .map(|checks| {
                checks
                    .iter()
                    .filter(|(_, def)| def.enabled)
                    .map(|(name, _)| name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All configured shape names
    pub fn shapes(&self) -> Vec<&str> {
        self.limits.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS_JSON: &str = r#"{
        "test_limits": {
            "BM.GPU.H100.8": {
                "rx_discards_check": {
                    "enabled": true,
                    "test_category": "LEVEL_1",
                    "threshold": 100
                },
                "link_check": {
                    "enabled": true,
                    "test_category": "LEVEL_1",
                    "timeout": "45s",
                    "threshold": {
                        "speed": "200G",
                        "effective_physical_errors": 0,
                        "raw_physical_errors_per_lane": 10000
                    }
                },
                "gpu_clk_check": {
                    "enabled": false,
                    "test_category": "LEVEL_1"
                }
            }
        }
    }"#;

    #[test]
    fn test_parse_and_lookup() {
        let limits = ShapeLimits::from_json(LIMITS_JSON).unwrap();
        assert!(limits.is_enabled("BM.GPU.H100.8", "rx_discards_check"));
        assert!(!limits.is_enabled("BM.GPU.H100.8", "gpu_clk_check"));
        assert!(!limits.is_enabled("BM.GPU.H100.8", "unknown_check"));
        assert!(!limits.is_enabled("BM.GPU.B200.8", "rx_discards_check"));
    }

    #[test]
    fn test_scalar_threshold() {
        let limits = ShapeLimits::from_json(LIMITS_JSON).unwrap();
        let def = limits
            .definition("BM.GPU.H100.8", "rx_discards_check")
            .unwrap();
        assert_eq!(def.threshold_f64(), Some(100.0));
        assert_eq!(def.category, "LEVEL_1");
        assert_eq!(def.timeout, None);
    }

    #[test]
    fn test_timeout_override() {
        let limits = ShapeLimits::from_json(LIMITS_JSON).unwrap();
        let def = limits.definition("BM.GPU.H100.8", "link_check").unwrap();
        assert_eq!(def.timeout, Some(Duration::from_secs(45)));
    }

    #[test]
    fn test_object_threshold() {
        let limits = ShapeLimits::from_json(LIMITS_JSON).unwrap();
        let def = limits.definition("BM.GPU.H100.8", "link_check").unwrap();
        assert_eq!(def.threshold_key_str("speed"), Some("200G"));
        assert_eq!(def.threshold_key_f64("effective_physical_errors"), Some(0.0));
        assert_eq!(
            def.threshold_key_f64("raw_physical_errors_per_lane"),
            Some(10000.0)
        );
        assert_eq!(def.threshold_key_f64("absent"), None);
    }

    #[test]
    fn test_enabled_checks_stable_order() {
        let limits = ShapeLimits::from_json(LIMITS_JSON).unwrap();
        let enabled = limits.enabled_checks("BM.GPU.H100.8");
        assert_eq!(enabled, vec!["link_check", "rx_discards_check"]);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = ShapeLimits::from_json("{oops").unwrap_err();
        assert!(matches!(err, CheckError::Config(_)));
    }
}
