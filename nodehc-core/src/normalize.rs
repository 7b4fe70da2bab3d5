//! Output normalizer
//!
//! Converts tool-specific raw output into typed fields so values from
//! different probes compare equal. The cardinal rule: "absent or
//! unparseable" is never conflated with "zero" or "good".

use serde::Serialize;

use crate::error::CheckError;

/// Typed value extracted from probe output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Floating-point metric (BER, speed in GB/s)
    Float(f64),
    /// Integer counter (error counts, discards)
    Int(i64),
    /// Enum-state or identifier string (link state, PCI address)
    Text(String),
}

/// A typed value tagged with its semantic name
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedField {
    /// Semantic name, e.g. "link_speed" or "effective_physical_errors"
    pub name: String,
    /// Extracted value
    pub value: FieldValue,
}

impl NormalizedField {
    /// Create a field with a text value
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: FieldValue::Text(value.into()),
        }
    }

    /// Create a field with an integer value
    pub fn int(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            value: FieldValue::Int(value),
        }
    }

    /// Create a field with a float value
    pub fn float(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: FieldValue::Float(value),
        }
    }
}

/// Normalize a PCI bus address to its canonical form.
///
/// Case-folds to lowercase; an 8-hex-digit domain prefix beginning with six
/// zeros collapses to the 2-digit form, so `00000000:0F:00.0` and
/// `0000:0f:00.0` compare equal.
pub fn normalize_pci_address(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with("000000") {
        format!("00{}", addr[6..].to_lowercase())
    } else {
        addr.to_lowercase()
    }
}

/// Parse an integer counter, distinguishing "unparseable" from zero
pub fn parse_counter(field: &str, raw: &str) -> Result<i64, CheckError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| CheckError::parse(field, format!("not an integer: {:?}", raw.trim())))
}

/// Parse a floating-point metric, distinguishing "unparseable" from zero
pub fn parse_float(field: &str, raw: &str) -> Result<f64, CheckError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| CheckError::parse(field, format!("not a number: {:?}", raw.trim())))
}

/// Extract a JSON document embedded in probe output.
///
/// mlxlink prefixes its JSON with warning banners on some firmware; the
/// payload starts at the first `{`. Anything that does not parse as JSON is
/// an explicit parse failure, never a crash.
pub fn extract_embedded_json(what: &str, raw: &str) -> Result<serde_json::Value, CheckError> {
    let start = raw
        .find('{')
        .ok_or_else(|| CheckError::parse(what, "no JSON object in output"))?;
    serde_json::from_str(&raw[start..])
        .map_err(|e| CheckError::parse(what, format!("invalid JSON: {}", e)))
}

/// Parse `key: value` counter lines (ethtool style).
///
/// Spaces inside the key are dropped before splitting so `rx_prio0_discards:
/// 12` and `rx_prio0_discards : 12` normalize identically. Lines without a
/// colon are skipped; they are headers, not counters.
pub fn parse_key_value_lines(lines: &[&str]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in lines {
        let clean: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if let Some((key, value)) = clean.split_once(':') {
            if !key.is_empty() {
                pairs.push((key.to_string(), value.to_string()));
            }
        }
    }
    pairs
}

/// Outcome of normalizing a per-lane counter array
#[derive(Debug, Clone, PartialEq)]
pub enum LaneCounters {
    /// Ordered counters, with explicitly "undefined" lanes dropped
    Parsed(Vec<i64>),
    /// An entry was neither numeric nor "undefined"
    Unparseable,
}

/// Normalize a per-lane error counter array from embedded JSON.
///
/// Entries may arrive as numbers or strings; the literal string "undefined"
/// marks a lane the firmware could not sample and is dropped explicitly.
/// Any other non-numeric entry makes the whole sequence unparseable rather
/// than being silently skipped.
pub fn parse_lane_counters(value: &serde_json::Value) -> LaneCounters {
    let entries = match value.as_array() {
        Some(entries) => entries,
        None => match value.as_str() {
            // Single scalar rendered as a space-separated string
            Some(s) => {
                return parse_lane_counter_strings(s.split_whitespace());
            }
            None => return LaneCounters::Unparseable,
        },
    };

    let mut counters = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(n) = entry.as_i64() {
            counters.push(n);
        } else if let Some(s) = entry.as_str() {
            if s == "undefined" {
                continue;
            }
            match s.trim().parse::<i64>() {
                Ok(n) => counters.push(n),
                Err(_) => return LaneCounters::Unparseable,
            }
        } else {
            return LaneCounters::Unparseable;
        }
    }
    LaneCounters::Parsed(counters)
}

fn parse_lane_counter_strings<'a>(parts: impl Iterator<Item = &'a str>) -> LaneCounters {
    let mut counters = Vec::new();
    for part in parts {
        if part == "undefined" {
            continue;
        }
        match part.parse::<i64>() {
            Ok(n) => counters.push(n),
            Err(_) => return LaneCounters::Unparseable,
        }
    }
    LaneCounters::Parsed(counters)
}
