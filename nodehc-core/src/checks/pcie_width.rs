//! PCIe width and speed check
//!
//! One `lspci -vvv` sweep, grouped by device family (NVIDIA, Mellanox). Each
//! family's negotiated link widths and speeds are bucketed and the bucket
//! counts compared against the shape expectations; a lane that trained down
//! shows up as a count shortfall. A non-ok link state annotation fails on
//! its own, whatever the counts say.

use std::collections::BTreeMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{CheckContext, HealthCheck};
use crate::evaluate::evaluate_count;
use crate::exec::ProbeCommand;
use crate::limits::CheckDefinition;
use crate::report::{CheckReport, Evaluation};

const CHECK_NAME: &str = "pcie_width_check";

/// Device families evaluated, by vendor marker in the lspci header line
const FAMILIES: [&str; 2] = ["nvidia", "mellanox"];

/// `0c:00.0 Infiniband controller: ...` (domain prefix optional)
static DEVICE_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9a-fA-F]{4}:)?[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-9a-fA-F]")
        .expect("static regex must compile")
});

/// `LnkSta: Speed 32GT/s (ok), Width x16 (ok)`
static LNK_STA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"LnkSta:\s*Speed\s+(\S+)\s*\(([^)]+)\),\s*Width\s+(x\d+)\s*\(([^)]+)\)")
        .expect("static regex must compile")
});

/// Expected bucket counts for one device family
#[derive(Debug, Default)]
struct FamilyExpectation {
    width: BTreeMap<String, usize>,
    speed: BTreeMap<String, usize>,
}

fn bucket_counts(value: Option<&serde_json::Value>) -> BTreeMap<String, usize> {
    value
        .and_then(serde_json::Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_u64().map(|n| (k.clone(), n as usize)))
                .collect()
        })
        .unwrap_or_default()
}

fn family_expectation(def: &CheckDefinition, family: &str) -> Option<FamilyExpectation> {
    let obj = def.threshold_key_object(family)?;
    let expectation = FamilyExpectation {
        width: bucket_counts(obj.get("width")),
        speed: bucket_counts(obj.get("speed")),
    };
    if expectation.width.is_empty() && expectation.speed.is_empty() {
        None
    } else {
        Some(expectation)
    }
}

/// Observed bucket counts and state anomalies for one device family
#[derive(Debug, Default)]
struct FamilyObservation {
    width: BTreeMap<String, usize>,
    speed: BTreeMap<String, usize>,
    state_errors: Vec<String>,
    device_count: usize,
}

/// Walk the lspci output once, attributing each LnkSta line to the family
/// of the most recent device header.
fn scan_link_status(lines: &[&str]) -> BTreeMap<&'static str, FamilyObservation> {
    let mut observations: BTreeMap<&'static str, FamilyObservation> = BTreeMap::new();
    let mut current: Option<&'static str> = None;

    for line in lines {
        if DEVICE_HEADER.is_match(line) {
            let lower = line.to_ascii_lowercase();
            current = FAMILIES.iter().copied().find(|f| lower.contains(f));
            if let Some(family) = current {
                observations.entry(family).or_default().device_count += 1;
            }
            continue;
        }
        let Some(family) = current else { continue };
        let Some(caps) = LNK_STA.captures(line) else {
            continue;
        };

        let obs = observations.entry(family).or_default();
        let speed = caps[1].to_string();
        let speed_state = caps[2].trim();
        let width = caps[3].to_string();
        let width_state = caps[4].trim();

        if width_state == "ok" {
            *obs.width.entry(width).or_default() += 1;
        } else {
            obs.state_errors
                .push(format!("width {} in state '{}'", width, width_state));
        }
        if speed_state == "ok" {
            *obs.speed.entry(speed).or_default() += 1;
        } else {
            obs.state_errors
                .push(format!("speed {} in state '{}'", speed, speed_state));
        }
    }
    observations
}

/// Verifies negotiated PCIe link width and speed per device family
pub struct PcieWidthCheck;

#[async_trait]
impl HealthCheck for PcieWidthCheck {
    fn name(&self) -> &'static str {
        CHECK_NAME
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> CheckReport {
        let def = match ctx.enabled_definition(CHECK_NAME) {
            Some(def) => def,
            None => {
                return CheckReport::skip(
                    CHECK_NAME,
                    "LEVEL_1",
                    format!("check not applicable for shape {}", ctx.shape),
                )
            }
        };

        let expectations: Vec<(&str, FamilyExpectation)> = FAMILIES
            .iter()
            .filter_map(|family| family_expectation(def, family).map(|e| (*family, e)))
            .collect();
        if expectations.is_empty() {
            return CheckReport::skip(
                CHECK_NAME,
                &def.category,
                format!("no PCIe expectations defined for shape {}", ctx.shape),
            );
        }

        let cmd = ProbeCommand::new("lspci", ["-vvv"]).with_timeout(ctx.timeout_for(def));
        let output = match ctx.runner.run(&cmd).await {
            Ok(output) => output,
            Err(e) => return CheckReport::from_error(CHECK_NAME, &def.category, &e),
        };
        if output.timed_out {
            return CheckReport::aggregate(
                CHECK_NAME,
                &def.category,
                vec![Evaluation::fail("node", "lspci", "bus scan timed out")],
            );
        }

        let observations = scan_link_status(&output.lines());
        let mut evals = Vec::new();
        for (family, expectation) in &expectations {
            let Some(obs) = observations.get(family) else {
                evals.push(Evaluation::fail(
                    *family,
                    "pcie_devices",
                    "no devices of this family on the bus",
                ));
                continue;
            };
            for (bucket, expected) in &expectation.width {
                let actual = obs.width.get(bucket).copied().unwrap_or(0);
                evals.push(evaluate_count(
                    *family,
                    &format!("width_{}", bucket),
                    *expected,
                    actual,
                ));
            }
            for (bucket, expected) in &expectation.speed {
                let actual = obs.speed.get(bucket).copied().unwrap_or(0);
                evals.push(evaluate_count(
                    *family,
                    &format!("speed_{}", bucket),
                    *expected,
                    actual,
                ));
            }
            for state_error in &obs.state_errors {
                evals.push(Evaluation::fail(*family, "link_state", state_error.clone()));
            }
        }

        let device_total: usize = observations.values().map(|o| o.device_count).sum();
        CheckReport::aggregate(CHECK_NAME, &def.category, evals)
            .with_detail("scanned_devices", device_total.into())
    }
}
