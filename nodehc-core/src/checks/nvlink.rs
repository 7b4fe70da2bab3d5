//! NVLink speed and count check
//!
//! Reads the per-GPU NVLink status listing and counts, for each GPU, the
//! links that are active and at or above the expected speed. Every GPU must
//! carry exactly the expected number of good links; a link that trained slow
//! or went inactive shows up as a count shortfall on that GPU.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{CheckContext, HealthCheck};
use crate::error::CheckError;
use crate::evaluate::evaluate_count;
use crate::exec::ProbeCommand;
use crate::limits::CheckDefinition;
use crate::normalize::parse_float;
use crate::report::{CheckReport, Evaluation};

const CHECK_NAME: &str = "nvlink_speed_check";

/// `GPU 0: NVIDIA H100 80GB HBM3 (UUID: ...)`
static GPU_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"GPU\s+(\d+):\s+(?:NVIDIA|HGX)").expect("static regex must compile"));

/// `Link 0: 26.562 GB/s`
static LINK_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Link\s+(\d+):\s+([\d.]+)\s+GB/s").expect("static regex must compile"));

/// Per-shape expectations: minimum link speed and good links per GPU
#[derive(Debug, Clone, Copy)]
struct NvlinkExpectations {
    speed: f64,
    count: usize,
}

impl NvlinkExpectations {
    fn from_definition(def: &CheckDefinition) -> Result<Self, CheckError> {
        let speed = def.threshold_key_f64("speed").ok_or_else(|| {
            CheckError::Config("nvlink_speed_check threshold missing \"speed\"".to_string())
        })?;
        let count = def.threshold_key_f64("count").ok_or_else(|| {
            CheckError::Config("nvlink_speed_check threshold missing \"count\"".to_string())
        })? as usize;
        Ok(Self { speed, count })
    }
}

/// Count good links per GPU, in listing order.
///
/// A good link is active and at least the expected speed. The listing only
/// ever contains GPU headers and link entries; anything else means the tool
/// emitted an error and the output cannot be trusted.
fn count_good_links(
    lines: &[&str],
    expected_speed: f64,
) -> Result<Vec<(String, usize)>, CheckError> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for line in lines {
        if let Some(caps) = GPU_HEADER.captures(line) {
            counts.push((format!("gpu{}", &caps[1]), 0));
            continue;
        }
        if let Some(caps) = LINK_LINE.captures(line) {
            let Some(current) = counts.last_mut() else {
                return Err(CheckError::parse(
                    "nvlink status output",
                    format!("link entry before any GPU header: {}", line),
                ));
            };
            let speed = parse_float("nvlink_speed", &caps[2])?;
            let active = !line.to_ascii_lowercase().contains("inactive");
            if active && speed >= expected_speed {
                current.1 += 1;
            }
            continue;
        }
        // Inactive links render without a speed and are simply not counted
        if !line.contains("GPU") && !line.contains("Link") {
            return Err(CheckError::parse(
                "nvlink status output",
                format!("unexpected entry: {}", line),
            ));
        }
    }
    Ok(counts)
}

/// Verifies per-GPU NVLink link count at the expected speed
pub struct NvlinkSpeedCheck;

#[async_trait]
impl HealthCheck for NvlinkSpeedCheck {
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

        let expect = match NvlinkExpectations::from_definition(def) {
            Ok(expect) => expect,
            Err(e) => return CheckReport::from_error(CHECK_NAME, &def.category, &e),
        };

        let cmd =
            ProbeCommand::new("nvidia-smi", ["nvlink", "-s"]).with_timeout(ctx.timeout_for(def));
        let output = match ctx.runner.run(&cmd).await {
            Ok(output) => output,
            Err(e) => return CheckReport::from_error(CHECK_NAME, &def.category, &e),
        };
        if output.timed_out {
            return CheckReport::aggregate(
                CHECK_NAME,
                &def.category,
                vec![Evaluation::fail("node", "nvlink", "NVLink status probe timed out")],
            );
        }

        let lines = output.lines();
        if lines.is_empty() {
            return CheckReport::aggregate(
                CHECK_NAME,
                &def.category,
                vec![Evaluation::fail("node", "nvlink", "no NVLink information reported")],
            );
        }

        let counts = match count_good_links(&lines, expect.speed) {
            Ok(counts) => counts,
            Err(e) => return CheckReport::from_error(CHECK_NAME, &def.category, &e),
        };
        if counts.is_empty() {
            return CheckReport::aggregate(
                CHECK_NAME,
                &def.category,
                vec![Evaluation::fail("node", "nvlink", "no GPUs in NVLink status output")],
            );
        }

        let evals = counts
            .iter()
            .map(|(gpu, good)| evaluate_count(gpu, "nvlink_count", expect.count, *good))
            .collect();

        CheckReport::aggregate(CHECK_NAME, &def.category, evals)
            .with_detail("gpu_count", counts.len().into())
    }
}
