//! RDMA link check
//!
//! Maps the shape's expected RDMA devices to OS interfaces, probes each with
//! the link-diagnostic tool (JSON output), and validates link state, speed,
//! status opcode, and error/BER counters. A device absent from the mapping
//! still appears in the result set as a failure for every field.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use super::{CheckContext, HealthCheck};
use crate::error::CheckError;
use crate::evaluate::{evaluate_field, Expectation};
use crate::exec::{CommandRunner, ProbeCommand};
use crate::limits::CheckDefinition;
use crate::normalize::{
    extract_embedded_json, parse_counter, parse_float, parse_lane_counters, LaneCounters,
    NormalizedField,
};
use crate::report::{CheckReport, Evaluation};

const CHECK_NAME: &str = "link_check";

/// Fields evaluated per link, in reporting order
const LINK_FIELDS: [&str; 8] = [
    "link_speed",
    "link_state",
    "physical_state",
    "link_status",
    "effective_physical_errors",
    "effective_physical_ber",
    "raw_physical_errors_per_lane",
    "raw_physical_ber",
];

/// BER bounds are fixed properties of the link technology, not per-shape
const EFFECTIVE_BER_BOUND: f64 = 1e-12;
const RAW_BER_BOUND: f64 = 1e-5;

/// Per-shape expectations for one link
#[derive(Debug, Clone)]
struct LinkExpectations {
    speed: String,
    effective_physical_errors: f64,
    raw_physical_errors_per_lane: i64,
}

impl LinkExpectations {
    fn from_definition(def: &CheckDefinition) -> Result<Self, CheckError> {
        let speed = def
            .threshold_key_str("speed")
            .ok_or_else(|| {
                CheckError::Config("link_check threshold missing \"speed\"".to_string())
            })?
            .to_string();
        Ok(Self {
            speed,
            effective_physical_errors: def
                .threshold_key_f64("effective_physical_errors")
                .unwrap_or(1.0),
            raw_physical_errors_per_lane: def
                .threshold_key_f64("raw_physical_errors_per_lane")
                .unwrap_or(10000.0) as i64,
        })
    }
}

/// Validates every expected RDMA link via the link-diagnostic tool
pub struct LinkCheck;

/// One FAIL evaluation per field for a device that could not be probed
fn fail_all_fields(device: &str, reason: &str) -> Vec<Evaluation> {
    LINK_FIELDS
        .iter()
        .map(|field| Evaluation::fail(device, *field, reason))
        .collect()
}

/// Pull a string out of a JSON section, empty if absent
fn section_str(section: Option<&serde_json::Value>, key: &str) -> String {
    section
        .and_then(|s| s.get(key))
        .map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default()
}

/// Evaluate one device's link-diagnostic JSON payload
fn evaluate_link_output(
    device: &str,
    raw: &str,
    expect: &LinkExpectations,
) -> Vec<Evaluation> {
    let payload = match extract_embedded_json("link-diagnostic output", raw) {
        Ok(payload) => payload,
        Err(e) => return fail_all_fields(device, &e.to_string()),
    };

    let output = match payload.pointer("/result/output") {
        Some(output) => output,
        None => {
            return fail_all_fields(
                device,
                "unable to parse link-diagnostic output: missing result.output",
            )
        }
    };

    let operational = output.get("Operational Info");
    let troubleshooting = output.get("Troubleshooting Info");
    let counters = output.get("Physical Counters and BER Info");

    let mut evals = Vec::with_capacity(LINK_FIELDS.len());

    // Exact-match style fields
    evals.push(evaluate_field(
        device,
        &NormalizedField::text("link_speed", section_str(operational, "Speed")),
        &Expectation::Contains {
            expected: expect.speed.clone(),
        },
    ));
    evals.push(evaluate_field(
        device,
        &NormalizedField::text("link_state", section_str(operational, "State")),
        &Expectation::equals("Active"),
    ));
    evals.push(evaluate_field(
        device,
        &NormalizedField::text(
            "physical_state",
            section_str(operational, "Physical state"),
        ),
        &Expectation::one_of(["LinkUp", "ETH_AN_FSM_ENABLE"]),
    ));

    // Status opcode 0 means "no issue"; anything else carries the tool's
    // remediation text.
    let opcode = section_str(troubleshooting, "Status Opcode");
    if opcode == "0" {
        evals.push(Evaluation::pass(device, "link_status"));
    } else {
        let recommendation = section_str(troubleshooting, "Recommendation");
        evals.push(Evaluation::fail(
            device,
            "link_status",
            format!("opcode {}: {}", opcode, recommendation),
        ));
    }

    // Counter fields: unparseable is a failure, never treated as zero
    let eff_errors = section_str(counters, "Effective Physical Errors");
    match parse_counter("effective_physical_errors", &eff_errors) {
        Ok(n) => evals.push(evaluate_field(
            device,
            &NormalizedField::int("effective_physical_errors", n),
            &Expectation::fail_at(expect.effective_physical_errors),
        )),
        Err(e) => evals.push(Evaluation::fail(
            device,
            "effective_physical_errors",
            e.to_string(),
        )),
    }

    let eff_ber = section_str(counters, "Effective Physical BER");
    match parse_float("effective_physical_ber", &eff_ber) {
        Ok(v) => evals.push(evaluate_field(
            device,
            &NormalizedField::float("effective_physical_ber", v),
            &Expectation::UpperBound {
                fail: EFFECTIVE_BER_BOUND,
            },
        )),
        Err(e) => evals.push(Evaluation::fail(
            device,
            "effective_physical_ber",
            e.to_string(),
        )),
    }

    // Per-lane errors degrade to WARN, not FAIL: elevated lane counters
    // predict trouble but do not prove a bad link on their own.
    let lanes = counters
        .and_then(|c| c.get("Raw Physical Errors Per Lane"))
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    match parse_lane_counters(&lanes) {
        LaneCounters::Parsed(values) => {
            if values
                .iter()
                .any(|v| *v >= expect.raw_physical_errors_per_lane)
            {
                let summary: Vec<String> = values.iter().map(i64::to_string).collect();
                evals.push(Evaluation::warn(
                    device,
                    "raw_physical_errors_per_lane",
                    summary.join(" "),
                ));
            } else {
                evals.push(Evaluation::pass(device, "raw_physical_errors_per_lane"));
            }
        }
        LaneCounters::Unparseable => evals.push(Evaluation::warn(
            device,
            "raw_physical_errors_per_lane",
            "unparseable lane counters",
        )),
    }

    let raw_ber = section_str(counters, "Raw Physical BER");
    match parse_float("raw_physical_ber", &raw_ber) {
        Ok(v) => evals.push(evaluate_field(
            device,
            &NormalizedField::float("raw_physical_ber", v),
            &Expectation::UpperBound { fail: RAW_BER_BOUND },
        )),
        Err(e) => evals.push(Evaluation::fail(device, "raw_physical_ber", e.to_string())),
    }

    evals
}

async fn probe_device(
    runner: &dyn CommandRunner,
    device: &str,
    timeout: Duration,
    expect: &LinkExpectations,
) -> Result<Vec<Evaluation>, CheckError> {
    let cmd = ProbeCommand::new(
        "mlxlink",
        [
            "-d",
            device,
            "--json",
            "--show_module",
            "--show_counters",
            "--show_eye",
        ],
    )
    .with_timeout(timeout);

    let output = runner.run(&cmd).await?;
    if output.timed_out {
        return Ok(fail_all_fields(device, "link-diagnostic probe timed out"));
    }

    // The tool exits non-zero on degraded links but still emits JSON on
    // stdout; classification happens on the payload, not the exit code.
    let raw = if output.stdout.trim().is_empty() {
        output.stderr.clone()
    } else {
        output.stdout.clone()
    };
    if raw.trim().is_empty() {
        return Ok(fail_all_fields(
            device,
            &format!("no output for device {}", device),
        ));
    }

    Ok(evaluate_link_output(device, &raw, expect))
}

#[async_trait]
impl HealthCheck for LinkCheck {
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

        let expect = match LinkExpectations::from_definition(def) {
            Ok(expect) => expect,
            Err(e) => return CheckReport::from_error(CHECK_NAME, &def.category, &e),
        };

        let expected_devices = match ctx.hardware() {
            Some(hw) if !hw.rdma_device_names().is_empty() => hw.rdma_device_names(),
            _ => {
                return CheckReport::skip(
                    CHECK_NAME,
                    &def.category,
                    format!("no RDMA devices defined for shape {}", ctx.shape),
                )
            }
        };

        let timeout = ctx.timeout_for(def);

        // Mapping is rebuilt every run; driver state can change between runs
        let map = match crate::mapper::load_interface_map(ctx.runner, timeout).await {
            Ok(map) => map,
            Err(e) => return CheckReport::from_error(CHECK_NAME, &def.category, &e),
        };
        if map.timed_out() {
            // An empty map here says nothing about the devices themselves
            let evals = expected_devices
                .iter()
                .flat_map(|device| fail_all_fields(device, "interface mapping probe timed out"))
                .collect();
            return CheckReport::aggregate(CHECK_NAME, &def.category, evals);
        }

        let resolved = map.resolve(&expected_devices);

        let expect = &expect;
        let probes = resolved.iter().map(|mapped| async move {
            let evals = match &mapped.interface {
                Some(_) => {
                    match probe_device(ctx.runner, &mapped.device, timeout, expect).await {
                        Ok(evals) => Ok(evals),
                        Err(e) if e.is_execution_error() => Err(e),
                        Err(e) => Ok(fail_all_fields(&mapped.device, &e.to_string())),
                    }
                }
                None => Ok(fail_all_fields(
                    &mapped.device,
                    &format!("device {} not found", mapped.device),
                )),
            };
            (mapped.device.clone(), evals)
        });
        let mut results = join_all(probes).await;

        // Aggregation keyed by device identity, not arrival order
        results.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut evals = Vec::new();
        for (_, result) in results {
            match result {
                Ok(device_evals) => evals.extend(device_evals),
                Err(e) => return CheckReport::from_error(CHECK_NAME, &def.category, &e),
            }
        }

        CheckReport::aggregate(CHECK_NAME, &def.category, evals)
            .with_detail("expected_devices", expected_devices.len().into())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::context;
    use super::*;
    use crate::exec::{MockRunner, ProbeOutput};
    use crate::report::HealthStatus;

    const IBDEV_BOTH: &str = "\
mlx5_0 port 1 ==> rdma0 (Up)
mlx5_1 port 1 ==> rdma1 (Up)
";

    fn healthy_mlxlink() -> String {
        serde_json::json!({
            "result": {
                "output": {
                    "Operational Info": {
                        "Speed": "200G",
                        "State": "Active",
                        "Physical state": "LinkUp"
                    },
                    "Troubleshooting Info": {
                        "Status Opcode": "0",
                        "Recommendation": "No issue was observed"
                    },
                    "Physical Counters and BER Info": {
                        "Effective Physical Errors": "0",
                        "Effective Physical BER": "1e-15",
                        "Raw Physical Errors Per Lane": ["0", "0", "undefined", "0"],
                        "Raw Physical BER": "1e-9"
                    }
                }
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_healthy_links_pass() {
        let runner = MockRunner::new();
        runner.enqueue_stdout("ibdev2netdev", IBDEV_BOTH);
        runner.enqueue_stdout("mlxlink", healthy_mlxlink());
        runner.enqueue_stdout("mlxlink", healthy_mlxlink());
        let ctx = context(&runner);

        let report = LinkCheck.run(&ctx).await;
        assert_eq!(report.status, HealthStatus::Pass);
    }

    #[tokio::test]
    async fn test_missing_device_fails_loudly() {
        // Mapper only knows mlx5_0; mlx5_1 must still appear, as failures
        let runner = MockRunner::new();
        runner.enqueue_stdout("ibdev2netdev", "mlx5_0 port 1 ==> rdma0 (Up)\n");
        runner.enqueue_stdout("mlxlink", healthy_mlxlink());
        let ctx = context(&runner);

        let report = LinkCheck.run(&ctx).await;
        assert_eq!(report.status, HealthStatus::Fail);
        assert!(report.message.contains("device mlx5_1 not found"));
    }

    #[tokio::test]
    async fn test_malformed_json_is_parse_fail_not_crash() {
        let runner = MockRunner::new();
        runner.enqueue_stdout("ibdev2netdev", IBDEV_BOTH);
        runner.enqueue_stdout("mlxlink", "this is not json at all");
        runner.enqueue_stdout("mlxlink", healthy_mlxlink());
        let ctx = context(&runner);

        let report = LinkCheck.run(&ctx).await;
        assert_eq!(report.status, HealthStatus::Fail);
        assert!(report.message.contains("unable to parse"));
    }

    #[tokio::test]
    async fn test_json_with_error_banner_still_parses() {
        let runner = MockRunner::new();
        runner.enqueue_stdout("ibdev2netdev", IBDEV_BOTH);
        runner.enqueue_stdout(
            "mlxlink",
            format!("Error: mlxlink exited 1\n{}", healthy_mlxlink()),
        );
        runner.enqueue_stdout("mlxlink", healthy_mlxlink());
        let ctx = context(&runner);

        let report = LinkCheck.run(&ctx).await;
        assert_eq!(report.status, HealthStatus::Pass);
    }

    #[tokio::test]
    async fn test_wrong_speed_fails_with_expected_value() {
        let mut payload: serde_json::Value =
            serde_json::from_str(&healthy_mlxlink()).unwrap();
        payload["result"]["output"]["Operational Info"]["Speed"] = "100G".into();

        let runner = MockRunner::new();
        runner.enqueue_stdout("ibdev2netdev", IBDEV_BOTH);
        runner.enqueue_stdout("mlxlink", payload.to_string());
        runner.enqueue_stdout("mlxlink", healthy_mlxlink());
        let ctx = context(&runner);

        let report = LinkCheck.run(&ctx).await;
        assert_eq!(report.status, HealthStatus::Fail);
        assert!(report.message.contains("100G, expected 200G"));
    }

    #[tokio::test]
    async fn test_lane_errors_at_threshold_warn() {
        let mut payload: serde_json::Value =
            serde_json::from_str(&healthy_mlxlink()).unwrap();
        payload["result"]["output"]["Physical Counters and BER Info"]
            ["Raw Physical Errors Per Lane"] = serde_json::json!(["10000", "3"]);

        let runner = MockRunner::new();
        runner.enqueue_stdout("ibdev2netdev", IBDEV_BOTH);
        runner.enqueue_stdout("mlxlink", payload.to_string());
        runner.enqueue_stdout("mlxlink", healthy_mlxlink());
        let ctx = context(&runner);

        let report = LinkCheck.run(&ctx).await;
        assert_eq!(report.status, HealthStatus::Warn);
        assert!(report.message.contains("raw_physical_errors_per_lane"));
    }

    #[tokio::test]
    async fn test_effective_errors_at_threshold_fail() {
        // Threshold in the test limits is 1; exactly 1 must FAIL
        let mut payload: serde_json::Value =
            serde_json::from_str(&healthy_mlxlink()).unwrap();
        payload["result"]["output"]["Physical Counters and BER Info"]
            ["Effective Physical Errors"] = "1".into();

        let runner = MockRunner::new();
        runner.enqueue_stdout("ibdev2netdev", IBDEV_BOTH);
        runner.enqueue_stdout("mlxlink", payload.to_string());
        runner.enqueue_stdout("mlxlink", healthy_mlxlink());
        let ctx = context(&runner);

        let report = LinkCheck.run(&ctx).await;
        assert_eq!(report.status, HealthStatus::Fail);
        assert!(report.message.contains("effective_physical_errors"));
    }

    #[tokio::test]
    async fn test_unparseable_ber_is_fail_not_zero() {
        let mut payload: serde_json::Value =
            serde_json::from_str(&healthy_mlxlink()).unwrap();
        payload["result"]["output"]["Physical Counters and BER Info"]
            ["Effective Physical BER"] = "N/A".into();

        let runner = MockRunner::new();
        runner.enqueue_stdout("ibdev2netdev", IBDEV_BOTH);
        runner.enqueue_stdout("mlxlink", payload.to_string());
        runner.enqueue_stdout("mlxlink", healthy_mlxlink());
        let ctx = context(&runner);

        let report = LinkCheck.run(&ctx).await;
        assert_eq!(report.status, HealthStatus::Fail);
        assert!(report.message.contains("effective_physical_ber"));
    }

    #[tokio::test]
    async fn test_mapper_binary_missing_is_error() {
        let runner = MockRunner::new();
        let ctx = context(&runner);

        let report = LinkCheck.run(&ctx).await;
        assert_eq!(report.status, HealthStatus::Error);
    }

    #[tokio::test]
    async fn test_mapper_timeout_is_named_not_device_missing() {
        let runner = MockRunner::new();
        runner.enqueue(
            "ibdev2netdev",
            ProbeOutput::timeout(std::time::Duration::from_secs(5)),
        );
        let ctx = context(&runner);

        let report = LinkCheck.run(&ctx).await;
        assert_eq!(report.status, HealthStatus::Fail);
        assert!(report.message.contains("interface mapping probe timed out"));
        assert!(!report.message.contains("not found"));
    }

    #[tokio::test]
    async fn test_probe_timeout_fails_device() {
        let runner = MockRunner::new();
        runner.enqueue_stdout("ibdev2netdev", IBDEV_BOTH);
        runner.enqueue(
            "mlxlink",
            ProbeOutput::timeout(std::time::Duration::from_secs(5)),
        );
        runner.enqueue_stdout("mlxlink", healthy_mlxlink());
        let ctx = context(&runner);

        let report = LinkCheck.run(&ctx).await;
        assert_eq!(report.status, HealthStatus::Fail);
        assert!(report.message.contains("timed out"));
    }
}
