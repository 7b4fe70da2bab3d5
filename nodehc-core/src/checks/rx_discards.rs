//! RX discards check
//!
//! Reads per-priority discard counters from the NIC statistics tool for
//! every RDMA interface of the shape. Any counter at or above the shape
//! threshold fails that interface. Two site variants exist with different
//! interface sets; the threshold object may carry an "interfaces" override
//! so both are expressible without code changes.

use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{CheckContext, HealthCheck};
use crate::evaluate::{evaluate_field, Expectation};
use crate::exec::ProbeCommand;
use crate::normalize::{parse_counter, parse_key_value_lines, NormalizedField};
use crate::report::{CheckReport, Evaluation};

const CHECK_NAME: &str = "rx_discards_check";

/// Counter names that participate in the check
static DISCARD_COUNTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^rx_prio[0-9]+_discards$").expect("static regex must compile"));

/// Checks per-priority RX discard counters on every RDMA interface
pub struct RxDiscardsCheck;

/// Evaluate one interface's statistics lines
fn evaluate_interface(interface: &str, lines: &[&str], threshold: f64) -> Vec<Evaluation> {
    if lines.is_empty() {
        return vec![Evaluation::fail(
            interface,
            "rx_discards",
            "no statistics returned for interface",
        )];
    }

    let mut evals = Vec::new();
    for (key, value) in parse_key_value_lines(lines) {
        if !DISCARD_COUNTER.is_match(&key) {
            continue;
        }
        match parse_counter(&key, &value) {
            Ok(n) => evals.push(evaluate_field(
                interface,
                &NormalizedField::int(&key, n),
                &Expectation::fail_at(threshold),
            )),
            Err(e) => evals.push(Evaluation::fail(interface, &key, e.to_string())),
        }
    }

    if evals.is_empty() {
        // Counters filtered away entirely means the tool answered with
        // something other than the expected statistics
        vec![Evaluation::fail(
            interface,
            "rx_discards",
            "no discard counters in statistics output",
        )]
    } else {
        evals
    }
}

#[async_trait]
impl HealthCheck for RxDiscardsCheck {
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

        let threshold = def
            .threshold_f64()
            .or_else(|| def.threshold_key_f64("threshold"));
        let threshold = match threshold {
            Some(t) => t,
            None => {
                return CheckReport::skip(
                    CHECK_NAME,
                    &def.category,
                    format!("no discard threshold defined for shape {}", ctx.shape),
                )
            }
        };

        // Variant selection: an explicit interface list in the threshold
        // object wins over the shape profile
        let interfaces = def
            .threshold_key_strings("interfaces")
            .unwrap_or_else(|| {
                ctx.hardware()
                    .map(|hw| hw.rdma_interfaces())
                    .unwrap_or_default()
            });
        if interfaces.is_empty() {
            return CheckReport::skip(
                CHECK_NAME,
                &def.category,
                format!("no RDMA interfaces defined for shape {}", ctx.shape),
            );
        }

        let timeout = ctx.timeout_for(def);
        let probes = interfaces.iter().map(|interface| async move {
            let cmd =
                ProbeCommand::new("ethtool", ["-S", interface.as_str()]).with_timeout(timeout);
            (interface.clone(), ctx.runner.run(&cmd).await)
        });
        let mut results = join_all(probes).await;
        results.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut evals = Vec::new();
        for (interface, result) in results {
            match result {
                Ok(output) if output.timed_out => {
                    evals.push(Evaluation::fail(
                        &interface,
                        "rx_discards",
                        "statistics probe timed out",
                    ));
                }
                Ok(output) if !output.success() => {
                    // Interface absent or tool refused: fail this interface,
                    // keep evaluating the rest
                    evals.push(Evaluation::fail(
                        &interface,
                        "rx_discards",
                        format!(
                            "statistics query failed (exit {:?})",
                            output.exit_code
                        ),
                    ));
                }
                Ok(output) => {
                    evals.extend(evaluate_interface(&interface, &output.lines(), threshold));
                }
                Err(e) if e.is_execution_error() => {
                    return CheckReport::from_error(CHECK_NAME, &def.category, &e)
                }
                Err(e) => {
                    evals.push(Evaluation::fail(&interface, "rx_discards", e.to_string()));
                }
            }
        }

        let failed: Vec<String> = evals
            .iter()
            .filter(|e| e.status != crate::report::HealthStatus::Pass)
            .map(|e| e.device.clone())
            .collect();

        CheckReport::aggregate(CHECK_NAME, &def.category, evals)
            .with_detail("interface_count", interfaces.len().into())
            .with_detail("failed_interfaces", serde_json::json!(failed))
    }
}
