//! Row remap failure check
//!
//! Queries per-GPU remapped-rows failure counters. A remap failure means the
//! GPU retired memory rows due to errors and could not remap them, which is
//! a hardware health signal on its own; the allowed count defaults to zero.
//! Every expected GPU must appear in the query output.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use super::{CheckContext, HealthCheck};
use crate::exec::ProbeCommand;
use crate::normalize::{normalize_pci_address, parse_counter};
use crate::report::{CheckReport, Evaluation};

const CHECK_NAME: &str = "row_remap_error_check";

/// Failure counts keyed by normalized PCI address; an unparseable counter is
/// carried as an error string, never as zero.
fn parse_failure_counts(lines: &[&str]) -> BTreeMap<String, Result<i64, String>> {
    let mut counts = BTreeMap::new();
    for line in lines {
        // The tool interleaves error banners with CSV rows on some drivers
        if line.starts_with("Error:") {
            continue;
        }
        let mut fields = line.split(',').map(str::trim);
        let (Some(bus_id), Some(raw)) = (fields.next(), fields.next()) else {
            debug!(line = %line, "Skipping malformed remapped-rows row");
            continue;
        };
        let pci = normalize_pci_address(bus_id);
        let count = parse_counter("remapped_rows.failure", raw).map_err(|e| e.to_string());
        counts.insert(pci, count);
    }
    counts
}

/// Flags GPUs with remapped-row failures
pub struct RowRemapCheck;

#[async_trait]
impl HealthCheck for RowRemapCheck {
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

        let expected = match ctx.hardware() {
            Some(hw) if !hw.gpu_pci_addresses().is_empty() => hw.gpu_pci_addresses(),
            _ => {
                return CheckReport::skip(
                    CHECK_NAME,
                    &def.category,
                    format!("no GPU inventory defined for shape {}", ctx.shape),
                )
            }
        };

        // Highest acceptable failure count; any count beyond it fails the GPU
        let allowed = def
            .threshold_f64()
            .or_else(|| def.threshold_key_f64("minimum-error"))
            .unwrap_or(0.0) as i64;

        let cmd = ProbeCommand::new(
            "nvidia-smi",
            [
                "--query-remapped-rows=gpu_bus_id,remapped_rows.failure",
                "--format=csv,noheader",
            ],
        )
        .with_timeout(ctx.timeout_for(def));

        let output = match ctx.runner.run(&cmd).await {
            Ok(output) => output,
            Err(e) => return CheckReport::from_error(CHECK_NAME, &def.category, &e),
        };
        if output.timed_out {
            return CheckReport::aggregate(
                CHECK_NAME,
                &def.category,
                vec![Evaluation::fail(
                    "node",
                    "row_remap",
                    "remapped-rows query timed out",
                )],
            );
        }

        let counts = parse_failure_counts(&output.lines());
        let mut evals = Vec::with_capacity(expected.len());
        for pci in &expected {
            match counts.get(pci) {
                None => evals.push(Evaluation::fail(
                    pci.clone(),
                    "row_remap",
                    "no remapped-rows data for expected GPU",
                )),
                Some(Err(detail)) => {
                    evals.push(Evaluation::fail(pci.clone(), "row_remap", detail.clone()))
                }
                Some(Ok(count)) if *count > allowed => evals.push(Evaluation::fail(
                    pci.clone(),
                    "row_remap",
                    format!("{} remapped-row failures (allowed {})", count, allowed),
                )),
                Some(Ok(_)) => evals.push(Evaluation::pass(pci.clone(), "row_remap")),
            }
        }

        CheckReport::aggregate(CHECK_NAME, &def.category, evals)
            .with_detail("expected_count", expected.len().into())
            .with_detail("reported_count", counts.len().into())
    }
}
