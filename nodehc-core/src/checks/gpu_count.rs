//! GPU count check
//!
//! Queries the GPU tool for the installed devices and compares both count
//! and PCI identity against the shape profile. A shortfall and an identity
//! mismatch are reported differently; they imply different remediation.

use async_trait::async_trait;
use tracing::debug;

use super::{CheckContext, HealthCheck};
use crate::evaluate::evaluate_identity_set;
use crate::exec::ProbeCommand;
use crate::normalize::normalize_pci_address;
use crate::report::{CheckReport, Evaluation};

const CHECK_NAME: &str = "gpu_count_check";

/// Compares discovered GPUs against the shape's expected inventory
pub struct GpuCountCheck;

/// Parse `nvidia-smi --query-gpu=index,pci.bus_id --format=csv,noheader`
/// into normalized PCI addresses, in index order.
fn parse_gpu_pci_addresses(lines: &[&str]) -> Vec<String> {
    let mut addresses = Vec::new();
    for line in lines {
        let mut fields = line.split(',').map(str::trim);
        let index = fields.next();
        let pci = fields.next();
        match (index, pci) {
            (Some(_), Some(pci)) if !pci.is_empty() => {
                addresses.push(normalize_pci_address(pci));
            }
            _ => debug!(line = %line, "Skipping malformed nvidia-smi CSV row"),
        }
    }
    addresses
}

#[async_trait]
impl HealthCheck for GpuCountCheck {
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

        let cmd = ProbeCommand::new(
            "nvidia-smi",
            ["--query-gpu=index,pci.bus_id", "--format=csv,noheader"],
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
                    "gpu_query",
                    "GPU query timed out",
                )],
            );
        }

        let actual = parse_gpu_pci_addresses(&output.lines());
        if actual.is_empty() {
            // No data is never conflated with a good state
            return CheckReport::aggregate(
                CHECK_NAME,
                &def.category,
                vec![Evaluation::fail(
                    "node",
                    "gpu_count",
                    format!("no GPUs reported, expected {}", expected.len()),
                )],
            )
            .with_detail("expected_count", expected.len().into());
        }

        let eval = evaluate_identity_set("node", "gpu_count", &expected, &actual);
        CheckReport::aggregate(CHECK_NAME, &def.category, vec![eval])
            .with_detail("expected_count", expected.len().into())
            .with_detail("actual_count", actual.len().into())
    }
}
