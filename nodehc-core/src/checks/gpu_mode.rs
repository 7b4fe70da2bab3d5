//! GPU MIG mode check
//!
//! Workloads on these shapes expect full-GPU exclusivity, so MIG partitioning
//! must be off. Queries each GPU's current MIG mode and fails any GPU whose
//! mode is outside the allowed list (by default "Disabled" or "N/A" for GPUs
//! without MIG support).

use async_trait::async_trait;

use super::{CheckContext, HealthCheck};
use crate::exec::ProbeCommand;
use crate::limits::CheckDefinition;
use crate::report::{CheckReport, Evaluation};

const CHECK_NAME: &str = "gpu_mode_check";

fn allowed_modes(def: &CheckDefinition) -> Vec<String> {
    def.threshold_key_strings("allowed_modes")
        .filter(|modes| !modes.is_empty())
        .unwrap_or_else(|| vec!["Disabled".to_string(), "N/A".to_string()])
}

/// Evaluate `index, mig.mode.current` CSV rows against the allowed modes
fn evaluate_modes(lines: &[&str], allowed: &[String]) -> Vec<Evaluation> {
    let mut evals = Vec::new();
    for line in lines {
        let mut fields = line.split(',').map(str::trim);
        let (Some(index), Some(mode)) = (fields.next(), fields.next()) else {
            evals.push(Evaluation::fail(
                "node",
                "mig_mode",
                format!("malformed mode row: {}", line),
            ));
            continue;
        };
        let device = format!("gpu{}", index);
        if allowed.iter().any(|a| a.eq_ignore_ascii_case(mode)) {
            evals.push(Evaluation::pass(device, "mig_mode"));
        } else {
            evals.push(Evaluation::fail(
                device,
                "mig_mode",
                format!("mode {}, expected one of {}", mode, allowed.join(" or ")),
            ));
        }
    }
    evals
}

/// Verifies MIG partitioning is off on every GPU
pub struct GpuModeCheck;

#[async_trait]
impl HealthCheck for GpuModeCheck {
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
        let allowed = allowed_modes(def);

        let cmd = ProbeCommand::new(
            "nvidia-smi",
            ["--query-gpu=index,mig.mode.current", "--format=csv,noheader"],
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
                vec![Evaluation::fail("node", "mig_mode", "GPU mode query timed out")],
            );
        }

        let lines = output.lines();
        if lines.is_empty() {
            return CheckReport::aggregate(
                CHECK_NAME,
                &def.category,
                vec![Evaluation::fail(
                    "node",
                    "mig_mode",
                    "no GPU mode information reported",
                )],
            );
        }

        let evals = evaluate_modes(&lines, &allowed);
        CheckReport::aggregate(CHECK_NAME, &def.category, evals)
            .with_detail("gpu_count", lines.len().into())
    }
}
