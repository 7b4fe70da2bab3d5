//! CDFP cable check
//!
//! On SXM platforms each GPU's PCI address must land on a specific physical
//! module slot; a swapped cable shows up as a GPU answering at the right
//! address with the wrong module ID. The detailed GPU query reports both,
//! and the pairing is compared against the shape profile.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use super::{CheckContext, HealthCheck};
use crate::exec::ProbeCommand;
use crate::normalize::{normalize_pci_address, parse_key_value_lines};
use crate::report::{CheckReport, Evaluation};

const CHECK_NAME: &str = "cdfp_cable_check";

/// Verifies GPU PCI address to module slot pairing
pub struct CdfpCableCheck;

/// Extract (normalized PCI, module id) pairs from `nvidia-smi -q` output.
///
/// Bus Id and Module Id lines appear once per GPU section, in the same
/// order, so pairing by position is sound. A missing Module Id column
/// (older driver) yields positional IDs starting at 1, matching the tool's
/// own numbering.
fn parse_gpu_pairing(lines: &[&str]) -> Result<Vec<(String, String)>, String> {
    let mut bus_ids = Vec::new();
    let mut module_ids = Vec::new();
    for (key, value) in parse_key_value_lines(lines) {
        if key.eq_ignore_ascii_case("busid") && !value.is_empty() {
            bus_ids.push(normalize_pci_address(&value));
        } else if key.eq_ignore_ascii_case("moduleid")
            && !value.is_empty()
            && value != "N/A"
            && value != "[NotSupported]"
        {
            module_ids.push(value);
        }
    }

    if bus_ids.is_empty() {
        return Err("no GPU bus IDs in detailed query output".to_string());
    }
    if module_ids.is_empty() {
        debug!("No module IDs reported, falling back to positional numbering");
        module_ids = (1..=bus_ids.len()).map(|i| i.to_string()).collect();
    }
    if bus_ids.len() != module_ids.len() {
        return Err(format!(
            "bus ID count ({}) does not match module ID count ({})",
            bus_ids.len(),
            module_ids.len()
        ));
    }

    Ok(bus_ids.into_iter().zip(module_ids).collect())
}

#[async_trait]
impl HealthCheck for CdfpCableCheck {
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
            Some(hw) if !hw.gpu_module_pairing().is_empty() => hw.gpu_module_pairing(),
            _ => {
                return CheckReport::skip(
                    CHECK_NAME,
                    &def.category,
                    format!("no GPU module pairing defined for shape {}", ctx.shape),
                )
            }
        };

        let cmd = ProbeCommand::new("nvidia-smi", ["-q"]).with_timeout(ctx.timeout_for(def));
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
                    "detailed GPU query timed out",
                )],
            );
        }

        let actual: BTreeMap<String, String> = match parse_gpu_pairing(&output.lines()) {
            Ok(pairs) => pairs.into_iter().collect(),
            Err(detail) => {
                return CheckReport::aggregate(
                    CHECK_NAME,
                    &def.category,
                    vec![Evaluation::fail("node", "cdfp_cable", detail)],
                )
            }
        };

        let mut evals = Vec::with_capacity(expected.len());
        for (pci, module) in &expected {
            let expected_module = module.to_string();
            match actual.get(pci) {
                None => evals.push(Evaluation::fail(
                    pci.clone(),
                    "cdfp_cable",
                    "GPU not present at expected address",
                )),
                Some(actual_module) if *actual_module != expected_module => {
                    evals.push(Evaluation::fail(
                        pci.clone(),
                        "cdfp_cable",
                        format!(
                            "cabled to module {}, expected module {}",
                            actual_module, expected_module
                        ),
                    ))
                }
                Some(_) => evals.push(Evaluation::pass(pci.clone(), "cdfp_cable")),
            }
        }

        CheckReport::aggregate(CHECK_NAME, &def.category, evals)
            .with_detail("expected_pairs", expected.len().into())
            .with_detail("actual_pairs", actual.len().into())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::context;
    use super::*;
    use crate::exec::MockRunner;
    use crate::report::HealthStatus;

    const QUERY_OK: &str = "\
GPU 00000000:0F:00.0
    Product Name                          : NVIDIA H100 80GB HBM3
    Bus Id                                : 00000000:0F:00.0
    Module Id                             : 2
GPU 00000000:2D:00.0
    Product Name                          : NVIDIA H100 80GB HBM3
    Bus Id                                : 00000000:2D:00.0
    Module Id                             : 4
";

    const QUERY_SWAPPED: &str = "\
GPU 00000000:0F:00.0
    Bus Id                                : 00000000:0F:00.0
    Module Id                             : 4
GPU 00000000:2D:00.0
    Bus Id                                : 00000000:2D:00.0
    Module Id                             : 2
";

    #[test]
    fn test_parse_pairing_normalizes_addresses() {
        let lines: Vec<&str> = QUERY_OK.lines().collect();
        let pairs = parse_gpu_pairing(&lines).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("0000:0f:00.0".to_string(), "2".to_string()),
                ("0000:2d:00.0".to_string(), "4".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_pairing_positional_fallback() {
        let lines = vec!["Bus Id : 00000000:0F:00.0", "Bus Id : 00000000:2D:00.0"];
        let pairs = parse_gpu_pairing(&lines).unwrap();
        assert_eq!(pairs[0].1, "1");
        assert_eq!(pairs[1].1, "2");
    }

    #[test]
    fn test_parse_pairing_count_mismatch_is_error() {
        let lines = vec![
            "Bus Id : 00000000:0F:00.0",
            "Bus Id : 00000000:2D:00.0",
            "Module Id : 2",
        ];
        assert!(parse_gpu_pairing(&lines).is_err());
    }

    #[tokio::test]
    async fn test_correct_pairing_passes() {
        let runner = MockRunner::new();
        runner.enqueue_stdout("nvidia-smi", QUERY_OK);
        let ctx = context(&runner);

        let report = CdfpCableCheck.run(&ctx).await;
        assert_eq!(report.status, HealthStatus::Pass);
    }

    #[tokio::test]
    async fn test_swapped_cables_fail_with_both_modules_named() {
        let runner = MockRunner::new();
        runner.enqueue_stdout("nvidia-smi", QUERY_SWAPPED);
        let ctx = context(&runner);

        let report = CdfpCableCheck.run(&ctx).await;
        assert_eq!(report.status, HealthStatus::Fail);
        assert!(report.message.contains("cabled to module 4"));
        assert!(report.message.contains("expected module 2"));
    }

    #[tokio::test]
    async fn test_absent_gpu_fails() {
        let runner = MockRunner::new();
        runner.enqueue_stdout(
            "nvidia-smi",
            "Bus Id : 00000000:0F:00.0\nModule Id : 2\n",
        );
        let ctx = context(&runner);

        let report = CdfpCableCheck.run(&ctx).await;
        assert_eq!(report.status, HealthStatus::Fail);
        assert!(report.message.contains("not present"));
    }

    #[tokio::test]
    async fn test_no_gpus_in_output_fails() {
        let runner = MockRunner::new();
        runner.enqueue_stdout("nvidia-smi", "Driver Version : 550.54.15\n");
        let ctx = context(&runner);

        let report = CdfpCableCheck.run(&ctx).await;
        assert_eq!(report.status, HealthStatus::Fail);
        assert!(report.message.contains("no GPU bus IDs"));
    }

    #[tokio::test]
    async fn test_missing_tool_is_error() {
        let runner = MockRunner::new();
        let ctx = context(&runner);

        let report = CdfpCableCheck.run(&ctx).await;
        assert_eq!(report.status, HealthStatus::Error);
    }
}
