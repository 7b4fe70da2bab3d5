//! RDMA NIC count check
//!
//! Probes each expected PCI address with the bus enumerator and counts the
//! addresses where a recognized RDMA controller answers. Device probes are
//! independent, so they fan out concurrently; results are keyed by PCI
//! address and aggregation stays deterministic.

use async_trait::async_trait;
use futures::future::join_all;
use tracing::debug;

use super::{CheckContext, HealthCheck};
use crate::evaluate::evaluate_count;
use crate::exec::ProbeCommand;
use crate::report::{CheckReport, Evaluation};

const CHECK_NAME: &str = "rdma_nic_count_check";

/// Controller vendor marker in lspci output for supported RDMA NICs
const RDMA_CONTROLLER_MARKER: &str = "Mellanox Technologies";

/// Counts RDMA NICs present at the shape's expected PCI addresses
pub struct RdmaNicCountCheck;

#[async_trait]
impl HealthCheck for RdmaNicCountCheck {
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
            Some(hw) if !hw.rdma_pci_addresses().is_empty() => hw.rdma_pci_addresses(),
            _ => {
                return CheckReport::skip(
                    CHECK_NAME,
                    &def.category,
                    format!("no RDMA NIC inventory defined for shape {}", ctx.shape),
                )
            }
        };

        // One lspci query per expected address, in parallel; each result is
        // (pci, present) so ordering never depends on completion order.
        let timeout = ctx.timeout_for(def);
        let probes = expected.iter().map(|pci| async move {
            let cmd =
                ProbeCommand::new("lspci", ["-s", pci.as_str(), "-v"]).with_timeout(timeout);
            match ctx.runner.run(&cmd).await {
                Ok(output) => {
                    let present = output
                        .lines()
                        .iter()
                        .any(|line| line.contains(RDMA_CONTROLLER_MARKER));
                    (pci.clone(), Ok(present))
                }
                Err(e) => (pci.clone(), Err(e)),
            }
        });
        let results = join_all(probes).await;

        // A missing lspci binary means we could not determine anything
        if let Some((_, Err(e))) = results
            .iter()
            .find(|(_, r)| matches!(r, Err(e) if e.is_execution_error()))
        {
            return CheckReport::from_error(CHECK_NAME, &def.category, e);
        }

        let mut detected = Vec::new();
        let mut missing = Vec::new();
        for (pci, result) in &results {
            match result {
                Ok(true) => detected.push(pci.clone()),
                Ok(false) | Err(_) => {
                    debug!(pci = %pci, "No RDMA controller detected at address");
                    missing.push(pci.clone());
                }
            }
        }

        let mut evals = vec![evaluate_count(
            "node",
            "rdma_nic_count",
            expected.len(),
            detected.len(),
        )];
        for pci in &missing {
            evals.push(Evaluation::fail(
                pci.clone(),
                "rdma_nic",
                "no RDMA controller at expected address",
            ));
        }

        CheckReport::aggregate(CHECK_NAME, &def.category, evals)
            .with_detail("expected_count", expected.len().into())
            .with_detail("detected_count", detected.len().into())
    }
}
