//! Health check family
//!
//! Each check is a declarative specialization of the shared engine: it pulls
//! its expectations from the shape limits, probes through the injected
//! command runner, normalizes the output, and folds the evaluations into a
//! `CheckReport`. One check's failure never aborts its siblings.

mod cable;
mod gpu_count;
mod gpu_mode;
mod link;
mod nvlink;
mod pcie_width;
mod rdma_count;
mod row_remap;
mod rx_discards;
mod xid;

pub use cable::CdfpCableCheck;
pub use gpu_count::GpuCountCheck;
pub use gpu_mode::GpuModeCheck;
pub use link::LinkCheck;
pub use nvlink::NvlinkSpeedCheck;
pub use pcie_width::PcieWidthCheck;
pub use rdma_count::RdmaNicCountCheck;
pub use row_remap::RowRemapCheck;
pub use rx_discards::RxDiscardsCheck;
pub use xid::GpuXidCheck;

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::exec::CommandRunner;
use crate::limits::{CheckDefinition, ShapeLimits};
use crate::report::CheckReport;
use crate::shapes::{ShapeCatalog, ShapeHardware};

/// Shared, read-only inputs for one check run
pub struct CheckContext<'a> {
    /// Shape being evaluated
    pub shape: String,
    /// Per-shape check configuration
    pub limits: &'a ShapeLimits,
    /// Shape hardware profiles
    pub catalog: &'a ShapeCatalog,
    /// Probe execution seam
    pub runner: &'a dyn CommandRunner,
    /// Timeout applied to each probe
    pub probe_timeout: Duration,
}

impl<'a> CheckContext<'a> {
    /// Definition of the named check for the current shape; None means the
    /// check is unconfigured or disabled and must SKIP.
    pub fn enabled_definition(&self, check: &str) -> Option<&'a CheckDefinition> {
        self.limits
            .definition(&self.shape, check)
            .filter(|def| def.enabled)
    }

    /// Hardware profile for the current shape
    pub fn hardware(&self) -> Option<&'a ShapeHardware> {
        self.catalog.hardware(&self.shape)
    }

    /// Probe timeout for one check: per-check override, else the run default
    pub fn timeout_for(&self, def: &CheckDefinition) -> Duration {
        def.timeout.unwrap_or(self.probe_timeout)
    }
}

/// One named health check
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Stable check name used in configuration and reports
    fn name(&self) -> &'static str;

    /// Run the check to completion. Implementations never return an error;
    /// execution problems become an ERROR-status report.
    async fn run(&self, ctx: &CheckContext<'_>) -> CheckReport;
}

impl std::fmt::Debug for dyn HealthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheck")
            .field("name", &self.name())
            .finish()
    }
}

/// The full built-in check battery, in reporting order
pub fn default_checks() -> Vec<Box<dyn HealthCheck>> {
    vec![
        Box::new(GpuCountCheck),
        Box::new(GpuModeCheck),
        Box::new(NvlinkSpeedCheck),
        Box::new(RowRemapCheck),
        Box::new(RdmaNicCountCheck),
        Box::new(LinkCheck),
        Box::new(RxDiscardsCheck),
        Box::new(GpuXidCheck),
        Box::new(PcieWidthCheck),
        Box::new(CdfpCableCheck),
    ]
}

/// Run every check sequentially, isolating failures to the failing check
pub async fn run_all(ctx: &CheckContext<'_>, checks: &[Box<dyn HealthCheck>]) -> Vec<CheckReport> {
    let mut reports = Vec::with_capacity(checks.len());
    for check in checks {
        info!(check = check.name(), "Running health check");
        let report = check.run(ctx).await;
        info!(
            check = check.name(),
            status = %report.status,
            "Health check complete"
        );
        reports.push(report);
    }
    reports
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::exec::MockRunner;
    use once_cell::sync::Lazy;

    pub const SHAPE: &str = "BM.GPU.H100.8";

    pub static LIMITS: Lazy<ShapeLimits> = Lazy::new(|| {
        ShapeLimits::from_json(
            r#"{
            "test_limits": {
                "BM.GPU.H100.8": {
                    "gpu_count_check": {"enabled": true, "test_category": "LEVEL_1"},
                    "gpu_mode_check": {
                        "enabled": true,
                        "test_category": "LEVEL_1",
                        "threshold": {"allowed_modes": ["Disabled", "N/A"]}
                    },
                    "nvlink_speed_check": {
                        "enabled": true,
                        "test_category": "LEVEL_1",
                        "threshold": {"speed": 26, "count": 2}
                    },
                    "row_remap_error_check": {
                        "enabled": true,
                        "test_category": "LEVEL_1",
                        "threshold": 0
                    },
                    "rdma_nic_count_check": {"enabled": true, "test_category": "LEVEL_1"},
                    "link_check": {
                        "enabled": true,
                        "test_category": "LEVEL_1",
                        "threshold": {
                            "speed": "200G",
                            "effective_physical_errors": 1,
                            "raw_physical_errors_per_lane": 10000
                        }
                    },
                    "rx_discards_check": {
                        "enabled": true,
                        "test_category": "LEVEL_1",
                        "threshold": 100
                    },
                    "gpu_xid_check": {"enabled": true, "test_category": "LEVEL_1"},
                    "pcie_width_check": {
                        "enabled": true,
                        "test_category": "LEVEL_1",
                        "threshold": {
                            "nvidia": {
                                "width": {"x2": 1, "x16": 2},
                                "speed": {"16GT/s": 1, "32GT/s": 2}
                            },
                            "mellanox": {
                                "width": {"x16": 2},
                                "speed": {"32GT/s": 2}
                            }
                        }
                    },
                    "cdfp_cable_check": {"enabled": true, "test_category": "LEVEL_1"}
                }
            }
        }"#,
        )
        .expect("test limits must parse")
    });

    pub static CATALOG: Lazy<ShapeCatalog> = Lazy::new(|| {
        ShapeCatalog::from_json(
            r#"{
            "hpc-shapes": [
                {
                    "shape": "BM.GPU.H100.8",
                    "gpu": [
                        {"pci": "0000:0F:00.0", "model": "NVIDIA H100", "id": 0, "module_id": 2},
                        {"pci": "0000:2D:00.0", "model": "NVIDIA H100", "id": 1, "module_id": 4}
                    ],
                    "rdma-nics": [
                        {"pci": "0000:0C:00.0", "interface": "rdma0", "device_name": "mlx5_0", "model": "Mellanox Technologies MT2910"},
                        {"pci": "0000:0C:00.1", "interface": "rdma1", "device_name": "mlx5_1", "model": "Mellanox Technologies MT2910"}
                    ]
                }
            ]
        }"#,
        )
        .expect("test catalog must parse")
    });

    pub fn context<'a>(runner: &'a MockRunner) -> CheckContext<'a> {
        CheckContext {
            shape: SHAPE.to_string(),
            limits: &LIMITS,
            catalog: &CATALOG,
            runner,
            probe_timeout: Duration::from_secs(5),
        }
    }
}
