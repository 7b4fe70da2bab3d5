//! NodeHC Core Library
//!
//! Health-check engine for GPU compute nodes. This crate provides the probe
//! executor, device mapping, output normalization, threshold evaluation, and
//! result aggregation; the built-in check battery is composed from those
//! pieces and driven entirely by per-shape configuration.

pub mod checks;
pub mod error;
pub mod evaluate;
pub mod exec;
pub mod limits;
pub mod mapper;
pub mod normalize;
pub mod report;
pub mod shapes;

// Re-export common types
pub use checks::{default_checks, run_all, CheckContext, HealthCheck};
pub use error::CheckError;
pub use exec::{CommandRunner, MockRunner, ProbeCommand, ProbeOutput, SystemRunner};
pub use limits::{CheckDefinition, ShapeLimits};
pub use report::{CheckReport, Evaluation, HealthStatus};
pub use shapes::{ShapeCatalog, ShapeHardware};
