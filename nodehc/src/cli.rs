//! CLI argument parsing for NodeHC

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

/// Report rendering format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Machine-readable run document
    Json,
    /// Aligned columns for terminals
    Table,
}

/// NodeHC - hardware health checks for GPU compute nodes
#[derive(Debug, Parser)]
#[command(name = "nodehc")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Machine shape to evaluate, e.g. BM.GPU.H100.8
    #[arg(long, env = "NODEHC_SHAPE")]
    pub shape: String,

    /// Path to the per-shape check limits file; defaults to
    /// ./test_limits.json then /etc/nodehc/test_limits.json
    #[arg(long)]
    pub limits: Option<PathBuf>,

    /// Path to the shape hardware profiles file; defaults to
    /// ./shapes.json then /etc/nodehc/shapes.json
    #[arg(long)]
    pub shapes: Option<PathBuf>,

    /// Node name recorded in the run document
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Run only the named checks (repeatable); default is the full battery
    #[arg(long = "check")]
    pub checks: Vec<String>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    pub output: OutputFormat,

    /// Per-probe timeout, e.g. "30s" or "2m"
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub probe_timeout: Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "NODEHC_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "NODEHC_LOG_JSON")]
    pub log_json: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
