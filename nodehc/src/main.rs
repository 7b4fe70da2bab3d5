//! NodeHC
//!
//! One-shot hardware health checker for GPU compute nodes. Loads the shape's
//! check configuration and hardware profile, runs the enabled check battery
//! against the live system tools, and prints one report per check. The exit
//! code encodes the worst outcome so fleet tooling can triage without
//! parsing output.

mod cli;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, OutputFormat};
use nodehc_core::checks::{default_checks, run_all, CheckContext, HealthCheck};
use nodehc_core::exec::SystemRunner;
use nodehc_core::report::{CheckReport, HealthStatus};
use nodehc_core::{ShapeCatalog, ShapeLimits};

/// Initialize the tracing/logging subsystem
fn init_logging(log_level: &str, json_format: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// Top-level document emitted for one run
#[derive(Debug, Serialize)]
struct RunDocument {
    shape: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    timestamp: String,
    reports: Vec<CheckReport>,
}

/// Resolve a config file: explicit flag wins, then the working directory,
/// then the system location.
fn resolve_config_path(explicit: Option<PathBuf>, file_name: &str) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    let cwd_candidate = PathBuf::from(file_name);
    if cwd_candidate.exists() {
        return Ok(cwd_candidate);
    }
    let system_candidate = PathBuf::from("/etc/nodehc").join(file_name);
    if system_candidate.exists() {
        return Ok(system_candidate);
    }
    anyhow::bail!(
        "{} not found in the working directory or /etc/nodehc, use the corresponding flag",
        file_name
    )
}

/// Node name for the run document: explicit flag, then the kernel hostname
fn node_name(explicit: Option<String>) -> Option<String> {
    explicit.or_else(|| {
        std::fs::read_to_string("/proc/sys/kernel/hostname")
            .ok()
            .map(|h| h.trim().to_string())
    })
}

/// Keep only the checks named on the command line; unknown names are an
/// input error, not a silent no-op.
fn select_checks(
    all: Vec<Box<dyn HealthCheck>>,
    requested: &[String],
) -> Result<Vec<Box<dyn HealthCheck>>> {
    if requested.is_empty() {
        return Ok(all);
    }
    let known: Vec<&str> = all.iter().map(|c| c.name()).collect();
    for name in requested {
        if !known.contains(&name.as_str()) {
            anyhow::bail!(
                "unknown check '{}', available: {}",
                name,
                known.join(", ")
            );
        }
    }
    Ok(all
        .into_iter()
        .filter(|c| requested.iter().any(|r| r == c.name()))
        .collect())
}

/// Exit code: any ERROR beats any FAIL beats a clean run
fn exit_code(reports: &[CheckReport]) -> i32 {
    if reports.iter().any(|r| r.status == HealthStatus::Error) {
        2
    } else if reports.iter().any(|r| r.status == HealthStatus::Fail) {
        1
    } else {
        0
    }
}

fn render_table(reports: &[CheckReport]) -> String {
    let name_width = reports
        .iter()
        .map(|r| r.name.len())
        .max()
        .unwrap_or(0)
        .max("CHECK".len());
    let mut out = format!("{:<name_width$}  {:<6}  MESSAGE\n", "CHECK", "STATUS");
    for report in reports {
        out.push_str(&format!(
            "{:<name_width$}  {:<6}  {}\n",
            report.name,
            report.status.to_string(),
            report.message
        ));
    }
    out
}

async fn run(cli: Cli) -> Result<Vec<CheckReport>> {
    let limits_path = resolve_config_path(cli.limits.clone(), "test_limits.json")?;
    let shapes_path = resolve_config_path(cli.shapes.clone(), "shapes.json")?;
    let limits = ShapeLimits::from_file(&limits_path)
        .with_context(|| format!("failed to load limits from {:?}", limits_path))?;
    let catalog = ShapeCatalog::from_file(&shapes_path)
        .with_context(|| format!("failed to load shape profiles from {:?}", shapes_path))?;

    let runner = SystemRunner::new();
    let ctx = CheckContext {
        shape: cli.shape.clone(),
        limits: &limits,
        catalog: &catalog,
        runner: &runner,
        probe_timeout: cli.probe_timeout,
    };

    info!(shape = %cli.shape, "Starting health check run");
    let checks = select_checks(default_checks(), &cli.checks)?;
    Ok(run_all(&ctx, &checks).await)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(&cli.log_level, cli.log_json);

    let shape = cli.shape.clone();
    let output = cli.output;
    let hostname = node_name(cli.node_name.clone());
    let reports = run(cli).await?;

    match output {
        OutputFormat::Json => {
            let document = RunDocument {
                shape,
                hostname,
                timestamp: Utc::now().to_rfc3339(),
                reports,
            };
            println!("{}", serde_json::to_string_pretty(&document)?);
            std::process::exit(exit_code(&document.reports));
        }
        OutputFormat::Table => {
            print!("{}", render_table(&reports));
            std::process::exit(exit_code(&reports));
        }
    }
}
