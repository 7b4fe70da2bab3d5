//! GPU XID error check
//!
//! Scans the kernel log for NVIDIA XID events. Each event carries a numeric
//! code whose severity comes from a built-in table, overridable per shape
//! through the threshold object (`xid_error_codes`). Critical codes fail the
//! node, warning codes flag it, codes the table does not know are surfaced
//! as warnings rather than dropped.

use std::collections::BTreeMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::{CheckContext, HealthCheck};
use crate::limits::CheckDefinition;
use crate::report::{CheckReport, Evaluation};

const CHECK_NAME: &str = "gpu_xid_check";

/// `NVRM: Xid (PCI:0000:0f:00): 79, GPU has fallen off the bus.`
static XID_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"NVRM: Xid \(PCI:([^)]+)\): (\d+),").expect("static regex must compile")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XidSeverity {
    Critical,
    Warning,
}

#[derive(Debug, Clone)]
struct XidEntry {
    description: &'static str,
    severity: XidSeverity,
}

/// Severity table for codes seen in practice on GPU compute nodes; shapes
/// can extend or override it via configuration.
static XID_TABLE: Lazy<BTreeMap<u32, XidEntry>> = Lazy::new(|| {
    use XidSeverity::{Critical, Warning};
    let entries = [
        (8, "GPU stopped processing", Critical),
        (13, "Graphics Engine Exception", Critical),
        (24, "GPU semaphore timeout", Warning),
        (30, "GPU semaphore access error", Warning),
        (31, "GPU memory page fault", Critical),
        (33, "Internal micro-controller error", Warning),
        (48, "Double Bit ECC Error", Critical),
        (79, "GPU has fallen off the bus", Critical),
        (92, "High single-bit ECC error rate", Critical),
        (94, "Contained ECC error", Critical),
        (95, "Uncontained ECC error", Critical),
        (119, "GSP RPC Timeout", Critical),
        (120, "GSP Error", Critical),
    ];
    entries
        .into_iter()
        .map(|(code, description, severity)| {
            (
                code,
                XidEntry {
                    description,
                    severity,
                },
            )
        })
        .collect()
});

/// Severity override parsed from the threshold object
#[derive(Debug)]
struct ConfiguredEntry {
    description: String,
    severity: XidSeverity,
}

/// Read `threshold.xid_error_codes` overrides, keyed by numeric code
fn configured_overrides(def: &CheckDefinition) -> BTreeMap<u32, ConfiguredEntry> {
    let mut overrides = BTreeMap::new();
    let Some(codes) = def.threshold_key_object("xid_error_codes") else {
        return overrides;
    };
    for (code, entry) in codes {
        let Ok(code) = code.parse::<u32>() else {
            debug!(code = %code, "Ignoring non-numeric XID code in configuration");
            continue;
        };
        let description = entry
            .get("description")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("configured XID code")
            .to_string();
        let severity = match entry.get("severity").and_then(serde_json::Value::as_str) {
            Some(s) if s.eq_ignore_ascii_case("critical") => XidSeverity::Critical,
            _ => XidSeverity::Warning,
        };
        overrides.insert(
            code,
            ConfiguredEntry {
                description,
                severity,
            },
        );
    }
    overrides
}

/// One distinct (code, pci) occurrence group in the log
#[derive(Debug)]
struct XidOccurrence {
    code: u32,
    pci: String,
    count: usize,
}

/// Collapse raw log lines into per-code, per-device occurrence groups
fn collect_occurrences(log: &str) -> Vec<XidOccurrence> {
    let mut groups: BTreeMap<(u32, String), usize> = BTreeMap::new();
    for caps in XID_LINE.captures_iter(log) {
        let pci = caps[1].trim().to_ascii_lowercase();
        if let Ok(code) = caps[2].parse::<u32>() {
            *groups.entry((code, pci)).or_default() += 1;
        }
    }
    groups
        .into_iter()
        .map(|((code, pci), count)| XidOccurrence { code, pci, count })
        .collect()
}

/// Flags XID events reported by the GPU driver in the kernel log
pub struct GpuXidCheck;

#[async_trait]
impl HealthCheck for GpuXidCheck {
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
        let overrides = configured_overrides(def);

        let cmd =
            crate::exec::ProbeCommand::new("dmesg", ["-T"]).with_timeout(ctx.timeout_for(def));
        let output = match ctx.runner.run(&cmd).await {
            Ok(output) => output,
            Err(e) => return CheckReport::from_error(CHECK_NAME, &def.category, &e),
        };

        if output.timed_out {
            return CheckReport::aggregate(
                CHECK_NAME,
                &def.category,
                vec![Evaluation::fail("node", "dmesg", "kernel log probe timed out")],
            );
        }
        if !output.success() {
            return CheckReport::aggregate(
                CHECK_NAME,
                &def.category,
                vec![Evaluation::fail(
                    "node",
                    "dmesg",
                    format!("kernel log query failed (exit {:?})", output.exit_code),
                )],
            );
        }

        if !output.stdout.contains("NVRM: Xid") {
            return CheckReport::aggregate(
                CHECK_NAME,
                &def.category,
                vec![Evaluation::pass("node", "gpu_xid")],
            );
        }

        let occurrences = collect_occurrences(&output.stdout);
        let mut evals = Vec::new();
        let mut critical_count = 0usize;
        for occ in &occurrences {
            let field = format!("xid_{}", occ.code);
            let (description, severity) = match overrides.get(&occ.code) {
                Some(entry) => (entry.description.clone(), entry.severity),
                None => match XID_TABLE.get(&occ.code) {
                    Some(entry) => (entry.description.to_string(), entry.severity),
                    None => {
                        evals.push(Evaluation::warn(
                            &occ.pci,
                            &field,
                            format!("unrecognized XID code ({} occurrences)", occ.count),
                        ));
                        continue;
                    }
                },
            };
            let message = format!("{} ({} occurrences)", description, occ.count);
            match severity {
                XidSeverity::Critical => {
                    critical_count += 1;
                    evals.push(Evaluation::fail(&occ.pci, &field, message));
                }
                XidSeverity::Warning => evals.push(Evaluation::warn(&occ.pci, &field, message)),
            }
        }

        if evals.is_empty() {
            // "NVRM: Xid" appeared but nothing matched the event pattern
            evals.push(Evaluation::warn(
                "node",
                "gpu_xid",
                "XID messages present but none matched the event pattern",
            ));
        }

        CheckReport::aggregate(CHECK_NAME, &def.category, evals)
            .with_detail("distinct_events", occurrences.len().into())
            .with_detail("critical_events", critical_count.into())
    }
}
