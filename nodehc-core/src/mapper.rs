//! Device mapper
//!
//! Resolves RDMA logical device names to OS interface names via the
//! external `ibdev2netdev` listing tool. The mapping is rebuilt on every
//! run; driver state can change between invocations. Missing devices are
//! reported explicitly, never dropped.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::CheckError;
use crate::exec::{CommandRunner, ProbeCommand};

/// One expected device with its resolved interface, if any
#[derive(Debug, Clone)]
pub struct MappedDevice {
    /// Logical device name
    pub device: String,
    /// OS interface name; None means the device was absent from the listing
    pub interface: Option<String>,
}

/// Device-name to interface-name association for one run
#[derive(Debug, Default)]
pub struct InterfaceMap {
    by_device: BTreeMap<String, String>,
    timed_out: bool,
}

impl InterfaceMap {
    /// Parse `ibdev2netdev` output.
    ///
    /// Line format: `mlx5_0 port 1 ==> eth0 (Up)`. The first field is the
    /// device, the fifth is the interface; shorter lines are skipped.
    pub fn parse(output: &str) -> Self {
        let mut by_device = BTreeMap::new();
        for line in output.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() >= 5 {
                by_device.insert(fields[0].to_string(), fields[4].to_string());
            } else if !line.trim().is_empty() {
                debug!(line = %line, "Skipping unrecognized ibdev2netdev line");
            }
        }
        Self {
            by_device,
            timed_out: false,
        }
    }

    /// Whether the listing tool timed out; the map carries no entries then
    /// and callers must not read absence as "device missing".
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Number of devices in the mapping
    pub fn len(&self) -> usize {
        self.by_device.len()
    }

    /// Whether the mapping is empty
    pub fn is_empty(&self) -> bool {
        self.by_device.is_empty()
    }

    /// Interface name for a logical device
    pub fn interface_for(&self, device: &str) -> Option<&str> {
        self.by_device.get(device).map(String::as_str)
    }

    /// Resolve each expected device to an interface.
    ///
    /// Every expected device yields exactly one entry; devices absent from
    /// the listing come back with `interface: None` so the caller can fail
    /// them loudly instead of silently shrinking the result set.
    pub fn resolve(&self, expected: &[String]) -> Vec<MappedDevice> {
        expected
            .iter()
            .map(|device| {
                let interface = self.interface_for(device).map(str::to_string);
                if interface.is_none() {
                    warn!(device = %device, "Expected device not present in interface mapping");
                }
                MappedDevice {
                    device: device.clone(),
                    interface,
                }
            })
            .collect()
    }
}

/// Query the listing tool once and build the interface mapping
pub async fn load_interface_map(
    runner: &dyn CommandRunner,
    timeout: Duration,
) -> Result<InterfaceMap, CheckError> {
    let cmd = ProbeCommand::new("ibdev2netdev", Vec::<String>::new()).with_timeout(timeout);
    let output = runner.run(&cmd).await?;

    if output.timed_out {
        warn!("Interface listing tool timed out, mapping unavailable");
        return Ok(InterfaceMap {
            by_device: BTreeMap::new(),
            timed_out: true,
        });
    }

    let map = InterfaceMap::parse(&output.stdout);
    debug!(devices = map.len(), "Built device-to-interface mapping");
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{MockRunner, ProbeOutput};

    const IBDEV_OUTPUT: &str = "\
mlx5_0 port 1 ==> eth0 (Up)
mlx5_1 port 1 ==> rdma0 (Up)
mlx5_3 port 1 ==> rdma1 (Down)
";

    #[test]
    fn test_parse_mapping() {
        let map = InterfaceMap::parse(IBDEV_OUTPUT);
        assert_eq!(map.len(), 3);
        assert_eq!(map.interface_for("mlx5_1"), Some("rdma0"));
        assert_eq!(map.interface_for("mlx5_9"), None);
    }

    #[test]
    fn test_parse_skips_short_lines() {
        let map = InterfaceMap::parse("garbage\nmlx5_0 port 1 ==> eth0 (Up)\n");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_resolve_keeps_missing_devices() {
        let map = InterfaceMap::parse(IBDEV_OUTPUT);
        let expected = vec!["mlx5_1".to_string(), "mlx5_9".to_string()];
        let resolved = map.resolve(&expected);

        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].interface.as_deref(), Some("rdma0"));
        assert_eq!(resolved[1].device, "mlx5_9");
        assert!(resolved[1].interface.is_none());
    }

    #[tokio::test]
    async fn test_load_interface_map() {
        let runner = MockRunner::new();
        runner.enqueue_stdout("ibdev2netdev", IBDEV_OUTPUT);

        let map = load_interface_map(&runner, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(map.len(), 3);
    }

    #[tokio::test]
    async fn test_load_interface_map_missing_binary() {
        let runner = MockRunner::new();
        let err = load_interface_map(&runner, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::BinaryMissing(_)));
    }

    #[tokio::test]
    async fn test_load_interface_map_timeout_is_flagged() {
        let runner = MockRunner::new();
        runner.enqueue("ibdev2netdev", ProbeOutput::timeout(Duration::from_secs(5)));

        let map = load_interface_map(&runner, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(map.is_empty());
        assert!(map.timed_out());
    }

    #[test]
    fn test_parsed_map_is_not_timed_out() {
        let map = InterfaceMap::parse(IBDEV_OUTPUT);
        assert!(!map.timed_out());
    }
}
