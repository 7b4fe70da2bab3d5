//! Shape hardware profiles
//!
//! Expected device inventory per machine shape: GPU PCI addresses and module
//! IDs, RDMA NIC addresses, device names, and interfaces. Externalized data,
//! never hard-coded in checks.

use std::path::Path;

use serde::Deserialize;

use crate::error::CheckError;
use crate::normalize::normalize_pci_address;

/// One GPU in a shape profile
#[derive(Debug, Clone, Deserialize)]
pub struct GpuSpec {
    /// PCI bus address as listed in the profile
    pub pci: String,
    /// Marketing model name
    #[serde(default)]
    pub model: String,
    /// Logical GPU index
    pub id: u32,
    /// Physical module slot, used for cable pairing
    #[serde(default)]
    pub module_id: Option<u32>,
}

/// One RDMA NIC in a shape profile
#[derive(Debug, Clone, Deserialize)]
pub struct RdmaNicSpec {
    /// PCI bus address
    pub pci: String,
    /// OS interface name, when fixed by the platform
    #[serde(default)]
    pub interface: String,
    /// RDMA logical device name, e.g. "mlx5_4"
    pub device_name: String,
    /// Controller model string as reported by the PCI enumerator
    #[serde(default)]
    pub model: String,
}

/// Hardware profile of one shape
#[derive(Debug, Clone, Deserialize)]
pub struct ShapeHardware {
    /// Shape name, e.g. "BM.GPU.H100.8"
    pub shape: String,
    /// GPU inventory
    #[serde(default)]
    pub gpu: Vec<GpuSpec>,
    /// RDMA NIC inventory
    #[serde(rename = "rdma-nics", default)]
    pub rdma_nics: Vec<RdmaNicSpec>,
}

impl ShapeHardware {
    /// Normalized GPU PCI addresses, in profile order
    pub fn gpu_pci_addresses(&self) -> Vec<String> {
        self.gpu
            .iter()
            .map(|g| normalize_pci_address(&g.pci))
            .collect()
    }

    /// (normalized PCI, module id) pairs for GPUs that declare a module
    pub fn gpu_module_pairing(&self) -> Vec<(String, u32)> {
        self.gpu
            .iter()
            .filter_map(|g| g.module_id.map(|m| (normalize_pci_address(&g.pci), m)))
            .collect()
    }

    /// Normalized RDMA NIC PCI addresses, in profile order
    pub fn rdma_pci_addresses(&self) -> Vec<String> {
        self.rdma_nics
            .iter()
            .map(|n| normalize_pci_address(&n.pci))
            .collect()
    }

    /// RDMA logical device names, in profile order
    pub fn rdma_device_names(&self) -> Vec<String> {
        self.rdma_nics
            .iter()
            .map(|n| n.device_name.clone())
            .collect()
    }

    /// RDMA interface names declared by the profile (empty entries skipped)
    pub fn rdma_interfaces(&self) -> Vec<String> {
        self.rdma_nics
            .iter()
            .filter(|n| !n.interface.is_empty())
            .map(|n| n.interface.clone())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ShapesFile {
    #[serde(rename = "hpc-shapes")]
    hpc_shapes: Vec<ShapeHardware>,
}

/// All shape hardware profiles
#[derive(Debug)]
pub struct ShapeCatalog {
    shapes: Vec<ShapeHardware>,
}

impl ShapeCatalog {
    /// Parse from a JSON string
    pub fn from_json(json: &str) -> Result<Self, CheckError> {
        let file: ShapesFile = serde_json::from_str(json)
            .map_err(|e| CheckError::Config(format!("invalid shapes file: {}", e)))?;
        Ok(Self {
            shapes: file.hpc_shapes,
        })
    }

    /// Load from a file path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CheckError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CheckError::Config(format!(
                "failed to read shapes file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    /// Hardware profile for a shape, if present
    pub fn hardware(&self, shape: &str) -> Option<&ShapeHardware> {
        self.shapes.iter().find(|s| s.shape == shape)
    }
}
