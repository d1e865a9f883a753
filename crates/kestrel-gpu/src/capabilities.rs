//! Capability negotiation and adapter identification.

use std::ffi::CStr;

use ash::vk;
use tracing::{trace, warn};

use crate::error::{CapabilityKind, GpuError, Result};

/// Outcome of checking a required capability list against a supported one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    kind: CapabilityKind,
    missing: Vec<String>,
}

impl Negotiation {
    pub fn is_satisfied(&self) -> bool {
        self.missing.is_empty()
    }

    /// Names that were required but not supported, in request order.
    pub fn missing(&self) -> &[String] {
        &self.missing
    }

    /// Device extensions fail as `MissingExtension`, everything else as
    /// `CapabilityUnsupported`.
    pub fn into_result(self) -> Result<()> {
        if self.missing.is_empty() {
            return Ok(());
        }
        Err(match self.kind {
            CapabilityKind::DeviceExtension => GpuError::MissingExtension(self.missing),
            kind => GpuError::CapabilityUnsupported {
                kind,
                missing: self.missing,
            },
        })
    }
}

/// Check `required` against `supported`, logging every unsupported entry.
///
/// Pure apart from logging, so instance layers, instance extensions and
/// device extensions all go through the same path.
pub fn negotiate(kind: CapabilityKind, required: &[&CStr], supported: &[&CStr]) -> Negotiation {
    for name in supported {
        trace!("Supported {kind}: {}", name.to_string_lossy());
    }

    let missing: Vec<String> = required
        .iter()
        .filter(|name| !supported.contains(name))
        .map(|name| name.to_string_lossy().into_owned())
        .collect();

    for name in &missing {
        warn!("Required {kind} not supported: {name}");
    }

    Negotiation { kind, missing }
}

/// Names out of layer properties. Malformed entries are skipped.
pub fn layer_names(properties: &[vk::LayerProperties]) -> Vec<&CStr> {
    properties
        .iter()
        .filter_map(|p| p.layer_name_as_c_str().ok())
        .collect()
}

/// Names out of extension properties. Malformed entries are skipped.
pub fn extension_names(properties: &[vk::ExtensionProperties]) -> Vec<&CStr> {
    properties
        .iter()
        .filter_map(|p| p.extension_name_as_c_str().ok())
        .collect()
}

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Identity of the selected physical device, kept for logging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
}

impl AdapterInfo {
    /// Query identity from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let device_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed>".to_string());

        let device_local_memory_mb = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            device_local_memory_mb,
        }
    }

    /// One-line description for logs.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}), Vulkan {}.{}.{}, {} MB VRAM",
            self.device_name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}
