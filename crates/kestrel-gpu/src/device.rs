//! Physical device selection and logical device creation.

use std::collections::BTreeSet;
use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::capabilities::{extension_names, negotiate, AdapterInfo};
use crate::error::{CapabilityKind, GpuError, QueueClass, Result};
use crate::instance::Instance;
use crate::surface::Surface;

/// Device extensions every selected GPU must support.
pub fn required_device_extensions() -> Vec<&'static CStr> {
    vec![ash::khr::swapchain::NAME]
}

/// Selection score for a device class. Higher wins.
pub const fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        _ => 1,
    }
}

/// Index of the highest-scoring device. Ties keep the first seen.
pub fn pick_best_device(device_types: &[vk::PhysicalDeviceType]) -> Option<usize> {
    let mut best: Option<(usize, u32)> = None;
    for (index, &device_type) in device_types.iter().enumerate() {
        let score = device_type_score(device_type);
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((index, score));
        }
    }
    best.map(|(index, _)| index)
}

/// Queue family indices chosen for each workload class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
    /// False when transfer work shares the graphics family.
    pub transfer_dedicated: bool,
}

impl QueueFamilies {
    /// Distinct family indices, for queue creation.
    pub fn unique(&self) -> BTreeSet<u32> {
        [self.graphics, self.compute, self.transfer].into_iter().collect()
    }
}

/// Run the three queue-family scans.
///
/// `supports_present` is only asked about graphics-capable families.
pub fn select_queue_families<F>(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: F,
) -> Result<QueueFamilies>
where
    F: FnMut(u32) -> Result<bool>,
{
    let indexed = || {
        families
            .iter()
            .enumerate()
            .filter(|(_, family)| family.queue_count > 0)
            .map(|(index, family)| (index as u32, family.queue_flags))
    };

    let mut graphics = None;
    for (index, flags) in indexed() {
        if flags.contains(vk::QueueFlags::GRAPHICS) && supports_present(index)? {
            graphics = Some(index);
            break;
        }
    }
    let graphics = graphics.ok_or(GpuError::MissingQueueCapability(QueueClass::Graphics))?;

    let compute = indexed()
        .find(|(_, flags)| {
            flags.contains(vk::QueueFlags::COMPUTE) && !flags.contains(vk::QueueFlags::GRAPHICS)
        })
        .map(|(index, _)| index)
        .ok_or(GpuError::MissingQueueCapability(QueueClass::Compute))?;

    let dedicated_transfer = indexed()
        .find(|(_, flags)| {
            flags.contains(vk::QueueFlags::TRANSFER)
                && !flags.intersects(vk::QueueFlags::COMPUTE | vk::QueueFlags::GRAPHICS)
        })
        .map(|(index, _)| index);

    let (transfer, transfer_dedicated) = match dedicated_transfer {
        Some(index) => (index, true),
        None => {
            warn!("No dedicated transfer queue family, falling back to graphics family {graphics}");
            (graphics, false)
        }
    };

    Ok(QueueFamilies {
        graphics,
        compute,
        transfer,
        transfer_dedicated,
    })
}

/// Names of required Vulkan 1.3 features the device lacks.
pub fn missing_features(features: &vk::PhysicalDeviceVulkan13Features<'_>) -> Vec<String> {
    let mut missing = Vec::new();
    if features.dynamic_rendering != vk::TRUE {
        missing.push("dynamicRendering".to_string());
    }
    if features.synchronization2 != vk::TRUE {
        missing.push("synchronization2".to_string());
    }
    missing
}

/// A device queue and the family it came from.
#[derive(Debug, Clone, Copy)]
pub struct Queue {
    pub family: u32,
    pub handle: vk::Queue,
    /// Whether the family is exclusive to this workload class.
    pub dedicated: bool,
}

/// Selected physical device plus the owned logical device.
pub struct Device {
    physical_device: vk::PhysicalDevice,
    info: AdapterInfo,
    device: ash::Device,
    graphics: Queue,
    compute: Queue,
    transfer: Queue,
    swapchain_loader: ash::khr::swapchain::Device,
    debug_utils: Option<ash::ext::debug_utils::Device>,
}

impl Device {
    /// Pick a GPU that can present to `surface` and create its logical device.
    ///
    /// Debug-utils labels are loaded when the instance has validation enabled.
    pub fn select(instance: &Instance, surface: &Surface) -> Result<Self> {
        let raw = instance.raw();

        // SAFETY: the instance is alive for the duration of selection.
        let physical_devices = unsafe { raw.enumerate_physical_devices()? };
        let device_types: Vec<vk::PhysicalDeviceType> = physical_devices
            .iter()
            .map(|&pd| unsafe { raw.get_physical_device_properties(pd) }.device_type)
            .collect();
        let best = pick_best_device(&device_types).ok_or(GpuError::NoSuitableDevice)?;
        let physical_device = physical_devices[best];

        // SAFETY: physical_device was enumerated from this instance.
        let info = unsafe { AdapterInfo::query(raw, physical_device) };
        info!("Selected GPU: {}", info.summary());

        let family_properties =
            unsafe { raw.get_physical_device_queue_family_properties(physical_device) };
        let families = select_queue_families(&family_properties, |index| {
            surface.supports_present(physical_device, index)
        })?;
        debug!("Queue families: {families:?}");

        let required = required_device_extensions();
        let available = unsafe { raw.enumerate_device_extension_properties(physical_device)? };
        negotiate(
            CapabilityKind::DeviceExtension,
            &required,
            &extension_names(&available),
        )
        .into_result()?;

        let missing = {
            let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default();
            let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut features_1_3);
            unsafe { raw.get_physical_device_features2(physical_device, &mut features2) };
            missing_features(&features_1_3)
        };
        if !missing.is_empty() {
            return Err(GpuError::MissingFeature(missing));
        }

        let queue_priority = 1.0_f32;
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(std::slice::from_ref(&queue_priority))
            })
            .collect();

        let extension_ptrs: Vec<*const std::ffi::c_char> =
            required.iter().map(|ext| ext.as_ptr()).collect();

        let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut vulkan_1_3_features);

        // SAFETY: queue families, extensions and features were validated above.
        let device = unsafe { raw.create_device(physical_device, &device_create_info, None)? };

        let queue = |family: u32, dedicated: bool| Queue {
            family,
            // SAFETY: one queue was requested from every family in use.
            handle: unsafe { device.get_device_queue(family, 0) },
            dedicated,
        };
        let graphics = queue(families.graphics, true);
        let compute = queue(families.compute, true);
        let transfer = queue(families.transfer, families.transfer_dedicated);

        let swapchain_loader = ash::khr::swapchain::Device::new(raw, &device);
        let debug_utils = instance
            .validation_enabled()
            .then(|| ash::ext::debug_utils::Device::new(raw, &device));

        info!("Logical device created");

        Ok(Self {
            physical_device,
            info,
            device,
            graphics,
            compute,
            transfer,
            swapchain_loader,
            debug_utils,
        })
    }

    pub const fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub const fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub const fn info(&self) -> &AdapterInfo {
        &self.info
    }

    pub const fn graphics_queue(&self) -> Queue {
        self.graphics
    }

    pub const fn compute_queue(&self) -> Queue {
        self.compute
    }

    pub const fn transfer_queue(&self) -> Queue {
        self.transfer
    }

    pub const fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    /// Debug-utils loader, present only with validation enabled.
    pub const fn debug_utils(&self) -> Option<&ash::ext::debug_utils::Device> {
        self.debug_utils.as_ref()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        debug!("Destroying logical device");
        // SAFETY: the allocator and every device child are released before the
        // device drops, and the owner waited for idle.
        unsafe { self.device.destroy_device(None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    const GCT: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw()
            | vk::QueueFlags::COMPUTE.as_raw()
            | vk::QueueFlags::TRANSFER.as_raw(),
    );
    const CT: vk::QueueFlags =
        vk::QueueFlags::from_raw(vk::QueueFlags::COMPUTE.as_raw() | vk::QueueFlags::TRANSFER.as_raw());

    #[test]
    fn discrete_beats_integrated_beats_other() {
        let types = [
            vk::PhysicalDeviceType::CPU,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::DISCRETE_GPU,
        ];
        assert_eq!(pick_best_device(&types), Some(2));
        assert_eq!(pick_best_device(&types[..2]), Some(1));
    }

    #[test]
    fn ties_keep_first_seen() {
        let types = [
            vk::PhysicalDeviceType::VIRTUAL_GPU,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vk::PhysicalDeviceType::DISCRETE_GPU,
        ];
        assert_eq!(pick_best_device(&types), Some(1));
        assert_eq!(
            pick_best_device(&[vk::PhysicalDeviceType::CPU, vk::PhysicalDeviceType::OTHER]),
            Some(0)
        );
    }

    #[test]
    fn no_devices_selects_nothing() {
        assert_eq!(pick_best_device(&[]), None);
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let families = [family(GCT), family(CT), family(vk::QueueFlags::TRANSFER)];
        let selected = select_queue_families(&families, |_| Ok(true)).unwrap();
        assert_eq!(
            selected,
            QueueFamilies {
                graphics: 0,
                compute: 1,
                transfer: 2,
                transfer_dedicated: true,
            }
        );
        assert_eq!(selected.unique().len(), 3);
    }

    #[test]
    fn graphics_family_must_present() {
        let families = [family(GCT), family(GCT), family(CT)];
        let selected = select_queue_families(&families, |index| Ok(index == 1)).unwrap();
        assert_eq!(selected.graphics, 1);
    }

    #[test]
    fn present_is_only_queried_for_graphics_families() {
        let families = [family(CT), family(GCT)];
        let mut asked = Vec::new();
        select_queue_families(&families, |index| {
            asked.push(index);
            Ok(true)
        })
        .unwrap();
        assert_eq!(asked, [1]);
    }

    #[test]
    fn transfer_falls_back_to_graphics() {
        let families = [family(GCT), family(CT)];
        let selected = select_queue_families(&families, |_| Ok(true)).unwrap();
        assert_eq!(selected.transfer, selected.graphics);
        assert!(!selected.transfer_dedicated);
        assert_eq!(selected.unique().len(), 2);
    }

    #[test]
    fn missing_async_compute_is_fatal() {
        let families = [family(GCT), family(vk::QueueFlags::TRANSFER)];
        let result = select_queue_families(&families, |_| Ok(true));
        assert!(matches!(
            result,
            Err(GpuError::MissingQueueCapability(QueueClass::Compute))
        ));
    }

    #[test]
    fn missing_presentable_graphics_is_fatal() {
        let families = [family(GCT), family(CT)];
        let result = select_queue_families(&families, |_| Ok(false));
        assert!(matches!(
            result,
            Err(GpuError::MissingQueueCapability(QueueClass::Graphics))
        ));
    }

    #[test]
    fn present_query_errors_propagate() {
        let families = [family(GCT), family(CT)];
        let result = select_queue_families(&families, |_| Err(GpuError::SurfaceLost));
        assert!(matches!(result, Err(GpuError::SurfaceLost)));
    }

    #[test]
    fn empty_families_are_skipped() {
        let mut empty = family(GCT);
        empty.queue_count = 0;
        let families = [empty, family(GCT), family(CT)];
        let selected = select_queue_families(&families, |_| Ok(true)).unwrap();
        assert_eq!(selected.graphics, 1);
    }

    #[test]
    fn feature_check_names_missing_features() {
        let none = vk::PhysicalDeviceVulkan13Features::default();
        assert_eq!(missing_features(&none), ["dynamicRendering", "synchronization2"]);

        let all = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        assert!(missing_features(&all).is_empty());
    }
}
