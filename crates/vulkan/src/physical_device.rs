//! Physical device (GPU) selection.
//!
//! # Overview
//!
//! Selection runs once, before any surface exists:
//! 1. Enumerate all GPUs
//! 2. Keep the ones with Vulkan 1.3, a graphics queue family, and the
//!    dynamic rendering and synchronization2 features
//! 3. Score the rest and pick the highest
//!
//! Presentation support is checked later, per surface, when a swapchain is
//! created.

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::{VulkanError, VulkanResult};

/// A GPU that passed the suitability checks.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    pub device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Family every queue type is served from.
    pub graphics_family: u32,
}

impl PhysicalDeviceInfo {
    pub fn device_name(&self) -> &str {
        self.properties
            .device_name_as_c_str()
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or("Unknown Device")
    }

    pub fn device_type_name(&self) -> &'static str {
        device_type_name(self.properties.device_type)
    }

    pub fn api_version(&self) -> (u32, u32, u32) {
        let version = self.properties.api_version;
        (
            vk::api_version_major(version),
            vk::api_version_minor(version),
            vk::api_version_patch(version),
        )
    }

    /// Total device local memory in bytes.
    pub fn device_local_memory(&self) -> u64 {
        self.memory_properties
            .memory_heaps
            .iter()
            .take(self.memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (major, minor, patch) = self.api_version();
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("api_version", &format!("{}.{}.{}", major, minor, patch))
            .field("graphics_family", &self.graphics_family)
            .finish()
    }
}

fn device_type_name(device_type: vk::PhysicalDeviceType) -> &'static str {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
        vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
        vk::PhysicalDeviceType::CPU => "CPU",
        _ => "Other",
    }
}

/// Selects the most suitable GPU.
///
/// # Errors
///
/// Returns [`VulkanError::NoSuitableGpu`] if no GPU passes the checks.
pub fn select_physical_device(instance: &ash::Instance, prefer_discrete: bool) -> VulkanResult<PhysicalDeviceInfo> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    if devices.is_empty() {
        warn!("No Vulkan-capable GPUs found");
        return Err(VulkanError::NoSuitableGpu);
    }
    info!("Found {} GPU(s)", devices.len());

    let selected = devices
        .into_iter()
        .filter_map(|device| check_device_suitability(instance, device))
        .map(|info| {
            let score = rate_device(
                info.properties.device_type,
                info.device_local_memory(),
                info.properties.limits.max_image_dimension2_d,
                prefer_discrete,
            );
            debug!("GPU '{}' ({}) - Score: {}", info.device_name(), info.device_type_name(), score);
            (info, score)
        })
        .max_by_key(|(_, score)| *score);

    let Some((info, score)) = selected else {
        warn!("No suitable GPU found with required capabilities");
        return Err(VulkanError::NoSuitableGpu);
    };
    let (major, minor, patch) = info.api_version();
    info!(
        "Selected GPU: '{}' ({}) - Vulkan {}.{}.{}, Score: {}",
        info.device_name(),
        info.device_type_name(),
        major,
        minor,
        patch,
        score
    );
    Ok(info)
}

fn check_device_suitability(instance: &ash::Instance, device: vk::PhysicalDevice) -> Option<PhysicalDeviceInfo> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let name = properties
        .device_name_as_c_str()
        .map(CStr::to_string_lossy)
        .unwrap_or_default()
        .into_owned();

    if !supports_api_1_3(properties.api_version) {
        debug!(
            "GPU '{}' skipped: Vulkan 1.3 not supported (version: {}.{})",
            name,
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version)
        );
        return None;
    }

    let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut features_1_3);
    unsafe { instance.get_physical_device_features2(device, &mut features2) };
    let features = features2.features;
    if features_1_3.dynamic_rendering == vk::FALSE || features_1_3.synchronization2 == vk::FALSE {
        debug!("GPU '{}' skipped: dynamic rendering or synchronization2 missing", name);
        return None;
    }

    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let Some(graphics_family) = find_graphics_family(&families) else {
        debug!("GPU '{}' skipped: no graphics queue family", name);
        return None;
    };

    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
    Some(PhysicalDeviceInfo {
        device,
        properties,
        features,
        memory_properties,
        graphics_family,
    })
}

fn supports_api_1_3(api_version: u32) -> bool {
    let major = vk::api_version_major(api_version);
    major > 1 || (major == 1 && vk::api_version_minor(api_version) >= 3)
}

/// First family with graphics support. Graphics families implicitly support
/// compute and transfer.
fn find_graphics_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|family| family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|index| index as u32)
}

/// Higher scores indicate more desirable devices.
fn rate_device(
    device_type: vk::PhysicalDeviceType,
    device_local_memory: u64,
    max_image_dimension: u32,
    prefer_discrete: bool,
) -> u32 {
    let mut score = match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU if prefer_discrete => 10000,
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU if prefer_discrete => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 10000,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 100,
        vk::PhysicalDeviceType::CPU => 10,
        _ => 1,
    };
    score += max_image_dimension;
    // VRAM in MB, capped at 16 GB.
    score += ((device_local_memory / (1024 * 1024)) as u32).min(16000);
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discrete_preferred() {
        let discrete = rate_device(vk::PhysicalDeviceType::DISCRETE_GPU, 4 << 30, 16384, true);
        let integrated = rate_device(vk::PhysicalDeviceType::INTEGRATED_GPU, 8 << 30, 16384, true);
        assert!(discrete > integrated);
    }

    #[test]
    fn test_integrated_preferred_when_asked() {
        let discrete = rate_device(vk::PhysicalDeviceType::DISCRETE_GPU, 4 << 30, 16384, false);
        let integrated = rate_device(vk::PhysicalDeviceType::INTEGRATED_GPU, 1 << 30, 16384, false);
        assert!(integrated > discrete);
    }

    #[test]
    fn test_vram_contribution_is_capped() {
        let small = rate_device(vk::PhysicalDeviceType::CPU, 32 << 30, 0, true);
        let large = rate_device(vk::PhysicalDeviceType::CPU, 64 << 30, 0, true);
        assert_eq!(small, large);
    }

    #[test]
    fn test_api_version_check() {
        assert!(supports_api_1_3(vk::make_api_version(0, 1, 3, 0)));
        assert!(supports_api_1_3(vk::make_api_version(0, 1, 4, 0)));
        assert!(!supports_api_1_3(vk::make_api_version(0, 1, 2, 198)));
    }

    #[test]
    fn test_find_graphics_family() {
        let transfer_only = vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::TRANSFER,
            queue_count: 1,
            ..Default::default()
        };
        let graphics = vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            queue_count: 1,
            ..Default::default()
        };
        let empty_graphics = vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::GRAPHICS,
            queue_count: 0,
            ..Default::default()
        };
        assert_eq!(find_graphics_family(&[transfer_only, empty_graphics, graphics]), Some(2));
        assert_eq!(find_graphics_family(&[transfer_only]), None);
    }
}
