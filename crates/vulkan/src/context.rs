//! Logical device, queue and memory allocator.
//!
//! # Overview
//!
//! [`Context`] bundles everything the backend's calls go through: the
//! instance, the selected GPU, the logical device with one queue from the
//! graphics family, and a [`gpu_allocator`] allocator.
//!
//! Every queue type the core asks for maps to that one queue, so resources
//! never change queue family ownership.

use std::mem::ManuallyDrop;

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;
use tracing::{debug, error, info};

use crate::config::VulkanConfig;
use crate::error::VulkanResult;
use crate::instance::Instance;
use crate::physical_device::{PhysicalDeviceInfo, select_physical_device};

/// Owner of the logical device and its allocator.
pub struct Context {
    device: ash::Device,
    physical: PhysicalDeviceInfo,
    /// Externally synchronized by the lock.
    queue: Mutex<vk::Queue>,
    /// Dropped before the device is destroyed.
    allocator: ManuallyDrop<Mutex<Allocator>>,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    surface_loader: Option<ash::khr::surface::Instance>,
    instance: Instance,
}

impl Context {
    /// Creates the instance, selects a GPU and creates the logical device.
    ///
    /// # Errors
    ///
    /// Returns an error if any step of the setup fails, including
    /// [`VulkanError::NoSuitableGpu`](crate::VulkanError::NoSuitableGpu).
    pub fn new(config: &VulkanConfig, display: Option<RawDisplayHandle>) -> VulkanResult<Self> {
        let instance = Instance::new(config, display)?;
        let physical = select_physical_device(instance.handle(), config.prefer_discrete_gpu)?;

        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(physical.graphics_family)
            .queue_priorities(&priorities)];

        let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        let features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(physical.features.sampler_anisotropy == vk::TRUE)
            .fill_mode_non_solid(physical.features.fill_mode_non_solid == vk::TRUE);

        let mut extensions = Vec::new();
        if instance.supports_surfaces() {
            extensions.push(ash::khr::swapchain::NAME.as_ptr());
        }

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut features_1_3);
        let device = unsafe { instance.handle().create_device(physical.device, &create_info, None)? };
        info!("Logical device created with {} extension(s)", extensions.len());

        let queue = unsafe { device.get_device_queue(physical.graphics_family, 0) };
        debug!("Queue retrieved from family {}", physical.graphics_family);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: physical.device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };
        info!("GPU memory allocator initialized");

        let (swapchain_loader, surface_loader) = if instance.supports_surfaces() {
            (
                Some(ash::khr::swapchain::Device::new(instance.handle(), &device)),
                Some(ash::khr::surface::Instance::new(instance.entry(), instance.handle())),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            device,
            physical,
            queue: Mutex::new(queue),
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            swapchain_loader,
            surface_loader,
            instance,
        })
    }

    #[inline]
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    #[inline]
    pub fn physical(&self) -> &PhysicalDeviceInfo {
        &self.physical
    }

    #[inline]
    pub fn queue_family(&self) -> u32 {
        self.physical.graphics_family
    }

    /// The queue, locked for submission or presentation.
    #[inline]
    pub fn queue(&self) -> &Mutex<vk::Queue> {
        &self.queue
    }

    #[inline]
    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Swapchain and surface loaders, present when the instance was created
    /// with a display.
    pub fn surface_loaders(&self) -> Option<(&ash::khr::swapchain::Device, &ash::khr::surface::Instance)> {
        self.swapchain_loader.as_ref().zip(self.surface_loader.as_ref())
    }

    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Context>();
    }
}
