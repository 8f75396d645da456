//! Swapchain management.
//!
//! This module handles surface and VkSwapchainKHR creation, image
//! acquisition, and presentation.
//!
//! # Overview
//!
//! A [`Swapchain`] owns its surface, swapchain, backbuffer views and a ring
//! of acquire semaphores. It does not hold the device; every call takes the
//! [`Context`] and [`Swapchain::destroy`] must be called explicitly before
//! the context goes away.
//!
//! A zero-sized swapchain (minimized window) keeps a null handle and no
//! images; acquiring from it reports `ERROR_OUT_OF_DATE_KHR` until it is
//! resized to a real extent.

use ash::vk;
use forge_rhi::backend::SurfaceTarget;
use forge_rhi::types::SwapchainInfo;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::conversions;
use crate::error::{VulkanError, VulkanResult};

/// Swapchain surface support details.
#[derive(Debug, Clone)]
pub struct SwapchainSupportDetails {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupportDetails {
    /// Queries swapchain support details for a physical device and surface.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the queries fail.
    pub fn query(
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> VulkanResult<Self> {
        let capabilities =
            unsafe { surface_loader.get_physical_device_surface_capabilities(physical_device, surface)? };
        let formats = unsafe { surface_loader.get_physical_device_surface_formats(physical_device, surface)? };
        let present_modes =
            unsafe { surface_loader.get_physical_device_surface_present_modes(physical_device, surface)? };

        debug!(
            "Swapchain support: {} formats, {} present modes, image count: {}-{}",
            formats.len(),
            present_modes.len(),
            capabilities.min_image_count,
            if capabilities.max_image_count == 0 {
                "unlimited".to_string()
            } else {
                capabilities.max_image_count.to_string()
            }
        );

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    /// At least one format and one present mode are available.
    #[inline]
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// A window surface with its swapchain and backbuffers.
pub struct Swapchain {
    surface: vk::SurfaceKHR,
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent2D,
    requested: SwapchainInfo,
    /// One more than the image count, so a semaphore is never reused while
    /// its acquire may still be pending.
    acquire_semaphores: Vec<vk::Semaphore>,
    next_semaphore: usize,
    current: u32,
    acquired: bool,
}

impl Swapchain {
    /// Creates a surface for `target` and a swapchain on it.
    ///
    /// # Errors
    ///
    /// Returns [`VulkanError::Unsupported`] when the context was created
    /// without a display, [`VulkanError::Surface`] when the surface cannot be
    /// created or presented to, or the error of swapchain creation.
    pub fn new(context: &Context, info: &SwapchainInfo, target: &SurfaceTarget) -> VulkanResult<Self> {
        let Some((_, surface_loader)) = context.surface_loaders() else {
            return Err(VulkanError::Unsupported(
                "swapchains need a backend created with a display handle".to_string(),
            ));
        };

        let instance = context.instance();
        let surface = unsafe {
            ash_window::create_surface(instance.entry(), instance.handle(), target.display, target.window, None)
        }
        .map_err(|e| VulkanError::Surface(format!("failed to create surface: {e}")))?;

        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(context.physical().device, context.queue_family(), surface)
        };
        if !matches!(supported, Ok(true)) {
            unsafe { surface_loader.destroy_surface(surface, None) };
            return Err(VulkanError::Surface(format!(
                "queue family {} cannot present to this surface",
                context.queue_family()
            )));
        }

        let mut swapchain = Self {
            surface,
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            format: conversions::format(info.format),
            extent: vk::Extent2D::default(),
            requested: info.clone(),
            acquire_semaphores: Vec::new(),
            next_semaphore: 0,
            current: 0,
            acquired: false,
        };
        if let Err(e) = swapchain.build(context, info.width, info.height) {
            swapchain.destroy(context);
            return Err(e);
        }
        Ok(swapchain)
    }

    /// Recreates the swapchain at a new size. The caller waits for the GPU
    /// first; previous images and views are invalid afterwards.
    ///
    /// # Errors
    ///
    /// Returns the error of swapchain creation.
    pub fn resize(&mut self, context: &Context, width: u32, height: u32) -> VulkanResult<()> {
        info!("Recreating swapchain for new size: {}x{}", width, height);
        self.build(context, width, height)
    }

    fn build(&mut self, context: &Context, width: u32, height: u32) -> VulkanResult<()> {
        let Some((swapchain_loader, surface_loader)) = context.surface_loaders() else {
            return Err(VulkanError::Unsupported("no surface loaders".to_string()));
        };
        let device = context.device();

        self.destroy_views(device);
        self.destroy_semaphores(device);
        self.acquired = false;

        let support = SwapchainSupportDetails::query(context.physical().device, self.surface, surface_loader)?;
        if !support.is_adequate() {
            return Err(VulkanError::Surface(
                "inadequate swapchain support (no formats or present modes)".to_string(),
            ));
        }

        let extent = choose_extent(&support.capabilities, width, height);
        let old_swapchain = self.handle;
        if extent.width == 0 || extent.height == 0 {
            if old_swapchain != vk::SwapchainKHR::null() {
                unsafe { swapchain_loader.destroy_swapchain(old_swapchain, None) };
            }
            self.handle = vk::SwapchainKHR::null();
            self.images.clear();
            self.extent = vk::Extent2D::default();
            info!("Swapchain is zero-sized; it stays out of date until resized");
            return Ok(());
        }

        let surface_format = choose_surface_format(&support.formats, conversions::format(self.requested.format));
        let present_mode = choose_present_mode(&support.present_modes, self.requested.vsync);
        let image_count = determine_image_count(&support.capabilities, self.requested.image_count);

        info!(
            "Creating swapchain: {}x{}, format {:?}, present mode {:?}, {} images",
            extent.width, extent.height, surface_format.format, present_mode, image_count
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);
        let created = unsafe { swapchain_loader.create_swapchain(&create_info, None) };
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { swapchain_loader.destroy_swapchain(old_swapchain, None) };
        }
        // The old swapchain is retired whether or not creation succeeded.
        self.handle = vk::SwapchainKHR::null();
        self.handle = created?;

        self.images = unsafe { swapchain_loader.get_swapchain_images(self.handle)? };
        self.format = surface_format.format;
        self.extent = extent;
        self.views = create_image_views(device, &self.images, surface_format.format)?;

        for _ in 0..=self.images.len() {
            let semaphore = unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? };
            self.acquire_semaphores.push(semaphore);
        }
        self.next_semaphore = 0;
        info!("Swapchain created with {} images", self.images.len());
        Ok(())
    }

    /// Acquires the next image; returns its index and the semaphore signaled
    /// when it becomes available.
    ///
    /// # Errors
    ///
    /// Returns `ERROR_OUT_OF_DATE_KHR` when the swapchain must be resized.
    /// A suboptimal swapchain is only logged.
    pub fn acquire(&mut self, context: &Context) -> VulkanResult<(u32, vk::Semaphore)> {
        let Some((swapchain_loader, _)) = context.surface_loaders() else {
            return Err(VulkanError::Unsupported("no surface loaders".to_string()));
        };
        if self.handle == vk::SwapchainKHR::null() {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR.into());
        }

        let semaphore = self.acquire_semaphores[self.next_semaphore];
        let (index, suboptimal) =
            unsafe { swapchain_loader.acquire_next_image(self.handle, u64::MAX, semaphore, vk::Fence::null())? };
        if suboptimal {
            warn!("Swapchain is suboptimal; resize it to match the surface");
        }
        self.next_semaphore = (self.next_semaphore + 1) % self.acquire_semaphores.len();
        self.current = index;
        self.acquired = true;
        Ok((index, semaphore))
    }

    /// Presents the acquired image once `wait_semaphores` are signaled.
    ///
    /// # Errors
    ///
    /// Returns [`VulkanError::Surface`] when no image was acquired, or
    /// `ERROR_OUT_OF_DATE_KHR` when the swapchain must be resized.
    pub fn present(&mut self, context: &Context, wait_semaphores: &[vk::Semaphore]) -> VulkanResult<()> {
        let Some((swapchain_loader, _)) = context.surface_loaders() else {
            return Err(VulkanError::Unsupported("no surface loaders".to_string()));
        };
        if !self.acquired {
            return Err(VulkanError::Surface("present without an acquired image".to_string()));
        }
        self.acquired = false;

        let swapchains = [self.handle];
        let image_indices = [self.current];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let queue = context.queue().lock();
        let suboptimal = unsafe { swapchain_loader.queue_present(*queue, &present_info)? };
        if suboptimal {
            warn!("Swapchain is suboptimal; resize it to match the surface");
        }
        Ok(())
    }

    #[inline]
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    #[inline]
    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn current_index(&self) -> u32 {
        self.current
    }

    /// Actual backbuffer description.
    pub fn info(&self) -> SwapchainInfo {
        SwapchainInfo {
            width: self.extent.width,
            height: self.extent.height,
            format: conversions::format_from_vk(self.format),
            image_count: self.images.len() as u32,
            vsync: self.requested.vsync,
        }
    }

    /// Destroys the views, semaphores, swapchain and surface. The caller
    /// waits for the GPU first.
    pub fn destroy(&mut self, context: &Context) {
        let device = context.device();
        self.destroy_views(device);
        self.destroy_semaphores(device);
        if let Some((swapchain_loader, surface_loader)) = context.surface_loaders() {
            unsafe {
                if self.handle != vk::SwapchainKHR::null() {
                    swapchain_loader.destroy_swapchain(self.handle, None);
                }
                if self.surface != vk::SurfaceKHR::null() {
                    surface_loader.destroy_surface(self.surface, None);
                }
            }
        }
        self.handle = vk::SwapchainKHR::null();
        self.surface = vk::SurfaceKHR::null();
        info!(
            "Swapchain destroyed (was {}x{}, {} images)",
            self.extent.width,
            self.extent.height,
            self.images.len()
        );
        self.images.clear();
    }

    fn destroy_views(&mut self, device: &ash::Device) {
        for view in self.views.drain(..) {
            unsafe { device.destroy_image_view(view, None) };
        }
    }

    fn destroy_semaphores(&mut self, device: &ash::Device) {
        for semaphore in self.acquire_semaphores.drain(..) {
            unsafe { device.destroy_semaphore(semaphore, None) };
        }
    }
}

/// Picks `requested` in the sRGB color space when offered, then
/// B8G8R8A8_SRGB, then the first available format.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR], requested: vk::Format) -> vk::SurfaceFormatKHR {
    let find = |format: vk::Format| {
        formats
            .iter()
            .find(|f| f.format == format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .copied()
    };

    if let Some(format) = find(requested) {
        return format;
    }
    if let Some(format) = find(vk::Format::B8G8R8A8_SRGB) {
        warn!("Surface format {:?} unavailable, using B8G8R8A8_SRGB", requested);
        return format;
    }
    warn!("Using first available surface format: {:?}", formats[0].format);
    formats[0]
}

/// FIFO when `vsync` is set (always available). Otherwise MAILBOX, then
/// IMMEDIATE, then FIFO.
fn choose_present_mode(present_modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync {
        for mode in [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE] {
            if present_modes.contains(&mode) {
                debug!("Selected {:?} present mode", mode);
                return mode;
            }
        }
    }
    debug!("Selected FIFO present mode (vsync)");
    vk::PresentModeKHR::FIFO
}

/// The surface's current extent when it defines one, otherwise the
/// requested size clamped to the surface limits.
fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if width == 0 || height == 0 {
        return vk::Extent2D::default();
    }
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
        height: height.clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
    }
}

/// `requested` clamped to the surface limits; a maximum of zero means
/// unlimited.
fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let count = requested.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

fn create_image_views(device: &ash::Device, images: &[vk::Image], format: vk::Format) -> VulkanResult<Vec<vk::ImageView>> {
    let mut views = Vec::with_capacity(images.len());
    for &image in images {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            );
        match unsafe { device.create_image_view(&create_info, None) } {
            Ok(view) => views.push(view),
            Err(e) => {
                for view in views {
                    unsafe { device.destroy_image_view(view, None) };
                }
                return Err(e.into());
            }
        }
    }
    debug!("Created {} image views", views.len());
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn test_choose_surface_format_honors_request() {
        let formats = [
            surface_format(vk::Format::B8G8R8A8_SRGB),
            surface_format(vk::Format::R8G8B8A8_UNORM),
        ];
        let selected = choose_surface_format(&formats, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(selected.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn test_choose_surface_format_fallbacks() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM),
            surface_format(vk::Format::B8G8R8A8_SRGB),
        ];
        let selected = choose_surface_format(&formats, vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(selected.format, vk::Format::B8G8R8A8_SRGB);

        let formats = [surface_format(vk::Format::R8G8B8A8_UNORM)];
        let selected = choose_surface_format(&formats, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(selected.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn test_choose_present_mode() {
        let modes = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE], false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(choose_present_mode(&[vk::PresentModeKHR::FIFO], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_choose_extent() {
        let mut capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: 1920, height: 1080 },
            min_image_extent: vk::Extent2D { width: 100, height: 100 },
            max_image_extent: vk::Extent2D { width: 2000, height: 2000 },
            ..Default::default()
        };
        assert_eq!(choose_extent(&capabilities, 800, 600), vk::Extent2D { width: 1920, height: 1080 });

        capabilities.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        assert_eq!(choose_extent(&capabilities, 3000, 50), vk::Extent2D { width: 2000, height: 100 });
        assert_eq!(choose_extent(&capabilities, 800, 600), vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn test_zero_request_gives_zero_extent() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: 1920, height: 1080 },
            ..Default::default()
        };
        assert_eq!(choose_extent(&capabilities, 0, 600), vk::Extent2D::default());
    }

    #[test]
    fn test_determine_image_count() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&capabilities, 3), 3);
        assert_eq!(determine_image_count(&capabilities, 8), 3);
        assert_eq!(determine_image_count(&capabilities, 1), 2);

        let unlimited = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&unlimited, 5), 5);
    }

    #[test]
    fn test_swapchain_support_details_is_adequate() {
        let adequate = SwapchainSupportDetails {
            capabilities: vk::SurfaceCapabilitiesKHR::default(),
            formats: vec![vk::SurfaceFormatKHR::default()],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        assert!(adequate.is_adequate());

        let no_modes = SwapchainSupportDetails {
            present_modes: vec![],
            ..adequate
        };
        assert!(!no_modes.is_adequate());
    }
}
