//! Vulkan instance management.
//!
//! This module handles VkInstance creation, validation layers, and the debug
//! messenger that routes validation output into `tracing`.
//!
//! # Overview
//!
//! [`Instance`] owns the loader entry, the instance and the optional debug
//! messenger. Surface extensions are only enabled when a display handle is
//! given, so an instance created without one can still drive offscreen work
//! but cannot create swapchains.
//!
//! # Example
//!
//! ```no_run
//! use forge_vulkan::VulkanConfig;
//! use forge_vulkan::instance::Instance;
//!
//! let instance = Instance::new(&VulkanConfig::default(), None)?;
//! assert!(!instance.supports_surfaces());
//! # Ok::<(), forge_vulkan::VulkanError>(())
//! ```

use std::ffi::{CStr, CString, c_char};

use ash::{Entry, vk};
use raw_window_handle::RawDisplayHandle;
use tracing::{debug, error, info, warn};

use crate::config::VulkanConfig;
use crate::error::{VulkanError, VulkanResult};

/// The Khronos validation layer name.
const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Vulkan instance with optional validation layer support.
pub struct Instance {
    entry: Entry,
    instance: ash::Instance,
    /// Present only when validation is enabled
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    surface_support: bool,
}

impl Instance {
    /// Creates a Vulkan 1.3 instance.
    ///
    /// With a `display`, the surface extensions that display needs are
    /// enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the Vulkan library cannot be loaded, a required
    /// extension is missing, or instance creation fails.
    pub fn new(config: &VulkanConfig, display: Option<RawDisplayHandle>) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load()? };

        let validation = config.enable_validation && Self::is_validation_layer_available(&entry)?;
        if config.enable_validation && !validation {
            warn!("Validation layer requested but not available, proceeding without it");
        }

        let application_name = CString::new(config.application_name.as_str()).map_err(|_| {
            VulkanError::InvalidArgument(format!(
                "application name {:?} contains a NUL byte",
                config.application_name
            ))
        })?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&application_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"forge")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions: Vec<*const c_char> = Vec::new();
        if let Some(display) = display {
            extensions.extend_from_slice(ash_window::enumerate_required_extensions(display)?);
        }
        if validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }
        let layers = if validation {
            vec![VALIDATION_LAYER_NAME.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);
        let instance = unsafe { entry.create_instance(&create_info, None)? };
        info!(
            "Vulkan instance created (API 1.3, {} extensions, validation: {})",
            extensions.len(),
            validation
        );

        let (debug_utils, debug_messenger) = if validation {
            let debug_utils = ash::ext::debug_utils::Instance::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils) {
                Ok(messenger) => (Some(debug_utils), Some(messenger)),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            (None, None)
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
            debug_messenger,
            surface_support: display.is_some(),
        })
    }

    #[inline]
    pub fn handle(&self) -> &ash::Instance {
        &self.instance
    }

    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    #[inline]
    pub fn has_validation(&self) -> bool {
        self.debug_messenger.is_some()
    }

    /// Whether surface extensions were enabled at creation.
    #[inline]
    pub fn supports_surfaces(&self) -> bool {
        self.surface_support
    }

    fn is_validation_layer_available(entry: &Entry) -> VulkanResult<bool> {
        let available = unsafe { entry.enumerate_instance_layer_properties()? };
        Ok(available.iter().any(|layer| {
            layer.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER_NAME)
        }))
    }

    fn setup_debug_messenger(
        debug_utils: &ash::ext::debug_utils::Instance,
    ) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));
        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? };
        debug!("Debug messenger created");
        Ok(messenger)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger) {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        info!("Vulkan instance destroyed");
    }
}

/// Routes validation layer messages into `tracing` by severity.
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let callback_data = unsafe { &*p_callback_data };
    let message = if callback_data.p_message.is_null() {
        std::borrow::Cow::Borrowed("(no message)")
    } else {
        unsafe { CStr::from_ptr(callback_data.p_message).to_string_lossy() }
    };

    let kind = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "General",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "Validation",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "Performance",
        _ => "Unknown",
    };
    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => error!("[Vulkan {}] {}", kind, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!("[Vulkan {}] {}", kind, message),
        _ => debug!("[Vulkan {}] {}", kind, message),
    }
    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_without_surfaces() {
        let config = VulkanConfig {
            enable_validation: false,
            ..Default::default()
        };
        match Instance::new(&config, None) {
            Ok(instance) => {
                assert!(!instance.has_validation());
                assert!(!instance.supports_surfaces());
            }
            Err(VulkanError::Loading(_) | VulkanError::Vulkan(_)) => {
                eprintln!("Skipping test: Vulkan not available");
            }
            Err(e) => panic!("Unexpected error: {e:?}"),
        }
    }

    #[test]
    fn test_application_name_with_nul_is_rejected() {
        let config = VulkanConfig {
            application_name: "bad\0name".to_string(),
            enable_validation: false,
            ..Default::default()
        };
        match Instance::new(&config, None) {
            Err(VulkanError::InvalidArgument(_)) => {}
            Err(VulkanError::Loading(_)) => eprintln!("Skipping test: Vulkan not available"),
            other => panic!("Unexpected result: {:?}", other.err()),
        }
    }
}
