//! Vulkan backend for `forge-rhi`.
//!
//! This crate implements [`forge_rhi::backend::Backend`] over Vulkan 1.3
//! using the `ash` crate. It handles:
//! - Instance, GPU and logical device creation
//! - Memory allocation through `gpu-allocator`
//! - Surfaces and swapchains
//! - Command recording with dynamic rendering and synchronization2

mod error;

pub mod backend;
pub mod config;
pub mod context;
pub mod conversions;
pub mod instance;
pub mod physical_device;
pub mod swapchain;

pub use backend::VulkanBackend;
pub use config::VulkanConfig;
pub use error::{VulkanError, VulkanResult};

// Re-export ash types that users might need
pub use ash::vk;
