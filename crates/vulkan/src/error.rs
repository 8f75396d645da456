//! Vulkan backend error types.

use ash::vk;
use forge_rhi::RhiError;
use thiserror::Error;

/// Error raised inside the Vulkan backend.
///
/// Converted into [`RhiError`] at the [`Backend`](forge_rhi::backend::Backend)
/// boundary.
#[derive(Error, Debug)]
pub enum VulkanError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Failed to load the Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    Allocator(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Surface creation or query error
    #[error("Surface error: {0}")]
    Surface(String),

    /// Arguments the backend cannot honor
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid SPIR-V or entry point
    #[error("Shader error: {0}")]
    Shader(String),

    /// Graphics pipeline creation failed
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Capability missing from this instance or device
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Result type alias for Vulkan backend internals.
pub type VulkanResult<T> = std::result::Result<T, VulkanError>;

impl From<VulkanError> for RhiError {
    fn from(err: VulkanError) -> Self {
        match err {
            VulkanError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR) => RhiError::SwapchainOutOfDate,
            VulkanError::Vulkan(
                result @ (vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            ) => RhiError::OutOfMemory(result.to_string()),
            VulkanError::Allocator(gpu_allocator::AllocationError::OutOfMemory) => {
                RhiError::OutOfMemory("GPU allocator exhausted".to_string())
            }
            VulkanError::Surface(message) => RhiError::SwapchainError(message),
            VulkanError::InvalidArgument(message) => RhiError::InvalidArgument(message),
            VulkanError::Shader(message) => RhiError::ShaderError(message),
            VulkanError::Pipeline(message) => RhiError::PipelineError(message),
            VulkanError::Unsupported(message) => RhiError::Unsupported(message),
            VulkanError::NoSuitableGpu => RhiError::Unsupported("no suitable GPU".to_string()),
            other => RhiError::Backend(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_date_maps_to_swapchain_out_of_date() {
        let err: RhiError = VulkanError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR).into();
        assert!(matches!(err, RhiError::SwapchainOutOfDate));
    }

    #[test]
    fn test_memory_errors_map_to_out_of_memory() {
        let err: RhiError = VulkanError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).into();
        assert!(matches!(err, RhiError::OutOfMemory(_)));

        let err: RhiError = VulkanError::Allocator(gpu_allocator::AllocationError::OutOfMemory).into();
        assert!(matches!(err, RhiError::OutOfMemory(_)));
    }

    #[test]
    fn test_other_errors_map_to_backend() {
        let err: RhiError = VulkanError::Vulkan(vk::Result::ERROR_DEVICE_LOST).into();
        assert!(matches!(err, RhiError::Backend(_)));
        let err: RhiError = VulkanError::Surface("lost".to_string()).into();
        assert!(matches!(err, RhiError::SwapchainError(_)));
        let err: RhiError = VulkanError::Shader("bad magic".to_string()).into();
        assert!(matches!(err, RhiError::ShaderError(_)));
    }
}
