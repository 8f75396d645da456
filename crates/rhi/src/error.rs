//! RHI-specific error types.

use thiserror::Error;

/// Error returned by fallible device and backend operations.
///
/// Programmer errors (stale or wrong-typed handles, leaks at shutdown) are not
/// represented here; they panic.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Native API failure that has no more specific variant
    #[error("Backend error: {0}")]
    Backend(String),

    /// Device or host memory exhausted
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Create info or call arguments rejected before reaching the backend
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Shader module creation error
    #[error("Shader error: {0}")]
    ShaderError(String),

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    PipelineError(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// The swapchain no longer matches its surface and must be resized
    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,

    /// The backend does not implement the requested operation
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration loading or validation error
    #[error(transparent)]
    Config(#[from] forge_core::Error),
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

/// Failure of a checked [`StableIndexArena`](crate::arena::StableIndexArena) access.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    /// The index is past the end of the arena's slots
    #[error("index {index} out of range (size {size})")]
    OutOfRange { index: usize, size: usize },

    /// The slot exists but holds no element
    #[error("use after free at index {index}")]
    UseAfterFree { index: usize },
}
