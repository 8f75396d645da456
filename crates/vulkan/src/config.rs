//! Vulkan backend configuration.

use serde::{Deserialize, Serialize};

/// Options for creating a [`VulkanBackend`](crate::VulkanBackend).
///
/// Deserialized from the `[vulkan]` table of the application config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VulkanConfig {
    /// Enables the Khronos validation layer and routes its messages into
    /// `tracing`. Ignored with a warning when the layer is not installed.
    pub enable_validation: bool,
    /// Application name reported to the driver.
    pub application_name: String,
    /// Scores discrete GPUs above integrated ones during device selection.
    pub prefer_discrete_gpu: bool,
}

impl Default for VulkanConfig {
    fn default() -> Self {
        Self {
            enable_validation: cfg!(debug_assertions),
            application_name: "forge".to_string(),
            prefer_discrete_gpu: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VulkanConfig::default();
        assert_eq!(config.enable_validation, cfg!(debug_assertions));
        assert_eq!(config.application_name, "forge");
        assert!(config.prefer_discrete_gpu);
    }

    #[test]
    fn test_partial_table() {
        let config: VulkanConfig = forge_core::config::parse("prefer_discrete_gpu = false").unwrap();
        assert!(!config.prefer_discrete_gpu);
        assert_eq!(config.application_name, "forge");
    }
}
