//! Application configuration, read from `forge.toml`.

use std::path::PathBuf;

use forge_rhi::DeviceConfig;
use forge_vulkan::VulkanConfig;
use serde::{Deserialize, Serialize};

/// Which backend the device drives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// CPU backend; needs no GPU.
    #[default]
    Headless,
    /// Vulkan, rendering offscreen.
    Vulkan,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendKind,
    /// Number of frames rendered before shutdown.
    pub frames: u32,
    /// Threads recording draws each frame.
    pub worker_threads: usize,
    /// Triangles each worker draws per frame.
    pub draws_per_worker: u32,
    /// Size of the offscreen color target.
    pub width: u32,
    pub height: u32,
    /// Directory holding `triangle.vert.spv` and `triangle.frag.spv`.
    pub shader_dir: PathBuf,
    pub device: DeviceConfig,
    pub vulkan: VulkanConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Headless,
            frames: 6,
            worker_threads: 4,
            draws_per_worker: 16,
            width: 640,
            height: 360,
            shader_dir: PathBuf::from("shaders/spirv"),
            device: DeviceConfig::default(),
            vulkan: VulkanConfig::default(),
        }
    }
}

impl AppConfig {
    /// Rejects values the frame loop cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`forge_core::Error::Config`] naming the offending field.
    pub fn validate(&self) -> forge_core::Result<()> {
        if self.worker_threads == 0 {
            return Err(forge_core::Error::Config("worker_threads must be at least 1".to_string()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(forge_core::Error::Config(format!(
                "target size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_headless() {
        let config = AppConfig::default();
        assert_eq!(config.backend, BackendKind::Headless);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_nested_tables() {
        let config: AppConfig = forge_core::config::parse(
            r#"
            backend = "vulkan"
            frames = 2

            [device]
            frames_in_flight = 3

            [vulkan]
            enable_validation = false
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Vulkan);
        assert_eq!(config.frames, 2);
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.device.frames_in_flight, 3);
        assert!(!config.vulkan.enable_validation);
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(forge_core::config::parse::<AppConfig>(r#"backend = "metal""#).is_err());
    }

    #[test]
    fn test_zero_workers_is_invalid() {
        let config = AppConfig {
            worker_threads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sample_file_parses() {
        let config: AppConfig = forge_core::config::parse(include_str!("../../../forge.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.device, DeviceConfig::default());
    }
}
