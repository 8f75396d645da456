//! Device configuration.

use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_MAX_IDLE_FRAMES;
use crate::error::{RhiError, RhiResult};

/// Largest supported number of frames in flight.
pub const MAX_FRAMES_IN_FLIGHT: u32 = 3;

/// Tunables of a [`Device`](crate::device::Device).
///
/// Deserialized from the `[device]` table of the application config; every
/// field falls back to its default when absent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Size of the frame ring. Resources destroyed in a frame are released
    /// this many `new_frame` calls later.
    pub frames_in_flight: u32,
    /// Frames a cached render pass or pipeline survives without a lookup.
    pub cache_max_idle_frames: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            cache_max_idle_frames: DEFAULT_MAX_IDLE_FRAMES,
        }
    }
}

impl DeviceConfig {
    /// Checks the ranges the device relies on.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Config`] if `frames_in_flight` is outside
    /// `1..=MAX_FRAMES_IN_FLIGHT`, or if cached objects could be evicted while
    /// a frame still in flight references them.
    pub fn validate(&self) -> RhiResult<()> {
        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&self.frames_in_flight) {
            return Err(config_error(format!(
                "frames_in_flight must be in 1..={}, got {}",
                MAX_FRAMES_IN_FLIGHT, self.frames_in_flight
            )));
        }
        if self.cache_max_idle_frames < self.frames_in_flight {
            return Err(config_error(format!(
                "cache_max_idle_frames ({}) must be at least frames_in_flight ({})",
                self.cache_max_idle_frames, self.frames_in_flight
            )));
        }
        Ok(())
    }
}

fn config_error(message: String) -> RhiError {
    RhiError::Config(forge_core::Error::Config(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = DeviceConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.cache_max_idle_frames, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frames_in_flight_range() {
        for frames in [0, MAX_FRAMES_IN_FLIGHT + 1] {
            let config = DeviceConfig {
                frames_in_flight: frames,
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(RhiError::Config(_))));
        }
    }

    #[test]
    fn test_cache_must_outlive_frame_ring() {
        let config = DeviceConfig {
            frames_in_flight: 3,
            cache_max_idle_frames: 2,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_partial_table() {
        let config: DeviceConfig = forge_core::config::parse("frames_in_flight = 3").unwrap();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.cache_max_idle_frames, DEFAULT_MAX_IDLE_FRAMES);
    }
}
