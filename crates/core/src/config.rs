//! TOML configuration loading.
//!
//! Configuration structs across the workspace derive `Deserialize` with
//! `#[serde(default)]`, so a file only needs to name the values it changes.
//! A missing file is not an error: the defaults are used and a line is logged.
//!
//! # Example
//!
//! ```no_run
//! use serde::Deserialize;
//!
//! #[derive(Debug, Default, Deserialize)]
//! #[serde(default)]
//! struct WindowConfig {
//!     width: u32,
//!     height: u32,
//! }
//!
//! let config: WindowConfig = forge_core::config::load_or_default("forge.toml")?;
//! # Ok::<(), forge_core::Error>(())
//! ```

use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Loads `T` from a TOML file, falling back to `T::default()` when the file
/// does not exist.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file exists but cannot be read, and
/// [`Error::Config`] if its contents are not valid TOML for `T`.
pub fn load_or_default<T>(path: impl AsRef<Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let path = path.as_ref();
    if !path.exists() {
        info!("Config file {} not found, using defaults", path.display());
        return Ok(T::default());
    }

    let contents = std::fs::read_to_string(path)?;
    let config = parse(&contents)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Parses `T` from a TOML string.
///
/// # Errors
///
/// Returns [`Error::Config`] with the parser message on invalid input.
pub fn parse<T: DeserializeOwned>(contents: &str) -> Result<T> {
    toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        frames: u32,
        name: String,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                frames: 2,
                name: "default".to_string(),
            }
        }
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Sample = load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, Sample::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "frames = 3").unwrap();

        let loaded: Sample = load_or_default(file.path()).unwrap();
        assert_eq!(loaded.frames, 3);
        assert_eq!(loaded.name, "default");
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "frames = \"three\"").unwrap();

        let result: Result<Sample> = load_or_default(file.path());
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
