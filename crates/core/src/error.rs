//! Error type shared by the non-GPU parts of the workspace.

use thiserror::Error;

/// Failure while loading or validating configuration.
///
/// GPU failures have their own types in `forge-rhi` and the backends.
/// `forge_rhi::RhiError::Config` wraps this one.
#[derive(Error, Debug)]
pub enum Error {
    /// The config file exists but could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse failure or out-of-range value
    #[error("Config error: {0}")]
    Config(String),
}

/// Result type alias using the core Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "IO error: denied");
    }
}
