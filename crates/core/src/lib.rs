//! Core utilities shared by the forge crates.
//!
//! This crate provides foundational types and utilities used across the workspace:
//! - Error types and result aliases
//! - Logging initialization
//! - TOML configuration loading

pub mod config;
mod error;
mod logging;

pub use error::{Error, Result};
pub use logging::{init_logging, try_init_logging};
