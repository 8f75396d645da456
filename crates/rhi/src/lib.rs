//! Backend-agnostic GPU resource and command recording core.
//!
//! This crate sits between engine code and a native graphics backend. It
//! handles:
//! - Type-tagged resource handles and stable-index arenas
//! - Resource creation with staged uploads and deferred destruction
//! - A ring of frames in flight with fences and per-thread command pools
//! - Render pass and pipeline caching with idle-frame eviction
//! - Command lists that resolve pipelines and descriptor sets lazily
//!
//! Native APIs plug in through the [`Backend`](backend::Backend) trait.
//! [`HeadlessBackend`](backend::HeadlessBackend) implements it on the CPU
//! for tests and GPU-less runs.

mod error;
mod frame;

pub mod arena;
pub mod backend;
pub mod cache;
pub mod command_list;
pub mod command_pool;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod handle;
pub mod pipeline;
pub mod render_pass;
pub mod resource;
pub mod types;

pub use config::DeviceConfig;
pub use device::Device;
pub use error::{ArenaError, RhiError, RhiResult};
