//! Ray tracing scene management: acceleration structures, pipelines, shader
//! binding tables and per-frame orchestration over a pluggable [`device::Device`].

pub mod commands;
pub mod config;
pub mod device;
mod error;
pub mod frames;
mod lux;
pub mod ray_tracing;
pub mod storage;
pub mod vulkan;

pub use config::{Config, FrameConfig, PipelineConfig};
pub use error::{Error, LayoutViolation, Result};
pub use lux::Lux;
