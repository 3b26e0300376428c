//! Vulkan implementation of [`crate::device::Device`] on top of `ash` and
//! `gpu-allocator`.

mod acceleration_structures;
mod commands;
mod debug;
mod device;
mod instance;
mod physical_device;
mod resources;
mod sync;

pub use device::VulkanDevice;
pub use instance::VulkanInstance;
pub use physical_device::PhysicalDevice;
