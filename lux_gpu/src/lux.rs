use crate::{
    config::Config,
    device::{Device, HeadlessDevice},
    vulkan::VulkanDevice,
    Error, Result,
};
use log::info;
use std::sync::Arc;

/// Entry point holding the device everything else is created from.
pub struct Lux {
    device: Arc<dyn Device>,
}

impl Lux {
    /// Wraps an existing device, refusing one that cannot trace rays.
    pub fn from_device(device: Arc<dyn Device>) -> Result<Lux> {
        if !device.supports_ray_tracing() {
            return Err(Error::UnsupportedDevice(device.name().to_string()));
        }

        info!("Selected device: {}", device.name());
        Ok(Lux { device })
    }

    pub fn vulkan(config: &Config) -> Result<Lux> {
        let device: Arc<dyn Device> = VulkanDevice::new(config)?;
        Self::from_device(device)
    }

    pub fn headless() -> Result<Lux> {
        let device: Arc<dyn Device> = HeadlessDevice::new();
        Self::from_device(device)
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_is_ray_tracing_capable() {
        let lux = Lux::headless().unwrap();
        assert_eq!(lux.device().name(), "Headless");
    }

    #[test]
    fn test_device_without_ray_tracing_is_rejected() {
        let device: Arc<dyn Device> = HeadlessDevice::without_ray_tracing();
        assert!(matches!(
            Lux::from_device(device),
            Err(Error::UnsupportedDevice(name)) if name == "Headless"
        ));
    }
}
