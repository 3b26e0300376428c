use crate::{
    device::{Device, ImageDescription, ImageId},
    Result,
};
use ash::vk;
use std::sync::Arc;

pub struct Image {
    device: Arc<dyn Device>,
    id: ImageId,
    name: String,
    size: (u32, u32),
    format: vk::Format,
}

impl Image {
    pub fn new(
        device: &Arc<dyn Device>,
        name: impl Into<String>,
        size: (u32, u32),
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Result<Image> {
        let name = name.into();
        log::debug!("Allocating {:?}", name);

        let id = device.create_image(&ImageDescription {
            name: &name,
            width: size.0,
            height: size.1,
            format,
            usage,
        })?;

        Ok(Image {
            device: device.clone(),
            id,
            name,
            size,
            format,
        })
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        log::debug!("Freeing {:?}", self.name);
        self.device.destroy_image(self.id);
    }
}
