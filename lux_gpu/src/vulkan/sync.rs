use crate::Result;
use ash::vk;

pub struct Fence {
    device: ash::Device,
    name: String,
    raw: vk::Fence,
}

impl Fence {
    pub fn new(device: &ash::Device, name: String) -> Result<Fence> {
        let raw = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }?;

        Ok(Fence {
            device: device.clone(),
            name,
            raw,
        })
    }

    pub unsafe fn raw(&self) -> vk::Fence {
        self.raw
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wait(&self) -> Result<()> {
        log::debug!("Waiting on fence {}", self.name);
        unsafe { self.device.wait_for_fences(&[self.raw], true, u64::MAX) }?;
        log::debug!("Fence {} wait complete", self.name);
        Ok(())
    }

    pub fn is_signaled(&self) -> Result<bool> {
        Ok(unsafe { self.device.get_fence_status(self.raw) }?)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.raw, None);
        }
    }
}
