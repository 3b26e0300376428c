use crate::{device::Device, storage::memory, storage::Buffer, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

pub struct ScratchBuffer {
    buffer: Buffer,
    size: u64,
    alignment: u32,
}

impl ScratchBuffer {
    pub fn new(device: &Arc<dyn Device>, name: &str, size: u64) -> Result<ScratchBuffer> {
        let alignment = device.ray_tracing_properties().scratch_alignment;

        // The buffer that is created may not meet the alignment requirements
        // of the scratch, so we need the extra space to allow for passing an
        // appropriately aligned address.
        let max_size = size + alignment as u64;

        let buffer = Buffer::new(
            device,
            format!("{} build scratch", name),
            max_size,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::GpuOnly,
        )?;

        Ok(ScratchBuffer {
            buffer,
            size,
            alignment,
        })
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        let address = self.buffer.device_address();
        let aligned_address = memory::align(address, self.alignment as _);

        assert!((aligned_address + self.size) <= (address + self.buffer.size()));

        aligned_address
    }

    /// Usable size, excluding the alignment slack.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}
