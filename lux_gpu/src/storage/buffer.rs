use crate::{
    device::{BufferDescription, BufferId, Device},
    Error, Result,
};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::MemoryLocation;
use std::{fmt, mem, sync::Arc};

pub struct Buffer {
    device: Arc<dyn Device>,
    id: BufferId,
    name: String,
    size: u64,
    allocated_size: u64,
    location: MemoryLocation,
    device_address: vk::DeviceAddress,
}

impl Buffer {
    pub fn new(
        device: &Arc<dyn Device>,
        name: impl Into<String>,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Buffer> {
        Self::new_aligned(device, name, size, usage, location, None)
    }

    pub fn new_aligned(
        device: &Arc<dyn Device>,
        name: impl Into<String>,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        alignment: Option<u64>,
    ) -> Result<Buffer> {
        let name = name.into();
        log::debug!("Allocating {:?}", name);

        let allocation = device.create_buffer(&BufferDescription {
            name: &name,
            size,
            usage: usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location,
            alignment,
        })?;

        Ok(Buffer {
            device: device.clone(),
            id: allocation.id,
            name,
            size,
            allocated_size: allocation.allocated_size,
            location,
            device_address: allocation.device_address,
        })
    }

    pub fn new_from_data<T: Pod>(
        device: &Arc<dyn Device>,
        name: impl Into<String>,
        data: &[T],
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Buffer> {
        let size = mem::size_of_val(data) as u64;
        let buffer = Buffer::new(device, name, size, usage, location)?;
        buffer.fill(data)?;

        Ok(buffer)
    }

    /// Replaces the whole contents of the buffer. `data` must be exactly the
    /// size of the buffer.
    pub fn fill<T: Pod>(&self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as u64 != self.size {
            return Err(Error::InvalidArgument {
                name: self.name.clone(),
                reason: format!("{} bytes filled into {} bytes", bytes.len(), self.size),
            });
        }

        self.device.write_buffer(self.id, 0, bytes)
    }

    pub fn write<T: Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let end = offset.checked_add(bytes.len() as u64);
        if end.map_or(true, |end| end > self.size) {
            return Err(Error::BufferOverflow {
                name: self.name.clone(),
                offset,
                len: bytes.len() as u64,
                size: self.size,
            });
        }

        self.device.write_buffer(self.id, offset, bytes)
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        self.device.read_buffer(self.id, 0, self.size)
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn allocated_size(&self) -> u64 {
        self.allocated_size
    }

    /// Number of `T` the buffer holds.
    pub fn count<T>(&self) -> u64 {
        self.size / mem::size_of::<T>() as u64
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Buffer({}|{}@{:#x})",
            self.name, self.size, self.device_address
        )
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        log::debug!("Freeing {:?}", self.name);
        self.device.destroy_buffer(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeadlessDevice;

    fn buffer(device: &Arc<dyn Device>) -> Buffer {
        Buffer::new(
            device,
            "constants",
            16,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )
        .unwrap()
    }

    #[test]
    fn test_fill_must_match_size() {
        let device: Arc<dyn Device> = HeadlessDevice::new();
        let buffer = buffer(&device);

        assert!(matches!(
            buffer.fill(&[0u32; 3]),
            Err(Error::InvalidArgument { .. })
        ));
        buffer.fill(&[7u32; 4]).unwrap();
        assert_eq!(&buffer.read().unwrap()[..4], &7u32.to_le_bytes());
    }

    #[test]
    fn test_write_past_end() {
        let device: Arc<dyn Device> = HeadlessDevice::new();
        let buffer = buffer(&device);

        assert!(matches!(
            buffer.write(12, &[0u32; 2]),
            Err(Error::BufferOverflow { offset: 12, len: 8, size: 16, .. })
        ));
        assert!(matches!(
            buffer.write(u64::MAX, &[0u8; 1]),
            Err(Error::BufferOverflow { .. })
        ));
        buffer.write(12, &[1u32]).unwrap();
    }
}
