use crate::{
    device::{AccelerationStructureId, AccelerationStructureType, Device},
    storage::Buffer,
    Result,
};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// An acceleration structure object and the device-local buffer backing it.
pub struct AccelerationStructure {
    device: Arc<dyn Device>,
    buffer: Buffer,
    id: AccelerationStructureId,
    ty: AccelerationStructureType,
    device_address: vk::DeviceAddress,
}

impl AccelerationStructure {
    /// Allocates exactly `size` bytes of result storage.
    pub fn new(
        device: &Arc<dyn Device>,
        name: &str,
        ty: AccelerationStructureType,
        size: vk::DeviceSize,
    ) -> Result<AccelerationStructure> {
        let buffer = Buffer::new(
            device,
            format!("{} acceleration structure", name),
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
            MemoryLocation::GpuOnly,
        )?;

        let id = device.create_acceleration_structure(ty, buffer.id(), size)?;
        let device_address = device.acceleration_structure_address(id)?;

        Ok(AccelerationStructure {
            device: device.clone(),
            buffer,
            id,
            ty,
            device_address,
        })
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn id(&self) -> AccelerationStructureId {
        self.id
    }

    pub fn ty(&self) -> AccelerationStructureType {
        self.ty
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        self.device.destroy_acceleration_structure(self.id);
    }
}
