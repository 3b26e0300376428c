use super::TopLevelAccelerationStructure;
use crate::{
    device::{DescriptorTableId, DescriptorWrite, Device},
    error::LayoutViolation,
    storage::{Buffer, Image},
    Error, Result,
};
use ash::vk;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// Read/write image
    StorageImage,
    AccelerationStructure,
    UniformBuffer,
    StorageBuffer,
}

impl DescriptorKind {
    pub fn name(&self) -> &'static str {
        match self {
            DescriptorKind::StorageImage => "storage image",
            DescriptorKind::AccelerationStructure => "acceleration structure",
            DescriptorKind::UniformBuffer => "uniform buffer",
            DescriptorKind::StorageBuffer => "storage buffer",
        }
    }
}

/// The fixed slot order of a descriptor table. Binding layouts that reference
/// the table are checked against it when the pipeline is finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorTableLayout {
    kinds: Vec<DescriptorKind>,
}

impl DescriptorTableLayout {
    pub const OUTPUT_IMAGE: u32 = 0;
    pub const SCENE: u32 = 1;
    pub const CAMERA: u32 = 2;

    pub fn new(kinds: Vec<DescriptorKind>) -> Self {
        Self { kinds }
    }

    /// Output image, scene and camera constants, in that order.
    pub fn ray_generation() -> Self {
        Self::new(vec![
            DescriptorKind::StorageImage,
            DescriptorKind::AccelerationStructure,
            DescriptorKind::UniformBuffer,
        ])
    }

    pub fn kinds(&self) -> &[DescriptorKind] {
        &self.kinds
    }

    pub fn capacity(&self) -> u32 {
        self.kinds.len() as u32
    }

    pub fn kind(&self, slot: u32) -> Option<DescriptorKind> {
        self.kinds.get(slot as usize).copied()
    }

    pub fn check(&self, slot: u32, kind: DescriptorKind) -> std::result::Result<(), LayoutViolation> {
        match self.kind(slot) {
            None => Err(LayoutViolation::DescriptorSlotOutOfRange {
                slot,
                capacity: self.capacity(),
            }),
            Some(expected) if expected != kind => Err(LayoutViolation::DescriptorKind {
                slot,
                expected: expected.name(),
                actual: kind.name(),
            }),
            Some(_) => Ok(()),
        }
    }
}

pub struct DescriptorTable {
    device: Arc<dyn Device>,
    name: String,
    id: DescriptorTableId,
    handle: u64,
    layout: Arc<DescriptorTableLayout>,
    acceleration_structure: Option<vk::DeviceAddress>,
}

impl DescriptorTable {
    /// Allocates a table with one slot per entry of `layout`.
    pub fn allocate(
        device: &Arc<dyn Device>,
        name: impl Into<String>,
        layout: Arc<DescriptorTableLayout>,
    ) -> Result<DescriptorTable> {
        let name = name.into();
        log::debug!("Allocating {:?} with {} slots", name, layout.capacity());

        let allocation = device.create_descriptor_table(&name, layout.kinds())?;

        Ok(DescriptorTable {
            device: device.clone(),
            name,
            id: allocation.id,
            handle: allocation.handle,
            layout,
            acceleration_structure: None,
        })
    }

    pub fn write_output_image(&mut self, slot: u32, image: &Image) -> Result<()> {
        self.write(slot, DescriptorWrite::StorageImage(image.id()))
    }

    pub fn write_acceleration_structure(
        &mut self,
        slot: u32,
        tlas: &TopLevelAccelerationStructure,
    ) -> Result<()> {
        self.write(
            slot,
            DescriptorWrite::AccelerationStructure(tlas.acceleration_structure().id()),
        )?;
        self.acceleration_structure = Some(tlas.device_address());

        Ok(())
    }

    pub fn write_constant_buffer(&mut self, slot: u32, buffer: &Buffer, size: u64) -> Result<()> {
        if size > buffer.size() {
            return Err(Error::BufferOverflow {
                name: buffer.name().to_string(),
                offset: 0,
                len: size,
                size: buffer.size(),
            });
        }
        self.write(
            slot,
            DescriptorWrite::UniformBuffer {
                buffer: buffer.id(),
                size,
            },
        )
    }

    fn write(&mut self, slot: u32, write: DescriptorWrite) -> Result<()> {
        self.layout.check(slot, write.kind())?;
        log::debug!("{}: slot {} <- {:?}", self.name, slot, write);
        self.device.write_descriptor(self.id, slot, &write)
    }

    /// Whether the table references `tlas` at its current address. False
    /// after a full rebuild moved the structure.
    pub fn points_at(&self, tlas: &TopLevelAccelerationStructure) -> bool {
        self.acceleration_structure == Some(tlas.device_address())
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn id(&self) -> DescriptorTableId {
        self.id
    }

    pub fn layout(&self) -> &Arc<DescriptorTableLayout> {
        &self.layout
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DescriptorTable {
    fn drop(&mut self) {
        log::debug!("Freeing {:?}", self.name);
        self.device.destroy_descriptor_table(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeadlessDevice;
    use gpu_allocator::MemoryLocation;

    fn table() -> (Arc<dyn Device>, DescriptorTable) {
        let device: Arc<dyn Device> = HeadlessDevice::new();
        let table = DescriptorTable::allocate(
            &device,
            "frame table",
            Arc::new(DescriptorTableLayout::ray_generation()),
        )
        .unwrap();
        (device, table)
    }

    #[test]
    fn test_writes_follow_layout() {
        let (device, mut table) = table();
        let image = Image::new(
            &device,
            "output",
            (4, 4),
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::STORAGE,
        )
        .unwrap();
        let camera = Buffer::new(
            &device,
            "camera",
            256,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )
        .unwrap();

        table
            .write_output_image(DescriptorTableLayout::OUTPUT_IMAGE, &image)
            .unwrap();
        table
            .write_constant_buffer(DescriptorTableLayout::CAMERA, &camera, 256)
            .unwrap();
    }

    #[test]
    fn test_wrong_slot_is_rejected() {
        let (device, mut table) = table();
        let camera = Buffer::new(
            &device,
            "camera",
            256,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )
        .unwrap();

        let result = table.write_constant_buffer(DescriptorTableLayout::SCENE, &camera, 256);

        assert!(matches!(
            result,
            Err(Error::LayoutContract(LayoutViolation::DescriptorKind { slot: 1, .. }))
        ));
    }

    #[test]
    fn test_slot_out_of_range() {
        let (device, mut table) = table();
        let image = Image::new(
            &device,
            "output",
            (4, 4),
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::STORAGE,
        )
        .unwrap();

        let result = table.write_output_image(3, &image);

        assert!(matches!(
            result,
            Err(Error::LayoutContract(
                LayoutViolation::DescriptorSlotOutOfRange { slot: 3, capacity: 3 }
            ))
        ));
    }

    #[test]
    fn test_constant_range_larger_than_buffer() {
        let (device, mut table) = table();
        let camera = Buffer::new(
            &device,
            "camera",
            64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )
        .unwrap();

        let result = table.write_constant_buffer(DescriptorTableLayout::CAMERA, &camera, 256);

        assert!(matches!(
            result,
            Err(Error::BufferOverflow { len: 256, size: 64, .. })
        ));
    }
}
