use super::BottomLevelAccelerationStructure;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use std::sync::Arc;

/// One placement of a bottom level structure in a scene. The index and hit
/// group offset are assigned by the top level builder from the instance's
/// position.
#[derive(Clone)]
pub struct Instance {
    blas: Arc<BottomLevelAccelerationStructure>,
    transform: Mat4,
    index: u32,
    hit_group_offset: u32,
    mask: u8,
    flags: vk::GeometryInstanceFlagsKHR,
}

impl Instance {
    /// Largest instance index or hit group offset a descriptor can hold.
    pub const MAX_PACKED: u32 = 0x00ff_ffff;

    pub fn new(blas: Arc<BottomLevelAccelerationStructure>, transform: Mat4) -> Self {
        Self {
            blas,
            transform,
            index: 0,
            hit_group_offset: 0,
            mask: 0xff,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
        }
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    pub fn blas(&self) -> &Arc<BottomLevelAccelerationStructure> {
        &self.blas
    }

    pub fn transform(&self) -> Mat4 {
        self.transform
    }

    pub fn set_transform(&mut self, transform: Mat4) {
        self.transform = transform;
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn hit_group_offset(&self) -> u32 {
        self.hit_group_offset
    }

    pub fn mask(&self) -> u8 {
        self.mask
    }

    pub(crate) fn assign(&mut self, index: u32, hit_groups_per_instance: u32) {
        self.index = index;
        self.hit_group_offset = index * hit_groups_per_instance;
    }

    pub fn descriptor(&self) -> InstanceDescriptor {
        InstanceDescriptor::new(
            self.transform,
            self.index,
            self.mask,
            self.hit_group_offset,
            self.flags.as_raw() as u8,
            self.blas.device_address(),
        )
    }
}

/// Hit group offsets for `count` instances with `hit_groups_per_instance`
/// consecutive hit group records each.
pub fn hit_group_offsets(count: u32, hit_groups_per_instance: u32) -> Vec<u32> {
    (0..count).map(|index| index * hit_groups_per_instance).collect()
}

/// The 64 byte instance record read by top level builds.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceDescriptor {
    /// Row-major 3x4 object to world transform.
    pub transform: [f32; 12],
    pub custom_index_and_mask: u32,
    pub hit_group_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl InstanceDescriptor {
    pub fn new(
        transform: Mat4,
        custom_index: u32,
        mask: u8,
        hit_group_offset: u32,
        flags: u8,
        acceleration_structure_reference: vk::DeviceAddress,
    ) -> Self {
        let rows = transform.transpose().to_cols_array();
        let mut transform = [0.0; 12];
        transform.copy_from_slice(&rows[..12]);

        Self {
            transform,
            custom_index_and_mask: pack_24_8(custom_index, mask),
            hit_group_offset_and_flags: pack_24_8(hit_group_offset, flags),
            acceleration_structure_reference,
        }
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & 0x00ff_ffff
    }

    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    pub fn hit_group_offset(&self) -> u32 {
        self.hit_group_offset_and_flags & 0x00ff_ffff
    }
}

fn pack_24_8(low_24: u32, high_8: u8) -> u32 {
    debug_assert!(low_24 <= Instance::MAX_PACKED, "{} does not fit in 24 bits", low_24);
    (low_24 & Instance::MAX_PACKED) | ((high_8 as u32) << 24)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{vec3, Vec4};
    use std::mem;

    #[test]
    fn test_descriptor_matches_vulkan_layout() {
        assert_eq!(mem::size_of::<InstanceDescriptor>(), 64);
        assert_eq!(
            mem::size_of::<InstanceDescriptor>(),
            mem::size_of::<vk::AccelerationStructureInstanceKHR>()
        );
    }

    #[test]
    fn test_transform_is_row_major() {
        let transform = Mat4::from_translation(vec3(1.0, 2.0, 3.0));
        let descriptor = InstanceDescriptor::new(transform, 0, 0xff, 0, 0, 0);

        assert_eq!(
            descriptor.transform,
            [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]
        );
        assert_eq!(transform.row(3), Vec4::new(0.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn test_packing() {
        let descriptor = InstanceDescriptor::new(Mat4::IDENTITY, 7, 0x0f, 2, 1, 0xabcd);

        assert_eq!(descriptor.custom_index(), 7);
        assert_eq!(descriptor.mask(), 0x0f);
        assert_eq!(descriptor.hit_group_offset(), 2);
        assert_eq!(descriptor.hit_group_offset_and_flags >> 24, 1);
        assert_eq!(descriptor.acceleration_structure_reference, 0xabcd);
    }

    #[test]
    fn test_hit_group_offsets() {
        assert_eq!(hit_group_offsets(2, 2), vec![0, 2]);
        assert_eq!(hit_group_offsets(5, 2), vec![0, 2, 4, 6, 8]);
        assert!(hit_group_offsets(0, 2).is_empty());
    }
}
