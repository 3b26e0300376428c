use super::sync::Fence;
use crate::{
    device::{
        AccelerationStructureId, AccelerationStructureType, BufferId, DescriptorTableId, ImageId,
        PipelineId, SubmissionIndex,
    },
    ray_tracing::DescriptorKind,
    Error, Result,
};
use ash::vk;
use gpu_allocator::{vulkan::Allocation, MemoryLocation};
use std::collections::{BTreeMap, HashMap};

pub struct VulkanBuffer {
    pub raw: vk::Buffer,
    pub allocation: Allocation,
    pub name: String,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

pub struct VulkanImage {
    pub raw: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Allocation,
    pub name: String,
}

pub struct VulkanAccelerationStructure {
    pub raw: vk::AccelerationStructureKHR,
    pub ty: AccelerationStructureType,
}

pub struct VulkanPipeline {
    pub raw: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layout: vk::DescriptorSetLayout,
    pub group_count: u32,
}

pub struct VulkanDescriptorTable {
    pub pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
    pub set_layout: vk::DescriptorSetLayout,
    pub kinds: Vec<DescriptorKind>,
}

pub struct InFlight {
    pub command_buffer: vk::CommandBuffer,
    pub fence: Fence,
}

/// Every live object handed out by the device, keyed by the ids the rest of
/// the crate holds.
#[derive(Default)]
pub struct State {
    next_id: u64,
    pub buffers: HashMap<BufferId, VulkanBuffer>,
    pub images: HashMap<ImageId, VulkanImage>,
    pub acceleration_structures: HashMap<AccelerationStructureId, VulkanAccelerationStructure>,
    pub pipelines: HashMap<PipelineId, VulkanPipeline>,
    pub descriptor_tables: HashMap<DescriptorTableId, VulkanDescriptorTable>,
    pub submissions: BTreeMap<SubmissionIndex, InFlight>,
    pub submission_count: u64,
}

fn unknown(kind: &'static str, id: u64) -> Error {
    Error::UnknownResource { kind, id }
}

impl State {
    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn buffer(&self, id: BufferId) -> Result<&VulkanBuffer> {
        self.buffers
            .get(&id)
            .ok_or_else(|| unknown(BufferId::KIND, id.0))
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> Result<&mut VulkanBuffer> {
        self.buffers
            .get_mut(&id)
            .ok_or_else(|| unknown(BufferId::KIND, id.0))
    }

    pub fn image(&self, id: ImageId) -> Result<&VulkanImage> {
        self.images
            .get(&id)
            .ok_or_else(|| unknown(ImageId::KIND, id.0))
    }

    pub fn acceleration_structure(
        &self,
        id: AccelerationStructureId,
    ) -> Result<&VulkanAccelerationStructure> {
        self.acceleration_structures
            .get(&id)
            .ok_or_else(|| unknown(AccelerationStructureId::KIND, id.0))
    }

    pub fn pipeline(&self, id: PipelineId) -> Result<&VulkanPipeline> {
        self.pipelines
            .get(&id)
            .ok_or_else(|| unknown(PipelineId::KIND, id.0))
    }

    pub fn descriptor_table(&self, id: DescriptorTableId) -> Result<&VulkanDescriptorTable> {
        self.descriptor_tables
            .get(&id)
            .ok_or_else(|| unknown(DescriptorTableId::KIND, id.0))
    }
}
