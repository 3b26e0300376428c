//! The capability interface the ray tracing core is written against.
//!
//! Everything above this module talks to the GPU through [`Device`]; the
//! Vulkan backend lives in [`crate::vulkan`] and a host-memory software
//! implementation in [`HeadlessDevice`].

mod headless;

pub use headless::HeadlessDevice;

use crate::{
    commands::CommandList,
    config::PipelineConfig,
    ray_tracing::{DescriptorKind, ShaderLibrary, ShaderStage},
    Result,
};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::fmt;

macro_rules! resource_id {
    ($name:ident, $kind:literal) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub const KIND: &'static str = $kind;
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

resource_id!(BufferId, "buffer");
resource_id!(ImageId, "image");
resource_id!(AccelerationStructureId, "acceleration structure");
resource_id!(PipelineId, "pipeline");
resource_id!(DescriptorTableId, "descriptor table");
resource_id!(SubmissionIndex, "submission");

/// Alignment and size rules for shader binding tables and build scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingProperties {
    /// Size of a program identifier in bytes.
    pub shader_group_handle_size: u32,
    /// Alignment of every record within a section.
    pub shader_group_handle_alignment: u32,
    /// Alignment of the start of every section.
    pub shader_group_base_alignment: u32,
    pub scratch_alignment: u32,
    pub max_recursion_depth: u32,
}

#[derive(Debug, Clone)]
pub struct BufferDescription<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub alignment: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferAllocation {
    pub id: BufferId,
    pub device_address: vk::DeviceAddress,
    pub allocated_size: u64,
}

#[derive(Debug, Clone)]
pub struct ImageDescription<'a> {
    pub name: &'a str,
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationStructureType {
    BottomLevel,
    TopLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexData {
    pub address: vk::DeviceAddress,
    pub count: u32,
    pub index_type: vk::IndexType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuildGeometry {
    Triangles {
        vertex_address: vk::DeviceAddress,
        vertex_count: u32,
        vertex_stride: u64,
        vertex_format: vk::Format,
        indices: Option<IndexData>,
    },
    Instances {
        address: vk::DeviceAddress,
        count: u32,
    },
}

impl BuildGeometry {
    pub fn primitive_count(&self) -> u32 {
        match self {
            BuildGeometry::Triangles {
                indices: Some(indices),
                ..
            } => indices.count / 3,
            BuildGeometry::Triangles { vertex_count, .. } => vertex_count / 3,
            BuildGeometry::Instances { count, .. } => *count,
        }
    }
}

/// Geometry and flags of a build, shared by the size query and the build
/// command itself so the two can never disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildInputs {
    pub ty: AccelerationStructureType,
    pub geometries: Vec<BuildGeometry>,
    pub allow_update: bool,
}

impl BuildInputs {
    pub fn primitive_counts(&self) -> Vec<u32> {
        self.geometries
            .iter()
            .map(BuildGeometry::primitive_count)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildSizes {
    pub acceleration_structure: vk::DeviceSize,
    pub build_scratch: vk::DeviceSize,
    pub update_scratch: vk::DeviceSize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescription {
    pub library: usize,
    pub symbol: String,
    pub stage: ShaderStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderGroupDescription {
    General { stage: u32 },
    TrianglesHit { closest_hit: u32 },
}

pub struct PipelineDescription<'a> {
    pub name: &'a str,
    pub libraries: &'a [ShaderLibrary],
    pub stages: &'a [StageDescription],
    pub groups: &'a [ShaderGroupDescription],
    pub descriptor_table: &'a [DescriptorKind],
    pub config: PipelineConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorWrite {
    StorageImage(ImageId),
    AccelerationStructure(AccelerationStructureId),
    UniformBuffer { buffer: BufferId, size: u64 },
    StorageBuffer { buffer: BufferId, size: u64 },
}

impl DescriptorWrite {
    pub fn kind(&self) -> DescriptorKind {
        match self {
            DescriptorWrite::StorageImage(_) => DescriptorKind::StorageImage,
            DescriptorWrite::AccelerationStructure(_) => DescriptorKind::AccelerationStructure,
            DescriptorWrite::UniformBuffer { .. } => DescriptorKind::UniformBuffer,
            DescriptorWrite::StorageBuffer { .. } => DescriptorKind::StorageBuffer,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DescriptorTableAllocation {
    pub id: DescriptorTableId,
    /// Opaque 64-bit handle written into shader binding table records.
    pub handle: u64,
}

pub trait Device: Send + Sync {
    fn name(&self) -> &str;
    fn supports_ray_tracing(&self) -> bool;
    fn ray_tracing_properties(&self) -> RayTracingProperties;

    fn create_buffer(&self, description: &BufferDescription) -> Result<BufferAllocation>;
    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()>;
    fn read_buffer(&self, buffer: BufferId, offset: u64, len: u64) -> Result<Vec<u8>>;
    fn destroy_buffer(&self, buffer: BufferId);

    fn create_image(&self, description: &ImageDescription) -> Result<ImageId>;
    fn destroy_image(&self, image: ImageId);

    fn acceleration_structure_build_sizes(&self, inputs: &BuildInputs) -> Result<BuildSizes>;
    fn create_acceleration_structure(
        &self,
        ty: AccelerationStructureType,
        buffer: BufferId,
        size: u64,
    ) -> Result<AccelerationStructureId>;
    fn acceleration_structure_address(
        &self,
        acceleration_structure: AccelerationStructureId,
    ) -> Result<vk::DeviceAddress>;
    fn destroy_acceleration_structure(&self, acceleration_structure: AccelerationStructureId);

    fn create_ray_tracing_pipeline(&self, description: &PipelineDescription) -> Result<PipelineId>;
    /// Identifiers of every group of the pipeline, in declaration order,
    /// `shader_group_handle_size` bytes each.
    fn shader_group_handles(&self, pipeline: PipelineId) -> Result<Vec<u8>>;
    fn destroy_pipeline(&self, pipeline: PipelineId);

    fn create_descriptor_table(
        &self,
        name: &str,
        kinds: &[DescriptorKind],
    ) -> Result<DescriptorTableAllocation>;
    fn write_descriptor(
        &self,
        table: DescriptorTableId,
        slot: u32,
        write: &DescriptorWrite,
    ) -> Result<()>;
    fn destroy_descriptor_table(&self, table: DescriptorTableId);

    fn submit(&self, commands: CommandList) -> Result<SubmissionIndex>;
    fn wait(&self, submission: SubmissionIndex) -> Result<()>;
    fn is_complete(&self, submission: SubmissionIndex) -> bool;
    fn wait_until_idle(&self) -> Result<()>;
}

impl fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({})", self.name())
    }
}
