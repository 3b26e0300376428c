mod acceleration_structures;
mod descriptor_table;
mod pipeline;
mod shader_binding_table;

pub use acceleration_structures::{
    hit_group_offsets, AccelerationStructure, BottomLevelAccelerationStructure,
    BottomLevelBuilder, GeometryRef, Instance, InstanceDescriptor, ScratchBuffer,
    TopLevelAccelerationStructure, TopLevelBuilder,
};
pub use descriptor_table::{DescriptorKind, DescriptorTable, DescriptorTableLayout};
pub use pipeline::{
    BindingLayout, BindingSlot, DescriptorRange, EntryPoint, PipelineBinder, Program,
    ProgramKind, RayTracingPipeline, RootArgument, ShaderLibrary, ShaderStage,
};
pub use shader_binding_table::{
    RecordPlacement, Section, SectionLayout, ShaderBindingTable, ShaderBindingTableBuilder,
    ShaderBindingTableLayout, ShaderBindingTableRegions, StridedRegion,
};
