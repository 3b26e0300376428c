mod acceleration_structure;
mod bottom_level;
mod geometry;
mod instance;
mod scratch_buffer;
mod top_level;

pub use acceleration_structure::AccelerationStructure;
pub use bottom_level::{BottomLevelAccelerationStructure, BottomLevelBuilder};
pub use geometry::GeometryRef;
pub use instance::{hit_group_offsets, Instance, InstanceDescriptor};
pub use scratch_buffer::ScratchBuffer;
pub use top_level::{TopLevelAccelerationStructure, TopLevelBuilder};
