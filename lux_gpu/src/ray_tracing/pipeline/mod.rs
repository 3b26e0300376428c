mod binder;
mod binding_layout;
mod library;
mod ray_tracing_pipeline;

pub use binder::PipelineBinder;
pub use binding_layout::{BindingLayout, BindingSlot, DescriptorRange, RootArgument};
pub use library::{EntryPoint, ShaderLibrary, ShaderStage};
pub use ray_tracing_pipeline::{Program, ProgramKind, RayTracingPipeline};
