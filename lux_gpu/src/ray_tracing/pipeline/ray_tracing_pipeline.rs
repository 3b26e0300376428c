use super::BindingLayout;
use crate::{
    config::PipelineConfig,
    device::{Device, PipelineId},
    ray_tracing::DescriptorTableLayout,
};
use std::{fmt, sync::Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    RayGeneration,
    Miss,
    HitGroup,
}

impl ProgramKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProgramKind::RayGeneration => "ray generation",
            ProgramKind::Miss => "miss",
            ProgramKind::HitGroup => "hit group",
        }
    }
}

/// A shader group of a finalized pipeline.
#[derive(Debug, Clone)]
pub struct Program {
    pub name: String,
    pub kind: ProgramKind,
    pub layout: Arc<BindingLayout>,
    /// Position of the group in the pipeline, and of its identifier.
    pub group: u32,
}

/// A finalized pipeline. Only lookups are possible from here on; declaring
/// more programs means building a new pipeline, which hands out new
/// identifiers.
pub struct RayTracingPipeline {
    device: Arc<dyn Device>,
    id: PipelineId,
    name: String,
    programs: Vec<Program>,
    identifiers: Vec<u8>,
    identifier_size: usize,
    descriptor_table_layout: Arc<DescriptorTableLayout>,
    config: PipelineConfig,
}

impl RayTracingPipeline {
    pub(super) fn new(
        device: Arc<dyn Device>,
        id: PipelineId,
        name: String,
        programs: Vec<Program>,
        identifiers: Vec<u8>,
        descriptor_table_layout: Arc<DescriptorTableLayout>,
        config: PipelineConfig,
    ) -> Self {
        let identifier_size = device.ray_tracing_properties().shader_group_handle_size as usize;
        assert_eq!(identifiers.len(), programs.len() * identifier_size);

        Self {
            device,
            id,
            name,
            programs,
            identifiers,
            identifier_size,
            descriptor_table_layout,
            config,
        }
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn programs(&self) -> &[Program] {
        &self.programs
    }

    pub fn program(&self, name: &str) -> Option<&Program> {
        self.programs.iter().find(|program| program.name == name)
    }

    /// The opaque identifier written at the start of the program's records.
    pub fn identifier(&self, name: &str) -> Option<&[u8]> {
        self.program(name).map(|program| {
            let start = program.group as usize * self.identifier_size;
            &self.identifiers[start..start + self.identifier_size]
        })
    }

    pub fn identifier_size(&self) -> usize {
        self.identifier_size
    }

    pub fn descriptor_table_layout(&self) -> &Arc<DescriptorTableLayout> {
        &self.descriptor_table_layout
    }

    pub fn config(&self) -> PipelineConfig {
        self.config
    }
}

impl fmt::Debug for RayTracingPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RayTracingPipeline({}|{:?}|{} programs)",
            self.name,
            self.id,
            self.programs.len()
        )
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        self.device.destroy_pipeline(self.id);
    }
}
