use super::{
    BindingLayout, Program, ProgramKind, RayTracingPipeline, ShaderLibrary, ShaderStage,
};
use crate::{
    config::PipelineConfig,
    device::{Device, PipelineDescription, ShaderGroupDescription, StageDescription},
    error::LayoutViolation,
    ray_tracing::DescriptorTableLayout,
    Result,
};
use std::{collections::HashMap, sync::Arc};

/// Collects program libraries, hit groups and binding layouts, then turns
/// them into a [`RayTracingPipeline`]. `finalize` consumes the binder, so no
/// declaration can follow it.
pub struct PipelineBinder {
    device: Arc<dyn Device>,
    name: String,
    config: PipelineConfig,
    descriptor_table_layout: Arc<DescriptorTableLayout>,
    libraries: Vec<ShaderLibrary>,
    hit_groups: Vec<(String, String)>,
    binding_layouts: Vec<(Vec<String>, Arc<BindingLayout>)>,
}

impl PipelineBinder {
    pub fn new(
        device: &Arc<dyn Device>,
        name: impl Into<String>,
        config: PipelineConfig,
        descriptor_table_layout: Arc<DescriptorTableLayout>,
    ) -> Self {
        Self {
            device: device.clone(),
            name: name.into(),
            config,
            descriptor_table_layout,
            libraries: vec![],
            hit_groups: vec![],
            binding_layouts: vec![],
        }
    }

    /// Ray generation and miss entry points become programs of the same
    /// name. Closest hit entry points are only reachable through hit groups.
    pub fn declare_library(&mut self, library: ShaderLibrary) -> &mut Self {
        self.libraries.push(library);
        self
    }

    pub fn declare_hit_group(
        &mut self,
        name: impl Into<String>,
        closest_hit: impl Into<String>,
    ) -> &mut Self {
        self.hit_groups.push((name.into(), closest_hit.into()));
        self
    }

    pub fn declare_binding_layout(
        &mut self,
        programs: &[&str],
        layout: Arc<BindingLayout>,
    ) -> &mut Self {
        self.binding_layouts.push((
            programs.iter().map(|program| program.to_string()).collect(),
            layout,
        ));
        self
    }

    pub fn finalize(self) -> Result<RayTracingPipeline> {
        // Every entry point becomes a stage, numbered across libraries
        let stages: Vec<StageDescription> = self
            .libraries
            .iter()
            .enumerate()
            .flat_map(|(library, shaders)| {
                shaders.entry_points().iter().map(move |entry_point| StageDescription {
                    library,
                    symbol: entry_point.symbol.clone(),
                    stage: entry_point.stage,
                })
            })
            .collect();

        let mut stage_indices: HashMap<&str, (u32, ShaderStage)> = HashMap::new();
        for (index, stage) in stages.iter().enumerate() {
            if stage_indices
                .insert(stage.symbol.as_str(), (index as u32, stage.stage))
                .is_some()
            {
                return Err(LayoutViolation::DuplicateProgram(stage.symbol.clone()).into());
            }
        }

        let mut groups: Vec<(String, ProgramKind, ShaderGroupDescription)> = stages
            .iter()
            .enumerate()
            .filter_map(|(index, stage)| {
                let kind = match stage.stage {
                    ShaderStage::RayGeneration => ProgramKind::RayGeneration,
                    ShaderStage::Miss => ProgramKind::Miss,
                    ShaderStage::ClosestHit => return None,
                };
                let group = ShaderGroupDescription::General {
                    stage: index as u32,
                };
                Some((stage.symbol.clone(), kind, group))
            })
            .collect();

        if !groups
            .iter()
            .any(|(_, kind, _)| *kind == ProgramKind::RayGeneration)
        {
            return Err(LayoutViolation::MissingRayGeneration.into());
        }

        for (name, closest_hit) in &self.hit_groups {
            if stage_indices.contains_key(name.as_str())
                || groups.iter().any(|(existing, _, _)| existing == name)
            {
                return Err(LayoutViolation::DuplicateProgram(name.clone()).into());
            }

            let stage = match stage_indices.get(closest_hit.as_str()) {
                Some((stage, ShaderStage::ClosestHit)) => *stage,
                _ => {
                    return Err(LayoutViolation::UnknownEntryPoint {
                        program: name.clone(),
                        entry_point: closest_hit.clone(),
                    }
                    .into())
                }
            };
            groups.push((
                name.clone(),
                ProgramKind::HitGroup,
                ShaderGroupDescription::TrianglesHit { closest_hit: stage },
            ));
        }

        let mut layouts: HashMap<&str, Arc<BindingLayout>> = HashMap::new();
        for (programs, layout) in &self.binding_layouts {
            layout.check_table(&self.descriptor_table_layout)?;

            for program in programs {
                if !groups.iter().any(|(name, _, _)| name == program) {
                    return Err(LayoutViolation::UnknownProgram(program.clone()).into());
                }
                if layouts.insert(program.as_str(), layout.clone()).is_some() {
                    return Err(LayoutViolation::DuplicateBindingLayout(program.clone()).into());
                }
            }
        }

        let programs = groups
            .iter()
            .enumerate()
            .map(|(group, (name, kind, _))| {
                let layout = layouts
                    .get(name.as_str())
                    .ok_or_else(|| LayoutViolation::MissingBindingLayout(name.clone()))?;
                Ok(Program {
                    name: name.clone(),
                    kind: *kind,
                    layout: layout.clone(),
                    group: group as u32,
                })
            })
            .collect::<std::result::Result<Vec<_>, LayoutViolation>>()?;

        let group_descriptions: Vec<ShaderGroupDescription> =
            groups.iter().map(|(_, _, group)| *group).collect();
        let id = self
            .device
            .create_ray_tracing_pipeline(&PipelineDescription {
                name: &self.name,
                libraries: &self.libraries,
                stages: &stages,
                groups: &group_descriptions,
                descriptor_table: self.descriptor_table_layout.kinds(),
                config: self.config,
            })?;
        let identifiers = self.device.shader_group_handles(id)?;

        log::info!(
            "Created pipeline {} with {} programs: {:?}",
            self.name,
            programs.len(),
            programs.iter().map(|p| &p.name).collect::<Vec<_>>()
        );

        Ok(RayTracingPipeline::new(
            self.device,
            id,
            self.name,
            programs,
            identifiers,
            self.descriptor_table_layout,
            self.config,
        ))
    }
}
