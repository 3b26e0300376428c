use super::{ProgramKind, RayTracingPipeline, RootArgument};
use crate::{
    device::{Device, PipelineId, RayTracingProperties},
    error::LayoutViolation,
    storage::{memory, Buffer},
    Error, Result,
};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// A run of equally sized records in the table buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StridedRegion {
    pub device_address: vk::DeviceAddress,
    pub size: u64,
    pub stride: u64,
}

impl StridedRegion {
    pub fn raw(&self) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR::builder()
            .device_address(self.device_address)
            .size(self.size)
            .stride(self.stride)
            .build()
    }
}

/// The four regions handed to a trace rays call. Callable shaders are never
/// used, so that region stays empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderBindingTableRegions {
    pub ray_generation: StridedRegion,
    pub miss: StridedRegion,
    pub hit_group: StridedRegion,
    pub callable: StridedRegion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    RayGeneration,
    Miss,
    HitGroup,
}

impl Section {
    fn accepts(&self, kind: ProgramKind) -> bool {
        matches!(
            (self, kind),
            (Section::RayGeneration, ProgramKind::RayGeneration)
                | (Section::Miss, ProgramKind::Miss)
                | (Section::HitGroup, ProgramKind::HitGroup)
        )
    }

    fn expected(&self) -> &'static str {
        match self {
            Section::RayGeneration => ProgramKind::RayGeneration.name(),
            Section::Miss => ProgramKind::Miss.name(),
            Section::HitGroup => ProgramKind::HitGroup.name(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionLayout {
    /// Byte offset from the start of the table.
    pub offset: u64,
    pub stride: u64,
    pub count: u64,
}

impl SectionLayout {
    pub fn size(&self) -> u64 {
        self.stride * self.count
    }

    fn region(&self, base: vk::DeviceAddress) -> StridedRegion {
        if self.count == 0 {
            return StridedRegion::default();
        }

        StridedRegion {
            device_address: base + self.offset,
            size: self.size(),
            stride: self.stride,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderBindingTableLayout {
    pub ray_generation: SectionLayout,
    pub miss: SectionLayout,
    pub hit_group: SectionLayout,
    /// Total bytes, up to the end of the hit group section.
    pub size: u64,
}

impl ShaderBindingTableLayout {
    pub fn section(&self, section: Section) -> SectionLayout {
        match section {
            Section::RayGeneration => self.ray_generation,
            Section::Miss => self.miss,
            Section::HitGroup => self.hit_group,
        }
    }

    /// Regions for a table starting at `base`. The ray generation region is
    /// a single record, so its size is its stride.
    pub fn regions(&self, base: vk::DeviceAddress) -> ShaderBindingTableRegions {
        let mut ray_generation = self.ray_generation.region(base);
        ray_generation.size = ray_generation.stride;

        ShaderBindingTableRegions {
            ray_generation,
            miss: self.miss.region(base),
            hit_group: self.hit_group.region(base),
            callable: StridedRegion::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Record {
    program: String,
    arguments: Vec<RootArgument>,
}

/// Where a program's record was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPlacement {
    pub section: Section,
    pub program: String,
    pub offset: u64,
}

/// Collects records per section and lays them out with one stride per
/// section. Records are placed in the order they were added, and hit group
/// records are addressed by instance hit group offset, so their order must
/// match the instance numbering.
#[derive(Debug, Clone)]
pub struct ShaderBindingTableBuilder {
    properties: RayTracingProperties,
    ray_generation: Option<Record>,
    miss: Vec<Record>,
    hit_groups: Vec<Record>,
    layout: Option<(PipelineId, ShaderBindingTableLayout)>,
}

impl ShaderBindingTableBuilder {
    pub fn new(properties: RayTracingProperties) -> Self {
        Self {
            properties,
            ray_generation: None,
            miss: vec![],
            hit_groups: vec![],
            layout: None,
        }
    }

    pub fn reset(&mut self) {
        self.ray_generation = None;
        self.miss.clear();
        self.hit_groups.clear();
        self.layout = None;
    }

    pub fn add_ray_generation_record(
        &mut self,
        program: impl Into<String>,
        arguments: Vec<RootArgument>,
    ) -> Result<&mut Self> {
        let program = program.into();
        if self.ray_generation.is_some() {
            return Err(LayoutViolation::DuplicateRayGeneration(program).into());
        }

        self.ray_generation = Some(Record { program, arguments });
        self.layout = None;
        Ok(self)
    }

    pub fn add_miss_record(
        &mut self,
        program: impl Into<String>,
        arguments: Vec<RootArgument>,
    ) -> &mut Self {
        self.miss.push(Record {
            program: program.into(),
            arguments,
        });
        self.layout = None;
        self
    }

    pub fn add_hit_group_record(
        &mut self,
        program: impl Into<String>,
        arguments: Vec<RootArgument>,
    ) -> &mut Self {
        self.hit_groups.push(Record {
            program: program.into(),
            arguments,
        });
        self.layout = None;
        self
    }

    /// Computes strides and offsets for the records added so far and
    /// returns the size of the table in bytes. Every record reserves room for
    /// all slots of its program's binding layout, so omitted trailing
    /// arguments read as zero.
    pub fn compute_layout(&mut self, pipeline: &RayTracingPipeline) -> Result<u64> {
        let layout = self.layout(pipeline)?;
        Ok(layout.size)
    }

    fn layout(&mut self, pipeline: &RayTracingPipeline) -> Result<ShaderBindingTableLayout> {
        if let Some((id, layout)) = self.layout {
            if id == pipeline.id() {
                return Ok(layout);
            }
        }

        let ray_generation = self
            .ray_generation
            .as_ref()
            .ok_or(LayoutViolation::MissingRayGeneration)?;

        let base_alignment = self.properties.shader_group_base_alignment as u64;
        let ray_generation = self.section(
            pipeline,
            Section::RayGeneration,
            0,
            std::slice::from_ref(ray_generation),
        )?;
        let miss = self.section(
            pipeline,
            Section::Miss,
            memory::align(ray_generation.offset + ray_generation.size(), base_alignment),
            &self.miss,
        )?;
        let hit_group = self.section(
            pipeline,
            Section::HitGroup,
            memory::align(miss.offset + miss.size(), base_alignment),
            &self.hit_groups,
        )?;

        let layout = ShaderBindingTableLayout {
            ray_generation,
            miss,
            hit_group,
            size: hit_group.offset + hit_group.size(),
        };
        log::debug!("Shader binding table layout for {}: {:?}", pipeline.name(), layout);

        self.layout = Some((pipeline.id(), layout));
        Ok(layout)
    }

    fn section(
        &self,
        pipeline: &RayTracingPipeline,
        section: Section,
        offset: u64,
        records: &[Record],
    ) -> Result<SectionLayout> {
        let mut largest = self.properties.shader_group_handle_size as u64;
        for record in records {
            largest = largest.max(self.record_size(pipeline, section, record)?);
        }

        Ok(SectionLayout {
            offset,
            stride: memory::align(
                largest,
                self.properties.shader_group_handle_alignment as u64,
            ),
            count: records.len() as u64,
        })
    }

    /// Identifier plus every slot of the program's binding layout.
    fn record_size(
        &self,
        pipeline: &RayTracingPipeline,
        section: Section,
        record: &Record,
    ) -> Result<u64> {
        let program = pipeline
            .program(&record.program)
            .ok_or_else(|| LayoutViolation::UnknownProgram(record.program.clone()))?;
        if !section.accepts(program.kind) {
            return Err(LayoutViolation::WrongSection {
                program: record.program.clone(),
                expected: section.expected(),
            }
            .into());
        }
        program
            .layout
            .check_arguments(&record.program, &record.arguments)?;

        Ok(self.properties.shader_group_handle_size as u64 + program.layout.arguments_size())
    }

    fn sections(&self) -> [(Section, Vec<&Record>); 3] {
        [
            (Section::RayGeneration, self.ray_generation.iter().collect()),
            (Section::Miss, self.miss.iter().collect()),
            (Section::HitGroup, self.hit_groups.iter().collect()),
        ]
    }

    fn placements(&mut self, pipeline: &RayTracingPipeline) -> Result<Vec<RecordPlacement>> {
        let layout = self.layout(pipeline)?;

        Ok(self
            .sections()
            .into_iter()
            .flat_map(|(section, records)| {
                let section_layout = layout.section(section);
                records
                    .into_iter()
                    .enumerate()
                    .map(move |(index, record)| RecordPlacement {
                        section,
                        program: record.program.clone(),
                        offset: section_layout.offset + index as u64 * section_layout.stride,
                    })
            })
            .collect())
    }

    /// Writes every record into `buffer`: the program's identifier followed
    /// by its root arguments, zero padded to the section stride.
    pub fn generate(
        &mut self,
        buffer: &Buffer,
        pipeline: &RayTracingPipeline,
    ) -> Result<ShaderBindingTableRegions> {
        let layout = self.layout(pipeline)?;
        if buffer.size() < layout.size {
            return Err(Error::BufferOverflow {
                name: buffer.name().to_string(),
                offset: 0,
                len: layout.size,
                size: buffer.size(),
            });
        }
        debug_assert_eq!(
            buffer.device_address() % self.properties.shader_group_base_alignment as u64,
            0
        );

        let mut data = vec![0u8; layout.size as usize];
        for (section, records) in self.sections() {
            let section_layout = layout.section(section);
            for (index, record) in records.into_iter().enumerate() {
                let identifier = pipeline
                    .identifier(&record.program)
                    .ok_or_else(|| LayoutViolation::UnknownProgram(record.program.clone()))?;
                let start = (section_layout.offset + index as u64 * section_layout.stride) as usize;
                data[start..start + identifier.len()].copy_from_slice(identifier);

                let mut cursor = start + identifier.len();
                for argument in &record.arguments {
                    data[cursor..cursor + RootArgument::SIZE as usize]
                        .copy_from_slice(&argument.to_bytes());
                    cursor += RootArgument::SIZE as usize;
                }
            }
        }

        buffer.write(0, &data)?;

        Ok(layout.regions(buffer.device_address()))
    }

    /// Allocates a host visible table buffer sized by the layout and
    /// generates into it.
    pub fn build(
        &mut self,
        device: &Arc<dyn Device>,
        name: &str,
        pipeline: &RayTracingPipeline,
    ) -> Result<ShaderBindingTable> {
        let size = self.compute_layout(pipeline)?;
        let buffer = Buffer::new_aligned(
            device,
            format!("{} shader binding table", name),
            size,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
            MemoryLocation::CpuToGpu,
            Some(self.properties.shader_group_base_alignment as u64),
        )?;

        let regions = self.generate(&buffer, pipeline)?;
        let layout = self.layout(pipeline)?;
        let records = self.placements(pipeline)?;

        Ok(ShaderBindingTable {
            buffer,
            layout,
            regions,
            pipeline: pipeline.id(),
            records,
        })
    }
}

/// A generated table and the pipeline it was generated against.
pub struct ShaderBindingTable {
    buffer: Buffer,
    layout: ShaderBindingTableLayout,
    regions: ShaderBindingTableRegions,
    pipeline: PipelineId,
    records: Vec<RecordPlacement>,
}

impl ShaderBindingTable {
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn layout(&self) -> &ShaderBindingTableLayout {
        &self.layout
    }

    pub fn regions(&self) -> ShaderBindingTableRegions {
        self.regions
    }

    pub fn pipeline(&self) -> PipelineId {
        self.pipeline
    }

    pub fn records(&self) -> &[RecordPlacement] {
        &self.records
    }

    pub fn count(&self, section: Section) -> usize {
        self.records
            .iter()
            .filter(|record| record.section == section)
            .count()
    }

    /// Checks that every record still carries the identifier `pipeline`
    /// hands out for its program.
    pub fn verify(&self, pipeline: &RayTracingPipeline) -> Result<()> {
        let data = self.buffer.read()?;

        for record in &self.records {
            let start = record.offset as usize;
            let written = &data[start..start + pipeline.identifier_size()];
            if pipeline.identifier(&record.program) != Some(written) {
                return Err(LayoutViolation::StaleProgramIdentifier {
                    program: record.program.clone(),
                }
                .into());
            }
        }

        Ok(())
    }
}
