use super::{
    AccelerationStructureId, AccelerationStructureType, BufferAllocation, BufferDescription,
    BufferId, BuildGeometry, BuildInputs, BuildSizes, DescriptorTableAllocation,
    DescriptorTableId, DescriptorWrite, Device, ImageDescription, ImageId, PipelineDescription,
    PipelineId, RayTracingProperties, ShaderGroupDescription, SubmissionIndex,
};
use crate::{
    commands::{BuildMode, Command, CommandList, ImageState},
    error::LayoutViolation,
    ray_tracing::{
        DescriptorKind, InstanceDescriptor, ShaderBindingTableRegions, ShaderStage, StridedRegion,
    },
    storage::memory,
    Error, Result,
};
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::{collections::HashMap, mem, sync::Arc};

const SPIRV_MAGIC: u32 = 0x0723_0203;
const FIRST_ADDRESS: u64 = 0x1_0000;
const MIN_BUFFER_ALIGNMENT: u64 = 256;
const DESCRIPTOR_HEAP_BASE: u64 = 0x7f00_0000_0000;

/// Identifier bytes carrying meaning: the pipeline id then the group index.
const IDENTIFIER_PREFIX: usize = 12;

/// A device living in host memory. Commands are validated and their effects
/// tracked when submitted, and every submission completes immediately.
///
/// The properties match common desktop hardware: 32 byte identifiers, 64
/// byte section alignment and 256 byte scratch alignment.
pub struct HeadlessDevice {
    name: String,
    ray_tracing: bool,
    state: Mutex<State>,
}

/// A submitted command list, kept for inspection.
#[derive(Debug, Clone)]
pub struct SubmittedList {
    pub index: SubmissionIndex,
    pub name: String,
    pub commands: Vec<Command>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    next_address: u64,
    allocated: u64,
    memory_budget: Option<u64>,
    buffers: HashMap<BufferId, HostBuffer>,
    images: HashMap<ImageId, HostImage>,
    acceleration_structures: HashMap<AccelerationStructureId, HostAccelerationStructure>,
    pipelines: HashMap<PipelineId, HostPipeline>,
    descriptor_tables: HashMap<DescriptorTableId, HostDescriptorTable>,
    submitted: Vec<SubmittedList>,
}

struct HostBuffer {
    name: String,
    address: vk::DeviceAddress,
    size: u64,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
    data: Vec<u8>,
}

impl HostBuffer {
    fn contains(&self, address: vk::DeviceAddress, len: u64) -> bool {
        address >= self.address && address + len <= self.address + self.size
    }
}

struct HostImage {
    size: u64,
    state: ImageState,
}

struct HostAccelerationStructure {
    ty: AccelerationStructureType,
    address: vk::DeviceAddress,
    size: u64,
    built: Option<BuiltWith>,
}

struct BuiltWith {
    allow_update: bool,
    primitive_counts: Vec<u32>,
}

struct HostPipeline {
    name: String,
    groups: u32,
    descriptor_table: Vec<DescriptorKind>,
}

struct HostDescriptorTable {
    name: String,
    kinds: Vec<DescriptorKind>,
    slots: Vec<Option<DescriptorWrite>>,
}

impl HeadlessDevice {
    pub fn new() -> Arc<HeadlessDevice> {
        Arc::new(Self::with_settings(true, None))
    }

    /// A device reporting no ray tracing support.
    pub fn without_ray_tracing() -> Arc<HeadlessDevice> {
        Arc::new(Self::with_settings(false, None))
    }

    /// Allocations beyond `bytes` in total fail with out of memory.
    pub fn with_memory_budget(bytes: u64) -> Arc<HeadlessDevice> {
        Arc::new(Self::with_settings(true, Some(bytes)))
    }

    fn with_settings(ray_tracing: bool, memory_budget: Option<u64>) -> Self {
        Self {
            name: "Headless".to_string(),
            ray_tracing,
            state: Mutex::new(State {
                next_id: 1,
                next_address: FIRST_ADDRESS,
                memory_budget,
                ..Default::default()
            }),
        }
    }

    /// Every list submitted so far, in submission order.
    pub fn submitted(&self) -> Vec<SubmittedList> {
        self.state.lock().submitted.clone()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.state.lock().allocated
    }

    /// Changes the budget for allocations made from now on. `None` lifts it.
    pub fn set_memory_budget(&self, bytes: Option<u64>) {
        self.state.lock().memory_budget = bytes;
    }

    pub fn image_state(&self, image: ImageId) -> Option<ImageState> {
        self.state.lock().images.get(&image).map(|image| image.state)
    }

    pub fn descriptor(&self, table: DescriptorTableId, slot: u32) -> Option<DescriptorWrite> {
        self.state
            .lock()
            .descriptor_tables
            .get(&table)
            .and_then(|table| table.slots.get(slot as usize).copied().flatten())
    }

    pub fn is_built(&self, acceleration_structure: AccelerationStructureId) -> bool {
        self.state
            .lock()
            .acceleration_structures
            .get(&acceleration_structure)
            .map_or(false, |structure| structure.built.is_some())
    }

    fn reserve(&self, state: &mut State, name: &str, size: u64) -> Result<()> {
        if let Some(budget) = state.memory_budget {
            if state.allocated + size > budget {
                log::warn!(
                    "Allocating {:?} ({} bytes) exceeds the budget of {} bytes",
                    name,
                    size,
                    budget
                );
                return Err(Error::OutOfMemory {
                    name: name.to_string(),
                    size,
                });
            }
        }
        state.allocated += size;

        Ok(())
    }
}

impl State {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer(&self, id: BufferId) -> Result<&HostBuffer> {
        self.buffers.get(&id).ok_or(Error::UnknownResource {
            kind: BufferId::KIND,
            id: id.0,
        })
    }

    fn buffer_at(&self, address: vk::DeviceAddress, len: u64) -> Option<&HostBuffer> {
        self.buffers
            .values()
            .find(|buffer| buffer.contains(address, len))
    }

    fn read(&self, address: vk::DeviceAddress, len: u64) -> Option<&[u8]> {
        self.buffer_at(address, len).map(|buffer| {
            let start = (address - buffer.address) as usize;
            &buffer.data[start..start + len as usize]
        })
    }

    fn structure_at(
        &self,
        address: vk::DeviceAddress,
    ) -> Option<(&AccelerationStructureId, &HostAccelerationStructure)> {
        self.acceleration_structures
            .iter()
            .find(|(_, structure)| structure.address == address)
    }

    /// Applies the effects of a list that validated completely.
    fn commit(&mut self, effects: Effects) {
        for (id, built) in effects.built {
            if let Some(structure) = self.acceleration_structures.get_mut(&id) {
                structure.built = Some(built);
            }
        }
        for (id, state) in effects.image_states {
            if let Some(image) = self.images.get_mut(&id) {
                image.state = state;
            }
        }
    }
}

fn build_sizes(inputs: &BuildInputs) -> BuildSizes {
    let primitives: u64 = inputs
        .primitive_counts()
        .iter()
        .map(|count| *count as u64)
        .sum();
    let (node, scratch, update) = match inputs.ty {
        AccelerationStructureType::BottomLevel => (64, 32, 16),
        AccelerationStructureType::TopLevel => (128, 64, 32),
    };

    BuildSizes {
        acceleration_structure: memory::align(256 + primitives * node, 256),
        build_scratch: memory::align(128 + primitives * scratch, 256),
        update_scratch: if inputs.allow_update {
            memory::align(64 + primitives * update, 256)
        } else {
            0
        },
    }
}

/// State changes made by a command list, applied only once every command in
/// the list has validated.
#[derive(Default)]
struct Effects {
    built: HashMap<AccelerationStructureId, BuiltWith>,
    image_states: HashMap<ImageId, ImageState>,
}

/// Replays a command list against the tracked state.
struct Execution<'a> {
    list: &'a str,
    properties: RayTracingProperties,
    state: &'a State,
    effects: Effects,
    pending_builds: Vec<AccelerationStructureId>,
    pipeline: Option<PipelineId>,
    descriptor_table: Option<DescriptorTableId>,
}

impl<'a> Execution<'a> {
    fn new(list: &'a str, properties: RayTracingProperties, state: &'a State) -> Self {
        Self {
            list,
            properties,
            state,
            effects: Effects::default(),
            pending_builds: vec![],
            pipeline: None,
            descriptor_table: None,
        }
    }

    fn built_with(
        &self,
        id: AccelerationStructureId,
        structure: &'a HostAccelerationStructure,
    ) -> Option<&BuiltWith> {
        self.effects.built.get(&id).or(structure.built.as_ref())
    }

    fn image_state(&self, id: ImageId, image: &HostImage) -> ImageState {
        self.effects
            .image_states
            .get(&id)
            .copied()
            .unwrap_or(image.state)
    }

    fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::InvalidCommand {
            list: self.list.to_string(),
            reason: reason.into(),
        }
    }

    fn execute(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::BuildAccelerationStructure {
                inputs,
                mode,
                destination,
                scratch_address,
            } => self.build(inputs, *mode, *destination, *scratch_address),
            Command::Barrier(_) => {
                self.pending_builds.clear();
                Ok(())
            }
            Command::ImageBarrier { image, from, to } => self.transition(*image, *from, *to),
            Command::BindPipeline(pipeline) => {
                if !self.state.pipelines.contains_key(pipeline) {
                    return Err(Error::UnknownResource {
                        kind: PipelineId::KIND,
                        id: pipeline.0,
                    });
                }
                self.pipeline = Some(*pipeline);
                Ok(())
            }
            Command::BindDescriptorTable { pipeline, table } => {
                self.bind_descriptor_table(*pipeline, *table)
            }
            Command::TraceRays {
                regions,
                width,
                height,
                depth,
            } => self.trace_rays(regions, (*width, *height, *depth)),
        }
    }

    fn build(
        &mut self,
        inputs: &BuildInputs,
        mode: BuildMode,
        destination: AccelerationStructureId,
        scratch_address: vk::DeviceAddress,
    ) -> Result<()> {
        let required = build_sizes(inputs);
        let state = self.state;
        let structure = state
            .acceleration_structures
            .get(&destination)
            .ok_or(Error::UnknownResource {
                kind: AccelerationStructureId::KIND,
                id: destination.0,
            })?;

        if structure.ty != inputs.ty {
            return Err(self.invalid(format!(
                "{:?} inputs built into a {:?} structure",
                inputs.ty, structure.ty
            )));
        }
        if structure.size < required.acceleration_structure {
            return Err(self.invalid(format!(
                "{:?} holds {} bytes but the build needs {}",
                destination, structure.size, required.acceleration_structure
            )));
        }

        let scratch_size = match mode {
            BuildMode::Build => required.build_scratch,
            BuildMode::Update { source } => {
                if source != destination {
                    return Err(self.invalid("updates must refit in place"));
                }
                match self.built_with(destination, structure) {
                    Some(built) if built.allow_update => {
                        if built.primitive_counts != inputs.primitive_counts() {
                            return Err(self.invalid(
                                "refit with a different primitive count than the last build",
                            ));
                        }
                    }
                    Some(_) => return Err(self.invalid("structure was built without updates")),
                    None => return Err(self.invalid("refit of a structure never built")),
                }
                required.update_scratch
            }
        };
        if scratch_address % self.properties.scratch_alignment as u64 != 0 {
            return Err(self.invalid(format!("scratch {:#x} is misaligned", scratch_address)));
        }
        if self.state.buffer_at(scratch_address, scratch_size).is_none() {
            return Err(self.invalid(format!(
                "{} bytes of scratch at {:#x} are not backed by a buffer",
                scratch_size, scratch_address
            )));
        }

        for geometry in &inputs.geometries {
            self.check_geometry(geometry)?;
        }

        self.effects.built.insert(
            destination,
            BuiltWith {
                allow_update: inputs.allow_update,
                primitive_counts: inputs.primitive_counts(),
            },
        );
        self.pending_builds.push(destination);

        Ok(())
    }

    fn check_geometry(&self, geometry: &BuildGeometry) -> Result<()> {
        match geometry {
            BuildGeometry::Triangles {
                vertex_address,
                vertex_count,
                vertex_stride,
                indices,
                ..
            } => {
                let len = *vertex_count as u64 * vertex_stride;
                if self.state.buffer_at(*vertex_address, len).is_none() {
                    return Err(self.invalid(format!(
                        "{} vertices at {:#x} are not backed by a buffer",
                        vertex_count, vertex_address
                    )));
                }
                if let Some(indices) = indices {
                    let index_size = if indices.index_type == vk::IndexType::UINT16 {
                        2
                    } else {
                        4
                    };
                    if self
                        .state
                        .buffer_at(indices.address, indices.count as u64 * index_size)
                        .is_none()
                    {
                        return Err(self.invalid(format!(
                            "{} indices at {:#x} are not backed by a buffer",
                            indices.count, indices.address
                        )));
                    }
                }
            }
            BuildGeometry::Instances { address, count } => {
                let size = mem::size_of::<InstanceDescriptor>() as u64;
                let data = self
                    .state
                    .read(*address, *count as u64 * size)
                    .ok_or_else(|| {
                        self.invalid(format!(
                            "{} instances at {:#x} are not backed by a buffer",
                            count, address
                        ))
                    })?;

                for (index, bytes) in data.chunks_exact(size as usize).enumerate() {
                    let descriptor: InstanceDescriptor = bytemuck::pod_read_unaligned(bytes);
                    let reference = descriptor.acceleration_structure_reference;
                    match self.state.structure_at(reference) {
                        Some((id, structure))
                            if structure.ty == AccelerationStructureType::BottomLevel
                                && self.built_with(*id, structure).is_some() =>
                        {
                            if self.pending_builds.contains(id) {
                                return Err(self.invalid(format!(
                                    "instance {} reads {:?} before a barrier",
                                    index, id
                                )));
                            }
                        }
                        _ => {
                            return Err(self.invalid(format!(
                                "instance {} references {:#x}, which is not a built bottom level structure",
                                index, reference
                            )))
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn transition(&mut self, image: ImageId, from: ImageState, to: ImageState) -> Result<()> {
        let state = self.state;
        let host = state.images.get(&image).ok_or(Error::UnknownResource {
            kind: ImageId::KIND,
            id: image.0,
        })?;

        let current = self.image_state(image, host);
        if from != ImageState::Undefined && from != current {
            return Err(self.invalid(format!(
                "{:?} transitioned from {:?} but is in {:?}",
                image, from, current
            )));
        }
        self.effects.image_states.insert(image, to);

        Ok(())
    }

    fn bind_descriptor_table(
        &mut self,
        pipeline: PipelineId,
        table: DescriptorTableId,
    ) -> Result<()> {
        if self.pipeline != Some(pipeline) {
            return Err(self.invalid(format!("{:?} is not bound", pipeline)));
        }
        let expected = self
            .state
            .pipelines
            .get(&pipeline)
            .map(|pipeline| pipeline.descriptor_table.clone())
            .unwrap_or_default();
        let host = self
            .state
            .descriptor_tables
            .get(&table)
            .ok_or(Error::UnknownResource {
                kind: DescriptorTableId::KIND,
                id: table.0,
            })?;
        if host.kinds != expected {
            return Err(self.invalid(format!(
                "{} does not match the layout of {:?}",
                host.name, pipeline
            )));
        }
        self.descriptor_table = Some(table);

        Ok(())
    }

    fn trace_rays(
        &mut self,
        regions: &ShaderBindingTableRegions,
        (width, height, depth): (u32, u32, u32),
    ) -> Result<()> {
        let pipeline = self
            .pipeline
            .ok_or_else(|| self.invalid("trace rays without a pipeline"))?;
        let table = self
            .descriptor_table
            .ok_or_else(|| self.invalid("trace rays without a descriptor table"))?;
        if width == 0 || height == 0 || depth == 0 {
            return Err(self.invalid("empty dispatch"));
        }
        if !self.pending_builds.is_empty() {
            return Err(self.invalid(format!(
                "trace rays reads {:?} before a barrier",
                self.pending_builds
            )));
        }

        self.check_descriptors(table)?;

        let raygen = &regions.ray_generation;
        if raygen.size == 0 || raygen.size != raygen.stride {
            return Err(self.invalid(format!(
                "ray generation region must hold one record, got {:?}",
                raygen
            )));
        }
        for (section, region) in [
            ("ray generation", raygen),
            ("miss", &regions.miss),
            ("hit group", &regions.hit_group),
        ] {
            self.check_region(pipeline, section, region)?;
        }

        Ok(())
    }

    fn check_descriptors(&self, table: DescriptorTableId) -> Result<()> {
        let host = self
            .state
            .descriptor_tables
            .get(&table)
            .ok_or(Error::UnknownResource {
                kind: DescriptorTableId::KIND,
                id: table.0,
            })?;

        for (slot, write) in host.slots.iter().enumerate() {
            match write {
                None => {
                    return Err(self.invalid(format!("{} slot {} was never written", host.name, slot)))
                }
                Some(DescriptorWrite::AccelerationStructure(id)) => {
                    let structure = self.state.acceleration_structures.get(id).ok_or(
                        Error::UnknownResource {
                            kind: AccelerationStructureId::KIND,
                            id: id.0,
                        },
                    )?;
                    if self.built_with(*id, structure).is_none() {
                        return Err(self.invalid(format!("{:?} was never built", id)));
                    }
                }
                Some(DescriptorWrite::StorageImage(id)) => {
                    let image = self.state.images.get(id).ok_or(Error::UnknownResource {
                        kind: ImageId::KIND,
                        id: id.0,
                    })?;
                    let current = self.image_state(*id, image);
                    if current != ImageState::Storage {
                        return Err(self.invalid(format!(
                            "{:?} is written while in {:?}",
                            id, current
                        )));
                    }
                }
                Some(DescriptorWrite::UniformBuffer { buffer, .. })
                | Some(DescriptorWrite::StorageBuffer { buffer, .. }) => {
                    self.state.buffer(*buffer)?;
                }
            }
        }

        Ok(())
    }

    fn check_region(
        &self,
        pipeline: PipelineId,
        section: &str,
        region: &StridedRegion,
    ) -> Result<()> {
        if region.size == 0 {
            return Ok(());
        }
        if region.device_address % self.properties.shader_group_base_alignment as u64 != 0 {
            return Err(self.invalid(format!("{} region is misaligned", section)));
        }
        if region.stride % self.properties.shader_group_handle_alignment as u64 != 0
            || region.size % region.stride != 0
        {
            return Err(self.invalid(format!("{} region has a bad stride", section)));
        }
        let buffer = self
            .state
            .buffer_at(region.device_address, region.size)
            .ok_or_else(|| self.invalid(format!("{} region is not backed by a buffer", section)))?;
        if !buffer
            .usage
            .contains(vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR)
        {
            return Err(self.invalid(format!(
                "{} region lies in {:?}, which is not a shader binding table",
                section, buffer.name
            )));
        }

        let groups = self
            .state
            .pipelines
            .get(&pipeline)
            .map_or(0, |pipeline| pipeline.groups);
        for record in 0..region.size / region.stride {
            let start = (region.device_address - buffer.address + record * region.stride) as usize;
            let identifier = &buffer.data[start..start + IDENTIFIER_PREFIX];
            let owner = u64::from_le_bytes(identifier[..8].try_into().unwrap_or_default());
            let group = u32::from_le_bytes(identifier[8..12].try_into().unwrap_or_default());
            if owner != pipeline.0 || group >= groups {
                return Err(LayoutViolation::StaleProgramIdentifier {
                    program: format!("{} record {}", section, record),
                }
                .into());
            }
        }

        Ok(())
    }
}

impl Device for HeadlessDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_ray_tracing(&self) -> bool {
        self.ray_tracing
    }

    fn ray_tracing_properties(&self) -> RayTracingProperties {
        RayTracingProperties {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            scratch_alignment: 256,
            max_recursion_depth: 31,
        }
    }

    fn create_buffer(&self, description: &BufferDescription) -> Result<BufferAllocation> {
        let mut state = self.state.lock();
        self.reserve(&mut state, description.name, description.size)?;

        let alignment = description
            .alignment
            .unwrap_or(1)
            .max(MIN_BUFFER_ALIGNMENT);
        let address = memory::align(state.next_address, alignment);
        // Addresses are never reused, so a rebuilt structure always moves
        state.next_address = address + description.size.max(1);

        let id = BufferId(state.next_id());
        state.buffers.insert(
            id,
            HostBuffer {
                name: description.name.to_string(),
                address,
                size: description.size,
                usage: description.usage,
                location: description.location,
                data: vec![0; description.size as usize],
            },
        );

        Ok(BufferAllocation {
            id,
            device_address: address,
            allocated_size: description.size,
        })
    }

    /// Writes to device local buffers are accepted, standing in for a staged
    /// upload.
    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let host = state.buffers.get_mut(&buffer).ok_or(Error::UnknownResource {
            kind: BufferId::KIND,
            id: buffer.0,
        })?;
        if offset + data.len() as u64 > host.size {
            return Err(Error::BufferOverflow {
                name: host.name.clone(),
                offset,
                len: data.len() as u64,
                size: host.size,
            });
        }

        let start = offset as usize;
        host.data[start..start + data.len()].copy_from_slice(data);

        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let host = state.buffer(buffer)?;
        if host.location == MemoryLocation::GpuOnly {
            return Err(Error::NotHostVisible {
                name: host.name.clone(),
            });
        }
        if offset + len > host.size {
            return Err(Error::BufferOverflow {
                name: host.name.clone(),
                offset,
                len,
                size: host.size,
            });
        }

        Ok(host.data[offset as usize..(offset + len) as usize].to_vec())
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        let mut state = self.state.lock();
        if let Some(host) = state.buffers.remove(&buffer) {
            state.allocated -= host.size;
        }
    }

    fn create_image(&self, description: &ImageDescription) -> Result<ImageId> {
        let mut state = self.state.lock();
        let size = description.width as u64 * description.height as u64 * 4;
        self.reserve(&mut state, description.name, size)?;

        let id = ImageId(state.next_id());
        state.images.insert(
            id,
            HostImage {
                size,
                state: ImageState::Undefined,
            },
        );

        Ok(id)
    }

    fn destroy_image(&self, image: ImageId) {
        let mut state = self.state.lock();
        if let Some(host) = state.images.remove(&image) {
            state.allocated -= host.size;
        }
    }

    fn acceleration_structure_build_sizes(&self, inputs: &BuildInputs) -> Result<BuildSizes> {
        Ok(build_sizes(inputs))
    }

    fn create_acceleration_structure(
        &self,
        ty: AccelerationStructureType,
        buffer: BufferId,
        size: u64,
    ) -> Result<AccelerationStructureId> {
        let mut state = self.state.lock();
        let host = state.buffer(buffer)?;
        if !host
            .usage
            .contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR)
            || size > host.size
        {
            return Err(Error::Allocation {
                name: host.name.clone(),
                reason: format!("cannot hold a {} byte acceleration structure", size),
            });
        }
        let address = host.address;

        let id = AccelerationStructureId(state.next_id());
        state.acceleration_structures.insert(
            id,
            HostAccelerationStructure {
                ty,
                address,
                size,
                built: None,
            },
        );

        Ok(id)
    }

    fn acceleration_structure_address(
        &self,
        acceleration_structure: AccelerationStructureId,
    ) -> Result<vk::DeviceAddress> {
        self.state
            .lock()
            .acceleration_structures
            .get(&acceleration_structure)
            .map(|structure| structure.address)
            .ok_or(Error::UnknownResource {
                kind: AccelerationStructureId::KIND,
                id: acceleration_structure.0,
            })
    }

    fn destroy_acceleration_structure(&self, acceleration_structure: AccelerationStructureId) {
        self.state
            .lock()
            .acceleration_structures
            .remove(&acceleration_structure);
    }

    fn create_ray_tracing_pipeline(&self, description: &PipelineDescription) -> Result<PipelineId> {
        let invalid = |reason: String| Error::InvalidShader {
            name: description.name.to_string(),
            reason,
        };

        for library in description.libraries {
            if library.code().first() != Some(&SPIRV_MAGIC) {
                return Err(Error::InvalidShader {
                    name: library.name().to_string(),
                    reason: "missing SPIR-V magic number".to_string(),
                });
            }
        }
        for stage in description.stages {
            let exported = description
                .libraries
                .get(stage.library)
                .map_or(false, |library| {
                    library
                        .entry_points()
                        .iter()
                        .any(|entry| entry.symbol == stage.symbol && entry.stage == stage.stage)
                });
            if !exported {
                return Err(invalid(format!("{} is not exported", stage.symbol)));
            }
        }
        for group in description.groups {
            let (stage, expected) = match group {
                ShaderGroupDescription::General { stage } => (*stage, None),
                ShaderGroupDescription::TrianglesHit { closest_hit } => {
                    (*closest_hit, Some(ShaderStage::ClosestHit))
                }
            };
            let actual = description
                .stages
                .get(stage as usize)
                .map(|stage| stage.stage)
                .ok_or_else(|| invalid(format!("group refers to missing stage {}", stage)))?;
            let matches = match expected {
                Some(expected) => actual == expected,
                None => actual != ShaderStage::ClosestHit,
            };
            if !matches {
                return Err(invalid(format!("stage {} cannot form {:?}", stage, group)));
            }
        }

        let max_recursion_depth = self.ray_tracing_properties().max_recursion_depth;
        if description.config.max_recursion_depth > max_recursion_depth {
            return Err(invalid(format!(
                "recursion depth {} exceeds {}",
                description.config.max_recursion_depth, max_recursion_depth
            )));
        }

        let mut state = self.state.lock();
        let id = PipelineId(state.next_id());
        state.pipelines.insert(
            id,
            HostPipeline {
                name: description.name.to_string(),
                groups: description.groups.len() as u32,
                descriptor_table: description.descriptor_table.to_vec(),
            },
        );

        Ok(id)
    }

    fn shader_group_handles(&self, pipeline: PipelineId) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let host = state.pipelines.get(&pipeline).ok_or(Error::UnknownResource {
            kind: PipelineId::KIND,
            id: pipeline.0,
        })?;
        let handle_size = self.ray_tracing_properties().shader_group_handle_size as usize;
        log::debug!("Handles for {} groups of {}", host.groups, host.name);

        let mut handles = vec![0; host.groups as usize * handle_size];
        for (group, handle) in handles.chunks_exact_mut(handle_size).enumerate() {
            handle[..8].copy_from_slice(&pipeline.0.to_le_bytes());
            handle[8..IDENTIFIER_PREFIX].copy_from_slice(&(group as u32).to_le_bytes());
        }

        Ok(handles)
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        self.state.lock().pipelines.remove(&pipeline);
    }

    fn create_descriptor_table(
        &self,
        name: &str,
        kinds: &[DescriptorKind],
    ) -> Result<DescriptorTableAllocation> {
        let mut state = self.state.lock();
        let id = DescriptorTableId(state.next_id());
        state.descriptor_tables.insert(
            id,
            HostDescriptorTable {
                name: name.to_string(),
                kinds: kinds.to_vec(),
                slots: vec![None; kinds.len()],
            },
        );

        Ok(DescriptorTableAllocation {
            id,
            handle: DESCRIPTOR_HEAP_BASE + id.0 * 64,
        })
    }

    fn write_descriptor(
        &self,
        table: DescriptorTableId,
        slot: u32,
        write: &DescriptorWrite,
    ) -> Result<()> {
        let mut state = self.state.lock();

        match write {
            DescriptorWrite::StorageImage(image) => {
                if !state.images.contains_key(image) {
                    return Err(Error::UnknownResource {
                        kind: ImageId::KIND,
                        id: image.0,
                    });
                }
            }
            DescriptorWrite::AccelerationStructure(id) => {
                match state.acceleration_structures.get(id) {
                    Some(structure) if structure.ty == AccelerationStructureType::TopLevel => {}
                    _ => {
                        return Err(Error::UnknownResource {
                            kind: "top level acceleration structure",
                            id: id.0,
                        })
                    }
                }
            }
            DescriptorWrite::UniformBuffer { buffer, size }
            | DescriptorWrite::StorageBuffer { buffer, size } => {
                let host = state.buffer(*buffer)?;
                if *size > host.size {
                    return Err(Error::BufferOverflow {
                        name: host.name.clone(),
                        offset: 0,
                        len: *size,
                        size: host.size,
                    });
                }
            }
        }

        let host = state
            .descriptor_tables
            .get_mut(&table)
            .ok_or(Error::UnknownResource {
                kind: DescriptorTableId::KIND,
                id: table.0,
            })?;
        let expected = host
            .kinds
            .get(slot as usize)
            .copied()
            .ok_or(LayoutViolation::DescriptorSlotOutOfRange {
                slot,
                capacity: host.kinds.len() as u32,
            })?;
        if expected != write.kind() {
            return Err(LayoutViolation::DescriptorKind {
                slot,
                expected: expected.name(),
                actual: write.kind().name(),
            }
            .into());
        }
        host.slots[slot as usize] = Some(*write);

        Ok(())
    }

    fn destroy_descriptor_table(&self, table: DescriptorTableId) {
        self.state.lock().descriptor_tables.remove(&table);
    }

    fn submit(&self, commands: CommandList) -> Result<SubmissionIndex> {
        let name = commands.name().to_string();
        let commands = commands.into_commands();
        log::debug!("Executing {} ({} commands)", name, commands.len());

        let mut state = self.state.lock();
        let effects = {
            let mut execution = Execution::new(&name, self.ray_tracing_properties(), &state);
            for command in &commands {
                execution.execute(command)?;
            }
            execution.effects
        };
        state.commit(effects);

        let index = SubmissionIndex(state.submitted.len() as u64 + 1);
        state.submitted.push(SubmittedList {
            index,
            name,
            commands,
        });

        Ok(index)
    }

    fn wait(&self, submission: SubmissionIndex) -> Result<()> {
        if submission.0 == 0 || submission.0 > self.state.lock().submitted.len() as u64 {
            return Err(Error::UnknownResource {
                kind: SubmissionIndex::KIND,
                id: submission.0,
            });
        }

        Ok(())
    }

    fn is_complete(&self, submission: SubmissionIndex) -> bool {
        submission.0 <= self.state.lock().submitted.len() as u64
    }

    fn wait_until_idle(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Barrier;

    fn device() -> Arc<HeadlessDevice> {
        HeadlessDevice::new()
    }

    fn buffer(device: &HeadlessDevice, name: &str, size: u64) -> BufferAllocation {
        device
            .create_buffer(&BufferDescription {
                name,
                size,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                location: MemoryLocation::CpuToGpu,
                alignment: None,
            })
            .unwrap()
    }

    #[test]
    fn test_addresses_are_aligned_and_unique() {
        let device = device();

        let first = buffer(&device, "first", 10);
        let second = buffer(&device, "second", 10);
        device.destroy_buffer(first.id);
        let third = buffer(&device, "third", 10);

        for allocation in [first, second, third] {
            assert_eq!(allocation.device_address % MIN_BUFFER_ALIGNMENT, 0);
        }
        assert_ne!(first.device_address, third.device_address);
        assert_ne!(second.device_address, third.device_address);
    }

    #[test]
    fn test_memory_budget() {
        let device = HeadlessDevice::with_memory_budget(100);

        let first = buffer(&device, "first", 60);
        let result = device.create_buffer(&BufferDescription {
            name: "second",
            size: 60,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            location: MemoryLocation::GpuOnly,
            alignment: None,
        });
        assert!(matches!(result, Err(Error::OutOfMemory { size: 60, .. })));

        device.destroy_buffer(first.id);
        assert_eq!(device.allocated_bytes(), 0);
    }

    #[test]
    fn test_device_local_memory_is_not_readable() {
        let device = device();
        let allocation = device
            .create_buffer(&BufferDescription {
                name: "local",
                size: 16,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                location: MemoryLocation::GpuOnly,
                alignment: None,
            })
            .unwrap();

        device.write_buffer(allocation.id, 0, &[1; 16]).unwrap();

        assert!(matches!(
            device.read_buffer(allocation.id, 0, 16),
            Err(Error::NotHostVisible { .. })
        ));
    }

    #[test]
    fn test_write_out_of_bounds() {
        let device = device();
        let allocation = buffer(&device, "small", 8);

        assert!(matches!(
            device.write_buffer(allocation.id, 4, &[0; 8]),
            Err(Error::BufferOverflow { offset: 4, len: 8, size: 8, .. })
        ));
    }

    #[test]
    fn test_refit_of_unbuilt_structure() {
        let device = device();
        let storage = device
            .create_buffer(&BufferDescription {
                name: "storage",
                size: 4096,
                usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
                location: MemoryLocation::GpuOnly,
                alignment: None,
            })
            .unwrap();
        let scratch = buffer(&device, "scratch", 4096);
        let structure = device
            .create_acceleration_structure(AccelerationStructureType::TopLevel, storage.id, 4096)
            .unwrap();

        let mut cmd = CommandList::new("refit");
        cmd.build_acceleration_structure(
            BuildInputs {
                ty: AccelerationStructureType::TopLevel,
                geometries: vec![],
                allow_update: true,
            },
            BuildMode::Update { source: structure },
            structure,
            scratch.device_address,
        );
        cmd.barrier(Barrier::AccelerationStructureRead);

        assert!(matches!(
            device.submit(cmd),
            Err(Error::InvalidCommand { .. })
        ));
        assert!(!device.is_built(structure));
    }

    #[test]
    fn test_image_transitions_are_tracked() {
        let device = device();
        let image = device
            .create_image(&ImageDescription {
                name: "output",
                width: 4,
                height: 4,
                format: vk::Format::R8G8B8A8_UNORM,
                usage: vk::ImageUsageFlags::STORAGE,
            })
            .unwrap();

        let mut cmd = CommandList::new("first frame");
        cmd.transition_image(image, ImageState::Undefined, ImageState::Storage);
        cmd.transition_image(image, ImageState::Storage, ImageState::CopySource);
        device.submit(cmd).unwrap();
        assert_eq!(device.image_state(image), Some(ImageState::CopySource));

        let mut cmd = CommandList::new("wrong state");
        cmd.transition_image(image, ImageState::Storage, ImageState::CopySource);
        assert!(device.submit(cmd).is_err());
    }

    #[test]
    fn test_handles_name_pipeline_and_group() {
        let device = device();
        let id = device
            .create_ray_tracing_pipeline(&PipelineDescription {
                name: "empty",
                libraries: &[],
                stages: &[],
                groups: &[],
                descriptor_table: &[],
                config: Default::default(),
            })
            .unwrap();

        assert!(device.shader_group_handles(id).unwrap().is_empty());
        device.destroy_pipeline(id);
        assert!(matches!(
            device.shader_group_handles(id),
            Err(Error::UnknownResource { .. })
        ));
    }

    #[test]
    fn test_submissions_complete_immediately() {
        let device = device();

        let mut cmd = CommandList::new("barrier");
        cmd.barrier(Barrier::AccelerationStructureBuild);
        let index = device.submit(cmd).unwrap();

        assert!(device.is_complete(index));
        device.wait(index).unwrap();
        assert_eq!(device.submitted().len(), 1);
        assert!(device.wait(SubmissionIndex(5)).is_err());
    }

    #[test]
    fn test_failed_submission_leaves_state_untouched() {
        let device = device();
        let vertices = buffer(&device, "vertices", 36);
        let storage = device
            .create_buffer(&BufferDescription {
                name: "storage",
                size: 4096,
                usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
                location: MemoryLocation::GpuOnly,
                alignment: None,
            })
            .unwrap();
        let scratch = buffer(&device, "scratch", 4096);
        let blas = device
            .create_acceleration_structure(AccelerationStructureType::BottomLevel, storage.id, 4096)
            .unwrap();
        let image = device
            .create_image(&ImageDescription {
                name: "output",
                width: 4,
                height: 4,
                format: vk::Format::R8G8B8A8_UNORM,
                usage: vk::ImageUsageFlags::STORAGE,
            })
            .unwrap();

        let mut cmd = CommandList::new("build then fail");
        cmd.build_acceleration_structure(
            BuildInputs {
                ty: AccelerationStructureType::BottomLevel,
                geometries: vec![BuildGeometry::Triangles {
                    vertex_address: vertices.device_address,
                    vertex_count: 3,
                    vertex_stride: 12,
                    vertex_format: vk::Format::R32G32B32_SFLOAT,
                    indices: None,
                }],
                allow_update: false,
            },
            BuildMode::Build,
            blas,
            scratch.device_address,
        );
        cmd.barrier(Barrier::AccelerationStructureRead);
        cmd.transition_image(image, ImageState::Undefined, ImageState::Storage);
        // The image is in Storage within this list, not CopySource
        cmd.transition_image(image, ImageState::CopySource, ImageState::Storage);

        assert!(matches!(
            device.submit(cmd),
            Err(Error::InvalidCommand { .. })
        ));
        assert!(!device.is_built(blas));
        assert_eq!(device.image_state(image), Some(ImageState::Undefined));
        assert!(device.submitted().is_empty());
    }
}
