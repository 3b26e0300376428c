use super::{
    acceleration_structures::{raw_type, BuildDescription},
    commands::Recorder,
    resources::{
        InFlight, State, VulkanAccelerationStructure, VulkanBuffer, VulkanDescriptorTable,
        VulkanImage, VulkanPipeline,
    },
    sync::Fence,
    PhysicalDevice, VulkanInstance,
};
use crate::{
    commands::CommandList,
    config::Config,
    device::{
        AccelerationStructureId, AccelerationStructureType, BufferAllocation, BufferDescription,
        BufferId, BuildInputs, BuildSizes, DescriptorTableAllocation, DescriptorTableId,
        DescriptorWrite, Device, ImageDescription, ImageId, PipelineDescription, PipelineId,
        RayTracingProperties, ShaderGroupDescription, SubmissionIndex,
    },
    error::LayoutViolation,
    ray_tracing::{DescriptorKind, ShaderStage},
    Error, Result,
};
use ash::{extensions::khr, vk, vk::Handle};
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc},
    AllocationError, AllocatorDebugSettings, MemoryLocation,
};
use log::info;
use parking_lot::Mutex;
use std::{
    ffi::CString,
    mem::{self, ManuallyDrop},
    os::raw::c_char,
    slice,
    sync::Arc,
};

struct DeviceExtensions {
    acceleration_structure: khr::AccelerationStructure,
    ray_tracing_pipeline: khr::RayTracingPipeline,
}

/// A Vulkan device with the ray tracing pipeline and acceleration structure
/// extensions enabled. All work goes through a single compute queue.
pub struct VulkanDevice {
    name: String,
    properties: RayTracingProperties,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    ext: DeviceExtensions,
    allocator: ManuallyDrop<Mutex<Allocator>>,
    // Also guards the command pool and queue
    state: Mutex<State>,
    raw: ash::Device,
    physical_device: PhysicalDevice,
}

impl VulkanDevice {
    pub fn new(config: &Config) -> Result<Arc<VulkanDevice>> {
        let instance = VulkanInstance::new(config.validation)?;
        let physical_device = Self::select_physical_device(&instance)?;
        info!("Using physical device {:?}", physical_device);

        let queue_family_index = physical_device
            .compute_queue_family()
            .ok_or_else(|| Error::UnsupportedDevice(physical_device.name().to_string()))?;
        let raw = create_device(&physical_device, queue_family_index)?;

        let ext = DeviceExtensions {
            acceleration_structure: khr::AccelerationStructure::new(
                unsafe { instance.raw() },
                &raw,
            ),
            ray_tracing_pipeline: khr::RayTracingPipeline::new(unsafe { instance.raw() }, &raw),
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: unsafe { instance.raw() }.clone(),
            device: raw.clone(),
            physical_device: unsafe { physical_device.raw() },
            debug_settings: AllocatorDebugSettings {
                log_memory_information: true,
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: true,
        })
        .map_err(|err| Error::Allocation {
            name: "allocator".to_string(),
            reason: err.to_string(),
        })?;

        let queue = unsafe { raw.get_device_queue(queue_family_index, 0) };
        let command_pool = unsafe {
            raw.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(queue_family_index)
                    .flags(vk::CommandPoolCreateFlags::TRANSIENT),
                None,
            )
        }?;

        let rt_props = physical_device.ray_tracing_pipeline_properties();
        let accel_props = physical_device.acceleration_structure_properties();
        let properties = RayTracingProperties {
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            scratch_alignment: accel_props.min_acceleration_structure_scratch_offset_alignment,
            max_recursion_depth: rt_props.max_ray_recursion_depth,
        };
        info!("Ray tracing properties: {:?}", properties);

        Ok(Arc::new(VulkanDevice {
            name: physical_device.name().to_string(),
            properties,
            queue,
            command_pool,
            ext,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            state: Mutex::new(State::default()),
            raw,
            physical_device,
        }))
    }

    fn select_physical_device(instance: &Arc<VulkanInstance>) -> Result<PhysicalDevice> {
        let mut physical_devices = instance.physical_devices()?;
        info!("Physical devices: {:?}", physical_devices);

        let first_name = physical_devices
            .first()
            .map_or("no Vulkan device".to_string(), |device| {
                device.name().to_string()
            });

        match physical_devices
            .iter()
            .position(PhysicalDevice::supports_ray_tracing)
        {
            Some(index) => Ok(physical_devices.swap_remove(index)),
            None => Err(Error::UnsupportedDevice(first_name)),
        }
    }

    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.physical_device
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        log::debug!("Allocating {:?}", name);

        self.allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|err| match err {
                AllocationError::OutOfMemory => Error::OutOfMemory {
                    name: name.to_string(),
                    size: requirements.size,
                },
                err => Error::Allocation {
                    name: name.to_string(),
                    reason: err.to_string(),
                },
            })
    }

    fn free(&self, name: &str, allocation: Allocation) {
        log::debug!("Freeing {:?}", name);

        if let Err(err) = self.allocator.lock().free(allocation) {
            log::error!("Failed to free {:?}: {}", name, err);
        }
    }

    fn allocate_buffer(&self, description: &BufferDescription) -> Result<VulkanBuffer> {
        let usage = description.usage
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::TRANSFER_DST;
        let create_info = vk::BufferCreateInfo::builder()
            .size(description.size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let raw = unsafe { self.raw.create_buffer(&create_info, None) }?;

        let mut requirements = unsafe { self.raw.get_buffer_memory_requirements(raw) };
        if let Some(alignment) = description.alignment {
            requirements.alignment = requirements.alignment.max(alignment);
        }

        let allocation =
            match self.allocate(description.name, requirements, description.location, true) {
                Ok(allocation) => allocation,
                Err(err) => {
                    unsafe { self.raw.destroy_buffer(raw, None) };
                    return Err(err);
                }
            };

        let bound = unsafe {
            self.raw
                .bind_buffer_memory(raw, allocation.memory(), allocation.offset())
        };
        let buffer = VulkanBuffer {
            raw,
            allocation,
            name: description.name.to_string(),
            size: description.size,
            usage,
            location: description.location,
        };
        if let Err(err) = bound {
            self.free_buffer(buffer);
            return Err(err.into());
        }

        Ok(buffer)
    }

    fn free_buffer(&self, buffer: VulkanBuffer) {
        unsafe { self.raw.destroy_buffer(buffer.raw, None) };
        self.free(&buffer.name, buffer.allocation);
    }

    fn free_image(&self, image: VulkanImage) {
        unsafe {
            self.raw.destroy_image_view(image.view, None);
            self.raw.destroy_image(image.raw, None);
        }
        self.free(&image.name, image.allocation);
    }

    /// Records `func` into a fresh command buffer, submits it and waits. The
    /// state lock must be held.
    fn one_time_submit<F>(&self, name: &str, func: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let command_buffer = self.allocate_command_buffer()?;
        let result = self.submit_and_wait(name, command_buffer, func);
        unsafe {
            self.raw
                .free_command_buffers(self.command_pool, &[command_buffer])
        };
        result
    }

    fn submit_and_wait<F>(&self, name: &str, command_buffer: vk::CommandBuffer, func: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.raw.begin_command_buffer(command_buffer, &begin_info) }?;
        func(command_buffer);
        unsafe { self.raw.end_command_buffer(command_buffer) }?;

        let fence = Fence::new(&self.raw, name.to_string())?;
        let submit_info = vk::SubmitInfo::builder().command_buffers(slice::from_ref(&command_buffer));
        unsafe {
            self.raw
                .queue_submit(self.queue, slice::from_ref(&submit_info), fence.raw())
        }?;
        fence.wait()
    }

    fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffers = unsafe { self.raw.allocate_command_buffers(&allocate_info) }?;

        command_buffers
            .into_iter()
            .next()
            .ok_or(Error::Vulkan(vk::Result::ERROR_UNKNOWN))
    }

    fn retire(&self, in_flight: InFlight) -> Result<()> {
        log::debug!("Retiring {}", in_flight.fence.name());
        let result = in_flight.fence.wait();
        unsafe {
            self.raw
                .free_command_buffers(self.command_pool, &[in_flight.command_buffer])
        };
        result
    }

    /// Waits for everything submitted so far so a resource can be released.
    fn retire_all(&self, state: &mut State) {
        for (index, in_flight) in mem::take(&mut state.submissions) {
            if let Err(err) = self.retire(in_flight) {
                log::error!("Waiting on {:?} failed: {}", index, err);
            }
        }
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
        Ok(unsafe { self.raw.create_shader_module(&create_info, None) }?)
    }

    fn create_descriptor_set_layout(
        &self,
        kinds: &[DescriptorKind],
    ) -> Result<vk::DescriptorSetLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = kinds
            .iter()
            .enumerate()
            .map(|(slot, kind)| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(slot as u32)
                    .descriptor_type(descriptor_type(*kind))
                    .descriptor_count(1)
                    .stage_flags(
                        vk::ShaderStageFlags::RAYGEN_KHR
                            | vk::ShaderStageFlags::MISS_KHR
                            | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                    )
                    .build()
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        Ok(unsafe { self.raw.create_descriptor_set_layout(&create_info, None) }?)
    }

    fn create_pipeline_objects(
        &self,
        description: &PipelineDescription,
        modules: &[vk::ShaderModule],
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
        let invalid = |reason: String| Error::InvalidShader {
            name: description.name.to_string(),
            reason,
        };

        let names = description
            .stages
            .iter()
            .map(|stage| {
                CString::new(stage.symbol.as_str())
                    .map_err(|_| invalid(format!("{:?} is not a valid symbol", stage.symbol)))
            })
            .collect::<Result<Vec<CString>>>()?;

        let stages = description
            .stages
            .iter()
            .zip(&names)
            .map(|(stage, name)| {
                let module = modules
                    .get(stage.library)
                    .copied()
                    .ok_or_else(|| invalid(format!("no library {}", stage.library)))?;
                Ok(vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage_flags(stage.stage))
                    .module(module)
                    .name(name)
                    .build())
            })
            .collect::<Result<Vec<vk::PipelineShaderStageCreateInfo>>>()?;

        let groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR> = description
            .groups
            .iter()
            .map(|group| match group {
                ShaderGroupDescription::General { stage } => {
                    vk::RayTracingShaderGroupCreateInfoKHR::builder()
                        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                        .general_shader(*stage)
                        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                        .any_hit_shader(vk::SHADER_UNUSED_KHR)
                        .intersection_shader(vk::SHADER_UNUSED_KHR)
                        .build()
                }
                ShaderGroupDescription::TrianglesHit { closest_hit } => {
                    vk::RayTracingShaderGroupCreateInfoKHR::builder()
                        .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                        .general_shader(vk::SHADER_UNUSED_KHR)
                        .closest_hit_shader(*closest_hit)
                        .any_hit_shader(vk::SHADER_UNUSED_KHR)
                        .intersection_shader(vk::SHADER_UNUSED_KHR)
                        .build()
                }
            })
            .collect();

        let layout = unsafe {
            self.raw.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::builder().set_layouts(slice::from_ref(&set_layout)),
                None,
            )
        }?;

        let create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(description.config.max_recursion_depth)
            .layout(layout)
            .build();

        let pipelines = unsafe {
            self.ext.ray_tracing_pipeline.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                slice::from_ref(&create_info),
                None,
            )
        };

        match pipelines.map(|pipelines| pipelines.into_iter().next()) {
            Ok(Some(pipeline)) => Ok((pipeline, layout)),
            Ok(None) => {
                unsafe { self.raw.destroy_pipeline_layout(layout, None) };
                Err(Error::Vulkan(vk::Result::ERROR_UNKNOWN))
            }
            Err(err) => {
                unsafe { self.raw.destroy_pipeline_layout(layout, None) };
                Err(err.into())
            }
        }
    }
}

impl Device for VulkanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_ray_tracing(&self) -> bool {
        true
    }

    fn ray_tracing_properties(&self) -> RayTracingProperties {
        self.properties
    }

    fn create_buffer(&self, description: &BufferDescription) -> Result<BufferAllocation> {
        let buffer = self.allocate_buffer(description)?;
        let device_address = unsafe {
            self.raw
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::builder().buffer(buffer.raw))
        };
        let allocated_size = buffer.allocation.size();

        let mut state = self.state.lock();
        let id = BufferId(state.next_id());
        state.buffers.insert(id, buffer);

        Ok(BufferAllocation {
            id,
            device_address,
            allocated_size,
        })
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let target = state.buffer_mut(buffer)?;
        let len = data.len() as u64;
        if offset + len > target.size {
            return Err(Error::BufferOverflow {
                name: target.name.clone(),
                offset,
                len,
                size: target.size,
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        if let Some(mapped) = target.allocation.mapped_slice_mut() {
            mapped[offset as usize..(offset + len) as usize].copy_from_slice(data);
            return Ok(());
        }

        // Device local memory is filled through a host visible staging copy
        let destination = target.raw;
        let name = format!("{} staging", target.name);
        let mut staging = self.allocate_buffer(&BufferDescription {
            name: &name,
            size: len,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
            alignment: None,
        })?;
        match staging.allocation.mapped_slice_mut() {
            Some(mapped) => mapped[..data.len()].copy_from_slice(data),
            None => {
                self.free_buffer(staging);
                return Err(Error::NotHostVisible { name });
            }
        }

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: offset,
            size: len,
        };
        let source = staging.raw;
        let result = self.one_time_submit(&name, |command_buffer| unsafe {
            self.raw
                .cmd_copy_buffer(command_buffer, source, destination, &[region])
        });
        self.free_buffer(staging);
        drop(state);

        result
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let source = state.buffer(buffer)?;
        if offset + len > source.size {
            return Err(Error::BufferOverflow {
                name: source.name.clone(),
                offset,
                len,
                size: source.size,
            });
        }

        match (source.location, source.allocation.mapped_slice()) {
            (MemoryLocation::GpuOnly, _) | (_, None) => Err(Error::NotHostVisible {
                name: source.name.clone(),
            }),
            (_, Some(mapped)) => Ok(mapped[offset as usize..(offset + len) as usize].to_vec()),
        }
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        let mut state = self.state.lock();
        self.retire_all(&mut state);
        if let Some(buffer) = state.buffers.remove(&buffer) {
            self.free_buffer(buffer);
        }
    }

    fn create_image(&self, description: &ImageDescription) -> Result<ImageId> {
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(description.format)
            .extent(vk::Extent3D {
                width: description.width,
                height: description.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(description.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let raw = unsafe { self.raw.create_image(&create_info, None) }?;

        let requirements = unsafe { self.raw.get_image_memory_requirements(raw) };
        let allocation =
            match self.allocate(description.name, requirements, MemoryLocation::GpuOnly, false) {
                Ok(allocation) => allocation,
                Err(err) => {
                    unsafe { self.raw.destroy_image(raw, None) };
                    return Err(err);
                }
            };

        let view = unsafe {
            self.raw
                .bind_image_memory(raw, allocation.memory(), allocation.offset())
                .and_then(|_| {
                    self.raw.create_image_view(
                        &vk::ImageViewCreateInfo::builder()
                            .image(raw)
                            .view_type(vk::ImageViewType::TYPE_2D)
                            .format(description.format)
                            .subresource_range(
                                vk::ImageSubresourceRange::builder()
                                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                                    .level_count(1)
                                    .layer_count(1)
                                    .build(),
                            ),
                        None,
                    )
                })
        };
        let view = match view {
            Ok(view) => view,
            Err(err) => {
                unsafe { self.raw.destroy_image(raw, None) };
                self.free(description.name, allocation);
                return Err(err.into());
            }
        };

        let mut state = self.state.lock();
        let id = ImageId(state.next_id());
        state.images.insert(
            id,
            VulkanImage {
                raw,
                view,
                allocation,
                name: description.name.to_string(),
            },
        );

        Ok(id)
    }

    fn destroy_image(&self, image: ImageId) {
        let mut state = self.state.lock();
        self.retire_all(&mut state);
        if let Some(image) = state.images.remove(&image) {
            self.free_image(image);
        }
    }

    fn acceleration_structure_build_sizes(&self, inputs: &BuildInputs) -> Result<BuildSizes> {
        let description = BuildDescription::new(inputs);

        let vk::AccelerationStructureBuildSizesInfoKHR {
            acceleration_structure_size,
            build_scratch_size,
            update_scratch_size,
            ..
        } = unsafe {
            self.ext
                .acceleration_structure
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &description.geometry_info(),
                    &description.primitive_counts(),
                )
        };

        Ok(BuildSizes {
            acceleration_structure: acceleration_structure_size,
            build_scratch: build_scratch_size,
            update_scratch: if inputs.allow_update {
                update_scratch_size
            } else {
                0
            },
        })
    }

    fn create_acceleration_structure(
        &self,
        ty: AccelerationStructureType,
        buffer: BufferId,
        size: u64,
    ) -> Result<AccelerationStructureId> {
        let mut state = self.state.lock();
        let backing = state.buffer(buffer)?;
        if !backing
            .usage
            .contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR)
        {
            return Err(Error::Allocation {
                name: backing.name.clone(),
                reason: "buffer lacks acceleration structure storage usage".to_string(),
            });
        }
        if size > backing.size {
            return Err(Error::Allocation {
                name: backing.name.clone(),
                reason: format!("{} bytes do not fit in {} bytes", size, backing.size),
            });
        }

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .ty(raw_type(ty))
            .buffer(backing.raw)
            .size(size);
        let raw = unsafe {
            self.ext
                .acceleration_structure
                .create_acceleration_structure(&create_info, None)
        }?;

        let id = AccelerationStructureId(state.next_id());
        state
            .acceleration_structures
            .insert(id, VulkanAccelerationStructure { raw, ty });

        Ok(id)
    }

    fn acceleration_structure_address(
        &self,
        acceleration_structure: AccelerationStructureId,
    ) -> Result<vk::DeviceAddress> {
        let state = self.state.lock();
        let raw = state.acceleration_structure(acceleration_structure)?.raw;
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::builder()
            .acceleration_structure(raw);

        Ok(unsafe {
            self.ext
                .acceleration_structure
                .get_acceleration_structure_device_address(&info)
        })
    }

    fn destroy_acceleration_structure(&self, acceleration_structure: AccelerationStructureId) {
        let mut state = self.state.lock();
        self.retire_all(&mut state);
        if let Some(acceleration_structure) =
            state.acceleration_structures.remove(&acceleration_structure)
        {
            log::debug!(
                "Destroying {:?} acceleration structure",
                acceleration_structure.ty
            );
            unsafe {
                self.ext
                    .acceleration_structure
                    .destroy_acceleration_structure(acceleration_structure.raw, None)
            };
        }
    }

    fn create_ray_tracing_pipeline(&self, description: &PipelineDescription) -> Result<PipelineId> {
        if description.config.max_recursion_depth > self.properties.max_recursion_depth {
            return Err(Error::InvalidShader {
                name: description.name.to_string(),
                reason: format!(
                    "recursion depth {} exceeds {}",
                    description.config.max_recursion_depth, self.properties.max_recursion_depth
                ),
            });
        }
        // Payload and attribute sizes are declared by the SPIR-V itself
        log::debug!(
            "Pipeline {} payload {} bytes, attributes {} bytes",
            description.name,
            description.config.max_payload_size,
            description.config.max_attribute_size
        );

        let mut modules = Vec::with_capacity(description.libraries.len());
        for library in description.libraries {
            match self.create_shader_module(library.code()) {
                Ok(module) => modules.push(module),
                Err(err) => {
                    for module in modules {
                        unsafe { self.raw.destroy_shader_module(module, None) };
                    }
                    return Err(err);
                }
            }
        }

        let created = self
            .create_descriptor_set_layout(description.descriptor_table)
            .and_then(|set_layout| {
                match self.create_pipeline_objects(description, &modules, set_layout) {
                    Ok((raw, layout)) => Ok((raw, layout, set_layout)),
                    Err(err) => {
                        unsafe { self.raw.destroy_descriptor_set_layout(set_layout, None) };
                        Err(err)
                    }
                }
            });

        for module in modules {
            unsafe { self.raw.destroy_shader_module(module, None) };
        }
        let (raw, layout, set_layout) = created?;
        info!("Created pipeline {}", description.name);

        let mut state = self.state.lock();
        let id = PipelineId(state.next_id());
        state.pipelines.insert(
            id,
            VulkanPipeline {
                raw,
                layout,
                set_layout,
                group_count: description.groups.len() as u32,
            },
        );

        Ok(id)
    }

    fn shader_group_handles(&self, pipeline: PipelineId) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let pipeline = state.pipeline(pipeline)?;
        let data_size =
            pipeline.group_count as usize * self.properties.shader_group_handle_size as usize;

        Ok(unsafe {
            self.ext
                .ray_tracing_pipeline
                .get_ray_tracing_shader_group_handles(
                    pipeline.raw,
                    0,
                    pipeline.group_count,
                    data_size,
                )
        }?)
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        let mut state = self.state.lock();
        self.retire_all(&mut state);
        if let Some(pipeline) = state.pipelines.remove(&pipeline) {
            unsafe {
                self.raw.destroy_pipeline(pipeline.raw, None);
                self.raw.destroy_pipeline_layout(pipeline.layout, None);
                self.raw
                    .destroy_descriptor_set_layout(pipeline.set_layout, None);
            }
        }
    }

    fn create_descriptor_table(
        &self,
        name: &str,
        kinds: &[DescriptorKind],
    ) -> Result<DescriptorTableAllocation> {
        let set_layout = self.create_descriptor_set_layout(kinds)?;

        let pool_sizes: Vec<vk::DescriptorPoolSize> = kinds
            .iter()
            .map(|kind| vk::DescriptorPoolSize {
                ty: descriptor_type(*kind),
                descriptor_count: 1,
            })
            .collect();
        let pool = match unsafe {
            self.raw.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::builder()
                    .max_sets(1)
                    .pool_sizes(&pool_sizes),
                None,
            )
        } {
            Ok(pool) => pool,
            Err(err) => {
                unsafe { self.raw.destroy_descriptor_set_layout(set_layout, None) };
                return Err(err.into());
            }
        };

        let sets = unsafe {
            self.raw.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::builder()
                    .descriptor_pool(pool)
                    .set_layouts(slice::from_ref(&set_layout)),
            )
        };
        let set = match sets.map(|sets| sets.into_iter().next()) {
            Ok(Some(set)) => set,
            result => {
                unsafe {
                    self.raw.destroy_descriptor_pool(pool, None);
                    self.raw.destroy_descriptor_set_layout(set_layout, None);
                }
                return Err(match result {
                    Err(err) => err.into(),
                    Ok(_) => Error::Vulkan(vk::Result::ERROR_UNKNOWN),
                });
            }
        };
        log::debug!("Created descriptor table {} with {} slots", name, kinds.len());

        let mut state = self.state.lock();
        let id = DescriptorTableId(state.next_id());
        state.descriptor_tables.insert(
            id,
            VulkanDescriptorTable {
                pool,
                set,
                set_layout,
                kinds: kinds.to_vec(),
            },
        );

        Ok(DescriptorTableAllocation {
            id,
            handle: set.as_raw(),
        })
    }

    fn write_descriptor(
        &self,
        table: DescriptorTableId,
        slot: u32,
        write: &DescriptorWrite,
    ) -> Result<()> {
        let state = self.state.lock();
        let descriptor_table = state.descriptor_table(table)?;
        let expected = descriptor_table.kinds.get(slot as usize).copied().ok_or(
            LayoutViolation::DescriptorSlotOutOfRange {
                slot,
                capacity: descriptor_table.kinds.len() as u32,
            },
        )?;
        if expected != write.kind() {
            return Err(LayoutViolation::DescriptorKind {
                slot,
                expected: expected.name(),
                actual: write.kind().name(),
            }
            .into());
        }

        let base = vk::WriteDescriptorSet::builder()
            .dst_set(descriptor_table.set)
            .dst_binding(slot)
            .descriptor_type(descriptor_type(expected));

        match write {
            DescriptorWrite::StorageImage(image) => {
                let image_info = vk::DescriptorImageInfo::builder()
                    .image_view(state.image(*image)?.view)
                    .image_layout(vk::ImageLayout::GENERAL)
                    .build();
                let write = base.image_info(slice::from_ref(&image_info)).build();
                unsafe { self.raw.update_descriptor_sets(&[write], &[]) };
            }
            DescriptorWrite::AccelerationStructure(acceleration_structure) => {
                let raw = state.acceleration_structure(*acceleration_structure)?.raw;
                let mut acceleration_structure_write =
                    vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                        .acceleration_structures(slice::from_ref(&raw));
                let mut write = base.push_next(&mut acceleration_structure_write).build();
                write.descriptor_count = 1;
                unsafe { self.raw.update_descriptor_sets(&[write], &[]) };
            }
            DescriptorWrite::UniformBuffer { buffer, size }
            | DescriptorWrite::StorageBuffer { buffer, size } => {
                let buffer_info = vk::DescriptorBufferInfo::builder()
                    .buffer(state.buffer(*buffer)?.raw)
                    .offset(0)
                    .range(*size)
                    .build();
                let write = base.buffer_info(slice::from_ref(&buffer_info)).build();
                unsafe { self.raw.update_descriptor_sets(&[write], &[]) };
            }
        }

        Ok(())
    }

    fn destroy_descriptor_table(&self, table: DescriptorTableId) {
        let mut state = self.state.lock();
        self.retire_all(&mut state);
        if let Some(table) = state.descriptor_tables.remove(&table) {
            unsafe {
                self.raw.destroy_descriptor_pool(table.pool, None);
                self.raw
                    .destroy_descriptor_set_layout(table.set_layout, None);
            }
        }
    }

    fn submit(&self, commands: CommandList) -> Result<SubmissionIndex> {
        let name = commands.name().to_string();
        let commands = commands.into_commands();

        let mut state = self.state.lock();
        let command_buffer = self.allocate_command_buffer()?;
        let recorded = {
            let recorder = Recorder {
                device: &self.raw,
                acceleration_structure: &self.ext.acceleration_structure,
                ray_tracing_pipeline: &self.ext.ray_tracing_pipeline,
                state: &*state,
                buffer: command_buffer,
            };
            recorder
                .begin()
                .and_then(|_| commands.iter().try_for_each(|command| recorder.record(command)))
                .and_then(|_| recorder.end())
        };

        let submitted = recorded.and_then(|_| {
            let fence = Fence::new(&self.raw, name.clone())?;
            let submit_info =
                vk::SubmitInfo::builder().command_buffers(slice::from_ref(&command_buffer));
            unsafe {
                self.raw
                    .queue_submit(self.queue, slice::from_ref(&submit_info), fence.raw())
            }?;
            Ok(fence)
        });
        let fence = match submitted {
            Ok(fence) => fence,
            Err(err) => {
                unsafe {
                    self.raw
                        .free_command_buffers(self.command_pool, &[command_buffer])
                };
                return Err(err);
            }
        };

        state.submission_count += 1;
        let index = SubmissionIndex(state.submission_count);
        log::debug!("Submitted {} as {:?}", name, index);
        state.submissions.insert(
            index,
            InFlight {
                command_buffer,
                fence,
            },
        );

        Ok(index)
    }

    fn wait(&self, submission: SubmissionIndex) -> Result<()> {
        let mut state = self.state.lock();
        if submission.0 == 0 || submission.0 > state.submission_count {
            return Err(Error::UnknownResource {
                kind: SubmissionIndex::KIND,
                id: submission.0,
            });
        }

        match state.submissions.remove(&submission) {
            Some(in_flight) => self.retire(in_flight),
            None => Ok(()),
        }
    }

    fn is_complete(&self, submission: SubmissionIndex) -> bool {
        let state = self.state.lock();
        match state.submissions.get(&submission) {
            Some(in_flight) => in_flight.fence.is_signaled().unwrap_or(false),
            None => submission.0 > 0 && submission.0 <= state.submission_count,
        }
    }

    fn wait_until_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        unsafe { self.raw.device_wait_idle() }?;
        self.retire_all(&mut state);
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Err(err) = unsafe { self.raw.device_wait_idle() } {
            log::error!("Waiting for {} to go idle failed: {}", self.name, err);
        }

        let mut state = mem::take(&mut *self.state.lock());
        self.retire_all(&mut state);
        unsafe {
            for (_, table) in state.descriptor_tables.drain() {
                self.raw.destroy_descriptor_pool(table.pool, None);
                self.raw
                    .destroy_descriptor_set_layout(table.set_layout, None);
            }
            for (_, pipeline) in state.pipelines.drain() {
                self.raw.destroy_pipeline(pipeline.raw, None);
                self.raw.destroy_pipeline_layout(pipeline.layout, None);
                self.raw
                    .destroy_descriptor_set_layout(pipeline.set_layout, None);
            }
            for (_, acceleration_structure) in state.acceleration_structures.drain() {
                self.ext
                    .acceleration_structure
                    .destroy_acceleration_structure(acceleration_structure.raw, None);
            }
        }
        for (_, image) in state.images.drain() {
            self.free_image(image);
        }
        for (_, buffer) in state.buffers.drain() {
            self.free_buffer(buffer);
        }

        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.raw.destroy_command_pool(self.command_pool, None);
            self.raw.destroy_device(None);
        }
    }
}

fn create_device(physical_device: &PhysicalDevice, queue_family_index: u32) -> Result<ash::Device> {
    let priorities = [1.0];
    let queue_create_info = vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(queue_family_index)
        .queue_priorities(&priorities)
        .build();

    let extensions = PhysicalDevice::required_extensions();
    info!("Requested device extensions: {:?}", extensions);
    let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut features_12 = vk::PhysicalDeviceVulkan12Features::builder()
        .buffer_device_address(true)
        .vulkan_memory_model(true)
        .build();
    let mut features_rt =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);
    let mut features_as =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(slice::from_ref(&queue_create_info))
        .enabled_extension_names(&extension_names)
        .push_next(&mut features_12)
        .push_next(&mut features_rt)
        .push_next(&mut features_as);

    let device = unsafe {
        physical_device
            .instance()
            .raw()
            .create_device(physical_device.raw(), &create_info, None)
    }?;

    Ok(device)
}

fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorKind::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
    }
}

fn stage_flags(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
        ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
        ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
    }
}
