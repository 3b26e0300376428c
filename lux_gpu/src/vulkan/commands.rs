use super::{acceleration_structures::BuildDescription, resources::State};
use crate::{
    commands::{Barrier, BuildMode, Command, ImageState},
    Result,
};
use ash::{extensions::khr, vk};
use std::slice;

/// Translates recorded commands into a Vulkan command buffer.
pub struct Recorder<'a> {
    pub device: &'a ash::Device,
    pub acceleration_structure: &'a khr::AccelerationStructure,
    pub ray_tracing_pipeline: &'a khr::RayTracingPipeline,
    pub state: &'a State,
    pub buffer: vk::CommandBuffer,
}

impl<'a> Recorder<'a> {
    pub fn begin(&self) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(self.buffer, &begin_info) }?;
        Ok(())
    }

    pub fn end(&self) -> Result<()> {
        unsafe { self.device.end_command_buffer(self.buffer) }?;
        Ok(())
    }

    pub fn record(&self, command: &Command) -> Result<()> {
        match command {
            Command::BuildAccelerationStructure {
                inputs,
                mode,
                destination,
                scratch_address,
            } => {
                let description = BuildDescription::new(inputs);
                let destination = self.state.acceleration_structure(*destination)?.raw;
                let (raw_mode, source) = match mode {
                    BuildMode::Build => (
                        vk::BuildAccelerationStructureModeKHR::BUILD,
                        vk::AccelerationStructureKHR::null(),
                    ),
                    BuildMode::Update { source } => (
                        vk::BuildAccelerationStructureModeKHR::UPDATE,
                        self.state.acceleration_structure(*source)?.raw,
                    ),
                };

                let geometry_info = description
                    .geometry_info()
                    .mode(raw_mode)
                    .src_acceleration_structure(source)
                    .dst_acceleration_structure(destination)
                    .scratch_data(vk::DeviceOrHostAddressKHR {
                        device_address: *scratch_address,
                    })
                    .build();

                unsafe {
                    self.acceleration_structure
                        .cmd_build_acceleration_structures(
                            self.buffer,
                            slice::from_ref(&geometry_info),
                            &[description.ranges()],
                        );
                }
            }
            Command::Barrier(barrier) => self.barrier(*barrier),
            Command::ImageBarrier { image, from, to } => {
                let image = self.state.image(*image)?.raw;
                self.transition_image_layout(image, *from, *to);
            }
            Command::BindPipeline(pipeline) => {
                let pipeline = self.state.pipeline(*pipeline)?.raw;
                unsafe {
                    self.device.cmd_bind_pipeline(
                        self.buffer,
                        vk::PipelineBindPoint::RAY_TRACING_KHR,
                        pipeline,
                    )
                };
            }
            Command::BindDescriptorTable { pipeline, table } => {
                let layout = self.state.pipeline(*pipeline)?.layout;
                let set = self.state.descriptor_table(*table)?.set;
                unsafe {
                    self.device.cmd_bind_descriptor_sets(
                        self.buffer,
                        vk::PipelineBindPoint::RAY_TRACING_KHR,
                        layout,
                        0,
                        &[set],
                        &[],
                    )
                };
            }
            Command::TraceRays {
                regions,
                width,
                height,
                depth,
            } => unsafe {
                self.ray_tracing_pipeline.cmd_trace_rays(
                    self.buffer,
                    &regions.ray_generation.raw(),
                    &regions.miss.raw(),
                    &regions.hit_group.raw(),
                    &regions.callable.raw(),
                    *width,
                    *height,
                    *depth,
                )
            },
        }

        Ok(())
    }

    fn barrier(&self, barrier: Barrier) {
        let (dst_access_mask, dst_stage_mask) = match barrier {
            Barrier::AccelerationStructureBuild => (
                vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                    | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            ),
            Barrier::AccelerationStructureRead => (
                vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            ),
        };

        let memory_barrier = vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_access_mask(dst_access_mask)
            .build();

        unsafe {
            self.device.cmd_pipeline_barrier(
                self.buffer,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                dst_stage_mask,
                vk::DependencyFlags::empty(),
                &[memory_barrier],
                &[],
                &[],
            )
        };
    }

    fn transition_image_layout(&self, image: vk::Image, from: ImageState, to: ImageState) {
        let (old_layout, src_access_mask, src_stage_mask) = image_state(from);
        let (new_layout, dst_access_mask, dst_stage_mask) = image_state(to);

        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(src_access_mask)
            .dst_access_mask(dst_access_mask)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1)
                    .build(),
            )
            .build();

        unsafe {
            self.device.cmd_pipeline_barrier(
                self.buffer,
                src_stage_mask,
                dst_stage_mask,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            )
        };
    }
}

fn image_state(state: ImageState) -> (vk::ImageLayout, vk::AccessFlags, vk::PipelineStageFlags) {
    match state {
        ImageState::Undefined => (
            vk::ImageLayout::UNDEFINED,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
        ),
        ImageState::Storage => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
        ImageState::CopySource => (
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_images_use_general_layout() {
        assert_eq!(image_state(ImageState::Storage).0, vk::ImageLayout::GENERAL);
        assert_eq!(
            image_state(ImageState::CopySource).0,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
        assert_eq!(
            image_state(ImageState::Undefined).2,
            vk::PipelineStageFlags::TOP_OF_PIPE
        );
    }
}
