use crate::{
    device::{
        AccelerationStructureId, BuildInputs, DescriptorTableId, Device, ImageId, PipelineId,
    },
    ray_tracing::ShaderBindingTableRegions,
    Result,
};
use ash::vk;
use std::{mem, sync::Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Build,
    /// Refit in place. The source must be the destination and must have
    /// been built with updates allowed.
    Update { source: AccelerationStructureId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    /// Acceleration structure writes made visible to later builds.
    AccelerationStructureBuild,
    /// Acceleration structure writes made visible to ray tracing shaders.
    AccelerationStructureRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Undefined,
    Storage,
    CopySource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BuildAccelerationStructure {
        inputs: BuildInputs,
        mode: BuildMode,
        destination: AccelerationStructureId,
        scratch_address: vk::DeviceAddress,
    },
    Barrier(Barrier),
    ImageBarrier {
        image: ImageId,
        from: ImageState,
        to: ImageState,
    },
    BindPipeline(PipelineId),
    BindDescriptorTable {
        pipeline: PipelineId,
        table: DescriptorTableId,
    },
    TraceRays {
        regions: ShaderBindingTableRegions,
        width: u32,
        height: u32,
        depth: u32,
    },
}

/// An ordered list of GPU commands, executed in order once submitted.
#[must_use]
#[derive(Debug)]
pub struct CommandList {
    name: String,
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commands: vec![],
        }
    }

    /// Records, submits and waits on a list in one go.
    pub fn now<F>(device: &Arc<dyn Device>, name: impl Into<String>, func: F) -> Result<()>
    where
        F: FnOnce(&mut CommandList) -> Result<()>,
    {
        let mut list = CommandList::new(name);
        func(&mut list)?;

        let name = list.name.clone();
        let submission = device.submit(list)?;
        log::debug!("Waiting upon command {}", name);
        device.wait(submission)?;
        log::debug!("Command {} complete", name);

        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn build_acceleration_structure(
        &mut self,
        inputs: BuildInputs,
        mode: BuildMode,
        destination: AccelerationStructureId,
        scratch_address: vk::DeviceAddress,
    ) {
        log::debug!(
            "{}: {:?} {:?} into {:?}",
            self.name,
            mode,
            inputs.ty,
            destination
        );
        self.commands.push(Command::BuildAccelerationStructure {
            inputs,
            mode,
            destination,
            scratch_address,
        });
    }

    pub fn barrier(&mut self, barrier: Barrier) {
        self.commands.push(Command::Barrier(barrier));
    }

    pub fn transition_image(&mut self, image: ImageId, from: ImageState, to: ImageState) {
        self.commands.push(Command::ImageBarrier { image, from, to });
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineId) {
        self.commands.push(Command::BindPipeline(pipeline));
    }

    pub fn bind_descriptor_table(&mut self, pipeline: PipelineId, table: DescriptorTableId) {
        self.commands
            .push(Command::BindDescriptorTable { pipeline, table });
    }

    pub fn trace_rays(&mut self, regions: ShaderBindingTableRegions, size: (u32, u32, u32)) {
        self.commands.push(Command::TraceRays {
            regions,
            width: size.0,
            height: size.1,
            depth: size.2,
        });
    }

    /// Moves every command of `other` to the end of this list.
    pub fn append(&mut self, other: CommandList) {
        let mut commands = other.into_commands();
        self.commands.append(&mut commands);
    }

    pub fn into_commands(mut self) -> Vec<Command> {
        mem::take(&mut self.commands)
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if !self.commands.is_empty() {
            log::warn!(
                "Command list {} was recorded but never submitted.",
                self.name
            );
        }
    }
}
