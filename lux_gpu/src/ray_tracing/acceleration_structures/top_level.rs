use super::{AccelerationStructure, Instance, InstanceDescriptor, ScratchBuffer};
use crate::{
    commands::{Barrier, BuildMode, CommandList},
    device::{AccelerationStructureType, BuildGeometry, BuildInputs, BuildSizes, Device},
    storage::Buffer,
    Error, Result,
};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::{mem, sync::Arc};

pub struct TopLevelAccelerationStructure {
    name: String,
    acceleration_structure: AccelerationStructure,
    scratch: ScratchBuffer,
    instance_buffer: Buffer,
    instances: Vec<Instance>,
    build_sizes: BuildSizes,
}

impl TopLevelAccelerationStructure {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acceleration_structure(&self) -> &AccelerationStructure {
        &self.acceleration_structure
    }

    pub fn scratch(&self) -> &ScratchBuffer {
        &self.scratch
    }

    pub fn instance_buffer(&self) -> &Buffer {
        &self.instance_buffer
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn build_sizes(&self) -> BuildSizes {
        self.build_sizes
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.acceleration_structure.device_address()
    }

    /// Changes an instance's transform. Takes effect on the next refit.
    pub fn set_transform(&mut self, index: usize, transform: glam::Mat4) -> Result<()> {
        let count = self.instances.len();
        let instance = self
            .instances
            .get_mut(index)
            .ok_or(Error::InstanceOutOfRange { index, count })?;
        instance.set_transform(transform);

        Ok(())
    }

    fn inputs(&self) -> BuildInputs {
        instance_inputs(&self.instance_buffer, self.instances.len() as u32)
    }

    fn write_descriptors(&self) -> Result<()> {
        let descriptors: Vec<InstanceDescriptor> =
            self.instances.iter().map(Instance::descriptor).collect();
        self.instance_buffer.fill(&descriptors)
    }
}

fn instance_inputs(instance_buffer: &Buffer, count: u32) -> BuildInputs {
    BuildInputs {
        ty: AccelerationStructureType::TopLevel,
        geometries: vec![BuildGeometry::Instances {
            address: instance_buffer.device_address(),
            count,
        }],
        allow_update: true,
    }
}

pub struct TopLevelBuilder {
    device: Arc<dyn Device>,
    hit_groups_per_instance: u32,
}

impl TopLevelBuilder {
    pub fn new(device: &Arc<dyn Device>, hit_groups_per_instance: u32) -> Self {
        Self {
            device: device.clone(),
            hit_groups_per_instance,
        }
    }

    /// Full build. Instances are numbered by position and given hit group
    /// offsets `index * hit_groups_per_instance`.
    pub fn build(
        &self,
        name: &str,
        mut instances: Vec<Instance>,
        cmd: &mut CommandList,
    ) -> Result<TopLevelAccelerationStructure> {
        if instances.is_empty() {
            return Err(Error::EmptyInstances(name.to_string()));
        }
        self.check_packing(name, instances.len())?;
        for (index, instance) in instances.iter_mut().enumerate() {
            instance.assign(index as u32, self.hit_groups_per_instance);
        }

        let instance_buffer = Buffer::new(
            &self.device,
            format!("{} instances", name),
            (instances.len() * mem::size_of::<InstanceDescriptor>()) as u64,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            MemoryLocation::CpuToGpu,
        )?;

        let build_sizes = self
            .device
            .acceleration_structure_build_sizes(&instance_inputs(
                &instance_buffer,
                instances.len() as u32,
            ))?;
        log::debug!("{} build sizes: {:?}", name, build_sizes);

        // One scratch buffer serves both full builds and refits
        let scratch = ScratchBuffer::new(
            &self.device,
            name,
            build_sizes.build_scratch.max(build_sizes.update_scratch),
        )?;
        let acceleration_structure = AccelerationStructure::new(
            &self.device,
            name,
            AccelerationStructureType::TopLevel,
            build_sizes.acceleration_structure,
        )?;

        let tlas = TopLevelAccelerationStructure {
            name: name.to_string(),
            acceleration_structure,
            scratch,
            instance_buffer,
            instances,
            build_sizes,
        };
        tlas.write_descriptors()?;

        cmd.build_acceleration_structure(
            tlas.inputs(),
            BuildMode::Build,
            tlas.acceleration_structure.id(),
            tlas.scratch.device_address(),
        );
        cmd.barrier(Barrier::AccelerationStructureRead);

        Ok(tlas)
    }

    /// The last instance's index and hit group offset must fit the 24 bit
    /// descriptor fields.
    fn check_packing(&self, name: &str, count: usize) -> Result<()> {
        let last = u32::try_from(count - 1).unwrap_or(u32::MAX);
        let offset = last.checked_mul(self.hit_groups_per_instance);

        match offset {
            Some(offset) if last <= Instance::MAX_PACKED && offset <= Instance::MAX_PACKED => Ok(()),
            _ => Err(Error::InvalidArgument {
                name: name.to_string(),
                reason: format!(
                    "{} instances with {} hit groups each overflow the 24 bit instance fields",
                    count, self.hit_groups_per_instance
                ),
            }),
        }
    }

    /// With `update_only` the structure is refit in place from the current
    /// instance transforms, keeping every buffer and the device address.
    /// Otherwise it is rebuilt from scratch into new buffers.
    ///
    /// Refitting is only valid while the instance list and the structures it
    /// references are unchanged since the last full build. The instance list
    /// can only be replaced through [`TopLevelBuilder::rebuild`], which always
    /// builds fully.
    pub fn update(
        &self,
        tlas: &mut TopLevelAccelerationStructure,
        update_only: bool,
        cmd: &mut CommandList,
    ) -> Result<()> {
        if !update_only {
            let instances = tlas.instances.clone();
            return self.rebuild(tlas, instances, cmd);
        }

        debug_assert_eq!(
            tlas.instance_buffer.count::<InstanceDescriptor>(),
            tlas.instances.len() as u64
        );

        tlas.write_descriptors()?;
        cmd.build_acceleration_structure(
            tlas.inputs(),
            BuildMode::Update {
                source: tlas.acceleration_structure.id(),
            },
            tlas.acceleration_structure.id(),
            tlas.scratch.device_address(),
        );
        cmd.barrier(Barrier::AccelerationStructureRead);

        Ok(())
    }

    /// Replaces the instance list and builds fully. The device address may
    /// change, so descriptor tables pointing at the old structure must be
    /// rewritten.
    pub fn rebuild(
        &self,
        tlas: &mut TopLevelAccelerationStructure,
        instances: Vec<Instance>,
        cmd: &mut CommandList,
    ) -> Result<()> {
        log::debug!("Rebuilding {} with {} instances", tlas.name, instances.len());
        let name = tlas.name.clone();
        *tlas = self.build(&name, instances, cmd)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        commands::Command,
        device::HeadlessDevice,
        ray_tracing::{BottomLevelAccelerationStructure, BottomLevelBuilder, GeometryRef},
    };
    use glam::{vec3, Mat4};

    struct Fixture {
        device: Arc<dyn Device>,
        cube: Arc<BottomLevelAccelerationStructure>,
        plane: Arc<BottomLevelAccelerationStructure>,
    }

    fn fixture() -> Fixture {
        let device: Arc<dyn Device> = HeadlessDevice::new();
        let mesh = |name: &str, vertices: u32| {
            let positions = vec![[0.5f32; 3]; vertices as usize];
            let buffer = Buffer::new_from_data(
                &device,
                name,
                &positions,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
                MemoryLocation::GpuOnly,
            )
            .unwrap();
            GeometryRef::triangles(Arc::new(buffer), vertices, 12)
        };

        let mut cmd = CommandList::new("blas");
        let structures = BottomLevelBuilder::new(&device)
            .build_all(
                &[("cube", vec![mesh("cube", 36)]), ("plane", vec![mesh("plane", 6)])],
                &mut cmd,
            )
            .unwrap();
        device.submit(cmd).unwrap();

        Fixture {
            device,
            cube: structures[0].clone(),
            plane: structures[1].clone(),
        }
    }

    fn scene(fixture: &Fixture) -> Vec<Instance> {
        vec![
            Instance::new(fixture.cube.clone(), Mat4::IDENTITY),
            Instance::new(fixture.plane.clone(), Mat4::IDENTITY),
        ]
    }

    #[test]
    fn test_hit_group_offsets_follow_index() {
        let fixture = fixture();
        let builder = TopLevelBuilder::new(&fixture.device, 2);
        let mut cmd = CommandList::new("tlas");

        let tlas = builder.build("scene", scene(&fixture), &mut cmd).unwrap();
        fixture.device.submit(cmd).unwrap();

        let offsets: Vec<u32> = tlas.instances().iter().map(Instance::hit_group_offset).collect();
        assert_eq!(offsets, vec![0, 2]);

        let bytes = tlas.instance_buffer().read().unwrap();
        let descriptors: Vec<InstanceDescriptor> = bytemuck::pod_collect_to_vec(&bytes);
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].custom_index(), 0);
        assert_eq!(descriptors[1].custom_index(), 1);
        assert_eq!(descriptors[1].hit_group_offset(), 2);
        assert_eq!(
            descriptors[0].acceleration_structure_reference,
            fixture.cube.device_address()
        );
        assert_eq!(
            descriptors[1].acceleration_structure_reference,
            fixture.plane.device_address()
        );
    }

    #[test]
    fn test_refit_keeps_size_and_address() {
        let fixture = fixture();
        let builder = TopLevelBuilder::new(&fixture.device, 2);
        let mut cmd = CommandList::new("tlas");
        let mut tlas = builder.build("scene", scene(&fixture), &mut cmd).unwrap();
        fixture.device.submit(cmd).unwrap();

        let size = tlas.acceleration_structure().size();
        let address = tlas.device_address();

        tlas.set_transform(0, Mat4::from_translation(vec3(0.0, 0.1, 0.0)))
            .unwrap();
        let mut cmd = CommandList::new("refit");
        builder.update(&mut tlas, true, &mut cmd).unwrap();

        match cmd.commands() {
            [Command::BuildAccelerationStructure {
                mode: BuildMode::Update { source },
                destination,
                ..
            }, Command::Barrier(Barrier::AccelerationStructureRead)] => {
                assert_eq!(source, destination);
            }
            other => panic!("unexpected commands {:?}", other),
        }
        fixture.device.submit(cmd).unwrap();

        assert_eq!(tlas.acceleration_structure().size(), size);
        assert_eq!(tlas.device_address(), address);

        let bytes = tlas.instance_buffer().read().unwrap();
        let descriptors: Vec<InstanceDescriptor> = bytemuck::pod_collect_to_vec(&bytes);
        assert_eq!(descriptors[0].transform[7], 0.1);
    }

    #[test]
    fn test_full_update_reallocates() {
        let fixture = fixture();
        let builder = TopLevelBuilder::new(&fixture.device, 2);
        let mut cmd = CommandList::new("tlas");
        let mut tlas = builder.build("scene", scene(&fixture), &mut cmd).unwrap();
        fixture.device.submit(cmd).unwrap();
        let address = tlas.device_address();

        let mut cmd = CommandList::new("rebuild");
        builder.update(&mut tlas, false, &mut cmd).unwrap();
        fixture.device.submit(cmd).unwrap();

        assert_ne!(tlas.device_address(), address);
        assert_eq!(tlas.instances().len(), 2);
    }

    #[test]
    fn test_rebuild_with_more_instances() {
        let fixture = fixture();
        let builder = TopLevelBuilder::new(&fixture.device, 2);
        let mut cmd = CommandList::new("tlas");
        let mut tlas = builder.build("scene", scene(&fixture), &mut cmd).unwrap();
        fixture.device.submit(cmd).unwrap();

        let mut instances = scene(&fixture);
        instances.push(Instance::new(
            fixture.cube.clone(),
            Mat4::from_translation(vec3(1.0, 0.0, 0.0)),
        ));
        let mut cmd = CommandList::new("rebuild");
        builder.rebuild(&mut tlas, instances, &mut cmd).unwrap();
        fixture.device.submit(cmd).unwrap();

        let offsets: Vec<u32> = tlas.instances().iter().map(Instance::hit_group_offset).collect();
        assert_eq!(offsets, vec![0, 2, 4]);
        // Two instances share the cube
        assert_eq!(Arc::strong_count(&fixture.cube), 3);
    }

    #[test]
    fn test_scratch_covers_refit() {
        let fixture = fixture();
        let builder = TopLevelBuilder::new(&fixture.device, 2);
        let mut cmd = CommandList::new("tlas");
        let tlas = builder.build("scene", scene(&fixture), &mut cmd).unwrap();
        fixture.device.submit(cmd).unwrap();

        let sizes = tlas.build_sizes();
        assert!(tlas.scratch().size() >= sizes.build_scratch);
        assert!(tlas.scratch().size() >= sizes.update_scratch);
    }

    #[test]
    fn test_empty_scene_is_rejected() {
        let fixture = fixture();
        let builder = TopLevelBuilder::new(&fixture.device, 2);
        let mut cmd = CommandList::new("tlas");

        let result = builder.build("empty", vec![], &mut cmd);

        assert!(matches!(result, Err(Error::EmptyInstances(_))));
    }

    #[test]
    fn test_transform_out_of_range() {
        let fixture = fixture();
        let builder = TopLevelBuilder::new(&fixture.device, 2);
        let mut cmd = CommandList::new("tlas");
        let mut tlas = builder.build("scene", scene(&fixture), &mut cmd).unwrap();
        fixture.device.submit(cmd).unwrap();

        assert!(matches!(
            tlas.set_transform(2, Mat4::IDENTITY),
            Err(Error::InstanceOutOfRange { index: 2, count: 2 })
        ));
    }

    #[test]
    fn test_hit_group_offset_must_fit_descriptor() {
        let fixture = fixture();
        let builder = TopLevelBuilder::new(&fixture.device, 1 << 23);
        let mut instances = scene(&fixture);
        instances.push(Instance::new(fixture.cube.clone(), Mat4::IDENTITY));
        let mut cmd = CommandList::new("tlas");

        // The third instance would start at hit group 2^24
        assert!(matches!(
            builder.build("scene", instances, &mut cmd),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(cmd.is_empty());

        let tlas = builder.build("scene", scene(&fixture), &mut cmd).unwrap();
        assert_eq!(tlas.instances()[1].hit_group_offset(), 1 << 23);
    }
}
