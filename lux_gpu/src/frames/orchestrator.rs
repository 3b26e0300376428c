use super::CameraConstants;
use crate::{
    commands::{CommandList, ImageState},
    config::FrameConfig,
    device::{Device, SubmissionIndex},
    ray_tracing::{
        DescriptorTable, DescriptorTableLayout, Instance, RayTracingPipeline, ShaderBindingTable,
        ShaderBindingTableBuilder, TopLevelAccelerationStructure, TopLevelBuilder,
    },
    storage::{Buffer, Image},
    Error, Result,
};
use ash::vk;
use glam::Mat4;
use gpu_allocator::MemoryLocation;
use std::{mem, slice, sync::Arc};

/// Adds a frame's shader binding table records. Called with the frame's
/// descriptor table whenever its table is generated.
pub type RecordWriter =
    Box<dyn Fn(&mut ShaderBindingTableBuilder, &DescriptorTable) -> Result<()> + Send + Sync>;

/// Everything one frame in flight reads or writes on the device.
pub struct FrameResources {
    tlas: TopLevelAccelerationStructure,
    descriptor_table: DescriptorTable,
    sbt: ShaderBindingTable,
    output: Image,
    camera: Buffer,
    submission: Option<SubmissionIndex>,
    output_state: ImageState,
}

impl FrameResources {
    pub fn tlas(&self) -> &TopLevelAccelerationStructure {
        &self.tlas
    }

    pub fn descriptor_table(&self) -> &DescriptorTable {
        &self.descriptor_table
    }

    pub fn sbt(&self) -> &ShaderBindingTable {
        &self.sbt
    }

    pub fn output(&self) -> &Image {
        &self.output
    }

    pub fn camera(&self) -> &Buffer {
        &self.camera
    }

    /// The last submission that used this frame.
    pub fn submission(&self) -> Option<SubmissionIndex> {
        self.submission
    }
}

/// Drives the per frame sequence: refit the scene, trace, and hand the
/// output image over for copying. Frames rotate through a fixed number of
/// slots, and the CPU only blocks when it comes back to a slot the GPU may
/// still be using.
pub struct FrameOrchestrator {
    device: Arc<dyn Device>,
    pipeline: RayTracingPipeline,
    tlas_builder: TopLevelBuilder,
    records: RecordWriter,
    transforms: Vec<Mat4>,
    frames: Vec<FrameResources>,
    frame_index: u64,
    extent: (u32, u32),
}

impl FrameOrchestrator {
    pub fn new(
        device: &Arc<dyn Device>,
        pipeline: RayTracingPipeline,
        instances: Vec<Instance>,
        extent: (u32, u32),
        config: &FrameConfig,
        records: RecordWriter,
    ) -> Result<Self> {
        let tlas_builder = TopLevelBuilder::new(device, config.hit_groups_per_instance);
        let transforms = instances.iter().map(Instance::transform).collect();

        let frames = (0..config.frames_in_flight.max(1))
            .map(|slot| {
                create_frame(
                    device,
                    &pipeline,
                    &tlas_builder,
                    &records,
                    slot,
                    instances.clone(),
                    extent,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        log::info!(
            "Rendering {}x{} with {} frames in flight",
            extent.0,
            extent.1,
            frames.len()
        );

        Ok(Self {
            device: device.clone(),
            pipeline,
            tlas_builder,
            records,
            transforms,
            frames,
            frame_index: 0,
            extent,
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn frame(&self, slot: usize) -> Option<&FrameResources> {
        self.frames.get(slot)
    }

    /// Frames rendered so far.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    pub fn pipeline(&self) -> &RayTracingPipeline {
        &self.pipeline
    }

    pub fn instance_count(&self) -> usize {
        self.transforms.len()
    }

    /// Moves an instance. Each frame picks the change up through a refit the
    /// next time it is rendered.
    pub fn set_transform(&mut self, index: usize, transform: Mat4) -> Result<()> {
        let count = self.transforms.len();
        let slot = self
            .transforms
            .get_mut(index)
            .ok_or(Error::InstanceOutOfRange { index, count })?;
        *slot = transform;

        Ok(())
    }

    /// Records and submits one frame into the next slot.
    pub fn render(&mut self, camera: &CameraConstants) -> Result<SubmissionIndex> {
        let slot = (self.frame_index % self.frames.len() as u64) as usize;
        let frame = &mut self.frames[slot];

        if let Some(submission) = frame.submission {
            if !self.device.is_complete(submission) {
                log::debug!("Waiting upon frame slot {}", slot);
            }
            self.device.wait(submission)?;
        }

        frame.camera.fill(slice::from_ref(camera))?;
        for (index, transform) in self.transforms.iter().enumerate() {
            frame.tlas.set_transform(index, *transform)?;
        }

        let mut cmd = CommandList::new(format!("frame {}", self.frame_index));
        self.tlas_builder.update(&mut frame.tlas, true, &mut cmd)?;
        debug_assert!(frame.descriptor_table.points_at(&frame.tlas));

        cmd.transition_image(frame.output.id(), frame.output_state, ImageState::Storage);
        cmd.bind_pipeline(self.pipeline.id());
        cmd.bind_descriptor_table(self.pipeline.id(), frame.descriptor_table.id());
        cmd.trace_rays(frame.sbt.regions(), (self.extent.0, self.extent.1, 1));
        cmd.transition_image(frame.output.id(), ImageState::Storage, ImageState::CopySource);

        let submission = self.device.submit(cmd)?;
        frame.submission = Some(submission);
        frame.output_state = ImageState::CopySource;
        self.frame_index += 1;

        Ok(submission)
    }

    /// Replaces the scene with a full rebuild of every frame's structure.
    /// Each frame gets a descriptor table pointing at its new structure and a
    /// shader binding table generated against that table. Nothing is swapped
    /// in unless every frame rebuilt, so a failure leaves the old scene in
    /// place.
    pub fn rebuild(&mut self, instances: Vec<Instance>) -> Result<()> {
        self.wait_idle()?;

        let rebuilt = self
            .frames
            .iter()
            .enumerate()
            .map(|(slot, frame)| {
                let tlas = build_tlas(
                    &self.device,
                    &self.tlas_builder,
                    frame.tlas.name(),
                    instances.clone(),
                )?;
                log::debug!("Re-pointing frame {} descriptors at {}", slot, tlas.name());
                let descriptor_table = bind_descriptors(
                    &self.device,
                    &self.pipeline,
                    slot,
                    &frame.output,
                    &tlas,
                    &frame.camera,
                )?;
                let sbt = generate_sbt(
                    &self.device,
                    &self.pipeline,
                    &self.records,
                    &descriptor_table,
                    slot,
                )?;
                Ok((tlas, descriptor_table, sbt))
            })
            .collect::<Result<Vec<_>>>()?;

        for (frame, (tlas, descriptor_table, sbt)) in self.frames.iter_mut().zip(rebuilt) {
            frame.tlas = tlas;
            frame.descriptor_table = descriptor_table;
            frame.sbt = sbt;
        }
        self.transforms = instances.iter().map(Instance::transform).collect();

        Ok(())
    }

    /// Swaps in a newly finalized pipeline. Its identifiers differ from the
    /// old ones, so every shader binding table is generated again before the
    /// pipeline is replaced.
    pub fn set_pipeline(&mut self, pipeline: RayTracingPipeline) -> Result<()> {
        self.wait_idle()?;

        let tables = self
            .frames
            .iter()
            .enumerate()
            .map(|(slot, frame)| {
                generate_sbt(
                    &self.device,
                    &pipeline,
                    &self.records,
                    &frame.descriptor_table,
                    slot,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        for (frame, sbt) in self.frames.iter_mut().zip(tables) {
            frame.sbt = sbt;
        }
        self.pipeline = pipeline;

        Ok(())
    }

    /// Checks every frame's shader binding table against the current
    /// pipeline.
    pub fn verify(&self) -> Result<()> {
        self.frames
            .iter()
            .try_for_each(|frame| frame.sbt.verify(&self.pipeline))
    }

    pub fn wait_idle(&self) -> Result<()> {
        for submission in self.frames.iter().filter_map(|frame| frame.submission) {
            self.device.wait(submission)?;
        }

        Ok(())
    }
}

impl Drop for FrameOrchestrator {
    fn drop(&mut self) {
        if let Err(error) = self.wait_idle() {
            log::warn!("Frames still in flight on drop: {}", error);
        }
    }
}

fn create_frame(
    device: &Arc<dyn Device>,
    pipeline: &RayTracingPipeline,
    tlas_builder: &TopLevelBuilder,
    records: &RecordWriter,
    slot: usize,
    instances: Vec<Instance>,
    extent: (u32, u32),
) -> Result<FrameResources> {
    let tlas = build_tlas(device, tlas_builder, &format!("scene {}", slot), instances)?;

    let output = Image::new(
        device,
        format!("output {}", slot),
        extent,
        vk::Format::R8G8B8A8_UNORM,
        vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
    )?;
    let camera = Buffer::new(
        device,
        format!("camera {}", slot),
        mem::size_of::<CameraConstants>() as u64,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        MemoryLocation::CpuToGpu,
    )?;

    let descriptor_table = bind_descriptors(device, pipeline, slot, &output, &tlas, &camera)?;
    let sbt = generate_sbt(device, pipeline, records, &descriptor_table, slot)?;

    Ok(FrameResources {
        tlas,
        descriptor_table,
        sbt,
        output,
        camera,
        submission: None,
        output_state: ImageState::Undefined,
    })
}

fn build_tlas(
    device: &Arc<dyn Device>,
    tlas_builder: &TopLevelBuilder,
    name: &str,
    instances: Vec<Instance>,
) -> Result<TopLevelAccelerationStructure> {
    let mut tlas = None;
    CommandList::now(device, format!("build {}", name), |cmd| {
        tlas = Some(tlas_builder.build(name, instances, cmd)?);
        Ok(())
    })?;

    tlas.ok_or_else(|| Error::EmptyInstances(name.to_string()))
}

fn bind_descriptors(
    device: &Arc<dyn Device>,
    pipeline: &RayTracingPipeline,
    slot: usize,
    output: &Image,
    tlas: &TopLevelAccelerationStructure,
    camera: &Buffer,
) -> Result<DescriptorTable> {
    let mut descriptor_table = DescriptorTable::allocate(
        device,
        format!("frame {} descriptors", slot),
        pipeline.descriptor_table_layout().clone(),
    )?;
    descriptor_table.write_output_image(DescriptorTableLayout::OUTPUT_IMAGE, output)?;
    descriptor_table.write_acceleration_structure(DescriptorTableLayout::SCENE, tlas)?;
    descriptor_table.write_constant_buffer(DescriptorTableLayout::CAMERA, camera, camera.size())?;

    Ok(descriptor_table)
}

fn generate_sbt(
    device: &Arc<dyn Device>,
    pipeline: &RayTracingPipeline,
    records: &RecordWriter,
    descriptor_table: &DescriptorTable,
    slot: usize,
) -> Result<ShaderBindingTable> {
    let mut builder = ShaderBindingTableBuilder::new(device.ray_tracing_properties());
    records(&mut builder, descriptor_table)?;
    builder.build(device, &format!("frame {}", slot), pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        commands::Command,
        config::PipelineConfig,
        device::HeadlessDevice,
        ray_tracing::{
            BindingLayout, BindingSlot, BottomLevelAccelerationStructure, BottomLevelBuilder,
            DescriptorKind, DescriptorRange, EntryPoint, GeometryRef, PipelineBinder,
            RootArgument, ShaderLibrary, ShaderStage,
        },
    };
    use glam::{vec3, Vec3};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scene {
        headless: Arc<HeadlessDevice>,
        device: Arc<dyn Device>,
        cube: Arc<BottomLevelAccelerationStructure>,
        plane: Arc<BottomLevelAccelerationStructure>,
    }

    fn scene() -> Scene {
        let headless = HeadlessDevice::new();
        let device: Arc<dyn Device> = headless.clone();
        let mesh = |name: &str, vertices: u32| {
            let positions = vec![[0.0f32; 3]; vertices as usize];
            let buffer = Buffer::new_from_data(
                &device,
                name,
                &positions,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
                MemoryLocation::GpuOnly,
            )
            .unwrap();
            vec![GeometryRef::triangles(Arc::new(buffer), vertices, 12)]
        };

        let mut structures = vec![];
        CommandList::now(&device, "blas", |cmd| {
            structures = BottomLevelBuilder::new(&device)
                .build_all(&[("cube", mesh("cube", 36)), ("plane", mesh("plane", 6))], cmd)?;
            Ok(())
        })
        .unwrap();

        Scene {
            headless,
            device,
            cube: structures[0].clone(),
            plane: structures[1].clone(),
        }
    }

    fn pipeline(device: &Arc<dyn Device>) -> RayTracingPipeline {
        let library = |symbol: &str, stage: ShaderStage| {
            ShaderLibrary::new(symbol, vec![0x0723_0203], vec![EntryPoint::new(symbol, stage)])
        };
        let raygen = Arc::new(BindingLayout::new(
            "raygen",
            vec![BindingSlot::DescriptorTable(vec![
                DescriptorRange::new(DescriptorKind::StorageImage, 0, 1),
                DescriptorRange::new(DescriptorKind::AccelerationStructure, 1, 1),
                DescriptorRange::new(DescriptorKind::UniformBuffer, 2, 1),
            ])],
        ));

        let mut binder = PipelineBinder::new(
            device,
            "frames",
            PipelineConfig::default(),
            Arc::new(DescriptorTableLayout::ray_generation()),
        );
        binder
            .declare_library(library("RayGen", ShaderStage::RayGeneration))
            .declare_library(library("Miss", ShaderStage::Miss))
            .declare_library(library("ClosestHit", ShaderStage::ClosestHit))
            .declare_hit_group("HitGroup", "ClosestHit")
            .declare_binding_layout(&["RayGen"], raygen)
            .declare_binding_layout(&["Miss", "HitGroup"], Arc::new(BindingLayout::empty("none")));
        binder.finalize().unwrap()
    }

    fn records() -> RecordWriter {
        Box::new(|builder: &mut ShaderBindingTableBuilder, table: &DescriptorTable| {
            builder.add_ray_generation_record(
                "RayGen",
                vec![RootArgument::DescriptorTable(table.handle())],
            )?;
            builder
                .add_miss_record("Miss", vec![])
                .add_hit_group_record("HitGroup", vec![])
                .add_hit_group_record("HitGroup", vec![]);
            Ok(())
        })
    }

    fn orchestrator(scene: &Scene) -> FrameOrchestrator {
        FrameOrchestrator::new(
            &scene.device,
            pipeline(&scene.device),
            vec![
                Instance::new(scene.cube.clone(), Mat4::IDENTITY),
                Instance::new(scene.plane.clone(), Mat4::IDENTITY),
            ],
            (64, 48),
            &FrameConfig::default(),
            records(),
        )
        .unwrap()
    }

    fn camera() -> CameraConstants {
        CameraConstants::look_at(Vec3::splat(1.5), Vec3::ZERO, 64.0 / 48.0)
    }

    #[test]
    fn test_frames_rotate_through_slots() {
        let scene = scene();
        let mut frames = orchestrator(&scene);

        let first = frames.render(&camera()).unwrap();
        let second = frames.render(&camera()).unwrap();
        let third = frames.render(&camera()).unwrap();

        assert_eq!(frames.frames_in_flight(), 2);
        assert_eq!(frames.frame(0).unwrap().submission(), Some(third));
        assert_eq!(frames.frame(1).unwrap().submission(), Some(second));
        assert!(first < third);
        assert_eq!(frames.frame_index(), 3);
    }

    #[test]
    fn test_frame_sequence() {
        let scene = scene();
        let mut frames = orchestrator(&scene);

        frames.render(&camera()).unwrap();

        let submitted = scene.headless.submitted();
        let frame = submitted.last().unwrap();
        let output = frames.frame(0).unwrap().output().id();
        let pipeline = frames.pipeline().id();
        match frame.commands.as_slice() {
            [Command::BuildAccelerationStructure { .. }, Command::Barrier(_), Command::ImageBarrier {
                image,
                from: ImageState::Undefined,
                to: ImageState::Storage,
            }, Command::BindPipeline(bound), Command::BindDescriptorTable { .. }, Command::TraceRays {
                width: 64,
                height: 48,
                depth: 1,
                ..
            }, Command::ImageBarrier {
                to: ImageState::CopySource,
                ..
            }] => {
                assert_eq!(*image, output);
                assert_eq!(*bound, pipeline);
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert_eq!(scene.headless.image_state(output), Some(ImageState::CopySource));

        // The second use of a slot starts from the copy source state
        frames.render(&camera()).unwrap();
        frames.render(&camera()).unwrap();
        let submitted = scene.headless.submitted();
        assert!(submitted.last().unwrap().commands.contains(&Command::ImageBarrier {
            image: output,
            from: ImageState::CopySource,
            to: ImageState::Storage,
        }));
    }

    #[test]
    fn test_animation_refits_in_place() {
        let scene = scene();
        let mut frames = orchestrator(&scene);
        let address = frames.frame(0).unwrap().tlas().device_address();

        frames
            .set_transform(0, Mat4::from_translation(vec3(0.0, 0.1, 0.0)))
            .unwrap();
        frames.render(&camera()).unwrap();

        let frame = frames.frame(0).unwrap();
        assert_eq!(frame.tlas().device_address(), address);
        assert!(frame.descriptor_table().points_at(frame.tlas()));
        assert_eq!(frame.tlas().instances()[0].transform().w_axis.y, 0.1);
    }

    #[test]
    fn test_rebuild_repoints_descriptor_tables() {
        let scene = scene();
        let mut frames = orchestrator(&scene);
        frames.render(&camera()).unwrap();
        let address = frames.frame(0).unwrap().tlas().device_address();

        frames
            .rebuild(vec![
                Instance::new(scene.cube.clone(), Mat4::IDENTITY),
                Instance::new(scene.plane.clone(), Mat4::IDENTITY),
                Instance::new(scene.cube.clone(), Mat4::from_translation(vec3(2.0, 0.0, 0.0))),
            ])
            .unwrap();

        let frame = frames.frame(0).unwrap();
        assert_ne!(frame.tlas().device_address(), address);
        assert!(frame.descriptor_table().points_at(frame.tlas()));
        assert_eq!(frames.instance_count(), 3);

        // Tracing against the moved structure still validates
        frames.render(&camera()).unwrap();
        frames.render(&camera()).unwrap();
        frames.verify().unwrap();
    }

    #[test]
    fn test_new_pipeline_regenerates_tables() {
        let scene = scene();
        let mut frames = orchestrator(&scene);

        frames.set_pipeline(pipeline(&scene.device)).unwrap();

        frames.verify().unwrap();
        frames.render(&camera()).unwrap();
    }

    #[test]
    fn test_transform_out_of_range() {
        let scene = scene();
        let mut frames = orchestrator(&scene);

        assert!(matches!(
            frames.set_transform(2, Mat4::IDENTITY),
            Err(Error::InstanceOutOfRange { index: 2, count: 2 })
        ));
    }

    #[test]
    fn test_failed_rebuild_keeps_old_scene() {
        let scene = scene();
        let headless = scene.headless.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let inner = records();
        let records: RecordWriter = Box::new(
            move |builder: &mut ShaderBindingTableBuilder, table: &DescriptorTable| {
                // Two calls at creation, then the second slot of the rebuild
                // runs out of memory allocating its shader binding table
                if counter.fetch_add(1, Ordering::SeqCst) == 3 {
                    headless.set_memory_budget(Some(headless.allocated_bytes()));
                }
                inner(builder, table)
            },
        );
        let mut frames = FrameOrchestrator::new(
            &scene.device,
            pipeline(&scene.device),
            vec![
                Instance::new(scene.cube.clone(), Mat4::IDENTITY),
                Instance::new(scene.plane.clone(), Mat4::IDENTITY),
            ],
            (64, 48),
            &FrameConfig::default(),
            records,
        )
        .unwrap();
        frames.render(&camera()).unwrap();
        let addresses: Vec<_> = (0..2)
            .map(|slot| frames.frame(slot).unwrap().tlas().device_address())
            .collect();

        let result = frames.rebuild(vec![
            Instance::new(scene.cube.clone(), Mat4::IDENTITY),
            Instance::new(scene.plane.clone(), Mat4::IDENTITY),
            Instance::new(scene.cube.clone(), Mat4::from_translation(vec3(2.0, 0.0, 0.0))),
        ]);

        assert!(matches!(result, Err(Error::OutOfMemory { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(frames.instance_count(), 2);
        for (slot, address) in addresses.into_iter().enumerate() {
            let frame = frames.frame(slot).unwrap();
            assert_eq!(frame.tlas().device_address(), address);
            assert_eq!(frame.tlas().instances().len(), 2);
            assert!(frame.descriptor_table().points_at(frame.tlas()));
        }

        scene.headless.set_memory_budget(None);
        frames.verify().unwrap();
        frames.set_transform(1, Mat4::IDENTITY).unwrap();
        frames.render(&camera()).unwrap();
        frames.render(&camera()).unwrap();
    }
}
