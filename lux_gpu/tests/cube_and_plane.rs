use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use gpu_allocator::MemoryLocation;
use lux_gpu::{
    commands::{Command, CommandList},
    device::{Device, HeadlessDevice},
    frames::{CameraConstants, FrameOrchestrator, RecordWriter},
    ray_tracing::{
        hit_group_offsets, BindingLayout, BindingSlot, BottomLevelAccelerationStructure,
        BottomLevelBuilder, DescriptorKind, DescriptorRange, DescriptorTable,
        DescriptorTableLayout, EntryPoint, GeometryRef, Instance, PipelineBinder,
        RayTracingPipeline, RootArgument, Section, ShaderBindingTableBuilder, ShaderLibrary,
        ShaderStage, TopLevelBuilder,
    },
    storage::Buffer,
    Error, FrameConfig, LayoutViolation, Lux, PipelineConfig,
};
use std::sync::Arc;

const SPIRV: [u32; 1] = [0x0723_0203];

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    colour: [f32; 4],
}

fn cube() -> Vec<Vertex> {
    // Corner i has +0.5 on x, y and z for bits 0, 1 and 2
    const TRIANGLES: [usize; 36] = [
        0, 4, 6, 0, 6, 2, // -x
        1, 3, 7, 1, 7, 5, // +x
        0, 1, 5, 0, 5, 4, // -y
        2, 6, 7, 2, 7, 3, // +y
        0, 2, 3, 0, 3, 1, // -z
        4, 5, 7, 4, 7, 6, // +z
    ];
    let corner = |i: usize| {
        let axis = |bit: usize| if i & (1 << bit) != 0 { 0.5 } else { -0.5 };
        [axis(0), axis(1), axis(2)]
    };

    TRIANGLES
        .iter()
        .map(|&i| Vertex {
            position: corner(i),
            colour: [1.0, 0.0, 0.5, 1.0],
        })
        .collect()
}

fn plane() -> Vec<Vertex> {
    [
        [-1.5, -0.8, -1.5],
        [1.5, -0.8, -1.5],
        [1.5, -0.8, 1.5],
        [-1.5, -0.8, -1.5],
        [1.5, -0.8, 1.5],
        [-1.5, -0.8, 1.5],
    ]
    .into_iter()
    .map(|position| Vertex {
        position,
        colour: [0.0, 0.8, 0.9, 1.0],
    })
    .collect()
}

fn mesh(device: &Arc<dyn Device>, name: &str, vertices: &[Vertex]) -> Vec<GeometryRef> {
    let buffer = Buffer::new_from_data(
        device,
        name,
        vertices,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        MemoryLocation::GpuOnly,
    )
    .unwrap();

    vec![GeometryRef::triangles(
        Arc::new(buffer),
        vertices.len() as u32,
        std::mem::size_of::<Vertex>() as u64,
    )]
}

fn build_meshes(
    device: &Arc<dyn Device>,
) -> lux_gpu::Result<Vec<Arc<BottomLevelAccelerationStructure>>> {
    let requests = [
        ("cube", mesh(device, "cube vertices", &cube())),
        ("plane", mesh(device, "plane vertices", &plane())),
    ];

    let mut structures = vec![];
    CommandList::now(device, "build meshes", |cmd| {
        structures = BottomLevelBuilder::new(device).build_all(&requests, cmd)?;
        Ok(())
    })?;

    Ok(structures)
}

fn library(name: &str, entry_points: &[(&str, ShaderStage)]) -> ShaderLibrary {
    ShaderLibrary::new(
        name,
        SPIRV.to_vec(),
        entry_points
            .iter()
            .map(|(symbol, stage)| EntryPoint::new(*symbol, *stage))
            .collect(),
    )
}

fn pipeline(device: &Arc<dyn Device>) -> RayTracingPipeline {
    let ray_generation = Arc::new(BindingLayout::new(
        "ray generation",
        vec![BindingSlot::DescriptorTable(vec![
            DescriptorRange::new(DescriptorKind::StorageImage, 0, 1),
            DescriptorRange::new(DescriptorKind::AccelerationStructure, 1, 1),
            DescriptorRange::new(DescriptorKind::UniformBuffer, 2, 1),
        ])],
    ));
    let plane = Arc::new(BindingLayout::new(
        "plane",
        vec![BindingSlot::DescriptorTable(vec![DescriptorRange::new(
            DescriptorKind::AccelerationStructure,
            1,
            1,
        )])],
    ));
    let empty = Arc::new(BindingLayout::empty("empty"));

    let mut binder = PipelineBinder::new(
        device,
        "cube and plane",
        PipelineConfig::default(),
        Arc::new(DescriptorTableLayout::ray_generation()),
    );
    binder
        .declare_library(library("raygen", &[("RayGen", ShaderStage::RayGeneration)]))
        .declare_library(library("miss", &[("Miss", ShaderStage::Miss)]))
        .declare_library(library(
            "hit",
            &[
                ("CubeClosestHit", ShaderStage::ClosestHit),
                ("PlaneClosestHit", ShaderStage::ClosestHit),
            ],
        ))
        .declare_library(library(
            "shadow",
            &[
                ("ShadowClosestHit", ShaderStage::ClosestHit),
                ("ShadowMiss", ShaderStage::Miss),
            ],
        ))
        .declare_hit_group("CubeHitGroup", "CubeClosestHit")
        .declare_hit_group("PlaneHitGroup", "PlaneClosestHit")
        .declare_hit_group("ShadowHitGroup", "ShadowClosestHit")
        .declare_binding_layout(&["RayGen"], ray_generation)
        .declare_binding_layout(&["PlaneHitGroup"], plane)
        .declare_binding_layout(
            &["Miss", "ShadowMiss", "CubeHitGroup", "ShadowHitGroup"],
            empty,
        );

    binder.finalize().unwrap()
}

fn records() -> RecordWriter {
    Box::new(
        |builder: &mut ShaderBindingTableBuilder, table: &DescriptorTable| {
            builder.add_ray_generation_record(
                "RayGen",
                vec![RootArgument::DescriptorTable(table.handle())],
            )?;
            builder
                .add_miss_record("Miss", vec![])
                .add_miss_record("ShadowMiss", vec![])
                .add_hit_group_record("CubeHitGroup", vec![])
                .add_hit_group_record("ShadowHitGroup", vec![])
                .add_hit_group_record(
                    "PlaneHitGroup",
                    vec![RootArgument::DescriptorTable(table.handle())],
                );
            Ok(())
        },
    )
}

fn instances(structures: &[Arc<BottomLevelAccelerationStructure>]) -> Vec<Instance> {
    structures
        .iter()
        .map(|blas| Instance::new(blas.clone(), Mat4::IDENTITY))
        .collect()
}

fn camera() -> CameraConstants {
    CameraConstants::look_at(Vec3::splat(1.5), Vec3::ZERO, 4.0 / 3.0)
}

#[test]
fn test_scene_setup() {
    let lux = Lux::headless().unwrap();
    let device = lux.device();

    let structures = build_meshes(device).unwrap();
    assert_eq!(structures[0].triangle_count(), 12);
    assert_eq!(structures[1].triangle_count(), 2);
    for blas in &structures {
        assert_eq!(
            blas.acceleration_structure().size(),
            blas.build_sizes().acceleration_structure
        );
    }

    let mut tlas = None;
    CommandList::now(device, "build scene", |cmd| {
        tlas = Some(TopLevelBuilder::new(device, 2).build("scene", instances(&structures), cmd)?);
        Ok(())
    })
    .unwrap();
    let tlas = tlas.unwrap();
    let offsets: Vec<u32> = tlas
        .instances()
        .iter()
        .map(Instance::hit_group_offset)
        .collect();
    assert_eq!(offsets, vec![0, 2]);
    assert_eq!(offsets, hit_group_offsets(2, 2));

    let pipeline = pipeline(device);
    let mut table = DescriptorTable::allocate(
        device,
        "descriptors",
        pipeline.descriptor_table_layout().clone(),
    )
    .unwrap();
    table
        .write_acceleration_structure(DescriptorTableLayout::SCENE, &tlas)
        .unwrap();

    let mut builder = ShaderBindingTableBuilder::new(device.ray_tracing_properties());
    records()(&mut builder, &table).unwrap();
    let sbt = builder.build(device, "sbt", &pipeline).unwrap();

    assert_eq!(sbt.count(Section::RayGeneration), 1);
    assert_eq!(sbt.count(Section::Miss), 2);
    assert_eq!(sbt.count(Section::HitGroup), 3);

    // Identifier plus one root argument, padded to the record alignment
    let layout = sbt.layout();
    assert_eq!(layout.hit_group.stride, 64);
    assert_eq!(layout.miss.stride, 32);
    assert_eq!(layout.hit_group.size(), 3 * 64);
    assert_eq!(layout.miss.offset % 64, 0);
    assert_eq!(layout.hit_group.offset % 64, 0);
    sbt.verify(&pipeline).unwrap();
}

#[test]
fn test_frames_render_and_animate() {
    let headless = HeadlessDevice::new();
    let device: Arc<dyn Device> = headless.clone();
    let structures = build_meshes(&device).unwrap();

    let mut frames = FrameOrchestrator::new(
        &device,
        pipeline(&device),
        instances(&structures),
        (320, 240),
        &FrameConfig::default(),
        records(),
    )
    .unwrap();

    for frame in 0..4 {
        let time = frame as f32;
        let transform = Mat4::from_rotation_y(time / 50.0)
            * Mat4::from_translation(Vec3::new(0.0, 0.1 * (time / 20.0).cos(), 0.0));
        frames.set_transform(0, transform).unwrap();
        frames.render(&camera()).unwrap();
    }

    let traces = headless
        .submitted()
        .iter()
        .flat_map(|list| list.commands.clone())
        .filter(|command| matches!(command, Command::TraceRays { .. }))
        .count();
    assert_eq!(traces, 4);
    assert_eq!(frames.frame_index(), 4);
    frames.verify().unwrap();
}

#[test]
fn test_new_pipeline_leaves_stale_tables() {
    let lux = Lux::headless().unwrap();
    let device = lux.device();

    let first = pipeline(device);
    let table = DescriptorTable::allocate(
        device,
        "descriptors",
        first.descriptor_table_layout().clone(),
    )
    .unwrap();
    let mut builder = ShaderBindingTableBuilder::new(device.ray_tracing_properties());
    records()(&mut builder, &table).unwrap();
    let sbt = builder.build(device, "sbt", &first).unwrap();

    let second = pipeline(device);

    assert!(matches!(
        sbt.verify(&second),
        Err(Error::LayoutContract(
            LayoutViolation::StaleProgramIdentifier { .. }
        ))
    ));
    sbt.verify(&first).unwrap();
}

#[test]
fn test_allocation_failure_is_reported() {
    let device: Arc<dyn Device> = HeadlessDevice::with_memory_budget(2048);

    assert!(matches!(
        build_meshes(&device),
        Err(Error::OutOfMemory { .. })
    ));
}

#[test]
fn test_device_without_ray_tracing_is_refused() {
    let device: Arc<dyn Device> = HeadlessDevice::without_ray_tracing();

    assert!(matches!(
        Lux::from_device(device),
        Err(Error::UnsupportedDevice(_))
    ));
}
