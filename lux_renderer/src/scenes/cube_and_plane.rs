use super::ShaderSource;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{vec3, Mat4, Vec3};
use gpu_allocator::MemoryLocation;
use lux_gpu::{
    commands::CommandList,
    device::Device,
    frames::{CameraConstants, RecordWriter},
    ray_tracing::{
        BindingLayout, BindingSlot, BottomLevelAccelerationStructure, BottomLevelBuilder,
        DescriptorKind, DescriptorRange, DescriptorTable, DescriptorTableLayout, GeometryRef,
        Instance, PipelineBinder, RayTracingPipeline, RootArgument, ShaderBindingTableBuilder,
        ShaderStage,
    },
    storage::Buffer,
    PipelineConfig, Result,
};
use std::{mem, sync::Arc};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub colour: [f32; 4],
}

impl Vertex {
    const fn new(position: [f32; 3], colour: [f32; 4]) -> Self {
        Self { position, colour }
    }
}

const CUBE_COLOUR: [f32; 4] = [1.0, 0.0, 0.5, 1.0];
const PLANE_COLOUR: [f32; 4] = [0.0, 0.8, 0.9, 1.0];

#[rustfmt::skip]
const CUBE_TRIANGLES: [[f32; 3]; 36] = [
    // -x
    [-0.5, -0.5, -0.5], [-0.5, -0.5, 0.5], [-0.5, 0.5, 0.5],
    [-0.5, -0.5, -0.5], [-0.5, 0.5, 0.5], [-0.5, 0.5, -0.5],
    // +x
    [0.5, -0.5, -0.5], [0.5, 0.5, -0.5], [0.5, 0.5, 0.5],
    [0.5, -0.5, -0.5], [0.5, 0.5, 0.5], [0.5, -0.5, 0.5],
    // -y
    [-0.5, -0.5, -0.5], [0.5, -0.5, -0.5], [0.5, -0.5, 0.5],
    [-0.5, -0.5, -0.5], [0.5, -0.5, 0.5], [-0.5, -0.5, 0.5],
    // +y
    [-0.5, 0.5, -0.5], [-0.5, 0.5, 0.5], [0.5, 0.5, 0.5],
    [-0.5, 0.5, -0.5], [0.5, 0.5, 0.5], [0.5, 0.5, -0.5],
    // -z
    [-0.5, -0.5, -0.5], [-0.5, 0.5, -0.5], [0.5, 0.5, -0.5],
    [-0.5, -0.5, -0.5], [0.5, 0.5, -0.5], [0.5, -0.5, -0.5],
    // +z
    [-0.5, -0.5, 0.5], [0.5, -0.5, 0.5], [0.5, 0.5, 0.5],
    [-0.5, -0.5, 0.5], [0.5, 0.5, 0.5], [-0.5, 0.5, 0.5],
];

#[rustfmt::skip]
const PLANE_TRIANGLES: [[f32; 3]; 6] = [
    [-1.5, -0.8, -1.5], [1.5, -0.8, -1.5], [1.5, -0.8, 1.5],
    [-1.5, -0.8, -1.5], [1.5, -0.8, 1.5], [-1.5, -0.8, 1.5],
];

/// A pink cube floating over a blue plane, lit with shadow rays.
pub struct CubeAndPlane {
    cube: Arc<BottomLevelAccelerationStructure>,
    plane: Arc<BottomLevelAccelerationStructure>,
}

impl CubeAndPlane {
    pub const EYE: Vec3 = Vec3::new(1.5, 1.5, 1.5);

    pub fn new(device: &Arc<dyn Device>) -> Result<CubeAndPlane> {
        let cube = mesh(device, "cube", CUBE_COLOUR, &CUBE_TRIANGLES)?;
        let plane = mesh(device, "plane", PLANE_COLOUR, &PLANE_TRIANGLES)?;

        let mut structures = vec![];
        CommandList::now(device, "build meshes", |cmd| {
            structures = BottomLevelBuilder::new(device)
                .build_all(&[("cube", cube), ("plane", plane)], cmd)?;
            Ok(())
        })?;
        log::info!(
            "Built {} and {}",
            structures[0].name(),
            structures[1].name()
        );

        let plane = structures.remove(1);
        let cube = structures.remove(0);

        Ok(CubeAndPlane { cube, plane })
    }

    pub fn cube(&self) -> &Arc<BottomLevelAccelerationStructure> {
        &self.cube
    }

    pub fn plane(&self) -> &Arc<BottomLevelAccelerationStructure> {
        &self.plane
    }

    /// The cube first, so its hit groups start at offset 0 and the plane's
    /// at 2.
    pub fn instances(&self) -> Vec<Instance> {
        vec![
            Instance::new(self.cube.clone(), Mat4::IDENTITY),
            Instance::new(self.plane.clone(), Mat4::IDENTITY),
        ]
    }

    /// Slow spin with a gentle bob, `time` in frames.
    pub fn cube_transform(time: f32) -> Mat4 {
        Mat4::from_rotation_y(time / 50.0)
            * Mat4::from_translation(vec3(0.0, 0.1 * (time / 20.0).cos(), 0.0))
    }

    pub fn camera(aspect_ratio: f32) -> CameraConstants {
        CameraConstants::look_at(Self::EYE, Vec3::ZERO, aspect_ratio)
    }

    pub fn pipeline(
        device: &Arc<dyn Device>,
        shaders: &ShaderSource,
        config: PipelineConfig,
    ) -> Result<RayTracingPipeline> {
        let ray_generation = Arc::new(BindingLayout::new(
            "ray generation",
            vec![BindingSlot::DescriptorTable(vec![
                DescriptorRange::new(DescriptorKind::StorageImage, 0, 1),
                DescriptorRange::new(DescriptorKind::AccelerationStructure, 1, 1),
                DescriptorRange::new(DescriptorKind::UniformBuffer, 2, 1),
            ])],
        ));
        // The plane traces shadow rays against the scene
        let plane = Arc::new(BindingLayout::new(
            "plane hit",
            vec![BindingSlot::DescriptorTable(vec![DescriptorRange::new(
                DescriptorKind::AccelerationStructure,
                DescriptorTableLayout::SCENE,
                1,
            )])],
        ));
        let empty = Arc::new(BindingLayout::empty("empty"));

        let mut binder = PipelineBinder::new(
            device,
            "cube and plane",
            config,
            Arc::new(DescriptorTableLayout::ray_generation()),
        );
        binder
            .declare_library(shaders.library("raygen", &[("RayGen", ShaderStage::RayGeneration)])?)
            .declare_library(shaders.library("miss", &[("Miss", ShaderStage::Miss)])?)
            .declare_library(shaders.library(
                "hit",
                &[
                    ("CubeClosestHit", ShaderStage::ClosestHit),
                    ("PlaneClosestHit", ShaderStage::ClosestHit),
                ],
            )?)
            .declare_library(shaders.library(
                "shadow",
                &[
                    ("ShadowClosestHit", ShaderStage::ClosestHit),
                    ("ShadowMiss", ShaderStage::Miss),
                ],
            )?)
            .declare_hit_group("CubeHitGroup", "CubeClosestHit")
            .declare_hit_group("PlaneHitGroup", "PlaneClosestHit")
            .declare_hit_group("ShadowHitGroup", "ShadowClosestHit")
            .declare_binding_layout(&["RayGen"], ray_generation)
            .declare_binding_layout(&["PlaneHitGroup"], plane)
            .declare_binding_layout(
                &["Miss", "ShadowMiss", "CubeHitGroup", "ShadowHitGroup"],
                empty,
            );

        binder.finalize()
    }

    /// One ray generation record, primary and shadow misses, then a
    /// primary and shadow hit group per instance.
    pub fn records() -> RecordWriter {
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
}

fn mesh(
    device: &Arc<dyn Device>,
    name: &str,
    colour: [f32; 4],
    positions: &[[f32; 3]],
) -> Result<Vec<GeometryRef>> {
    let vertices: Vec<Vertex> = positions
        .iter()
        .map(|position| Vertex::new(*position, colour))
        .collect();

    let buffer = Buffer::new_from_data(
        device,
        format!("{} vertices", name),
        &vertices,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::STORAGE_BUFFER,
        MemoryLocation::GpuOnly,
    )?;

    Ok(vec![GeometryRef::triangles(
        Arc::new(buffer),
        vertices.len() as u32,
        mem::size_of::<Vertex>() as u64,
    )])
}

#[cfg(test)]
mod tests {
    use super::*;
    use lux_gpu::{
        device::HeadlessDevice,
        ray_tracing::{ProgramKind, Section},
    };

    #[test]
    fn test_vertex_layout() {
        assert_eq!(mem::size_of::<Vertex>(), 28);
    }

    #[test]
    fn test_scene_builds_on_headless() {
        let device: Arc<dyn Device> = HeadlessDevice::new();
        let scene = CubeAndPlane::new(&device).unwrap();

        assert_eq!(scene.cube().triangle_count(), 12);
        assert_eq!(scene.plane().triangle_count(), 2);

        let pipeline =
            CubeAndPlane::pipeline(&device, &ShaderSource::Placeholder, PipelineConfig::default())
                .unwrap();
        let table = DescriptorTable::allocate(
            &device,
            "descriptors",
            pipeline.descriptor_table_layout().clone(),
        )
        .unwrap();
        let mut builder = ShaderBindingTableBuilder::new(device.ray_tracing_properties());
        CubeAndPlane::records()(&mut builder, &table).unwrap();
        let sbt = builder.build(&device, "sbt", &pipeline).unwrap();

        assert_eq!(sbt.count(Section::RayGeneration), 1);
        assert_eq!(sbt.count(Section::Miss), 2);
        assert_eq!(sbt.count(Section::HitGroup), 3);

        // Every hit group the pipeline declares has a record
        for program in pipeline.programs() {
            if program.kind == ProgramKind::HitGroup {
                assert!(
                    sbt.records().iter().any(|record| record.program == program.name),
                    "{} has no record",
                    program.name
                );
            }
        }
    }

    #[test]
    fn test_cube_starts_raised() {
        let transform = CubeAndPlane::cube_transform(0.0);
        assert!((transform.w_axis.y - 0.1).abs() < 1e-6);
    }
}
