use super::{AccelerationStructure, GeometryRef, ScratchBuffer};
use crate::{
    commands::{Barrier, BuildMode, CommandList},
    device::{AccelerationStructureType, BuildInputs, BuildSizes, Device},
    Error, Result,
};
use ash::vk;
use rayon::prelude::*;
use std::{fmt, sync::Arc};

/// A built bottom level acceleration structure. Owns its result and scratch
/// storage; instances share it through an `Arc`, so it lives as long as any
/// top level structure that references it.
pub struct BottomLevelAccelerationStructure {
    name: String,
    acceleration_structure: AccelerationStructure,
    scratch: ScratchBuffer,
    geometries: Vec<GeometryRef>,
    build_sizes: BuildSizes,
}

impl BottomLevelAccelerationStructure {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acceleration_structure(&self) -> &AccelerationStructure {
        &self.acceleration_structure
    }

    pub fn scratch(&self) -> &ScratchBuffer {
        &self.scratch
    }

    pub fn geometries(&self) -> &[GeometryRef] {
        &self.geometries
    }

    pub fn build_sizes(&self) -> BuildSizes {
        self.build_sizes
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.acceleration_structure.device_address()
    }

    pub fn triangle_count(&self) -> u32 {
        self.geometries.iter().map(GeometryRef::triangle_count).sum()
    }
}

impl fmt::Debug for BottomLevelAccelerationStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BottomLevelAccelerationStructure({}|{} triangles@{:#x})",
            self.name,
            self.triangle_count(),
            self.device_address()
        )
    }
}

pub struct BottomLevelBuilder {
    device: Arc<dyn Device>,
}

impl BottomLevelBuilder {
    pub fn new(device: &Arc<dyn Device>) -> Self {
        Self {
            device: device.clone(),
        }
    }

    /// Records the build of one structure over `geometries`, followed by a
    /// barrier so later builds can read it.
    pub fn build(
        &self,
        name: &str,
        geometries: &[GeometryRef],
        cmd: &mut CommandList,
    ) -> Result<Arc<BottomLevelAccelerationStructure>> {
        let blas = self.encode(name, geometries, cmd)?;
        cmd.barrier(Barrier::AccelerationStructureBuild);

        Ok(blas)
    }

    /// Encodes independent builds in parallel and joins them behind a single
    /// barrier. Results are in the same order as `requests`.
    pub fn build_all(
        &self,
        requests: &[(&str, Vec<GeometryRef>)],
        cmd: &mut CommandList,
    ) -> Result<Vec<Arc<BottomLevelAccelerationStructure>>> {
        let encoded: Vec<(Arc<BottomLevelAccelerationStructure>, CommandList)> = requests
            .par_iter()
            .map(|(name, geometries)| {
                let mut list = CommandList::new(format!("{} build", name));
                let blas = self.encode(name, geometries, &mut list)?;
                Ok((blas, list))
            })
            .collect::<Result<_>>()?;

        let structures = encoded
            .into_iter()
            .map(|(blas, list)| {
                cmd.append(list);
                blas
            })
            .collect();
        cmd.barrier(Barrier::AccelerationStructureBuild);

        Ok(structures)
    }

    fn encode(
        &self,
        name: &str,
        geometries: &[GeometryRef],
        cmd: &mut CommandList,
    ) -> Result<Arc<BottomLevelAccelerationStructure>> {
        if geometries.is_empty() {
            return Err(Error::EmptyGeometry(name.to_string()));
        }
        for geometry in geometries {
            geometry.validate(name)?;
        }

        let inputs = BuildInputs {
            ty: AccelerationStructureType::BottomLevel,
            geometries: geometries.iter().map(GeometryRef::build_geometry).collect(),
            allow_update: false,
        };

        let build_sizes = self.device.acceleration_structure_build_sizes(&inputs)?;
        log::debug!("{} build sizes: {:?}", name, build_sizes);

        let scratch = ScratchBuffer::new(&self.device, name, build_sizes.build_scratch)?;
        let acceleration_structure = AccelerationStructure::new(
            &self.device,
            name,
            AccelerationStructureType::BottomLevel,
            build_sizes.acceleration_structure,
        )?;

        cmd.build_acceleration_structure(
            inputs,
            BuildMode::Build,
            acceleration_structure.id(),
            scratch.device_address(),
        );

        Ok(Arc::new(BottomLevelAccelerationStructure {
            name: name.to_string(),
            acceleration_structure,
            scratch,
            geometries: geometries.to_vec(),
            build_sizes,
        }))
    }
}
