use crate::device::{AccelerationStructureType, BuildGeometry, BuildInputs};
use ash::vk;

/// Raw geometry and ranges of a build, kept alive for as long as the build
/// info that points at them.
pub struct BuildDescription {
    ty: vk::AccelerationStructureTypeKHR,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    geometries: Vec<vk::AccelerationStructureGeometryKHR>,
    ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
}

impl BuildDescription {
    pub fn new(inputs: &BuildInputs) -> BuildDescription {
        let mut flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
        if inputs.allow_update {
            flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
        }

        BuildDescription {
            ty: raw_type(inputs.ty),
            flags,
            geometries: inputs.geometries.iter().map(geometry).collect(),
            ranges: inputs
                .geometries
                .iter()
                .map(|geometry: &BuildGeometry| {
                    vk::AccelerationStructureBuildRangeInfoKHR::builder()
                        .primitive_count(geometry.primitive_count())
                        .build()
                })
                .collect(),
        }
    }

    pub fn geometry_info(&self) -> vk::AccelerationStructureBuildGeometryInfoKHRBuilder {
        vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(self.ty)
            .flags(self.flags)
            .geometries(&self.geometries)
    }

    pub fn ranges(&self) -> &[vk::AccelerationStructureBuildRangeInfoKHR] {
        &self.ranges
    }

    pub fn primitive_counts(&self) -> Vec<u32> {
        self.ranges.iter().map(|range| range.primitive_count).collect()
    }
}

pub fn raw_type(ty: AccelerationStructureType) -> vk::AccelerationStructureTypeKHR {
    match ty {
        AccelerationStructureType::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationStructureType::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

fn geometry(geometry: &BuildGeometry) -> vk::AccelerationStructureGeometryKHR {
    match geometry {
        BuildGeometry::Triangles {
            vertex_address,
            vertex_count,
            vertex_stride,
            vertex_format,
            indices,
        } => {
            let geometry_data = vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                    .vertex_format(*vertex_format)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: *vertex_address,
                    })
                    .vertex_stride(*vertex_stride)
                    .max_vertex(vertex_count.saturating_sub(1))
                    .index_type(
                        indices
                            .as_ref()
                            .map_or(vk::IndexType::NONE_KHR, |indices| indices.index_type),
                    )
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: indices.as_ref().map_or(0, |indices| indices.address),
                    })
                    .build(),
            };

            vk::AccelerationStructureGeometryKHR::builder()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .geometry(geometry_data)
                .flags(vk::GeometryFlagsKHR::OPAQUE)
                .build()
        }
        BuildGeometry::Instances { address, .. } => {
            let geometry_data = vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: *address,
                    })
                    .array_of_pointers(false)
                    .build(),
            };

            vk::AccelerationStructureGeometryKHR::builder()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .flags(vk::GeometryFlagsKHR::OPAQUE)
                .geometry(geometry_data)
                .build()
        }
    }
}
