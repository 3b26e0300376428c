use crate::{
    device::{BuildGeometry, IndexData},
    storage::Buffer,
    Error, Result,
};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Triangle geometry supplied by the caller, referenced by a bottom level
/// build. The buffers are shared so they outlive any build that reads them.
#[derive(Clone)]
pub struct GeometryRef {
    vertices: Arc<Buffer>,
    vertex_count: u32,
    vertex_stride: u64,
    vertex_format: vk::Format,
    indices: Option<Arc<Buffer>>,
    index_count: u32,
    index_type: vk::IndexType,
}

impl GeometryRef {
    /// A flat triangle list of three-float positions.
    pub fn triangles(vertices: Arc<Buffer>, vertex_count: u32, vertex_stride: u64) -> Self {
        Self {
            vertices,
            vertex_count,
            vertex_stride,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            indices: None,
            index_count: 0,
            index_type: vk::IndexType::UINT32,
        }
    }

    /// Indexed triangles with 32-bit indices. An index count of zero keeps
    /// the geometry a flat list.
    pub fn with_indices(mut self, indices: Arc<Buffer>, index_count: u32) -> Self {
        self.indices = Some(indices);
        self.index_count = index_count;
        self
    }

    pub fn with_index_type(mut self, index_type: vk::IndexType) -> Self {
        self.index_type = index_type;
        self
    }

    pub fn with_vertex_format(mut self, vertex_format: vk::Format) -> Self {
        self.vertex_format = vertex_format;
        self
    }

    pub fn vertices(&self) -> &Arc<Buffer> {
        &self.vertices
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn vertex_stride(&self) -> u64 {
        self.vertex_stride
    }

    pub fn indices(&self) -> Option<&Arc<Buffer>> {
        self.indices.as_ref().filter(|_| self.index_count > 0)
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn is_indexed(&self) -> bool {
        self.indices().is_some()
    }

    pub fn triangle_count(&self) -> u32 {
        if self.is_indexed() {
            self.index_count / 3
        } else {
            self.vertex_count / 3
        }
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        let invalid = |reason: String| Error::InvalidGeometry {
            name: name.to_string(),
            reason,
        };

        if self.vertex_count == 0 {
            return Err(invalid(format!("{} has no vertices", self.vertices.name())));
        }
        if self.vertex_stride == 0 {
            return Err(invalid(format!("{} has a zero stride", self.vertices.name())));
        }

        let vertex_bytes = self.vertex_count as u64 * self.vertex_stride;
        if vertex_bytes > self.vertices.size() {
            return Err(invalid(format!(
                "{} vertices of {} bytes overflow {:?}",
                self.vertex_count, self.vertex_stride, self.vertices
            )));
        }

        match self.indices() {
            Some(indices) => {
                if self.index_count % 3 != 0 {
                    return Err(invalid(format!(
                        "{} indices is not a whole number of triangles",
                        self.index_count
                    )));
                }

                let index_size = match self.index_type {
                    vk::IndexType::UINT16 => 2,
                    vk::IndexType::UINT32 => 4,
                    other => return Err(invalid(format!("unsupported index type {:?}", other))),
                };
                if self.index_count as u64 * index_size > indices.size() {
                    return Err(invalid(format!(
                        "{} indices overflow {:?}",
                        self.index_count, indices
                    )));
                }
            }
            None if self.vertex_count % 3 != 0 => {
                return Err(invalid(format!(
                    "{} vertices is not a whole number of triangles",
                    self.vertex_count
                )));
            }
            None => (),
        }

        for buffer in [Some(&self.vertices), self.indices()].into_iter().flatten() {
            if buffer.location() != MemoryLocation::GpuOnly {
                log::debug!(
                    "Buffer {} is used as build input but it's not in exclusive GPU memory",
                    buffer.name()
                );
            }
        }

        Ok(())
    }

    pub(crate) fn build_geometry(&self) -> BuildGeometry {
        BuildGeometry::Triangles {
            vertex_address: self.vertices.device_address(),
            vertex_count: self.vertex_count,
            vertex_stride: self.vertex_stride,
            vertex_format: self.vertex_format,
            indices: self.indices().map(|indices| IndexData {
                address: indices.device_address(),
                count: self.index_count,
                index_type: self.index_type,
            }),
        }
    }
}
