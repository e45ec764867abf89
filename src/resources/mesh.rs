//! Procedural meshes and their GPU buffers

use glam::{Vec2, Vec3, Vec4};

use crate::backend::{BufferHandle, BufferUsage, RenderDevice, Vertex};
use crate::binding::{BindingPool, WriteBatch};
use crate::error::FrameResult;
use crate::pipeline::ShaderProgram;
use crate::resources::material::{GpuMaterial, Material};
use crate::resources::create_buffer_with_data;

/// CPU-side vertex and index data of one mesh part
#[derive(Debug, Clone)]
pub struct MeshData {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            vertices: Vec::new(),
            indices: Vec::new(),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    /// Move every vertex by `offset`
    pub fn translated(mut self, offset: Vec3) -> Self {
        for vertex in &mut self.vertices {
            vertex.position += offset;
        }
        self
    }

    /// Unit cube centered at the origin, four vertices per face
    pub fn cube() -> Self {
        let mut mesh = Self::new("cube");
        let faces = [
            (Vec3::Z, Vec3::Y),
            (Vec3::NEG_Z, Vec3::Y),
            (Vec3::X, Vec3::Y),
            (Vec3::NEG_X, Vec3::Y),
            (Vec3::Y, Vec3::NEG_Z),
            (Vec3::NEG_Y, Vec3::Z),
        ];

        for (normal, up) in faces {
            let right = up.cross(normal);
            let base = mesh.vertices.len() as u32;
            let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
            for (u, v) in corners {
                mesh.vertices.push(Vertex {
                    position: (normal + right * u + up * v) * 0.5,
                    normal,
                    uv: Vec2::new((u + 1.0) * 0.5, (1.0 - v) * 0.5),
                    tangent: right.extend(1.0),
                });
            }
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        mesh
    }

    /// UV sphere of radius 0.5
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let mut mesh = Self::new("sphere");
        let segments = segments.max(3);
        let rings = rings.max(2);

        for ring in 0..=rings {
            let v = ring as f32 / rings as f32;
            let phi = v * std::f32::consts::PI;
            for segment in 0..=segments {
                let u = segment as f32 / segments as f32;
                let theta = u * std::f32::consts::TAU;
                let normal = Vec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
                mesh.vertices.push(Vertex {
                    position: normal * 0.5,
                    normal,
                    uv: Vec2::new(u, v),
                    tangent: Vec4::new(-theta.sin(), 0.0, theta.cos(), 1.0),
                });
            }
        }

        let stride = segments + 1;
        for ring in 0..rings {
            for segment in 0..segments {
                let a = ring * stride + segment;
                let b = a + stride;
                mesh.indices
                    .extend_from_slice(&[a, b, a + 1, a + 1, b, b + 1]);
            }
        }

        mesh
    }

    /// Plane in XZ facing +Y
    pub fn plane(width: f32, depth: f32, subdivisions: u32) -> Self {
        let mut mesh = Self::new("plane");
        let cells = subdivisions.max(1);

        for row in 0..=cells {
            let v = row as f32 / cells as f32;
            for column in 0..=cells {
                let u = column as f32 / cells as f32;
                mesh.vertices.push(Vertex {
                    position: Vec3::new((u - 0.5) * width, 0.0, (v - 0.5) * depth),
                    normal: Vec3::Y,
                    uv: Vec2::new(u, v),
                    tangent: Vec4::new(1.0, 0.0, 0.0, 1.0),
                });
            }
        }

        let stride = cells + 1;
        for row in 0..cells {
            for column in 0..cells {
                let a = row * stride + column;
                let b = a + stride;
                mesh.indices
                    .extend_from_slice(&[a, b, a + 1, a + 1, b, b + 1]);
            }
        }

        mesh
    }
}

/// A contiguous index range of a shared mesh buffer drawn with one material
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubMesh {
    pub index_count: u32,
    pub index_offset: u32,
    pub vertex_offset: i32,
    pub material_index: u32,
}

/// Concatenates mesh parts into one vertex/index pair
#[derive(Debug, Default)]
pub struct MeshBuilder {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    sub_meshes: Vec<SubMesh>,
}

impl MeshBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `part`, keeping its indices local to its own vertices.
    pub fn append(mut self, part: &MeshData, material_index: u32) -> Self {
        self.sub_meshes.push(SubMesh {
            index_count: part.indices.len() as u32,
            index_offset: self.indices.len() as u32,
            vertex_offset: self.vertices.len() as i32,
            material_index,
        });
        self.vertices.extend_from_slice(&part.vertices);
        self.indices.extend_from_slice(&part.indices);
        self
    }

    pub fn sub_meshes(&self) -> &[SubMesh] {
        &self.sub_meshes
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }
}

/// What the pass sequencer needs from a drawable mesh
pub trait MeshSource {
    fn vertex_buffer(&self) -> BufferHandle;

    /// Index buffer of `u32` indices
    fn index_buffer(&self) -> BufferHandle;

    /// Sub-meshes in storage order
    fn sub_meshes(&self) -> &[SubMesh];

    fn materials(&self) -> &[GpuMaterial];
}

/// A mesh uploaded into a single vertex and index buffer
pub struct GpuMesh {
    vertex_buffer: BufferHandle,
    index_buffer: BufferHandle,
    sub_meshes: Vec<SubMesh>,
    materials: Vec<GpuMaterial>,
}

impl GpuMesh {
    /// Upload the builder's geometry and create one table per material.
    ///
    /// Material tables are allocated from `pool` for `program`'s material
    /// set and written in a single bulk update.
    pub fn upload<D: RenderDevice>(
        device: &mut D,
        pool: &mut BindingPool,
        program: &ShaderProgram,
        builder: MeshBuilder,
        materials: &[Material],
    ) -> FrameResult<Self> {
        let vertex_buffer = create_buffer_with_data(
            device,
            "Mesh Vertices",
            BufferUsage::VERTEX,
            bytemuck::cast_slice(&builder.vertices),
        )?;
        let index_buffer = create_buffer_with_data(
            device,
            "Mesh Indices",
            BufferUsage::INDEX,
            bytemuck::cast_slice(&builder.indices),
        )?;

        let mut batch = WriteBatch::new();
        let mut gpu_materials = Vec::with_capacity(materials.len());
        for material in materials {
            gpu_materials.push(GpuMaterial::new(device, pool, program, material, &mut batch)?);
        }
        batch.apply(device)?;

        log::debug!(
            "Uploaded mesh: {} vertices, {} indices, {} sub-meshes, {} materials",
            builder.vertices.len(),
            builder.indices.len(),
            builder.sub_meshes.len(),
            gpu_materials.len()
        );

        Ok(Self {
            vertex_buffer,
            index_buffer,
            sub_meshes: builder.sub_meshes,
            materials: gpu_materials,
        })
    }

    pub fn destroy<D: RenderDevice>(self, device: &mut D) {
        for material in self.materials {
            material.destroy(device);
        }
        device.destroy_buffer(self.index_buffer);
        device.destroy_buffer(self.vertex_buffer);
    }
}

impl MeshSource for GpuMesh {
    fn vertex_buffer(&self) -> BufferHandle {
        self.vertex_buffer
    }

    fn index_buffer(&self) -> BufferHandle {
        self.index_buffer
    }

    fn sub_meshes(&self) -> &[SubMesh] {
        &self.sub_meshes
    }

    fn materials(&self) -> &[GpuMaterial] {
        &self.materials
    }
}
