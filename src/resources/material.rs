//! Materials bound through a per-material table

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

use crate::backend::{BoundResource, BufferHandle, BufferUsage, RenderDevice};
use crate::binding::{BindingPool, BindingTable, WriteBatch};
use crate::error::FrameResult;
use crate::pipeline::{ShaderProgram, MATERIAL_SET};
use crate::resources::create_buffer_with_data;

/// Surface parameters of one material
#[derive(Debug, Clone)]
pub struct Material {
    pub name: String,
    pub base_color: Vec4,
    pub metallic: f32,
    pub roughness: f32,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            base_color: Vec4::ONE,
            metallic: 0.0,
            roughness: 0.5,
        }
    }
}

impl Material {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_base_color(mut self, color: Vec4) -> Self {
        self.base_color = color;
        self
    }

    pub fn with_metallic(mut self, metallic: f32) -> Self {
        self.metallic = metallic;
        self
    }

    pub fn with_roughness(mut self, roughness: f32) -> Self {
        self.roughness = roughness;
        self
    }

    pub fn uniform(&self) -> MaterialUniform {
        MaterialUniform {
            base_color: self.base_color,
            metallic: self.metallic,
            roughness: self.roughness,
            _padding: [0.0; 2],
        }
    }

    pub fn plastic(color: Vec3) -> Self {
        Self::new("plastic")
            .with_base_color(color.extend(1.0))
            .with_roughness(0.4)
    }

    pub fn metal(color: Vec3, roughness: f32) -> Self {
        Self::new("metal")
            .with_base_color(color.extend(1.0))
            .with_metallic(1.0)
            .with_roughness(roughness)
    }

    pub fn chrome() -> Self {
        Self::metal(Vec3::new(0.55, 0.56, 0.55), 0.05)
    }

    pub fn gold() -> Self {
        Self::metal(Vec3::new(1.0, 0.766, 0.336), 0.3)
    }
}

/// GPU layout of the `Material` uniform block
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialUniform {
    pub base_color: Vec4,
    pub metallic: f32,
    pub roughness: f32,
    pub _padding: [f32; 2],
}

/// A material's uniform buffer and the table that binds it
pub struct GpuMaterial {
    name: String,
    buffer: BufferHandle,
    table: BindingTable,
}

impl GpuMaterial {
    /// Upload `material` and queue the write of its table into `batch`.
    pub fn new<D: RenderDevice>(
        device: &mut D,
        pool: &mut BindingPool,
        program: &ShaderProgram,
        material: &Material,
        batch: &mut WriteBatch,
    ) -> FrameResult<Self> {
        let uniform = material.uniform();
        let buffer = create_buffer_with_data(
            device,
            &material.name,
            BufferUsage::UNIFORM,
            bytemuck::bytes_of(&uniform),
        )?;
        let table = program.allocate_table(device, pool, MATERIAL_SET)?;
        batch.push(program.write_for(
            "material",
            &table,
            BoundResource::UniformBuffer {
                buffer,
                offset: 0,
                range: std::mem::size_of::<MaterialUniform>() as u64,
            },
        )?);

        Ok(Self {
            name: material.name.clone(),
            buffer,
            table,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Table to bind at the material set index
    pub fn descriptor_set(&self) -> &BindingTable {
        &self.table
    }

    pub fn destroy<D: RenderDevice>(self, device: &mut D) {
        device.destroy_buffer(self.buffer);
    }
}
