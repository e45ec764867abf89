//! Indexed geometry pass lit by the atmosphere cube

use crate::backend::{
    DepthState, GraphicsPipelineHandle, PipelineRef, RenderDevice, RenderPassHandle, Vertex,
};
use crate::error::FrameResult;
use crate::pipeline::create_graphics_pipeline;
use crate::pipeline::program::ShaderProgram;

/// Set index of the shared camera/environment table
pub const SHARED_SET: u32 = 0;

/// Set index of the per-material table
pub const MATERIAL_SET: u32 = 1;

pub struct GeometryPipeline {
    program: ShaderProgram,
    pipeline: GraphicsPipelineHandle,
}

impl GeometryPipeline {
    pub fn new<D: RenderDevice>(device: &mut D, render_pass: RenderPassHandle) -> FrameResult<Self> {
        let program = ShaderProgram::from_wgsl(device, "geometry", GEOMETRY_SHADER)?;
        let pipeline = create_graphics_pipeline(
            device,
            &program,
            render_pass,
            Some(Vertex::layout()),
            DepthState::default(),
        )?;
        Ok(Self { program, pipeline })
    }

    pub fn program(&self) -> &ShaderProgram {
        &self.program
    }

    pub fn pipeline(&self) -> PipelineRef {
        PipelineRef::Graphics(self.pipeline)
    }

    pub fn destroy<D: RenderDevice>(self, device: &mut D) {
        device.destroy_graphics_pipeline(self.pipeline);
        self.program.destroy(device);
    }
}

pub const GEOMETRY_SHADER: &str = r#"
struct Camera {
    view_projection: mat4x4<f32>,
    inverse_view_projection: mat4x4<f32>,
    position: vec3<f32>,
}

struct Material {
    base_color: vec4<f32>,
    metallic: f32,
    roughness: f32,
}

struct Object {
    transform: mat4x4<f32>,
}

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) tangent: vec4<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) world_normal: vec3<f32>,
}

var<push_constant> object: Object;

@group(0) @binding(0) var<uniform> camera: Camera;
@group(0) @binding(1) var environment: texture_cube<f32>;
@group(0) @binding(2) var environment_sampler: sampler;

@group(1) @binding(0) var<uniform> material: Material;

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    let world_position = object.transform * vec4<f32>(input.position, 1.0);
    var output: VertexOutput;
    output.clip_position = camera.view_projection * world_position;
    output.world_position = world_position.xyz;
    output.world_normal = normalize((object.transform * vec4<f32>(input.normal, 0.0)).xyz);
    return output;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let normal = normalize(input.world_normal);
    let view = normalize(camera.position - input.world_position);
    let reflected = reflect(-view, normal);

    let irradiance = textureSample(environment, environment_sampler, normal).rgb;
    let radiance = textureSample(environment, environment_sampler, reflected).rgb;

    let albedo = material.base_color.rgb;
    let diffuse = albedo * irradiance * (1.0 - material.metallic);
    let specular = mix(vec3<f32>(0.04), albedo, material.metallic) * radiance * (1.0 - material.roughness);
    return vec4<f32>(diffuse + specular, material.base_color.a);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        DescriptorKind, ImageFormat, RecordingDevice, RenderPassDescriptor, ShaderStages,
    };

    #[test]
    fn test_geometry_interface() {
        let mut device = RecordingDevice::new();
        let pass = device
            .create_render_pass(&RenderPassDescriptor {
                label: None,
                color_formats: vec![ImageFormat::Rgba16Float],
                depth_format: Some(ImageFormat::Depth24PlusStencil8),
                clear_on_load: true,
            })
            .unwrap();
        let geometry = GeometryPipeline::new(&mut device, pass).unwrap();
        let program = geometry.program();

        let material = program.find_slot("material").unwrap();
        assert_eq!(material.set, MATERIAL_SET);
        assert_eq!(material.kind, DescriptorKind::UniformBuffer);
        assert_eq!(material.stages, ShaderStages::FRAGMENT);

        let camera = program.find_slot("camera").unwrap();
        assert_eq!(camera.set, SHARED_SET);
        assert_eq!(camera.stages, ShaderStages::VERTEX_FRAGMENT);

        let push = program.push_constants().unwrap();
        assert_eq!(push.size, 64);
        assert_eq!(push.stages, ShaderStages::VERTEX);
    }
}
