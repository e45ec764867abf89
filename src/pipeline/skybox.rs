//! Full-screen sky pass sampling the atmosphere cube

use crate::backend::{
    CompareFunction, DepthState, GraphicsPipelineHandle, PipelineRef, RenderDevice,
    RenderPassHandle,
};
use crate::error::FrameResult;
use crate::pipeline::program::ShaderProgram;
use crate::pipeline::create_graphics_pipeline;

/// Vertices of the procedural full-screen triangle
pub const FULLSCREEN_TRIANGLE_VERTICES: u32 = 3;

/// Sky pipeline: no vertex input, depth tested but never written
pub struct SkyboxPipeline {
    program: ShaderProgram,
    pipeline: GraphicsPipelineHandle,
}

impl SkyboxPipeline {
    pub fn new<D: RenderDevice>(device: &mut D, render_pass: RenderPassHandle) -> FrameResult<Self> {
        let program = ShaderProgram::from_wgsl(device, "skybox", SKYBOX_SHADER)?;
        let pipeline = create_graphics_pipeline(
            device,
            &program,
            render_pass,
            None,
            DepthState {
                test: true,
                write: false,
                compare: CompareFunction::LessEqual,
            },
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

pub const SKYBOX_SHADER: &str = r#"
struct Camera {
    view_projection: mat4x4<f32>,
    inverse_view_projection: mat4x4<f32>,
    position: vec3<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) ndc: vec2<f32>,
}

@group(0) @binding(0) var<uniform> camera: Camera;
@group(0) @binding(1) var environment: texture_cube<f32>;
@group(0) @binding(2) var environment_sampler: sampler;

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOutput {
    let corner = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    let ndc = corner * 2.0 - 1.0;
    var output: VertexOutput;
    output.clip_position = vec4<f32>(ndc, 1.0, 1.0);
    output.ndc = ndc;
    return output;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let far = camera.inverse_view_projection * vec4<f32>(input.ndc, 1.0, 1.0);
    let near = camera.inverse_view_projection * vec4<f32>(input.ndc, 0.0, 1.0);
    let direction = normalize(far.xyz / far.w - near.xyz / near.w);
    return textureSample(environment, environment_sampler, direction);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DescriptorKind, RecordingDevice, RenderPassDescriptor, ImageFormat};

    #[test]
    fn test_skybox_interface() {
        let mut device = RecordingDevice::new();
        let pass = device
            .create_render_pass(&RenderPassDescriptor {
                label: None,
                color_formats: vec![ImageFormat::Rgba16Float],
                depth_format: Some(ImageFormat::Depth24PlusStencil8),
                clear_on_load: true,
            })
            .unwrap();
        let skybox = SkyboxPipeline::new(&mut device, pass).unwrap();
        let program = skybox.program();

        assert_eq!(program.find_slot("camera").unwrap().kind, DescriptorKind::UniformBuffer);
        assert_eq!(program.find_slot("environment").unwrap().kind, DescriptorKind::SampledImage);
        assert_eq!(
            program.find_slot("environment_sampler").unwrap().binding,
            2
        );
        assert!(program.push_constants().is_none());
        assert_eq!(program.slot_layouts().len(), 1);
    }
}
