//! Shader programs, the three pass pipelines and the per-frame sequencer
//!
//! The frame renders in three passes:
//! 1. Atmosphere - compute pass writing a Preetham sky into a cube map
//! 2. Skybox - full-screen triangle sampling the cube
//! 3. Geometry - indexed mesh draws, one material table per sub-mesh

pub mod atmosphere;
pub mod geometry;
pub mod program;
pub mod sequencer;
pub mod skybox;

pub use atmosphere::{
    AtmospherePipeline, SkyCube, SkyParams, ATMOSPHERE_DISPATCH, MAX_CUBE_SIZE,
};
pub use geometry::{GeometryPipeline, MATERIAL_SET, SHARED_SET};
pub use program::{compile_wgsl, ShaderProgram};
pub use sequencer::{
    clear_values, explicit_clear_attachments, FramePasses, FrameState, PassSequencer, SyncMode,
};
pub use skybox::SkyboxPipeline;

use crate::backend::{
    CullMode, DepthState, GraphicsPipelineDescriptor, GraphicsPipelineHandle, RenderDevice,
    RenderPassHandle, ShaderStages, VertexBufferLayout,
};
use crate::error::FrameResult;

/// Create a graphics pipeline from a program with vertex and fragment entry points
pub(crate) fn create_graphics_pipeline<D: RenderDevice>(
    device: &mut D,
    program: &ShaderProgram,
    render_pass: RenderPassHandle,
    vertex_layout: Option<VertexBufferLayout>,
    depth: DepthState,
) -> FrameResult<GraphicsPipelineHandle> {
    let pipeline = device.create_graphics_pipeline(&GraphicsPipelineDescriptor {
        label: Some(format!("{} Pipeline", program.label())),
        spirv: program.spirv().to_vec(),
        vertex_entry: program.entry_point(ShaderStages::VERTEX)?.to_string(),
        fragment_entry: program.entry_point(ShaderStages::FRAGMENT)?.to_string(),
        table_layouts: program.layout_handles(),
        push_constants: program.push_constants(),
        vertex_layout,
        render_pass,
        cull_mode: CullMode::None,
        depth,
    })?;
    Ok(pipeline)
}
