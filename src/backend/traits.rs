//! Core device abstraction
//!
//! `RenderDevice` is the interface the orchestration layer records and
//! submits through. The Vulkan backend implements it on top of ash, and
//! the recording backend implements it in host memory for tests.

use crate::backend::types::*;
use thiserror::Error;

/// Device error type
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Failed to initialize device: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create image: {0}")]
    ImageCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Descriptor operation failed: {0}")]
    DescriptorFailed(String),
    #[error("Command recording failed: {0}")]
    RecordingFailed(String),
    #[error("Submission failed: {0}")]
    SubmitFailed(String),
    #[error("Buffer {0:?} is not host visible")]
    NotHostVisible(BufferHandle),
    #[error("Unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },
    #[error("Surface lost")]
    SurfaceLost,
    #[error("Device lost")]
    DeviceLost,
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub(crate) u64);

/// Handle to an image view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageViewHandle(pub(crate) u64);

/// Handle to a sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub(crate) u64);

/// Handle to a pool tables are allocated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingPoolHandle(pub(crate) u64);

/// Handle to a table layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableLayoutHandle(pub(crate) u64);

/// Handle to an allocated binding table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableHandle(pub(crate) u64);

/// Handle to a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassHandle(pub(crate) u64);

/// Handle to a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferHandle(pub(crate) u64);

/// Handle to a graphics pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineHandle(pub(crate) u64);

/// Handle to a compute pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputePipelineHandle(pub(crate) u64);

/// Handle to a command stream being recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandStream(pub(crate) u64);

/// Handle to a submitted command stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubmissionId(pub(crate) u64);

/// Device interface consumed by the orchestration layer
///
/// Handles are never reused: a recreated object always receives a new
/// identity.
pub trait RenderDevice {
    // === Binding tables ===

    /// Create a pool with the given per-kind descriptor counts.
    fn create_binding_pool(
        &mut self,
        sizes: &[(DescriptorKind, u32)],
        max_tables: u32,
    ) -> DeviceResult<BindingPoolHandle>;

    /// Invalidate every table allocated from `pool`.
    fn reset_binding_pool(&mut self, pool: BindingPoolHandle) -> DeviceResult<()>;

    fn destroy_binding_pool(&mut self, pool: BindingPoolHandle);

    fn create_table_layout(&mut self, entries: &[TableLayoutEntry])
        -> DeviceResult<TableLayoutHandle>;

    fn destroy_table_layout(&mut self, layout: TableLayoutHandle);

    fn allocate_table(
        &mut self,
        pool: BindingPoolHandle,
        layout: TableLayoutHandle,
    ) -> DeviceResult<TableHandle>;

    /// Apply all writes in a single bulk update.
    fn update_tables(&mut self, writes: &[TableWrite]) -> DeviceResult<()>;

    // === Buffers ===

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> DeviceResult<BufferHandle>;

    /// Map a host-visible buffer. The mapping must be released with
    /// `unmap_buffer` before the caller returns.
    fn map_buffer(&mut self, buffer: BufferHandle) -> DeviceResult<&mut [u8]>;

    fn unmap_buffer(&mut self, buffer: BufferHandle);

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    // === Images ===

    fn create_image(&mut self, desc: &ImageDescriptor) -> DeviceResult<ImageHandle>;

    fn create_image_view(
        &mut self,
        image: ImageHandle,
        kind: ImageViewKind,
    ) -> DeviceResult<ImageViewHandle>;

    fn destroy_image_view(&mut self, view: ImageViewHandle);

    fn destroy_image(&mut self, image: ImageHandle);

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> DeviceResult<SamplerHandle>;

    fn destroy_sampler(&mut self, sampler: SamplerHandle);

    // === Passes ===

    fn create_render_pass(&mut self, desc: &RenderPassDescriptor)
        -> DeviceResult<RenderPassHandle>;

    fn destroy_render_pass(&mut self, pass: RenderPassHandle);

    fn create_framebuffer(
        &mut self,
        pass: RenderPassHandle,
        attachments: &[ImageViewHandle],
        extent: Extent2D,
    ) -> DeviceResult<FramebufferHandle>;

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);

    // === Pipelines ===

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDescriptor,
    ) -> DeviceResult<GraphicsPipelineHandle>;

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> DeviceResult<ComputePipelineHandle>;

    fn destroy_graphics_pipeline(&mut self, pipeline: GraphicsPipelineHandle);

    fn destroy_compute_pipeline(&mut self, pipeline: ComputePipelineHandle);

    // === Submission ===

    /// Allocate a primary command stream, optionally already in the recording state.
    fn create_command_stream(&mut self, begin_immediately: bool) -> DeviceResult<CommandStream>;

    fn begin_command_stream(&mut self, stream: CommandStream) -> DeviceResult<()>;

    /// Release a stream without submitting it, whatever it has recorded.
    fn discard_command_stream(&mut self, stream: CommandStream);

    /// End and submit a stream. With `wait` set, returns only once the GPU
    /// has finished it and the stream has been released.
    fn submit(&mut self, stream: CommandStream, wait: bool) -> DeviceResult<SubmissionId>;

    fn is_submission_complete(&mut self, submission: SubmissionId) -> DeviceResult<bool>;

    /// Block until `submission` completes and release its stream.
    fn wait_submission(&mut self, submission: SubmissionId) -> DeviceResult<()>;

    fn wait_idle(&mut self) -> DeviceResult<()>;

    // === Recording ===

    fn cmd_bind_pipeline(&mut self, stream: CommandStream, pipeline: PipelineRef)
        -> DeviceResult<()>;

    fn cmd_bind_table(
        &mut self,
        stream: CommandStream,
        pipeline: PipelineRef,
        set: u32,
        table: TableHandle,
    ) -> DeviceResult<()>;

    fn cmd_push_constants(
        &mut self,
        stream: CommandStream,
        pipeline: PipelineRef,
        stages: ShaderStages,
        offset: u32,
        data: &[u8],
    ) -> DeviceResult<()>;

    fn cmd_dispatch(&mut self, stream: CommandStream, x: u32, y: u32, z: u32)
        -> DeviceResult<()>;

    /// Make compute shader writes visible to later fragment shader reads.
    fn cmd_compute_to_graphics_barrier(&mut self, stream: CommandStream) -> DeviceResult<()>;

    fn cmd_begin_pass(
        &mut self,
        stream: CommandStream,
        pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2D,
        clear_values: &[ClearValue],
    ) -> DeviceResult<()>;

    fn cmd_set_viewport(&mut self, stream: CommandStream, viewport: &Viewport)
        -> DeviceResult<()>;

    fn cmd_set_scissor(&mut self, stream: CommandStream, extent: Extent2D) -> DeviceResult<()>;

    fn cmd_clear_attachments(
        &mut self,
        stream: CommandStream,
        attachments: &[ClearAttachment],
        rect: &ClearRect,
    ) -> DeviceResult<()>;

    fn cmd_draw(
        &mut self,
        stream: CommandStream,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> DeviceResult<()>;

    fn cmd_bind_vertex_buffer(
        &mut self,
        stream: CommandStream,
        buffer: BufferHandle,
        offset: u64,
    ) -> DeviceResult<()>;

    fn cmd_bind_index_buffer(
        &mut self,
        stream: CommandStream,
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    ) -> DeviceResult<()>;

    fn cmd_draw_indexed(
        &mut self,
        stream: CommandStream,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> DeviceResult<()>;

    fn cmd_end_pass(&mut self, stream: CommandStream) -> DeviceResult<()>;
}
