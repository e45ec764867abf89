//! Recording device for tests and headless development.
//!
//! This backend doesn't talk to a GPU. It keeps every object in host
//! memory, records each command stream as a list of [`RecordedCommand`]s
//! and validates the calls a real driver would reject (writes to unknown
//! bindings, binds of invalidated tables, recording into a closed stream).

use std::collections::{BTreeMap, HashMap};

use super::traits::*;
use super::types::*;

/// A command captured from a stream
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BindPipeline(PipelineRef),
    BindTable {
        pipeline: PipelineRef,
        set: u32,
        table: TableHandle,
    },
    PushConstants {
        pipeline: PipelineRef,
        stages: ShaderStages,
        offset: u32,
        data: Vec<u8>,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    ComputeToGraphicsBarrier,
    BeginPass {
        pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2D,
        clear_values: Vec<ClearValue>,
    },
    SetViewport(Viewport),
    SetScissor(Extent2D),
    ClearAttachments {
        attachments: Vec<ClearAttachment>,
        rect: ClearRect,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    BindVertexBuffer {
        buffer: BufferHandle,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    EndPass,
}

/// A submitted command stream
#[derive(Debug, Clone)]
pub struct RecordedSubmission {
    pub id: SubmissionId,
    pub commands: Vec<RecordedCommand>,
    /// Whether the caller asked to block on completion
    pub waited: bool,
    pub complete: bool,
}

struct RecordedBuffer {
    usage: BufferUsage,
    data: Vec<u8>,
    mapped: bool,
}

struct RecordedPool {
    remaining: [u32; 6],
    tables_left: u32,
    tables: Vec<TableHandle>,
    initial: ([u32; 6], u32),
}

struct RecordedTable {
    layout: TableLayoutHandle,
    slots: BTreeMap<u32, BoundResource>,
}

struct RecordedStream {
    commands: Vec<RecordedCommand>,
    recording: bool,
}

/// Host-memory implementation of [`RenderDevice`]
#[derive(Default)]
pub struct RecordingDevice {
    next_id: u64,
    buffers: HashMap<u64, RecordedBuffer>,
    images: HashMap<u64, ImageDescriptor>,
    views: HashMap<u64, ImageHandle>,
    samplers: HashMap<u64, SamplerDescriptor>,
    pools: HashMap<u64, RecordedPool>,
    layouts: HashMap<u64, Vec<TableLayoutEntry>>,
    tables: HashMap<u64, RecordedTable>,
    render_passes: HashMap<u64, RenderPassDescriptor>,
    framebuffers: HashMap<u64, Extent2D>,
    graphics_pipelines: HashMap<u64, Option<String>>,
    compute_pipelines: HashMap<u64, Option<String>>,
    streams: HashMap<u64, RecordedStream>,
    submissions: Vec<RecordedSubmission>,
    update_calls: usize,
    wait_idle_calls: usize,
    discarded_streams: usize,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    fn next_id(&mut self) -> u64 {
        // Start at 1 even when built through `Default`
        self.next_id = self.next_id.max(1);
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn stream_mut(&mut self, stream: CommandStream) -> DeviceResult<&mut RecordedStream> {
        match self.streams.get_mut(&stream.0) {
            Some(state) if state.recording => Ok(state),
            Some(_) => Err(DeviceError::RecordingFailed(format!(
                "stream {} is not recording",
                stream.0
            ))),
            None => Err(DeviceError::UnknownHandle {
                kind: "command stream",
                id: stream.0,
            }),
        }
    }

    fn record(&mut self, stream: CommandStream, command: RecordedCommand) -> DeviceResult<()> {
        log::trace!("RecordingDevice: stream {} <- {:?}", stream.0, command);
        self.stream_mut(stream)?.commands.push(command);
        Ok(())
    }

    fn check_pipeline(&self, pipeline: PipelineRef) -> DeviceResult<()> {
        let known = match pipeline {
            PipelineRef::Graphics(h) => self.graphics_pipelines.contains_key(&h.0),
            PipelineRef::Compute(h) => self.compute_pipelines.contains_key(&h.0),
        };
        if known {
            Ok(())
        } else {
            Err(DeviceError::UnknownHandle {
                kind: "pipeline",
                id: match pipeline {
                    PipelineRef::Graphics(h) => h.0,
                    PipelineRef::Compute(h) => h.0,
                },
            })
        }
    }

    /// All submissions in submission order
    pub fn submissions(&self) -> &[RecordedSubmission] {
        &self.submissions
    }

    pub fn last_submission(&self) -> Option<&RecordedSubmission> {
        self.submissions.last()
    }

    /// Streams allocated and neither submitted nor discarded
    pub fn open_stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn discarded_streams(&self) -> usize {
        self.discarded_streams
    }

    /// Submissions that were made without waiting and have not completed
    pub fn pending_submissions(&self) -> usize {
        self.submissions.iter().filter(|s| !s.complete).count()
    }

    /// Mark every pending submission as finished, as a GPU eventually would
    pub fn complete_all(&mut self) {
        for submission in &mut self.submissions {
            submission.complete = true;
        }
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|b| b.data.as_slice())
    }

    pub fn is_mapped(&self, buffer: BufferHandle) -> bool {
        self.buffers.get(&buffer.0).is_some_and(|b| b.mapped)
    }

    pub fn is_image_alive(&self, image: ImageHandle) -> bool {
        self.images.contains_key(&image.0)
    }

    pub fn is_view_alive(&self, view: ImageViewHandle) -> bool {
        self.views.contains_key(&view.0)
    }

    pub fn live_image_count(&self) -> usize {
        self.images.len()
    }

    pub fn live_framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn live_render_pass_count(&self) -> usize {
        self.render_passes.len()
    }

    pub fn image_descriptor(&self, image: ImageHandle) -> Option<&ImageDescriptor> {
        self.images.get(&image.0)
    }

    pub fn framebuffer_extent(&self, framebuffer: FramebufferHandle) -> Option<Extent2D> {
        self.framebuffers.get(&framebuffer.0).copied()
    }

    /// What a table slot currently points at
    pub fn table_slot(&self, table: TableHandle, binding: u32) -> Option<BoundResource> {
        self.tables
            .get(&table.0)
            .and_then(|t| t.slots.get(&binding).copied())
    }

    pub fn is_table_valid(&self, table: TableHandle) -> bool {
        self.tables.contains_key(&table.0)
    }

    /// Number of bulk `update_tables` calls issued
    pub fn update_calls(&self) -> usize {
        self.update_calls
    }

    pub fn wait_idle_calls(&self) -> usize {
        self.wait_idle_calls
    }
}

impl RenderDevice for RecordingDevice {
    fn create_binding_pool(
        &mut self,
        sizes: &[(DescriptorKind, u32)],
        max_tables: u32,
    ) -> DeviceResult<BindingPoolHandle> {
        let mut remaining = [0u32; 6];
        for &(kind, count) in sizes {
            remaining[kind.index()] += count;
        }
        let id = self.next_id();
        log::trace!("RecordingDevice: creating binding pool {} ({:?})", id, sizes);
        self.pools.insert(
            id,
            RecordedPool {
                remaining,
                tables_left: max_tables,
                tables: Vec::new(),
                initial: (remaining, max_tables),
            },
        );
        Ok(BindingPoolHandle(id))
    }

    fn reset_binding_pool(&mut self, pool: BindingPoolHandle) -> DeviceResult<()> {
        let state = self.pools.get_mut(&pool.0).ok_or(DeviceError::UnknownHandle {
            kind: "binding pool",
            id: pool.0,
        })?;
        for table in state.tables.drain(..) {
            self.tables.remove(&table.0);
        }
        (state.remaining, state.tables_left) = state.initial;
        Ok(())
    }

    fn destroy_binding_pool(&mut self, pool: BindingPoolHandle) {
        if let Some(state) = self.pools.remove(&pool.0) {
            for table in state.tables {
                self.tables.remove(&table.0);
            }
        }
    }

    fn create_table_layout(
        &mut self,
        entries: &[TableLayoutEntry],
    ) -> DeviceResult<TableLayoutHandle> {
        let id = self.next_id();
        self.layouts.insert(id, entries.to_vec());
        Ok(TableLayoutHandle(id))
    }

    fn destroy_table_layout(&mut self, layout: TableLayoutHandle) {
        self.layouts.remove(&layout.0);
    }

    fn allocate_table(
        &mut self,
        pool: BindingPoolHandle,
        layout: TableLayoutHandle,
    ) -> DeviceResult<TableHandle> {
        let entries = self
            .layouts
            .get(&layout.0)
            .ok_or(DeviceError::UnknownHandle {
                kind: "table layout",
                id: layout.0,
            })?
            .clone();
        let id = self.next_id();
        let state = self.pools.get_mut(&pool.0).ok_or(DeviceError::UnknownHandle {
            kind: "binding pool",
            id: pool.0,
        })?;

        let mut remaining = state.remaining;
        for entry in &entries {
            let slot = &mut remaining[entry.kind.index()];
            *slot = slot.checked_sub(1).ok_or_else(|| {
                DeviceError::DescriptorFailed("out of pool memory".to_string())
            })?;
        }
        if state.tables_left == 0 {
            return Err(DeviceError::DescriptorFailed(
                "pool table limit reached".to_string(),
            ));
        }
        state.remaining = remaining;
        state.tables_left -= 1;
        state.tables.push(TableHandle(id));

        self.tables.insert(
            id,
            RecordedTable {
                layout,
                slots: BTreeMap::new(),
            },
        );
        Ok(TableHandle(id))
    }

    fn update_tables(&mut self, writes: &[TableWrite]) -> DeviceResult<()> {
        // Validate everything first so a rejected batch leaves tables untouched
        for write in writes {
            let table = self
                .tables
                .get(&write.table.0)
                .ok_or(DeviceError::UnknownHandle {
                    kind: "table",
                    id: write.table.0,
                })?;
            let entry = self
                .layouts
                .get(&table.layout.0)
                .and_then(|entries| entries.iter().find(|e| e.binding == write.binding))
                .ok_or_else(|| {
                    DeviceError::DescriptorFailed(format!(
                        "table {} has no binding {}",
                        write.table.0, write.binding
                    ))
                })?;
            if entry.kind != write.resource.kind() {
                return Err(DeviceError::DescriptorFailed(format!(
                    "binding {} expects {:?}, got {:?}",
                    write.binding,
                    entry.kind,
                    write.resource.kind()
                )));
            }
        }

        for write in writes {
            if let Some(table) = self.tables.get_mut(&write.table.0) {
                table.slots.insert(write.binding, write.resource);
            }
        }
        self.update_calls += 1;
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> DeviceResult<BufferHandle> {
        log::trace!(
            "RecordingDevice: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let id = self.next_id();
        self.buffers.insert(
            id,
            RecordedBuffer {
                usage: desc.usage,
                data: vec![0; desc.size as usize],
                mapped: false,
            },
        );
        Ok(BufferHandle(id))
    }

    fn map_buffer(&mut self, buffer: BufferHandle) -> DeviceResult<&mut [u8]> {
        let state = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(DeviceError::UnknownHandle {
                kind: "buffer",
                id: buffer.0,
            })?;
        if !state.usage.contains(BufferUsage::MAP_WRITE) {
            return Err(DeviceError::NotHostVisible(buffer));
        }
        state.mapped = true;
        Ok(state.data.as_mut_slice())
    }

    fn unmap_buffer(&mut self, buffer: BufferHandle) {
        if let Some(state) = self.buffers.get_mut(&buffer.0) {
            state.mapped = false;
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn create_image(&mut self, desc: &ImageDescriptor) -> DeviceResult<ImageHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(DeviceError::ImageCreationFailed(format!(
                "degenerate extent {}x{}",
                desc.width, desc.height
            )));
        }
        log::trace!(
            "RecordingDevice: creating image {:?} ({}x{})",
            desc.label,
            desc.width,
            desc.height
        );
        let id = self.next_id();
        self.images.insert(id, desc.clone());
        Ok(ImageHandle(id))
    }

    fn create_image_view(
        &mut self,
        image: ImageHandle,
        _kind: ImageViewKind,
    ) -> DeviceResult<ImageViewHandle> {
        if !self.images.contains_key(&image.0) {
            return Err(DeviceError::UnknownHandle {
                kind: "image",
                id: image.0,
            });
        }
        let id = self.next_id();
        self.views.insert(id, image);
        Ok(ImageViewHandle(id))
    }

    fn destroy_image_view(&mut self, view: ImageViewHandle) {
        self.views.remove(&view.0);
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        self.images.remove(&image.0);
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> DeviceResult<SamplerHandle> {
        let id = self.next_id();
        self.samplers.insert(id, desc.clone());
        Ok(SamplerHandle(id))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.0);
    }

    fn create_render_pass(
        &mut self,
        desc: &RenderPassDescriptor,
    ) -> DeviceResult<RenderPassHandle> {
        let id = self.next_id();
        self.render_passes.insert(id, desc.clone());
        Ok(RenderPassHandle(id))
    }

    fn destroy_render_pass(&mut self, pass: RenderPassHandle) {
        self.render_passes.remove(&pass.0);
    }

    fn create_framebuffer(
        &mut self,
        pass: RenderPassHandle,
        attachments: &[ImageViewHandle],
        extent: Extent2D,
    ) -> DeviceResult<FramebufferHandle> {
        let desc = self
            .render_passes
            .get(&pass.0)
            .ok_or(DeviceError::UnknownHandle {
                kind: "render pass",
                id: pass.0,
            })?;
        let expected = desc.color_formats.len() + usize::from(desc.depth_format.is_some());
        if attachments.len() != expected {
            return Err(DeviceError::ImageCreationFailed(format!(
                "framebuffer needs {} attachments, got {}",
                expected,
                attachments.len()
            )));
        }
        if let Some(view) = attachments.iter().find(|v| !self.views.contains_key(&v.0)) {
            return Err(DeviceError::UnknownHandle {
                kind: "image view",
                id: view.0,
            });
        }
        let id = self.next_id();
        self.framebuffers.insert(id, extent);
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer.0);
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDescriptor,
    ) -> DeviceResult<GraphicsPipelineHandle> {
        if !self.render_passes.contains_key(&desc.render_pass.0) {
            return Err(DeviceError::PipelineCreationFailed(
                "unknown render pass".to_string(),
            ));
        }
        let id = self.next_id();
        self.graphics_pipelines.insert(id, desc.label.clone());
        Ok(GraphicsPipelineHandle(id))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> DeviceResult<ComputePipelineHandle> {
        let id = self.next_id();
        self.compute_pipelines.insert(id, desc.label.clone());
        Ok(ComputePipelineHandle(id))
    }

    fn destroy_graphics_pipeline(&mut self, pipeline: GraphicsPipelineHandle) {
        self.graphics_pipelines.remove(&pipeline.0);
    }

    fn destroy_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        self.compute_pipelines.remove(&pipeline.0);
    }

    fn create_command_stream(&mut self, begin_immediately: bool) -> DeviceResult<CommandStream> {
        let id = self.next_id();
        self.streams.insert(
            id,
            RecordedStream {
                commands: Vec::new(),
                recording: begin_immediately,
            },
        );
        Ok(CommandStream(id))
    }

    fn begin_command_stream(&mut self, stream: CommandStream) -> DeviceResult<()> {
        let state = self
            .streams
            .get_mut(&stream.0)
            .ok_or(DeviceError::UnknownHandle {
                kind: "command stream",
                id: stream.0,
            })?;
        state.recording = true;
        Ok(())
    }

    fn discard_command_stream(&mut self, stream: CommandStream) {
        if let Some(state) = self.streams.remove(&stream.0) {
            log::trace!(
                "RecordingDevice: discarding stream {} ({} commands)",
                stream.0,
                state.commands.len()
            );
            self.discarded_streams += 1;
        }
    }

    fn submit(&mut self, stream: CommandStream, wait: bool) -> DeviceResult<SubmissionId> {
        self.stream_mut(stream)?;
        let state = self
            .streams
            .remove(&stream.0)
            .ok_or(DeviceError::UnknownHandle {
                kind: "command stream",
                id: stream.0,
            })?;
        let id = SubmissionId(self.next_id());
        log::trace!(
            "RecordingDevice: submitting stream {} ({} commands, wait: {})",
            stream.0,
            state.commands.len(),
            wait
        );
        self.submissions.push(RecordedSubmission {
            id,
            commands: state.commands,
            waited: wait,
            complete: wait,
        });
        Ok(id)
    }

    fn is_submission_complete(&mut self, submission: SubmissionId) -> DeviceResult<bool> {
        self.submissions
            .iter()
            .find(|s| s.id == submission)
            .map(|s| s.complete)
            .ok_or(DeviceError::UnknownHandle {
                kind: "submission",
                id: submission.0,
            })
    }

    fn wait_submission(&mut self, submission: SubmissionId) -> DeviceResult<()> {
        let entry = self
            .submissions
            .iter_mut()
            .find(|s| s.id == submission)
            .ok_or(DeviceError::UnknownHandle {
                kind: "submission",
                id: submission.0,
            })?;
        entry.complete = true;
        Ok(())
    }

    fn wait_idle(&mut self) -> DeviceResult<()> {
        self.wait_idle_calls += 1;
        self.complete_all();
        Ok(())
    }

    fn cmd_bind_pipeline(
        &mut self,
        stream: CommandStream,
        pipeline: PipelineRef,
    ) -> DeviceResult<()> {
        self.check_pipeline(pipeline)?;
        self.record(stream, RecordedCommand::BindPipeline(pipeline))
    }

    fn cmd_bind_table(
        &mut self,
        stream: CommandStream,
        pipeline: PipelineRef,
        set: u32,
        table: TableHandle,
    ) -> DeviceResult<()> {
        self.check_pipeline(pipeline)?;
        if !self.tables.contains_key(&table.0) {
            return Err(DeviceError::UnknownHandle {
                kind: "table",
                id: table.0,
            });
        }
        self.record(stream, RecordedCommand::BindTable { pipeline, set, table })
    }

    fn cmd_push_constants(
        &mut self,
        stream: CommandStream,
        pipeline: PipelineRef,
        stages: ShaderStages,
        offset: u32,
        data: &[u8],
    ) -> DeviceResult<()> {
        self.check_pipeline(pipeline)?;
        self.record(
            stream,
            RecordedCommand::PushConstants {
                pipeline,
                stages,
                offset,
                data: data.to_vec(),
            },
        )
    }

    fn cmd_dispatch(&mut self, stream: CommandStream, x: u32, y: u32, z: u32) -> DeviceResult<()> {
        self.record(stream, RecordedCommand::Dispatch { x, y, z })
    }

    fn cmd_compute_to_graphics_barrier(&mut self, stream: CommandStream) -> DeviceResult<()> {
        self.record(stream, RecordedCommand::ComputeToGraphicsBarrier)
    }

    fn cmd_begin_pass(
        &mut self,
        stream: CommandStream,
        pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2D,
        clear_values: &[ClearValue],
    ) -> DeviceResult<()> {
        if !self.framebuffers.contains_key(&framebuffer.0) {
            return Err(DeviceError::UnknownHandle {
                kind: "framebuffer",
                id: framebuffer.0,
            });
        }
        self.record(
            stream,
            RecordedCommand::BeginPass {
                pass,
                framebuffer,
                extent,
                clear_values: clear_values.to_vec(),
            },
        )
    }

    fn cmd_set_viewport(&mut self, stream: CommandStream, viewport: &Viewport) -> DeviceResult<()> {
        self.record(stream, RecordedCommand::SetViewport(*viewport))
    }

    fn cmd_set_scissor(&mut self, stream: CommandStream, extent: Extent2D) -> DeviceResult<()> {
        self.record(stream, RecordedCommand::SetScissor(extent))
    }

    fn cmd_clear_attachments(
        &mut self,
        stream: CommandStream,
        attachments: &[ClearAttachment],
        rect: &ClearRect,
    ) -> DeviceResult<()> {
        self.record(
            stream,
            RecordedCommand::ClearAttachments {
                attachments: attachments.to_vec(),
                rect: *rect,
            },
        )
    }

    fn cmd_draw(
        &mut self,
        stream: CommandStream,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> DeviceResult<()> {
        self.record(
            stream,
            RecordedCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            },
        )
    }

    fn cmd_bind_vertex_buffer(
        &mut self,
        stream: CommandStream,
        buffer: BufferHandle,
        offset: u64,
    ) -> DeviceResult<()> {
        self.record(stream, RecordedCommand::BindVertexBuffer { buffer, offset })
    }

    fn cmd_bind_index_buffer(
        &mut self,
        stream: CommandStream,
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    ) -> DeviceResult<()> {
        self.record(
            stream,
            RecordedCommand::BindIndexBuffer {
                buffer,
                offset,
                format,
            },
        )
    }

    fn cmd_draw_indexed(
        &mut self,
        stream: CommandStream,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> DeviceResult<()> {
        self.record(
            stream,
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            },
        )
    }

    fn cmd_end_pass(&mut self, stream: CommandStream) -> DeviceResult<()> {
        self.record(stream, RecordedCommand::EndPass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_never_reused() {
        let mut device = RecordingDevice::new();
        let desc = ImageDescriptor {
            width: 4,
            height: 4,
            ..Default::default()
        };
        let first = device.create_image(&desc).unwrap();
        device.destroy_image(first);
        let second = device.create_image(&desc).unwrap();
        assert_ne!(first, second);
        assert!(!device.is_image_alive(first));
        assert!(device.is_image_alive(second));
    }

    #[test]
    fn test_recording_into_submitted_stream_fails() {
        let mut device = RecordingDevice::new();
        let stream = device.create_command_stream(true).unwrap();
        device.cmd_dispatch(stream, 1, 1, 1).unwrap();
        device.submit(stream, true).unwrap();
        assert!(device.cmd_dispatch(stream, 1, 1, 1).is_err());
    }

    #[test]
    fn test_stream_created_without_begin_rejects_commands() {
        let mut device = RecordingDevice::new();
        let stream = device.create_command_stream(false).unwrap();
        assert!(device.cmd_dispatch(stream, 1, 1, 1).is_err());
        device.begin_command_stream(stream).unwrap();
        device.cmd_dispatch(stream, 1, 1, 1).unwrap();
    }

    #[test]
    fn test_map_requires_host_visible_buffer() {
        let mut device = RecordingDevice::new();
        let buffer = device
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 16,
                usage: BufferUsage::VERTEX,
            })
            .unwrap();
        assert!(matches!(
            device.map_buffer(buffer),
            Err(DeviceError::NotHostVisible(_))
        ));
    }

    #[test]
    fn test_update_rejects_kind_mismatch() {
        let mut device = RecordingDevice::new();
        let pool = device
            .create_binding_pool(&[(DescriptorKind::UniformBuffer, 1)], 1)
            .unwrap();
        let layout = device
            .create_table_layout(&[TableLayoutEntry {
                binding: 0,
                kind: DescriptorKind::UniformBuffer,
                stages: ShaderStages::VERTEX,
            }])
            .unwrap();
        let table = device.allocate_table(pool, layout).unwrap();
        let sampler = device.create_sampler(&SamplerDescriptor::default()).unwrap();

        let result = device.update_tables(&[TableWrite {
            table,
            binding: 0,
            resource: BoundResource::Sampler(sampler),
        }]);
        assert!(result.is_err());
        assert_eq!(device.update_calls(), 0);
        assert_eq!(device.table_slot(table, 0), None);
    }

    #[test]
    fn test_pool_reset_invalidates_tables() {
        let mut device = RecordingDevice::new();
        let pool = device
            .create_binding_pool(&[(DescriptorKind::Sampler, 1)], 1)
            .unwrap();
        let layout = device
            .create_table_layout(&[TableLayoutEntry {
                binding: 0,
                kind: DescriptorKind::Sampler,
                stages: ShaderStages::FRAGMENT,
            }])
            .unwrap();
        let table = device.allocate_table(pool, layout).unwrap();
        assert!(device.allocate_table(pool, layout).is_err());

        device.reset_binding_pool(pool).unwrap();
        assert!(!device.is_table_valid(table));
        assert!(device.allocate_table(pool, layout).is_ok());
    }
}
