//! Per-frame pass sequencing
//!
//! A frame moves through `Idle -> ComputeDispatched (optional) ->
//! GeometryRecorded -> Submitted -> Idle`. All passes of a frame go into
//! one command stream; the atmosphere dispatch ends with a barrier so the
//! sky and geometry passes read the finished cube.
//!
//! A failed step abandons the frame: the partly recorded stream is discarded
//! and the sequencer is idle again, so the next frame starts clean.

use glam::Mat4;

use crate::backend::{
    ClearAspect, ClearAttachment, ClearRect, ClearValue, CommandStream, Extent2D, ImageFormat,
    IndexFormat, RenderDevice, ShaderStages, SubmissionId, Viewport,
};
use crate::binding::BindingTable;
use crate::error::{FrameError, FrameResult};
use crate::pipeline::atmosphere::{AtmospherePipeline, SkyParams, ATMOSPHERE_DISPATCH};
use crate::pipeline::geometry::{GeometryPipeline, MATERIAL_SET, SHARED_SET};
use crate::pipeline::skybox::{SkyboxPipeline, FULLSCREEN_TRIANGLE_VERTICES};
use crate::resources::MeshSource;
use crate::target::{OffscreenTargetManager, OffscreenTargetSpec, SubmissionRing};

/// Where the sequencer is within the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    ComputeDispatched,
    GeometryRecorded,
    Submitted,
}

impl FrameState {
    pub fn name(&self) -> &'static str {
        match self {
            FrameState::Idle => "Idle",
            FrameState::ComputeDispatched => "ComputeDispatched",
            FrameState::GeometryRecorded => "GeometryRecorded",
            FrameState::Submitted => "Submitted",
        }
    }
}

/// How submissions are synchronised with the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Every submission is waited on before `submit` returns
    #[default]
    Blocking,
    /// Up to `depth` submissions stay in flight, tracked by a [`SubmissionRing`]
    ///
    /// The layer keeps `depth` camera uniform slots, each with its own shared
    /// table, so the renderer pool must hold `depth` such tables.
    Ring { depth: usize },
}

/// Clear values for the offscreen pass, in attachment order
pub fn clear_values(spec: &OffscreenTargetSpec) -> Vec<ClearValue> {
    spec.clear_values()
}

/// In-pass clear of every color attachment and the depth/stencil
/// attachment when present, over the full extent of layer 0.
pub fn explicit_clear_attachments(
    color_attachments: u32,
    depth_format: Option<ImageFormat>,
    spec: &OffscreenTargetSpec,
    extent: Extent2D,
) -> (Vec<ClearAttachment>, ClearRect) {
    let mut attachments: Vec<ClearAttachment> = (0..color_attachments)
        .map(|attachment| ClearAttachment {
            aspect: ClearAspect::Color { attachment },
            value: ClearValue::Color(spec.clear_color),
        })
        .collect();

    if let Some(format) = depth_format {
        let aspect = if format.has_stencil() {
            ClearAspect::DepthStencil
        } else {
            ClearAspect::Depth
        };
        attachments.push(ClearAttachment {
            aspect,
            value: ClearValue::DepthStencil {
                depth: spec.clear_depth,
                stencil: spec.clear_stencil,
            },
        });
    }

    let rect = ClearRect {
        extent,
        base_array_layer: 0,
        layer_count: 1,
    };
    (attachments, rect)
}

/// Every sub-mesh must name a material the mesh has.
fn check_materials<M: MeshSource + ?Sized>(mesh: &M) -> FrameResult<()> {
    let available = mesh.materials().len();
    match mesh
        .sub_meshes()
        .iter()
        .enumerate()
        .find(|(_, sub_mesh)| sub_mesh.material_index as usize >= available)
    {
        Some((sub_mesh, bad)) => Err(FrameError::MissingMaterial {
            sub_mesh,
            material_index: bad.material_index,
            available,
        }),
        None => Ok(()),
    }
}

/// The pipelines and shared table the render passes draw with
pub struct FramePasses<'a> {
    pub skybox: &'a SkyboxPipeline,
    pub geometry: &'a GeometryPipeline,
    /// Camera and environment table bound at the shared set
    pub shared_table: &'a BindingTable,
}

/// Records and submits the passes of one frame
pub struct PassSequencer {
    state: FrameState,
    stream: Option<CommandStream>,
    sync_mode: SyncMode,
    /// Parameters of the last sky that was actually submitted
    last_sky: Option<SkyParams>,
    /// Parameters dispatched into the open stream
    pending_sky: Option<SkyParams>,
    recorded_epoch: u64,
}

impl PassSequencer {
    pub fn new(sync_mode: SyncMode) -> Self {
        Self {
            state: FrameState::Idle,
            stream: None,
            sync_mode,
            last_sky: None,
            pending_sky: None,
            recorded_epoch: 0,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    /// Force the next [`PassSequencer::dispatch_atmosphere`] to run.
    pub fn invalidate_sky(&mut self) {
        self.last_sky = None;
    }

    /// Whether a dispatch with `params` would regenerate the sky
    pub fn sky_needs_update(&self, params: &SkyParams) -> bool {
        self.last_sky.as_ref() != Some(params)
    }

    fn expect(&self, allowed: &[FrameState], expected: &'static str) -> FrameResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(FrameError::OutOfOrder {
                expected,
                found: self.state.name(),
            })
        }
    }

    fn transition(&mut self, next: FrameState) {
        log::debug!("Pass sequencer: {} -> {}", self.state.name(), next.name());
        self.state = next;
    }

    /// Drop the frame in progress and go back to idle.
    fn abandon<D: RenderDevice>(&mut self, device: &mut D) {
        if let Some(stream) = self.stream.take() {
            device.discard_command_stream(stream);
        }
        self.pending_sky = None;
        if self.state != FrameState::Idle {
            log::warn!("Pass sequencer: abandoning frame in {}", self.state.name());
            self.state = FrameState::Idle;
        }
    }

    fn stream<D: RenderDevice>(&mut self, device: &mut D) -> FrameResult<CommandStream> {
        match self.stream {
            Some(stream) => Ok(stream),
            None => {
                let stream = device.create_command_stream(true)?;
                self.stream = Some(stream);
                Ok(stream)
            }
        }
    }

    /// Record the atmosphere dispatch when `params` changed since the last one.
    ///
    /// Returns whether a dispatch was recorded. Only valid while idle.
    pub fn dispatch_atmosphere<D: RenderDevice>(
        &mut self,
        device: &mut D,
        atmosphere: &AtmospherePipeline,
        table: &BindingTable,
        params: SkyParams,
    ) -> FrameResult<bool> {
        self.expect(&[FrameState::Idle], "Idle")?;
        if !self.sky_needs_update(&params) {
            return Ok(false);
        }

        if let Err(e) = self.record_dispatch(device, atmosphere, table, &params) {
            self.abandon(device);
            return Err(e);
        }

        self.pending_sky = Some(params);
        self.transition(FrameState::ComputeDispatched);
        Ok(true)
    }

    fn record_dispatch<D: RenderDevice>(
        &mut self,
        device: &mut D,
        atmosphere: &AtmospherePipeline,
        table: &BindingTable,
        params: &SkyParams,
    ) -> FrameResult<()> {
        let stream = self.stream(device)?;
        let pipeline = atmosphere.pipeline();
        let [x, y, z] = ATMOSPHERE_DISPATCH;

        device.cmd_bind_pipeline(stream, pipeline)?;
        device.cmd_bind_table(stream, pipeline, table.set(), table.handle())?;
        device.cmd_push_constants(
            stream,
            pipeline,
            ShaderStages::COMPUTE,
            0,
            bytemuck::bytes_of(params),
        )?;
        device.cmd_dispatch(stream, x, y, z)?;
        device.cmd_compute_to_graphics_barrier(stream)?;
        Ok(())
    }

    /// Record the sky and geometry passes into the current offscreen target.
    ///
    /// With `explicit_clear` the attachments are cleared right after the pass
    /// begins, for passes configured to load previous contents.
    ///
    /// On error the whole frame, including a recorded dispatch, is dropped.
    pub fn record_frame<D: RenderDevice, M: MeshSource + ?Sized>(
        &mut self,
        device: &mut D,
        passes: &FramePasses<'_>,
        targets: &OffscreenTargetManager,
        mesh: &M,
        transform: Mat4,
        explicit_clear: bool,
    ) -> FrameResult<()> {
        self.expect(
            &[FrameState::Idle, FrameState::ComputeDispatched],
            "Idle or ComputeDispatched",
        )?;

        let recorded = check_materials(mesh).and_then(|()| {
            self.record_passes(device, passes, targets, mesh, transform, explicit_clear)
        });
        if let Err(e) = recorded {
            self.abandon(device);
            return Err(e);
        }

        self.recorded_epoch = targets.target().epoch();
        self.transition(FrameState::GeometryRecorded);
        Ok(())
    }

    fn record_passes<D: RenderDevice, M: MeshSource + ?Sized>(
        &mut self,
        device: &mut D,
        passes: &FramePasses<'_>,
        targets: &OffscreenTargetManager,
        mesh: &M,
        transform: Mat4,
        explicit_clear: bool,
    ) -> FrameResult<()> {
        let stream = self.stream(device)?;
        let target = targets.target();
        let spec = targets.spec();
        let extent = target.extent();

        device.cmd_begin_pass(
            stream,
            target.render_pass(),
            target.framebuffer(),
            extent,
            &clear_values(spec),
        )?;
        device.cmd_set_viewport(stream, &Viewport::from_extent(extent))?;
        device.cmd_set_scissor(stream, extent)?;

        if explicit_clear {
            let (attachments, rect) = explicit_clear_attachments(
                target.color_attachment_count(),
                spec.depth_format,
                spec,
                extent,
            );
            device.cmd_clear_attachments(stream, &attachments, &rect)?;
        }

        // Sky
        let skybox = passes.skybox.pipeline();
        device.cmd_bind_pipeline(stream, skybox)?;
        device.cmd_bind_table(stream, skybox, SHARED_SET, passes.shared_table.handle())?;
        device.cmd_draw(stream, FULLSCREEN_TRIANGLE_VERTICES, 1, 0, 0)?;

        // Geometry
        let geometry = passes.geometry.pipeline();
        let push_stages = passes
            .geometry
            .program()
            .push_constants()
            .map(|range| range.stages)
            .unwrap_or(ShaderStages::VERTEX);
        device.cmd_bind_pipeline(stream, geometry)?;
        device.cmd_bind_table(stream, geometry, SHARED_SET, passes.shared_table.handle())?;
        device.cmd_push_constants(
            stream,
            geometry,
            push_stages,
            0,
            bytemuck::bytes_of(&transform),
        )?;
        device.cmd_bind_vertex_buffer(stream, mesh.vertex_buffer(), 0)?;
        device.cmd_bind_index_buffer(stream, mesh.index_buffer(), 0, IndexFormat::Uint32)?;

        let materials = mesh.materials();
        for (index, sub_mesh) in mesh.sub_meshes().iter().enumerate() {
            let material = materials.get(sub_mesh.material_index as usize).ok_or(
                FrameError::MissingMaterial {
                    sub_mesh: index,
                    material_index: sub_mesh.material_index,
                    available: materials.len(),
                },
            )?;
            device.cmd_bind_table(
                stream,
                geometry,
                MATERIAL_SET,
                material.descriptor_set().handle(),
            )?;
            device.cmd_draw_indexed(
                stream,
                sub_mesh.index_count,
                1,
                sub_mesh.index_offset,
                sub_mesh.vertex_offset,
                0,
            )?;
        }

        device.cmd_end_pass(stream)?;
        Ok(())
    }

    /// Submit the recorded frame and return to idle.
    ///
    /// In blocking mode this waits for the GPU; in ring mode the submission
    /// is tracked in `in_flight`, tagged with the target epoch it rendered.
    pub fn submit<D: RenderDevice>(
        &mut self,
        device: &mut D,
        in_flight: &mut SubmissionRing,
    ) -> FrameResult<SubmissionId> {
        self.expect(&[FrameState::GeometryRecorded], "GeometryRecorded")?;
        let stream = self.stream.take().ok_or(FrameError::OutOfOrder {
            expected: "a recorded command stream",
            found: self.state.name(),
        })?;

        let wait = self.sync_mode == SyncMode::Blocking;
        let submission = match device.submit(stream, wait) {
            Ok(submission) => submission,
            Err(e) => {
                // The dispatch may or may not have run
                self.last_sky = None;
                self.abandon(device);
                return Err(e.into());
            }
        };
        self.transition(FrameState::Submitted);
        if let Some(params) = self.pending_sky.take() {
            self.last_sky = Some(params);
        }

        let tracked = match self.sync_mode {
            SyncMode::Blocking => Ok(()),
            SyncMode::Ring { .. } => in_flight.push(device, self.recorded_epoch, submission),
        };
        self.transition(FrameState::Idle);
        tracked.map(|()| submission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BoundResource, BufferHandle, RecordedCommand, RecordingDevice};
    use crate::binding::{BindingPool, PoolCapacities};
    use crate::pipeline::atmosphere::SkyCube;
    use crate::resources::{GpuMaterial, GpuMesh, Material, MeshBuilder, MeshData, SubMesh};

    #[test]
    fn test_explicit_clear_covers_color_and_depth_stencil() {
        let spec = OffscreenTargetSpec::default();
        let (attachments, rect) = explicit_clear_attachments(
            1,
            Some(ImageFormat::Depth24PlusStencil8),
            &spec,
            Extent2D::new(640, 480),
        );
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].aspect, ClearAspect::Color { attachment: 0 });
        assert_eq!(attachments[0].value, ClearValue::Color([0.1, 0.1, 0.1, 1.0]));
        assert_eq!(attachments[1].aspect, ClearAspect::DepthStencil);
        assert_eq!(
            rect,
            ClearRect {
                extent: Extent2D::new(640, 480),
                base_array_layer: 0,
                layer_count: 1,
            }
        );
    }

    #[test]
    fn test_explicit_clear_depth_only_and_colorless() {
        let spec = OffscreenTargetSpec::default();
        let (attachments, _) =
            explicit_clear_attachments(2, Some(ImageFormat::Depth32Float), &spec, Extent2D::new(1, 1));
        assert_eq!(attachments.len(), 3);
        assert_eq!(attachments[2].aspect, ClearAspect::Depth);

        let (attachments, _) = explicit_clear_attachments(1, None, &spec, Extent2D::new(1, 1));
        assert_eq!(attachments.len(), 1);
    }

    struct Compute {
        device: RecordingDevice,
        atmosphere: AtmospherePipeline,
        table: BindingTable,
    }

    fn compute() -> Compute {
        let mut device = RecordingDevice::new();
        let mut pool = BindingPool::new(&mut device, "test", PoolCapacities::default()).unwrap();
        let atmosphere = AtmospherePipeline::new(&mut device).unwrap();
        let cube = SkyCube::new(&mut device, 32).unwrap();
        let table = atmosphere
            .program()
            .allocate_table(&mut device, &mut pool, 0)
            .unwrap();
        let record = atmosphere
            .program()
            .write_for(
                "sky_cube",
                &table,
                BoundResource::StorageImage {
                    view: cube.storage_view(),
                    layout: cube.layout(),
                },
            )
            .unwrap();
        crate::binding::WriteBatch::new()
            .push(record)
            .apply(&mut device)
            .unwrap();
        Compute {
            device,
            atmosphere,
            table,
        }
    }

    #[test]
    fn test_dispatch_records_fixed_grid_and_barrier() {
        let mut c = compute();
        let mut sequencer = PassSequencer::new(SyncMode::Blocking);
        let params = SkyParams::default();

        assert!(sequencer
            .dispatch_atmosphere(&mut c.device, &c.atmosphere, &c.table, params)
            .unwrap());
        assert_eq!(sequencer.state(), FrameState::ComputeDispatched);

        // Nothing was submitted yet; inspect the open stream by submitting it raw
        let stream = sequencer.stream.take().unwrap();
        c.device.submit(stream, true).unwrap();
        let commands = &c.device.last_submission().unwrap().commands;
        assert_eq!(
            commands[3],
            RecordedCommand::Dispatch { x: 64, y: 64, z: 6 }
        );
        assert_eq!(commands[4], RecordedCommand::ComputeToGraphicsBarrier);
        assert!(matches!(
            &commands[2],
            RecordedCommand::PushConstants { data, stages, .. }
                if data.as_slice() == bytemuck::bytes_of(&params) && *stages == ShaderStages::COMPUTE
        ));
    }

    #[test]
    fn test_unchanged_sky_is_not_redispatched() {
        let mut c = compute();
        let mut sequencer = PassSequencer::new(SyncMode::Blocking);
        let params = SkyParams::default();
        sequencer.last_sky = Some(params);

        assert!(!sequencer
            .dispatch_atmosphere(&mut c.device, &c.atmosphere, &c.table, params)
            .unwrap());
        assert_eq!(sequencer.state(), FrameState::Idle);

        let changed = SkyParams {
            turbidity: 5.0,
            ..params
        };
        assert!(sequencer.sky_needs_update(&changed));
        sequencer.invalidate_sky();
        assert!(sequencer.sky_needs_update(&params));
    }

    #[test]
    fn test_out_of_order_transitions() {
        let mut c = compute();
        let mut sequencer = PassSequencer::new(SyncMode::Blocking);
        let mut ring = SubmissionRing::new(1);

        assert!(matches!(
            sequencer.submit(&mut c.device, &mut ring),
            Err(FrameError::OutOfOrder { expected: "GeometryRecorded", found: "Idle" })
        ));

        sequencer
            .dispatch_atmosphere(&mut c.device, &c.atmosphere, &c.table, SkyParams::default())
            .unwrap();
        assert!(matches!(
            sequencer.dispatch_atmosphere(
                &mut c.device,
                &c.atmosphere,
                &c.table,
                SkyParams::default()
            ),
            Err(FrameError::OutOfOrder { found: "ComputeDispatched", .. })
        ));
    }

    struct Scene {
        compute: Compute,
        pool: BindingPool,
        targets: OffscreenTargetManager,
        skybox: SkyboxPipeline,
        geometry: GeometryPipeline,
        shared_table: BindingTable,
        mesh: GpuMesh,
    }

    fn scene() -> Scene {
        let mut compute = compute();
        let device = &mut compute.device;
        let targets = OffscreenTargetManager::new(device, OffscreenTargetSpec::default()).unwrap();
        let render_pass = targets.target().render_pass();
        let skybox = SkyboxPipeline::new(device, render_pass).unwrap();
        let geometry = GeometryPipeline::new(device, render_pass).unwrap();
        let mut pool = BindingPool::new(device, "scene", PoolCapacities::default()).unwrap();
        let shared_table = geometry
            .program()
            .allocate_table(device, &mut pool, SHARED_SET)
            .unwrap();
        let mesh = GpuMesh::upload(
            device,
            &mut pool,
            geometry.program(),
            MeshBuilder::new().append(&MeshData::cube(), 0),
            &[Material::new("only")],
        )
        .unwrap();
        Scene {
            compute,
            pool,
            targets,
            skybox,
            geometry,
            shared_table,
            mesh,
        }
    }

    /// A mesh whose sub-meshes point somewhere else
    struct Remapped<'a> {
        mesh: &'a GpuMesh,
        sub_meshes: Vec<SubMesh>,
    }

    impl MeshSource for Remapped<'_> {
        fn vertex_buffer(&self) -> BufferHandle {
            self.mesh.vertex_buffer()
        }

        fn index_buffer(&self) -> BufferHandle {
            self.mesh.index_buffer()
        }

        fn sub_meshes(&self) -> &[SubMesh] {
            &self.sub_meshes
        }

        fn materials(&self) -> &[GpuMaterial] {
            self.mesh.materials()
        }
    }

    fn count(commands: &[RecordedCommand], pred: impl Fn(&RecordedCommand) -> bool) -> usize {
        commands.iter().filter(|c| pred(c)).count()
    }

    #[test]
    fn test_missing_material_drops_the_whole_frame() {
        let mut s = scene();
        let mut sequencer = PassSequencer::new(SyncMode::Blocking);
        let mut ring = SubmissionRing::new(1);
        let params = SkyParams::default();
        let c = &mut s.compute;

        sequencer
            .dispatch_atmosphere(&mut c.device, &c.atmosphere, &c.table, params)
            .unwrap();
        let broken = Remapped {
            mesh: &s.mesh,
            sub_meshes: s
                .mesh
                .sub_meshes()
                .iter()
                .map(|sub_mesh| SubMesh {
                    material_index: 7,
                    ..*sub_mesh
                })
                .collect(),
        };
        let passes = FramePasses {
            skybox: &s.skybox,
            geometry: &s.geometry,
            shared_table: &s.shared_table,
        };

        let err = sequencer
            .record_frame(&mut c.device, &passes, &s.targets, &broken, Mat4::IDENTITY, false)
            .unwrap_err();
        assert!(matches!(
            err,
            FrameError::MissingMaterial {
                sub_mesh: 0,
                material_index: 7,
                available: 1,
            }
        ));
        assert_eq!(sequencer.state(), FrameState::Idle);
        assert_eq!(c.device.open_stream_count(), 0);
        assert_eq!(c.device.discarded_streams(), 1);
        // The dropped dispatch never ran
        assert!(sequencer.sky_needs_update(&params));

        assert!(sequencer
            .dispatch_atmosphere(&mut c.device, &c.atmosphere, &c.table, params)
            .unwrap());
        sequencer
            .record_frame(&mut c.device, &passes, &s.targets, &s.mesh, Mat4::IDENTITY, false)
            .unwrap();
        sequencer.submit(&mut c.device, &mut ring).unwrap();
        assert!(!sequencer.sky_needs_update(&params));

        assert_eq!(c.device.submissions().len(), 1);
        let commands = &c.device.last_submission().unwrap().commands;
        assert_eq!(count(commands, |c| matches!(c, RecordedCommand::BeginPass { .. })), 1);
        assert_eq!(count(commands, |c| *c == RecordedCommand::EndPass), 1);
        assert_eq!(count(commands, |c| matches!(c, RecordedCommand::Dispatch { .. })), 1);
    }

    #[test]
    fn test_device_error_inside_pass_leaves_no_open_pass() {
        let mut s = scene();
        let mut sequencer = PassSequencer::new(SyncMode::Blocking);
        let mut ring = SubmissionRing::new(1);
        let c = &mut s.compute;

        // Invalidates the shared table, so binding it fails after the pass began
        s.pool.reset(&mut c.device).unwrap();
        let stale = FramePasses {
            skybox: &s.skybox,
            geometry: &s.geometry,
            shared_table: &s.shared_table,
        };
        assert!(matches!(
            sequencer.record_frame(&mut c.device, &stale, &s.targets, &s.mesh, Mat4::IDENTITY, false),
            Err(FrameError::DeviceOperationFailed(_))
        ));
        assert_eq!(sequencer.state(), FrameState::Idle);
        assert_eq!(c.device.open_stream_count(), 0);

        let shared_table = s
            .geometry
            .program()
            .allocate_table(&mut c.device, &mut s.pool, SHARED_SET)
            .unwrap();
        let mesh = GpuMesh::upload(
            &mut c.device,
            &mut s.pool,
            s.geometry.program(),
            MeshBuilder::new().append(&MeshData::cube(), 0),
            &[Material::new("again")],
        )
        .unwrap();
        let passes = FramePasses {
            skybox: &s.skybox,
            geometry: &s.geometry,
            shared_table: &shared_table,
        };
        sequencer
            .record_frame(&mut c.device, &passes, &s.targets, &mesh, Mat4::IDENTITY, false)
            .unwrap();
        sequencer.submit(&mut c.device, &mut ring).unwrap();

        let commands = &c.device.last_submission().unwrap().commands;
        assert!(matches!(commands.first(), Some(RecordedCommand::BeginPass { .. })));
        assert_eq!(count(commands, |c| matches!(c, RecordedCommand::BeginPass { .. })), 1);
        assert_eq!(commands.last(), Some(&RecordedCommand::EndPass));
    }
}
