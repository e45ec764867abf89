//! The viewport layer: owns every renderer object and drives one frame
//!
//! All GPU access goes through the device passed to each call, so the layer
//! works the same against the Vulkan device and the recording device.
//! A frame is `on_update` (camera, sky regeneration), `on_render` (camera
//! upload, sky + geometry passes, submit), then `draw_ui`, which sizes the
//! offscreen target to the editor window and shows it.

use egui::TextureId;
use glam::{Mat4, Vec3, Vec4};

use crate::backend::{BoundResource, RenderDevice, SubmissionId};
use crate::binding::{BindingPool, BindingTable, WriteBatch};
use crate::egui_integration::{DisplayBridge, ImageRegistry};
use crate::error::FrameResult;
use crate::pipeline::{
    AtmospherePipeline, FramePasses, GeometryPipeline, PassSequencer, SkyCube, SkyParams,
    SkyboxPipeline, SyncMode, SHARED_SET,
};
use crate::resources::{GpuMesh, Material, MeshBuilder, MeshData};
use crate::scene::{Camera, CameraSource, FrameDataUploader};
use crate::target::{OffscreenTargetManager, SubmissionRing};
use crate::ViewerConfig;

const SKY_DRAG_SPEED: f64 = 0.1;
const SKY_DRAG_RANGE: std::ops::RangeInclusive<f32> = 0.0..=10.0;

/// Sky, geometry and display state of the viewport
pub struct SkyViewLayer<C = Camera> {
    targets: OffscreenTargetManager,
    in_flight: SubmissionRing,
    sequencer: PassSequencer,
    pool: BindingPool,

    atmosphere: AtmospherePipeline,
    skybox: SkyboxPipeline,
    geometry: GeometryPipeline,
    sky_cube: SkyCube,
    atmosphere_table: BindingTable,
    /// One per camera uniform slot
    shared_tables: Vec<BindingTable>,

    uploader: FrameDataUploader,
    mesh: GpuMesh,
    camera: C,
    bridge: DisplayBridge<TextureId>,

    sky: SkyParams,
    transform: Mat4,
    explicit_clear: bool,
}

impl SkyViewLayer<Camera> {
    /// Build the layer with an orbiting camera looking at the scene origin.
    pub fn new<D: RenderDevice>(device: &mut D, config: &ViewerConfig) -> FrameResult<Self> {
        let camera = Camera::new(Vec3::new(0.0, 2.0, 6.0), Vec3::ZERO)
            .with_orbit_speed(config.orbit_speed);
        Self::with_camera(device, config, camera)
    }
}

impl<C: CameraSource> SkyViewLayer<C> {
    pub fn with_camera<D: RenderDevice>(
        device: &mut D,
        config: &ViewerConfig,
        mut camera: C,
    ) -> FrameResult<Self> {
        let targets = OffscreenTargetManager::new(device, config.target)?;
        let extent = targets.extent();
        camera.resize(extent.width, extent.height);

        // Pipelines stay compatible with every later generation of the pass
        let render_pass = targets.target().render_pass();
        let atmosphere = AtmospherePipeline::new(device)?;
        let skybox = SkyboxPipeline::new(device, render_pass)?;
        let geometry = GeometryPipeline::new(device, render_pass)?;

        let sky_cube = SkyCube::new(device, config.cube_size)?;
        let slot_count = match config.sync_mode {
            SyncMode::Blocking => 1,
            SyncMode::Ring { depth } => depth.max(1),
        };
        let uploader = FrameDataUploader::new(device, slot_count)?;

        let mut pool = BindingPool::new(device, "Renderer", config.pool)?;
        let atmosphere_set = atmosphere.program().find_slot("sky_cube")?.set;
        let atmosphere_table = atmosphere
            .program()
            .allocate_table(device, &mut pool, atmosphere_set)?;
        let shared_tables = (0..slot_count)
            .map(|_| {
                geometry
                    .program()
                    .allocate_table(device, &mut pool, SHARED_SET)
            })
            .collect::<FrameResult<Vec<_>>>()?;

        let mut writes = WriteBatch::new();
        writes.push(atmosphere.program().write_for(
            "sky_cube",
            &atmosphere_table,
            BoundResource::StorageImage {
                view: sky_cube.storage_view(),
                layout: sky_cube.layout(),
            },
        )?);
        for (slot, table) in shared_tables.iter().enumerate() {
            writes
                .push(
                    geometry
                        .program()
                        .write_for("camera", table, uploader.binding_at(slot))?,
                )
                .push(geometry.program().write_for(
                    "environment",
                    table,
                    BoundResource::SampledImage {
                        view: sky_cube.cube_view(),
                        layout: sky_cube.layout(),
                    },
                )?)
                .push(geometry.program().write_for(
                    "environment_sampler",
                    table,
                    BoundResource::Sampler(sky_cube.sampler()),
                )?);
        }
        writes.apply(device)?;

        let mesh = GpuMesh::upload(
            device,
            &mut pool,
            geometry.program(),
            scene_mesh(),
            &scene_materials(),
        )?;

        let in_flight = match config.sync_mode {
            SyncMode::Blocking => SubmissionRing::new(1),
            SyncMode::Ring { depth } => SubmissionRing::new(depth),
        };

        log::info!(
            "Sky view layer ready: {}x{} target, {} cube, {:?}",
            extent.width,
            extent.height,
            config.cube_size,
            config.sync_mode
        );

        Ok(Self {
            targets,
            in_flight,
            sequencer: PassSequencer::new(config.sync_mode),
            pool,
            atmosphere,
            skybox,
            geometry,
            sky_cube,
            atmosphere_table,
            shared_tables,
            uploader,
            mesh,
            camera,
            bridge: DisplayBridge::new(),
            sky: config.sky,
            transform: Mat4::IDENTITY,
            explicit_clear: !config.target.clear_on_load,
        })
    }

    /// Advance the camera and regenerate the sky if its parameters changed.
    ///
    /// Returns whether an atmosphere dispatch was recorded.
    pub fn on_update<D: RenderDevice>(&mut self, device: &mut D, dt: f32) -> FrameResult<bool> {
        self.camera.update(dt);

        if !self.sequencer.sky_needs_update(&self.sky) {
            return Ok(false);
        }
        // Earlier frames may still sample the cube
        if self.is_ring() {
            self.in_flight.drain(device)?;
        }
        let dispatched = self.sequencer.dispatch_atmosphere(
            device,
            &self.atmosphere,
            &self.atmosphere_table,
            self.sky,
        )?;
        if dispatched {
            log::debug!("Regenerating sky with {:?}", self.sky);
        }
        Ok(dispatched)
    }

    /// Upload the camera, record the sky and geometry passes and submit them.
    ///
    /// In ring mode this waits only for the frame that last used the camera
    /// slot being written, so up to `depth` frames overlap.
    pub fn on_render<D: RenderDevice>(&mut self, device: &mut D) -> FrameResult<SubmissionId> {
        let slot = self.uploader.advance();
        if let Some(reader) = self.uploader.reader() {
            self.in_flight.retire_until(device, reader)?;
        }
        self.uploader.refresh(device, &self.camera)?;

        let passes = FramePasses {
            skybox: &self.skybox,
            geometry: &self.geometry,
            shared_table: &self.shared_tables[slot],
        };
        self.sequencer.record_frame(
            device,
            &passes,
            &self.targets,
            &self.mesh,
            self.transform,
            self.explicit_clear,
        )?;
        let submission = self.sequencer.submit(device, &mut self.in_flight)?;
        self.uploader.set_reader(submission);
        Ok(submission)
    }

    /// Fit the offscreen target to the space the UI offers and return the
    /// handle the UI displays it with.
    ///
    /// The camera projection follows the target only when it was recreated.
    pub fn present_viewport<D, R>(
        &mut self,
        device: &mut D,
        registry: &mut R,
        width: i32,
        height: i32,
    ) -> FrameResult<TextureId>
    where
        D: RenderDevice,
        R: ImageRegistry<D, Handle = TextureId>,
    {
        if self.targets.resize(device, &mut self.in_flight, width, height)? {
            let extent = self.targets.extent();
            self.camera.resize(extent.width, extent.height);
            // Nothing is in flight after a resize, so the current slot is free
            self.uploader.refresh(device, &self.camera)?;
        }
        self.bridge
            .current_handle(device, registry, self.targets.display_image())
    }

    /// Editor window showing the viewport, and a settings window for the sky.
    pub fn draw_ui<D, R>(
        &mut self,
        ctx: &egui::Context,
        device: &mut D,
        registry: &mut R,
    ) -> FrameResult<()>
    where
        D: RenderDevice,
        R: ImageRegistry<D, Handle = TextureId>,
    {
        let mut presented = Ok(());
        egui::Window::new("Editor")
            .frame(egui::Frame::window(&ctx.style()).inner_margin(0.0))
            .show(ctx, |ui| {
                let available = ui.available_size();
                match self.present_viewport(
                    device,
                    registry,
                    available.x as i32,
                    available.y as i32,
                ) {
                    Ok(texture) => {
                        // Flipped vertically
                        let uv = egui::Rect::from_min_max(egui::pos2(0.0, 1.0), egui::pos2(1.0, 0.0));
                        ui.add(
                            egui::Image::new(egui::load::SizedTexture::new(texture, available))
                                .uv(uv),
                        );
                    }
                    Err(e) => presented = Err(e),
                }
            });

        let sky = &mut self.sky;
        egui::Window::new("Settings").show(ctx, |ui| {
            sky_drag_value(ui, "Turbidity", &mut sky.turbidity);
            sky_drag_value(ui, "Azimuth", &mut sky.azimuth);
            sky_drag_value(ui, "Inclination", &mut sky.inclination);
        });

        presented
    }

    /// Wait for the GPU and release everything the layer created.
    pub fn destroy<D, R>(mut self, device: &mut D, registry: &mut R)
    where
        D: RenderDevice,
        R: ImageRegistry<D, Handle = TextureId>,
    {
        if let Err(e) = self.in_flight.drain(device) {
            log::error!("Failed to drain in-flight submissions: {}", e);
        }
        if let Err(e) = device.wait_idle() {
            log::error!("Failed to wait for idle before destroying the layer: {}", e);
        }

        self.bridge.release(device, registry);
        self.mesh.destroy(device);
        self.uploader.destroy(device);
        self.pool.destroy(device);
        self.sky_cube.destroy(device);
        self.geometry.destroy(device);
        self.skybox.destroy(device);
        self.atmosphere.destroy(device);
        self.targets.destroy(device);
        log::info!("Sky view layer destroyed");
    }

    pub fn sky_params(&self) -> SkyParams {
        self.sky
    }

    pub fn set_sky_params(&mut self, params: SkyParams) {
        self.sky = params;
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }

    pub fn targets(&self) -> &OffscreenTargetManager {
        &self.targets
    }

    pub fn in_flight(&self) -> &SubmissionRing {
        &self.in_flight
    }

    pub fn sequencer(&self) -> &PassSequencer {
        &self.sequencer
    }

    pub fn uploader(&self) -> &FrameDataUploader {
        &self.uploader
    }

    pub fn mesh(&self) -> &GpuMesh {
        &self.mesh
    }

    /// Shared table of the current camera slot
    pub fn shared_table(&self) -> &BindingTable {
        &self.shared_tables[self.uploader.current_slot()]
    }

    pub fn shared_tables(&self) -> &[BindingTable] {
        &self.shared_tables
    }

    pub fn atmosphere_table(&self) -> &BindingTable {
        &self.atmosphere_table
    }

    pub fn sky_cube(&self) -> &SkyCube {
        &self.sky_cube
    }

    fn is_ring(&self) -> bool {
        matches!(self.sequencer.sync_mode(), SyncMode::Ring { .. })
    }

}

fn sky_drag_value(ui: &mut egui::Ui, label: &str, value: &mut f32) {
    ui.horizontal(|ui| {
        ui.label(label);
        ui.add(
            egui::DragValue::new(value)
                .speed(SKY_DRAG_SPEED)
                .clamp_range(SKY_DRAG_RANGE),
        );
    });
}

/// Ground plane, sphere and cube, one material each
fn scene_mesh() -> MeshBuilder {
    MeshBuilder::new()
        .append(&MeshData::plane(8.0, 8.0, 4), 0)
        .append(
            &MeshData::sphere(48, 24).translated(Vec3::new(-1.2, 0.5, 0.0)),
            1,
        )
        .append(&MeshData::cube().translated(Vec3::new(1.2, 0.5, 0.0)), 2)
}

fn scene_materials() -> Vec<Material> {
    vec![
        Material::new("ground")
            .with_base_color(Vec4::new(0.35, 0.35, 0.38, 1.0))
            .with_roughness(0.9),
        Material::chrome(),
        Material::gold(),
    ]
}
