//! Shared fixtures for the integration tests.
//!
//! Everything runs against [`RecordingDevice`], so no GPU is needed.

#![allow(dead_code)]

use egui::TextureId;
use glam::{Mat4, Vec3};

use sky_viewport::backend::{DescriptorKind, RecordingDevice, ShaderStages, TableLayoutEntry};
use sky_viewport::binding::TableLayout;
use sky_viewport::egui_integration::{DisplayImage, ImageRegistry};
use sky_viewport::pipeline::SyncMode;
use sky_viewport::scene::{Camera, CameraSource};
use sky_viewport::{FrameResult, ViewerConfig};

/// Layout with one binding per entry of `kinds`, in order
pub fn layout(device: &mut RecordingDevice, set: u32, kinds: &[DescriptorKind]) -> TableLayout {
    let entries = kinds
        .iter()
        .enumerate()
        .map(|(binding, &kind)| TableLayoutEntry {
            binding: binding as u32,
            kind,
            stages: ShaderStages::VERTEX | ShaderStages::FRAGMENT,
        })
        .collect();
    TableLayout::new(device, set, entries).expect("layout creation")
}

/// Viewer configuration with a small sky cube
pub fn config(sync_mode: SyncMode) -> ViewerConfig {
    ViewerConfig {
        cube_size: 64,
        sync_mode,
        ..Default::default()
    }
}

/// Registry handing out sequential user texture ids
#[derive(Debug, Default)]
pub struct UiRegistry {
    next: u64,
    pub registered: Vec<DisplayImage>,
    pub live: Vec<TextureId>,
}

impl ImageRegistry<RecordingDevice> for UiRegistry {
    type Handle = TextureId;

    fn register_image(
        &mut self,
        _device: &mut RecordingDevice,
        image: DisplayImage,
    ) -> FrameResult<TextureId> {
        self.next += 1;
        let id = TextureId::User(self.next);
        self.registered.push(image);
        self.live.push(id);
        Ok(id)
    }

    fn unregister_image(&mut self, _device: &mut RecordingDevice, handle: TextureId) {
        self.live.retain(|&live| live != handle);
    }
}

/// Camera that remembers every resize it receives
#[derive(Debug, Clone)]
pub struct SpyCamera {
    pub camera: Camera,
    pub resizes: Vec<(u32, u32)>,
    pub updates: usize,
}

impl SpyCamera {
    pub fn new() -> Self {
        Self {
            camera: Camera::new(Vec3::new(0.0, 2.0, 6.0), Vec3::ZERO).with_orbit_speed(0.5),
            resizes: Vec::new(),
            updates: 0,
        }
    }
}

impl CameraSource for SpyCamera {
    fn update(&mut self, dt: f32) {
        self.updates += 1;
        self.camera.update(dt);
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.resizes.push((width, height));
        self.camera.resize(width, height);
    }

    fn view_projection(&self) -> Mat4 {
        self.camera.view_projection()
    }

    fn inverse_view_projection(&self) -> Mat4 {
        self.camera.inverse_view_projection()
    }

    fn position(&self) -> Vec3 {
        self.camera.position()
    }
}
