//! Sky Viewport - binding tables and pass sequencing for a sky/geometry viewport
//!
//! A compute pass generates a Preetham sky into a cube map, a full-screen
//! pass draws it behind procedurally built geometry into a resizable
//! offscreen target, and egui displays that target inside an editor window.
//!
//! Two device implementations back the [`backend::RenderDevice`] trait:
//! - **Vulkan**: via ash and gpu-allocator (`vulkan-backend` feature, default)
//! - **Recording**: host-side, records every command; used by the tests
//!
//! # Layout
//! - [`binding`]: binding pools with per-kind accounting, shader slot
//!   reflection and batched table writes
//! - [`target`]: the offscreen target and in-flight submission tracking
//! - [`pipeline`]: shader programs, pipelines and the pass sequencer
//! - [`scene`] / [`resources`]: camera uniforms, meshes and materials
//! - [`egui_integration`]: handing the offscreen image to the UI
//! - [`layer`]: the per-frame orchestrator tying it all together

pub mod backend;
pub mod binding;
pub mod egui_integration;
pub mod error;
pub mod layer;
pub mod pipeline;
pub mod resources;
pub mod scene;
pub mod target;
pub mod window;

#[cfg(feature = "vulkan-backend")]
pub use backend::vulkan::VulkanDevice;
pub use backend::RecordingDevice;
#[cfg(feature = "vulkan-backend")]
pub use egui_integration::VulkanEguiIntegration;
pub use error::{FrameError, FrameResult, PoolLimit};
pub use layer::SkyViewLayer;
pub use window::Window;

use binding::PoolCapacities;
use pipeline::{SkyParams, SyncMode};
use target::OffscreenTargetSpec;

/// Configuration for the viewer and its layer
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    /// Window title
    pub title: String,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Enable vsync
    pub vsync: bool,
    /// Offscreen target formats, initial size and clear behaviour
    pub target: OffscreenTargetSpec,
    /// Edge length of the sky cube faces; the atmosphere dispatch covers up to 2048
    pub cube_size: u32,
    /// Renderer binding pool
    pub pool: PoolCapacities,
    /// Pool the UI registers displayed images from
    pub ui_pool: PoolCapacities,
    pub sync_mode: SyncMode,
    /// Swapchain clear color behind the UI
    pub clear_color: [f32; 4],
    /// Initial sky tunables
    pub sky: SkyParams,
    /// Camera orbit speed in radians per second
    pub orbit_speed: f32,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            title: "Sky Viewport".to_string(),
            width: 1600,
            height: 900,
            vsync: true,
            target: OffscreenTargetSpec::default(),
            cube_size: 2048,
            pool: PoolCapacities::default(),
            ui_pool: PoolCapacities::default(),
            sync_mode: SyncMode::Blocking,
            clear_color: [0.1, 0.1, 0.15, 1.0],
            sky: SkyParams::default(),
            orbit_speed: 0.1,
        }
    }
}
