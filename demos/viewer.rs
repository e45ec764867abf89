//! # Sky Viewer
//!
//! Generates a Preetham sky into a cube map, draws it behind a few
//! procedural meshes into an offscreen target and shows that target in an
//! egui "Editor" window. The "Settings" window edits the sky.
//!
//! ```text
//! cargo run --example viewer -- --ring-depth 2 --turbidity 4
//! ```

use std::time::Instant;

use clap::Parser;
use sky_viewport::backend::DeviceError;
use sky_viewport::pipeline::{SkyParams, SyncMode};
use sky_viewport::{
    FrameResult, SkyViewLayer, ViewerConfig, VulkanDevice, VulkanEguiIntegration, Window,
};
use winit::event::{Event, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget};

#[derive(Parser, Debug)]
#[command(
    name = "viewer",
    about = "Procedural sky and geometry rendered offscreen and shown through egui",
    version
)]
struct Args {
    /// Initial window width in pixels.
    #[arg(long, default_value = "1600")]
    width: u32,

    /// Initial window height in pixels.
    #[arg(long, default_value = "900")]
    height: u32,

    /// Disable vertical sync (may cause tearing).
    #[arg(long)]
    no_vsync: bool,

    /// Keep up to N offscreen submissions in flight instead of waiting on each.
    #[arg(long)]
    ring_depth: Option<usize>,

    /// Edge length of the sky cube faces.
    #[arg(long, default_value = "2048")]
    cube_size: u32,

    /// Load the previous target contents and clear inside the pass instead.
    #[arg(long)]
    explicit_clear: bool,

    #[arg(long, default_value = "3.14")]
    turbidity: f32,

    #[arg(long, default_value = "0.0")]
    azimuth: f32,

    #[arg(long, default_value = "0.0")]
    inclination: f32,

    /// Camera orbit speed in radians per second.
    #[arg(long, default_value = "0.1")]
    orbit_speed: f32,

    /// Exit after rendering N frames (useful for testing).
    #[arg(long)]
    max_frames: Option<u64>,
}

impl From<&Args> for ViewerConfig {
    fn from(args: &Args) -> Self {
        let mut config = ViewerConfig {
            width: args.width,
            height: args.height,
            vsync: !args.no_vsync,
            cube_size: args.cube_size,
            sky: SkyParams {
                turbidity: args.turbidity,
                azimuth: args.azimuth,
                inclination: args.inclination,
            },
            orbit_speed: args.orbit_speed,
            ..Default::default()
        };
        config.target.clear_on_load = !args.explicit_clear;
        if let Some(depth) = args.ring_depth {
            config.sync_mode = SyncMode::Ring { depth };
        }
        config
    }
}

struct Viewer {
    // Field order is drop order: the device goes last
    layer: Option<SkyViewLayer>,
    egui: VulkanEguiIntegration,
    device: VulkanDevice,
    window: Window,
    last_frame: Instant,
    frames: u64,
    max_frames: Option<u64>,
}

impl Viewer {
    fn new(
        event_loop: &EventLoop<()>,
        config: &ViewerConfig,
        max_frames: Option<u64>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let window = Window::new(event_loop, config)?;
        let mut device = VulkanDevice::new(window.window(), config.vsync)?;
        let mut egui = VulkanEguiIntegration::new(&mut device, window.window(), config.ui_pool)?;
        egui.set_clear_color(config.clear_color);
        let layer = SkyViewLayer::new(&mut device, config)?;

        Ok(Self {
            layer: Some(layer),
            egui,
            device,
            window,
            last_frame: Instant::now(),
            frames: 0,
            max_frames,
        })
    }

    fn on_window_event(&mut self, event: &WindowEvent) -> FrameResult<()> {
        self.window.handle_event(event);
        if self.egui.on_window_event(self.window.window(), event) {
            return Ok(());
        }
        if let WindowEvent::Resized(size) = event {
            self.device.resize_surface(size.width, size.height)?;
        }
        Ok(())
    }

    fn frame(&mut self) -> FrameResult<()> {
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;

        let Some(layer) = self.layer.as_mut() else {
            return Ok(());
        };
        if self.window.is_minimized() {
            return Ok(());
        }

        layer.on_update(&mut self.device, dt)?;
        layer.on_render(&mut self.device)?;

        // Waits for the previous UI frame, which may sample the offscreen image
        let present = match self.device.begin_frame() {
            Ok(present) => present,
            Err(DeviceError::SurfaceLost) => return self.recreate_surface(),
            Err(e) => return Err(e.into()),
        };

        self.egui.begin_frame(self.window.window());
        let ctx = self.egui.context().clone();
        layer.draw_ui(&ctx, &mut self.device, &mut self.egui)?;
        self.egui.end_frame(self.window.window());
        self.egui.render(&self.device, &present)?;

        match self.device.end_frame() {
            Ok(()) => {}
            Err(DeviceError::SurfaceLost) => self.recreate_surface()?,
            Err(e) => return Err(e.into()),
        }

        self.frames += 1;
        Ok(())
    }

    fn recreate_surface(&mut self) -> FrameResult<()> {
        let (width, height) = self.window.dimensions();
        self.device.resize_surface(width, height)?;
        Ok(())
    }

    fn finished(&self) -> bool {
        self.window.should_close() || self.max_frames.is_some_and(|max| self.frames >= max)
    }

    fn shutdown(&mut self) {
        if let Some(layer) = self.layer.take() {
            layer.destroy(&mut self.device, &mut self.egui);
        }
        self.egui.destroy(&mut self.device);
        log::info!("Rendered {} frames", self.frames);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ViewerConfig::from(&args);
    log::info!("Starting sky viewer: {:?}", config);

    let event_loop = EventLoop::new()?;
    let mut viewer = Viewer::new(&event_loop, &config, args.max_frames)?;

    event_loop.run(move |event, elwt: &EventLoopWindowTarget<()>| {
        elwt.set_control_flow(ControlFlow::Poll);

        let result: FrameResult<()> = match event {
            Event::WindowEvent { event, .. } => viewer.on_window_event(&event),
            Event::AboutToWait => {
                let result = viewer.frame();
                viewer.window.request_redraw();
                result
            }
            Event::LoopExiting => {
                viewer.shutdown();
                Ok(())
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            log::error!("Frame failed: {}", e);
            elwt.exit();
        } else if viewer.finished() {
            elwt.exit();
        }
    })?;

    Ok(())
}
