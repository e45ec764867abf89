//! Vulkan egui integration using egui-ash-renderer
//!
//! Renders the UI into the swapchain and registers offscreen images as
//! egui user textures through an isolated binding pool.

use ash::vk;
use egui_ash_renderer::{Options, Renderer};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use std::sync::{Arc, Mutex};
use winit::event::WindowEvent;
use winit::window::Window;

use crate::backend::vulkan::{PresentFrame, VulkanDevice};
use crate::backend::{
    BoundResource, DescriptorKind, DeviceError, RenderDevice, ShaderStages, TableLayoutEntry,
    TableWrite,
};
use crate::binding::{BindingPool, BindingTable, PoolCapacities, TableLayout, WriteBatch, WriteRecord};
use crate::egui_integration::bridge::{DisplayImage, ImageRegistry};
use crate::error::FrameResult;

/// Set index of the user texture table expected by the renderer
const UI_TEXTURE_SET: u32 = 0;

/// Vulkan-specific egui integration
pub struct VulkanEguiIntegration {
    ctx: egui::Context,
    winit_state: egui_winit::State,
    /// Must be dropped before the allocator
    renderer: Option<Renderer>,
    /// Uses cloned device handles, so it must be dropped before the device
    allocator: Option<Arc<Mutex<Allocator>>>,
    paint_jobs: Vec<egui::ClippedPrimitive>,
    textures_delta: egui::TexturesDelta,
    clear_color: [f32; 4],
    // Displayed images
    pool: Option<BindingPool>,
    layout: Option<TableLayout>,
    table: BindingTable,
    writes: WriteBatch,
}

impl VulkanEguiIntegration {
    pub fn new(
        device: &mut VulkanDevice,
        window: &Window,
        ui_pool: PoolCapacities,
    ) -> FrameResult<Self> {
        let ctx = egui::Context::default();

        let winit_state = egui_winit::State::new(
            ctx.clone(),
            egui::ViewportId::ROOT,
            window,
            Some(window.scale_factor() as f32),
            None,
        );

        // egui-ash-renderer wants its own allocator behind a std Mutex
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: device.instance().clone(),
            device: device.logical_device().clone(),
            physical_device: device.physical_device(),
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| DeviceError::InitializationFailed(e.to_string()))?;
        let allocator = Arc::new(Mutex::new(allocator));

        let renderer = Renderer::with_gpu_allocator(
            allocator.clone(),
            device.logical_device().clone(),
            device.ui_render_pass(),
            Options {
                srgb_framebuffer: true,
                ..Default::default()
            },
        )
        .map_err(|e| DeviceError::InitializationFailed(e.to_string()))?;

        let mut pool = BindingPool::new(device, "UI Images", ui_pool)?;
        let layout = TableLayout::new(
            device,
            UI_TEXTURE_SET,
            vec![TableLayoutEntry {
                binding: 0,
                kind: DescriptorKind::CombinedImageSampler,
                stages: ShaderStages::FRAGMENT,
            }],
        )?;
        let table = pool.allocate(device, &layout)?;

        Ok(Self {
            ctx,
            winit_state,
            renderer: Some(renderer),
            allocator: Some(allocator),
            paint_jobs: Vec::new(),
            textures_delta: egui::TexturesDelta::default(),
            clear_color: [0.1, 0.1, 0.15, 1.0],
            pool: Some(pool),
            layout: Some(layout),
            table,
            writes: WriteBatch::new(),
        })
    }

    /// Destroy GPU resources. Must be called before the device is dropped.
    pub fn destroy(&mut self, device: &mut VulkanDevice) {
        if let Err(e) = device.wait_idle() {
            log::error!("Failed to wait for idle before destroying egui: {}", e);
        }

        // Renderer first, it uses the allocator
        self.renderer = None;
        self.allocator = None;

        if let Some(pool) = self.pool.take() {
            pool.destroy(device);
        }
        if let Some(layout) = self.layout.take() {
            layout.destroy(device);
        }
    }

    /// Color the swapchain is cleared to behind the UI
    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    /// Feed a winit event to egui; returns whether egui consumed it
    pub fn on_window_event(&mut self, window: &Window, event: &WindowEvent) -> bool {
        self.winit_state.on_window_event(window, event).consumed
    }

    pub fn begin_frame(&mut self, window: &Window) {
        let raw_input = self.winit_state.take_egui_input(window);
        self.ctx.begin_frame(raw_input);
    }

    pub fn end_frame(&mut self, window: &Window) {
        let full_output = self.ctx.end_frame();

        self.winit_state
            .handle_platform_output(window, full_output.platform_output);

        self.paint_jobs = self
            .ctx
            .tessellate(full_output.shapes, full_output.pixels_per_point);
        self.textures_delta.append(full_output.textures_delta);
    }

    /// Record the UI pass into the presentation command buffer.
    pub fn render(&mut self, device: &VulkanDevice, frame: &PresentFrame) -> FrameResult<()> {
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(());
        };

        // Uploads run on their own command buffer, outside the pass
        let uploads: Vec<_> = self.textures_delta.set.drain(..).collect();
        renderer
            .set_textures(device.graphics_queue(), device.command_pool(), &uploads)
            .map_err(|e| DeviceError::RecordingFailed(e.to_string()))?;

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(frame.render_pass)
            .framebuffer(frame.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: frame.extent,
            })
            .clear_values(&clear_values);

        let logical = device.logical_device();
        unsafe {
            logical.cmd_begin_render_pass(
                frame.command_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            );
        }
        let drawn = renderer.cmd_draw(
            frame.command_buffer,
            frame.extent,
            self.ctx.pixels_per_point(),
            &self.paint_jobs,
        );
        unsafe { logical.cmd_end_render_pass(frame.command_buffer) };
        drawn.map_err(|e| DeviceError::RecordingFailed(e.to_string()))?;

        let freed: Vec<_> = self.textures_delta.free.drain(..).collect();
        renderer
            .free_textures(&freed)
            .map_err(|e| DeviceError::RecordingFailed(e.to_string()))?;
        Ok(())
    }

    pub fn context(&self) -> &egui::Context {
        &self.ctx
    }

    pub fn wants_keyboard_input(&self) -> bool {
        self.ctx.wants_keyboard_input()
    }

    pub fn wants_pointer_input(&self) -> bool {
        self.ctx.wants_pointer_input()
    }
}

impl ImageRegistry<VulkanDevice> for VulkanEguiIntegration {
    type Handle = egui::TextureId;

    /// Point the UI table at `image` and hand it to egui as a user texture.
    fn register_image(
        &mut self,
        device: &mut VulkanDevice,
        image: DisplayImage,
    ) -> FrameResult<egui::TextureId> {
        // A previous UI frame may still sample the table
        device.wait_idle()?;

        self.writes.push(WriteRecord {
            slot: "ui_texture".to_string(),
            write: TableWrite {
                table: self.table.handle(),
                binding: 0,
                resource: BoundResource::CombinedImageSampler {
                    sampler: image.sampler,
                    view: image.view,
                    layout: image.layout,
                },
            },
        });
        self.writes.apply(device)?;

        let set = device.raw_table(self.table.handle()).ok_or(DeviceError::UnknownHandle {
            kind: "table",
            id: self.table.handle().0,
        })?;
        let renderer = self.renderer.as_mut().ok_or_else(|| {
            DeviceError::DescriptorFailed("egui renderer already destroyed".into())
        })?;
        Ok(renderer.add_user_texture(set))
    }

    fn unregister_image(&mut self, _device: &mut VulkanDevice, handle: egui::TextureId) {
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.remove_user_texture(handle);
        }
    }
}

impl Drop for VulkanEguiIntegration {
    fn drop(&mut self) {
        if self.renderer.is_some() || self.allocator.is_some() {
            log::warn!(
                "VulkanEguiIntegration::destroy() was not called before drop. This may cause issues."
            );
        }
    }
}
