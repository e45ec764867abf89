//! Resizable offscreen color and depth target

use crate::backend::{
    AddressMode, ClearValue, Extent2D, FilterMode, FramebufferHandle, ImageDescriptor,
    ImageDimension, ImageFormat, ImageHandle, ImageLayout, ImageUsage, ImageViewHandle,
    ImageViewKind, RenderDevice, RenderPassDescriptor, RenderPassHandle, SamplerDescriptor,
    SamplerHandle,
};
use crate::egui_integration::DisplayImage;
use crate::error::FrameResult;
use crate::target::in_flight::SubmissionRing;

/// Formats, initial size and clear behaviour of the offscreen target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffscreenTargetSpec {
    pub color_format: ImageFormat,
    pub depth_format: Option<ImageFormat>,
    pub width: u32,
    pub height: u32,
    /// Clear when the pass begins instead of loading previous contents
    pub clear_on_load: bool,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

impl Default for OffscreenTargetSpec {
    fn default() -> Self {
        Self {
            color_format: ImageFormat::Rgba16Float,
            depth_format: Some(ImageFormat::Depth24PlusStencil8),
            width: 1280,
            height: 720,
            clear_on_load: true,
            clear_color: [0.1, 0.1, 0.1, 1.0],
            clear_depth: 1.0,
            clear_stencil: 0,
        }
    }
}

impl OffscreenTargetSpec {
    /// Clear values in attachment order: color first, then depth/stencil
    pub fn clear_values(&self) -> Vec<ClearValue> {
        let mut values = vec![ClearValue::Color(self.clear_color)];
        if self.depth_format.is_some() {
            values.push(ClearValue::DepthStencil {
                depth: self.clear_depth,
                stencil: self.clear_stencil,
            });
        }
        values
    }
}

/// One generation of the target's GPU objects
#[derive(Debug)]
pub struct OffscreenTarget {
    extent: Extent2D,
    epoch: u64,
    render_pass: RenderPassHandle,
    framebuffer: FramebufferHandle,
    color_image: ImageHandle,
    color_view: ImageViewHandle,
    depth: Option<(ImageHandle, ImageViewHandle)>,
}

impl OffscreenTarget {
    fn create<D: RenderDevice>(
        device: &mut D,
        spec: &OffscreenTargetSpec,
        extent: Extent2D,
        epoch: u64,
    ) -> FrameResult<Self> {
        let render_pass = device.create_render_pass(&RenderPassDescriptor {
            label: Some("Offscreen Pass".into()),
            color_formats: vec![spec.color_format],
            depth_format: spec.depth_format,
            clear_on_load: spec.clear_on_load,
        })?;

        // Created straight into the sampled layout so a fresh target can be
        // displayed before anything renders into it.
        let color_image = device.create_image(&ImageDescriptor {
            label: Some("Offscreen Color".into()),
            width: extent.width,
            height: extent.height,
            format: spec.color_format,
            usage: ImageUsage::RENDER_ATTACHMENT | ImageUsage::SAMPLED,
            dimension: ImageDimension::D2,
            initial_layout: ImageLayout::ShaderReadOnly,
        })?;
        let color_view = device.create_image_view(color_image, ImageViewKind::D2)?;

        let depth = match spec.depth_format {
            Some(format) => {
                let image = device.create_image(&ImageDescriptor {
                    label: Some("Offscreen Depth".into()),
                    width: extent.width,
                    height: extent.height,
                    format,
                    usage: ImageUsage::RENDER_ATTACHMENT,
                    dimension: ImageDimension::D2,
                    initial_layout: ImageLayout::DepthStencilAttachment,
                })?;
                let view = device.create_image_view(image, ImageViewKind::D2)?;
                Some((image, view))
            }
            None => None,
        };

        let mut attachments = vec![color_view];
        if let Some((_, view)) = depth {
            attachments.push(view);
        }
        let framebuffer = device.create_framebuffer(render_pass, &attachments, extent)?;

        Ok(Self {
            extent,
            epoch,
            render_pass,
            framebuffer,
            color_image,
            color_view,
            depth,
        })
    }

    fn destroy<D: RenderDevice>(self, device: &mut D) {
        device.destroy_framebuffer(self.framebuffer);
        if let Some((image, view)) = self.depth {
            device.destroy_image_view(view);
            device.destroy_image(image);
        }
        device.destroy_image_view(self.color_view);
        device.destroy_image(self.color_image);
        device.destroy_render_pass(self.render_pass);
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    /// Generation counter, bumped on every recreation
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn render_pass(&self) -> RenderPassHandle {
        self.render_pass
    }

    pub fn framebuffer(&self) -> FramebufferHandle {
        self.framebuffer
    }

    pub fn color_image(&self) -> ImageHandle {
        self.color_image
    }

    pub fn color_view(&self) -> ImageViewHandle {
        self.color_view
    }

    pub fn depth_image(&self) -> Option<ImageHandle> {
        self.depth.map(|(image, _)| image)
    }

    pub fn color_attachment_count(&self) -> u32 {
        1
    }
}

/// Clamp a requested dimension to at least one texel
fn clamp_dimension(value: i32) -> u32 {
    value.max(1) as u32
}

/// Owns the offscreen target and recreates it on size changes
pub struct OffscreenTargetManager {
    spec: OffscreenTargetSpec,
    sampler: SamplerHandle,
    target: OffscreenTarget,
}

impl OffscreenTargetManager {
    pub fn new<D: RenderDevice>(device: &mut D, spec: OffscreenTargetSpec) -> FrameResult<Self> {
        let extent = Extent2D::new(spec.width.max(1), spec.height.max(1));
        let sampler = device.create_sampler(&SamplerDescriptor {
            label: Some("Offscreen Sampler".into()),
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            address_mode: AddressMode::ClampToEdge,
        })?;
        let target = OffscreenTarget::create(device, &spec, extent, 0)?;
        log::info!(
            "Created offscreen target {}x{}",
            extent.width,
            extent.height
        );
        Ok(Self {
            spec,
            sampler,
            target,
        })
    }

    pub fn spec(&self) -> &OffscreenTargetSpec {
        &self.spec
    }

    pub fn target(&self) -> &OffscreenTarget {
        &self.target
    }

    pub fn extent(&self) -> Extent2D {
        self.target.extent
    }

    pub fn sampler(&self) -> SamplerHandle {
        self.sampler
    }

    /// What the UI should display for the current generation
    pub fn display_image(&self) -> DisplayImage {
        DisplayImage {
            sampler: self.sampler,
            view: self.target.color_view,
            layout: ImageLayout::ShaderReadOnly,
        }
    }

    /// Recreate the target when the requested size differs from the current one.
    ///
    /// Dimensions below one clamp to one. Every submission in `in_flight`
    /// that may still reference the current generation is waited on before
    /// its objects are destroyed. Returns whether the target changed.
    pub fn resize<D: RenderDevice>(
        &mut self,
        device: &mut D,
        in_flight: &mut SubmissionRing,
        width: i32,
        height: i32,
    ) -> FrameResult<bool> {
        let extent = Extent2D::new(clamp_dimension(width), clamp_dimension(height));
        if extent == self.target.extent {
            return Ok(false);
        }

        in_flight.retire_through(device, self.target.epoch)?;

        let replacement = OffscreenTarget::create(device, &self.spec, extent, self.target.epoch + 1)?;
        let previous = std::mem::replace(&mut self.target, replacement);
        log::info!(
            "Resized offscreen target {}x{} -> {}x{} (epoch {})",
            previous.extent.width,
            previous.extent.height,
            extent.width,
            extent.height,
            self.target.epoch
        );
        previous.destroy(device);
        Ok(true)
    }

    pub fn destroy<D: RenderDevice>(self, device: &mut D) {
        self.target.destroy(device);
        device.destroy_sampler(self.sampler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingDevice;

    fn manager(device: &mut RecordingDevice) -> OffscreenTargetManager {
        OffscreenTargetManager::new(device, OffscreenTargetSpec::default()).unwrap()
    }

    #[test]
    fn test_same_size_is_noop() {
        let mut device = RecordingDevice::new();
        let mut ring = SubmissionRing::new(1);
        let mut targets = manager(&mut device);
        let before = (targets.target().color_image(), targets.target().framebuffer());

        assert!(!targets.resize(&mut device, &mut ring, 1280, 720).unwrap());
        assert_eq!(
            before,
            (targets.target().color_image(), targets.target().framebuffer())
        );
        assert_eq!(targets.target().epoch(), 0);
    }

    #[test]
    fn test_resize_recreates_everything() {
        let mut device = RecordingDevice::new();
        let mut ring = SubmissionRing::new(1);
        let mut targets = manager(&mut device);
        let old = targets.display_image();
        let old_color = targets.target().color_image();
        let old_depth = targets.target().depth_image().unwrap();
        let images = device.live_image_count();

        assert!(targets.resize(&mut device, &mut ring, 800, 600).unwrap());

        let target = targets.target();
        assert_eq!(target.extent(), Extent2D::new(800, 600));
        assert_eq!(target.epoch(), 1);
        assert_ne!(target.color_image(), old_color);
        assert!(!device.is_image_alive(old_color));
        assert!(!device.is_image_alive(old_depth));
        assert!(!device.is_view_alive(old.view));
        assert_eq!(device.live_image_count(), images);
        assert_eq!(device.live_framebuffer_count(), 1);
        assert_eq!(device.live_render_pass_count(), 1);
        assert_eq!(device.framebuffer_extent(target.framebuffer()), Some(target.extent()));

        // The sampler outlives the resize
        assert_eq!(targets.display_image().sampler, old.sampler);
        assert_ne!(targets.display_image().view, old.view);
    }

    #[test]
    fn test_degenerate_sizes_clamp() {
        let mut device = RecordingDevice::new();
        let mut ring = SubmissionRing::new(1);
        let mut targets = manager(&mut device);

        assert!(targets.resize(&mut device, &mut ring, 0, -5).unwrap());
        assert_eq!(targets.extent(), Extent2D::new(1, 1));
        assert!(!targets.resize(&mut device, &mut ring, -1, 0).unwrap());
    }

    #[test]
    fn test_color_image_starts_sampled() {
        let mut device = RecordingDevice::new();
        let targets = manager(&mut device);
        let desc = device.image_descriptor(targets.target().color_image()).unwrap();
        assert_eq!(desc.initial_layout, ImageLayout::ShaderReadOnly);
        assert_eq!(desc.format, ImageFormat::Rgba16Float);
        assert_eq!(targets.spec().clear_values().len(), 2);

        targets.destroy(&mut device);
        assert_eq!(device.live_image_count(), 0);
        assert_eq!(device.live_framebuffer_count(), 0);
    }
}
