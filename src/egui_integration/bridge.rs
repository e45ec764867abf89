//! Exposes the offscreen color image to the UI as a displayable handle

use std::fmt::Debug;

use crate::backend::{ImageLayout, ImageViewHandle, RenderDevice, SamplerHandle};
use crate::error::FrameResult;

/// The image, sampler and layout triple a UI registration is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayImage {
    pub sampler: SamplerHandle,
    pub view: ImageViewHandle,
    pub layout: ImageLayout,
}

/// UI-side image registration mechanism
pub trait ImageRegistry<D: RenderDevice> {
    type Handle: Copy + PartialEq + Debug;

    fn register_image(&mut self, device: &mut D, image: DisplayImage) -> FrameResult<Self::Handle>;

    fn unregister_image(&mut self, device: &mut D, handle: Self::Handle);
}

/// Caches the UI handle for the current display image
///
/// The handle is re-registered only when the triple changes, which happens
/// when the offscreen target is recreated.
#[derive(Debug)]
pub struct DisplayBridge<H> {
    cached: Option<(DisplayImage, H)>,
}

impl<H> Default for DisplayBridge<H> {
    fn default() -> Self {
        Self { cached: None }
    }
}

impl<H: Copy + PartialEq + Debug> DisplayBridge<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `image`, registering it if it differs from the last one seen.
    pub fn current_handle<D, R>(
        &mut self,
        device: &mut D,
        registry: &mut R,
        image: DisplayImage,
    ) -> FrameResult<H>
    where
        D: RenderDevice,
        R: ImageRegistry<D, Handle = H>,
    {
        if let Some((cached_image, handle)) = self.cached {
            if cached_image == image {
                return Ok(handle);
            }
        }

        let handle = registry.register_image(device, image)?;
        if let Some((_, stale)) = self.cached.replace((image, handle)) {
            registry.unregister_image(device, stale);
        }
        log::debug!("Registered display image {:?} as {:?}", image.view, handle);
        Ok(handle)
    }

    /// Last handle handed out, if any
    pub fn cached_handle(&self) -> Option<H> {
        self.cached.map(|(_, handle)| handle)
    }

    /// Drop the cached registration.
    pub fn release<D, R>(&mut self, device: &mut D, registry: &mut R)
    where
        D: RenderDevice,
        R: ImageRegistry<D, Handle = H>,
    {
        if let Some((_, handle)) = self.cached.take() {
            registry.unregister_image(device, handle);
        }
    }
}
