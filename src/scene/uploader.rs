//! Per-frame camera data upload

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::backend::{
    BoundResource, BufferDescriptor, BufferHandle, BufferUsage, RenderDevice, SubmissionId,
};
use crate::error::FrameResult;
use crate::scene::camera::CameraSource;

/// GPU layout of the `Camera` uniform block shared by the sky and geometry shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraUniform {
    pub view_projection: Mat4,
    pub inverse_view_projection: Mat4,
    pub position: Vec3,
    pub _padding: f32,
}

impl CameraUniform {
    pub fn from_camera<C: CameraSource + ?Sized>(camera: &C) -> Self {
        Self {
            view_projection: camera.view_projection(),
            inverse_view_projection: camera.inverse_view_projection(),
            position: camera.position(),
            _padding: 0.0,
        }
    }
}

struct UniformSlot {
    buffer: BufferHandle,
    /// Last submission that read this buffer
    reader: Option<SubmissionId>,
}

/// Keeps a host mirror of the camera block and copies it into one of
/// several host-visible uniform buffers
///
/// Frames take the slots in turn, so a frame still in flight keeps reading
/// its own copy while the next one is written.
pub struct FrameDataUploader {
    slots: Vec<UniformSlot>,
    current: usize,
    next: usize,
    mirror: CameraUniform,
}

impl FrameDataUploader {
    pub fn new<D: RenderDevice>(device: &mut D, slot_count: usize) -> FrameResult<Self> {
        let mut slots = Vec::with_capacity(slot_count.max(1));
        for slot in 0..slot_count.max(1) {
            let buffer = device.create_buffer(&BufferDescriptor {
                label: Some(format!("Camera Uniforms {}", slot)),
                size: std::mem::size_of::<CameraUniform>() as u64,
                usage: BufferUsage::UNIFORM | BufferUsage::MAP_WRITE,
            })?;
            slots.push(UniformSlot {
                buffer,
                reader: None,
            });
        }
        Ok(Self {
            slots,
            current: 0,
            next: 0,
            mirror: CameraUniform::zeroed(),
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// Move on to the slot the next frame writes and return its index.
    pub fn advance(&mut self) -> usize {
        self.current = self.next;
        self.next = (self.next + 1) % self.slots.len();
        self.current
    }

    /// Submission that last read the current slot, if any
    pub fn reader(&self) -> Option<SubmissionId> {
        self.slots[self.current].reader
    }

    pub fn set_reader(&mut self, submission: SubmissionId) {
        self.slots[self.current].reader = Some(submission);
    }

    /// Recompute the block from `camera` and copy it to the GPU.
    ///
    /// The mapping is released before returning.
    pub fn refresh<D: RenderDevice, C: CameraSource + ?Sized>(
        &mut self,
        device: &mut D,
        camera: &C,
    ) -> FrameResult<()> {
        self.mirror = CameraUniform::from_camera(camera);
        let buffer = self.buffer();
        let bytes = bytemuck::bytes_of(&self.mirror);
        let mapped = device.map_buffer(buffer)?;
        mapped[..bytes.len()].copy_from_slice(bytes);
        device.unmap_buffer(buffer);
        log::trace!(
            "Uploaded camera block at {:?} to slot {}",
            self.mirror.position,
            self.current
        );
        Ok(())
    }

    /// Buffer of the current slot
    pub fn buffer(&self) -> BufferHandle {
        self.slots[self.current].buffer
    }

    pub fn buffer_at(&self, slot: usize) -> BufferHandle {
        self.slots[slot].buffer
    }

    /// Host copy of what was last uploaded
    pub fn mirror(&self) -> &CameraUniform {
        &self.mirror
    }

    /// Buffer region of the current slot, for a uniform table write
    pub fn binding(&self) -> BoundResource {
        self.binding_at(self.current)
    }

    pub fn binding_at(&self, slot: usize) -> BoundResource {
        BoundResource::UniformBuffer {
            buffer: self.slots[slot].buffer,
            offset: 0,
            range: std::mem::size_of::<CameraUniform>() as u64,
        }
    }

    pub fn destroy<D: RenderDevice>(self, device: &mut D) {
        for slot in self.slots {
            device.destroy_buffer(slot.buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingDevice;
    use crate::scene::Camera;

    #[test]
    fn test_layout_matches_wgsl() {
        assert_eq!(std::mem::size_of::<CameraUniform>(), 144);
    }

    #[test]
    fn test_refresh_copies_exact_bytes() {
        let mut device = RecordingDevice::new();
        let mut uploader = FrameDataUploader::new(&mut device, 1).unwrap();
        let camera = Camera::new(Vec3::new(3.0, 2.0, 1.0), Vec3::ZERO);

        uploader.refresh(&mut device, &camera).unwrap();

        let contents = device.buffer_contents(uploader.buffer()).unwrap();
        let uploaded: CameraUniform = bytemuck::pod_read_unaligned(contents);
        assert_eq!(uploaded.view_projection, camera.view_projection());
        assert_eq!(uploaded.inverse_view_projection, camera.inverse_view_projection());
        assert_eq!(uploaded.position, Vec3::new(3.0, 2.0, 1.0));
        assert_eq!(&uploaded, uploader.mirror());
        assert!(!device.is_mapped(uploader.buffer()));
    }

    #[test]
    fn test_slots_rotate_and_keep_their_contents() {
        let mut device = RecordingDevice::new();
        let mut uploader = FrameDataUploader::new(&mut device, 2).unwrap();
        assert_eq!(uploader.slot_count(), 2);
        assert_ne!(uploader.buffer_at(0), uploader.buffer_at(1));

        let near = Camera::new(Vec3::new(1.0, 0.0, 0.0), Vec3::ZERO);
        let far = Camera::new(Vec3::new(9.0, 0.0, 0.0), Vec3::ZERO);

        assert_eq!(uploader.advance(), 0);
        uploader.refresh(&mut device, &near).unwrap();
        assert_eq!(uploader.advance(), 1);
        uploader.refresh(&mut device, &far).unwrap();
        assert_eq!(uploader.advance(), 0);

        let position = |buffer| {
            let block: CameraUniform =
                bytemuck::pod_read_unaligned(device.buffer_contents(buffer).unwrap());
            block.position
        };
        assert_eq!(position(uploader.buffer_at(0)), Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(position(uploader.buffer_at(1)), Vec3::new(9.0, 0.0, 0.0));
        assert_eq!(uploader.binding(), uploader.binding_at(0));
    }
}
