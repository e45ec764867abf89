//! Meshes and materials
//!
//! Procedural geometry is concatenated into one vertex/index buffer pair;
//! each material owns a uniform buffer and a binding table.

mod material;
mod mesh;

pub use material::*;
pub use mesh::*;

use crate::backend::{BufferDescriptor, BufferHandle, BufferUsage, RenderDevice};
use crate::error::FrameResult;

/// Create a host-visible buffer holding `data`.
pub(crate) fn create_buffer_with_data<D: RenderDevice>(
    device: &mut D,
    label: &str,
    usage: BufferUsage,
    data: &[u8],
) -> FrameResult<BufferHandle> {
    let buffer = device.create_buffer(&BufferDescriptor {
        label: Some(label.to_string()),
        size: data.len().max(4) as u64,
        usage: usage | BufferUsage::MAP_WRITE,
    })?;
    let mapped = device.map_buffer(buffer)?;
    mapped[..data.len()].copy_from_slice(data);
    device.unmap_buffer(buffer);
    Ok(buffer)
}
