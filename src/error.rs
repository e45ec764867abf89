//! Crate-level error type
//!
//! Every condition here is a programmer or asset error that is detected
//! early. Nothing is retried; callers are expected to abort on failure.

use std::fmt;

use crate::backend::{DescriptorKind, DeviceError};
use thiserror::Error;

/// Which capacity of a binding pool ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolLimit {
    /// Descriptors of one kind
    Kind(DescriptorKind),
    /// Outstanding tables
    Tables,
}

impl fmt::Display for PoolLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolLimit::Kind(kind) => write!(f, "{:?} descriptors", kind),
            PoolLimit::Tables => f.write_str("tables"),
        }
    }
}

/// Errors produced by the binding, target and sequencing layers
#[derive(Error, Debug)]
pub enum FrameError {
    /// A pool ran out of descriptors of one kind, or of tables.
    #[error("binding pool exhausted: requested {requested} {limit}, {remaining} remaining")]
    ExhaustedPool {
        limit: PoolLimit,
        requested: u32,
        remaining: u32,
    },
    /// Shader reflection has no resource with the requested name.
    #[error("shader '{shader}' has no resource slot named '{slot}'")]
    UnknownSlot { shader: String, slot: String },
    /// Shader reflection has no table layout for the requested set.
    #[error("shader '{shader}' declares no resource set {set}")]
    UnknownSet { shader: String, set: u32 },
    /// A write does not match the layout of the table it targets.
    #[error("slot '{slot}' does not match its target: {reason}")]
    LayoutMismatch { slot: String, reason: String },
    /// A sub-mesh refers to a material the mesh does not have.
    #[error("sub-mesh {sub_mesh} uses material {material_index}, but the mesh has {available}")]
    MissingMaterial {
        sub_mesh: usize,
        material_index: u32,
        available: usize,
    },
    /// A pass sequencer transition was requested from the wrong state.
    #[error("pass sequencer expected {expected} but was {found}")]
    OutOfOrder {
        expected: &'static str,
        found: &'static str,
    },
    /// WGSL parsing, validation or SPIR-V generation failed.
    #[error("failed to compile shader '{shader}': {reason}")]
    ShaderCompilation { shader: String, reason: String },
    /// A device call returned a non-success status.
    #[error("device operation failed: {0}")]
    DeviceOperationFailed(#[from] DeviceError),
}

pub type FrameResult<T> = Result<T, FrameError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FrameError::ExhaustedPool {
            limit: PoolLimit::Kind(DescriptorKind::CombinedImageSampler),
            requested: 8,
            remaining: 7,
        };
        assert_eq!(
            err.to_string(),
            "binding pool exhausted: requested 8 CombinedImageSampler descriptors, 7 remaining"
        );

        let err = FrameError::ExhaustedPool {
            limit: PoolLimit::Tables,
            requested: 1,
            remaining: 0,
        };
        assert_eq!(
            err.to_string(),
            "binding pool exhausted: requested 1 tables, 0 remaining"
        );

        let err = FrameError::UnknownSlot {
            shader: "skybox".into(),
            slot: "albedo".into(),
        };
        assert!(err.to_string().contains("albedo"));
    }

    #[test]
    fn test_device_error_converts() {
        let err: FrameError = DeviceError::DeviceLost.into();
        assert!(matches!(err, FrameError::DeviceOperationFailed(DeviceError::DeviceLost)));
    }
}
