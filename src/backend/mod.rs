//! Device abstraction layer
//!
//! Provides the device trait, handles and shared types, plus the backends
//! that implement them.

pub mod recording;
pub mod traits;
pub mod types;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub use recording::{RecordedCommand, RecordedSubmission, RecordingDevice};
pub use traits::*;
pub use types::*;
