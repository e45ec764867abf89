//! Offscreen render target and in-flight submission tracking

pub mod in_flight;
pub mod offscreen;

pub use in_flight::{InFlight, SubmissionRing};
pub use offscreen::{OffscreenTarget, OffscreenTargetManager, OffscreenTargetSpec};
