//! Camera and per-frame uniform data

mod camera;
mod uploader;

pub use camera::*;
pub use uploader::*;
