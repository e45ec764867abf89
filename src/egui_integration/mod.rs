//! egui GUI integration
//!
//! The display bridge is backend independent; the Vulkan integration
//! renders egui with egui-ash-renderer and registers offscreen images
//! as user textures.

mod bridge;

#[cfg(feature = "vulkan-backend")]
mod vulkan;

pub use bridge::{DisplayBridge, DisplayImage, ImageRegistry};

#[cfg(feature = "vulkan-backend")]
pub use vulkan::VulkanEguiIntegration;
