// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash. Every wrapper holds an Arc of the
// GraphicsContext, so the device outlives everything created from it.

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use device::{GraphicsContext, ENABLE_VALIDATION};
pub use swapchain::Swapchain;
