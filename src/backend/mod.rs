// Backend module - Vulkan plumbing for the reproduction
//
// Thin wrappers around ash. Nothing here destroys itself on drop: GpuContext
// decides when each object dies, in reverse creation order.

pub mod context;
pub mod device;
pub mod image;
pub mod instance;
pub mod swapchain;
pub mod sync;

pub use context::GpuContext;
pub use device::VulkanDevice;
pub use image::PlaceholderImage;
pub use instance::Surface;
pub use swapchain::Swapchain;
pub use sync::FrameSync;
