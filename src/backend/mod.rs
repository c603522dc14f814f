// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash with ownership and teardown made explicit.
// Nothing outside this module issues raw Vulkan calls.

pub mod buffer;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod targets;
pub mod texture;

pub use buffer::{IndexBuffer, PerFrameBuffer, PerFrameBufferKind, VertexBuffer};
pub use device::DeviceContext;
pub use pipeline::GraphicsPipeline;
pub use swapchain::Swapchain;
pub use targets::RenderTargets;
pub use texture::Texture;
