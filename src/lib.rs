// kiln - frame-synchronization and swapchain-lifecycle core
//
// The renderer owns the presentable surface, recreates it on resize, paces
// N frames in flight against the GPU, and hands per-frame command and
// descriptor state to drawing code.
//
// LAYERING:
//   DeviceContext            one per process, everything references it
//   Renderer                 surface + swapchain + frame ring + facade
//   GraphicsPipeline         compiled pipeline + descriptor infrastructure
//   PerFrameBuffer           aligned per-frame uniform/storage windows
//   VertexBuffer/IndexBuffer/Texture   draw-time resources

pub mod backend;
pub mod config;
pub mod renderer;

pub use backend::pipeline::{
    PushConstantRange, ShaderBinding, ShaderBindingKind, VertexAttribute, VertexAttributeKind,
    VertexBinding, VertexInputRate,
};
pub use backend::shader::{ShaderStage, ShaderStageKind};
pub use backend::{
    DeviceContext, GraphicsPipeline, IndexBuffer, PerFrameBuffer, PerFrameBufferKind, Texture,
    VertexBuffer,
};
pub use config::{Config, RendererSettings};
pub use renderer::{FrameHandle, Renderer};

/// Initialize logging from the environment, defaulting to info level.
pub fn init_logging() {
    use log::LevelFilter;

    let _ = env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Info)
        .try_init();
}
