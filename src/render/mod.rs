//! CPU tile renderer and framebuffer presentation seam

pub mod framebuffer;
pub mod renderer;

pub use framebuffer::{FramebufferSink, HeadlessSink, InputState};
pub use renderer::Renderer;
