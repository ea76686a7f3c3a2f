//! Worker pool and render-loop synchronization primitives

pub mod barrier;
pub mod pool;

pub use barrier::RenderBarrier;
pub use pool::{TaskGroup, ThreadPool};
