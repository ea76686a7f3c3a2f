//! Triangle mesh loading and geometry

pub mod ply;
pub mod triangle;

pub use ply::Mesh;
pub use triangle::{Triangle, Vertex};
