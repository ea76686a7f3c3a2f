//! Sparse voxel octree: packed encoding, construction, traversal, and
//! persistence

pub mod allocator;
pub mod builder;
pub mod io;
pub mod tree;

pub use allocator::ChunkedAllocator;
pub use builder::build_octree;
pub use tree::{Hit, VoxelOctree};
