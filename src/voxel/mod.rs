//! Voxel volumes: material words, voxelization, and the occupancy oracle

pub mod data;
pub mod material;
pub mod volume;
pub mod voxelizer;

pub use data::VoxelData;
pub use material::{compress_material, decompress_material};
pub use volume::VolumeFile;
pub use voxelizer::MeshVoxelizer;

use crate::core::types::Result;

/// Producer of dense material blocks for the occupancy oracle.
///
/// Implemented by the mesh voxelizer (in-memory builds) and by
/// [`VolumeFile`] (on-disk builds).
pub trait VoxelSource {
    /// True volume dimensions (W, H, D)
    fn dims(&self) -> (u32, u32, u32);

    /// Called once with the cache-block dimensions before any block request
    fn begin_blocks(&mut self, block_w: u32, block_h: u32, block_d: u32) -> Result<()>;

    /// Fill `dst` (`w*h*d` words, x fastest) with the block at `(x, y, z)`.
    /// `dst` is pre-zeroed by the caller.
    fn fill_block(
        &mut self,
        dst: &mut [u32],
        x: u32,
        y: u32,
        z: u32,
        w: u32,
        h: u32,
        d: u32,
    ) -> Result<()>;

    /// Whether the block-aligned region at `(x, y, z)` holds no voxels
    fn block_empty(&mut self, x: u32, y: u32, z: u32) -> Result<bool>;
}
