//! Octree construction from the occupancy oracle
//!
//! Recursive descent over the virtual cube. Each node queries its eight
//! octants destructively (so subcubes shared across cache-block boundaries
//! enter the tree only once), appends its children through the chunked
//! allocator, and patches their child offsets after the subtrees return.
//! Offsets wider than 14 bits spill into far-pointer words inserted right
//! after the child descriptor they extend.

use crate::core::types::Result;
use crate::octree::allocator::ChunkedAllocator;
use crate::octree::tree::VoxelOctree;
use crate::voxel::{VoxelData, VoxelSource};

/// Child offsets above this need a far-pointer word
const FAR_THRESHOLD: u64 = 0x3FFF;

/// Build the packed octree for the whole virtual volume
pub fn build_octree<S: VoxelSource>(voxels: &mut VoxelData<S>) -> Result<VoxelOctree> {
    let side = voxels.side_length();

    let mut alloc = ChunkedAllocator::new();
    alloc.push_back(0);
    build_node(&mut alloc, voxels, 0, 0, 0, side, 0)?;

    let insertions = alloc.insertion_count();
    let mut words = alloc.finalize();
    // The root has no parent to patch its offset; its children always start
    // at the next word.
    words[0] |= 1 << 18;

    log::info!(
        "octree built: {} words ({} far-pointer words)",
        words.len(),
        insertions
    );
    Ok(VoxelOctree::new(words, voxels.center()))
}

/// Emit the descriptor at `descriptor_index` for the cube `(x, y, z, size)`
/// and its subtree. Returns the distance from the descriptor to its first
/// child in (pre-insertion) words.
fn build_node<S: VoxelSource>(
    alloc: &mut ChunkedAllocator,
    voxels: &mut VoxelData<S>,
    x: u32,
    y: u32,
    z: u32,
    size: u32,
    descriptor_index: u64,
) -> Result<u64> {
    voxels.prepare_data_access(x, y, z, size)?;

    let half = size >> 1;
    let pos_x = [x + half, x, x + half, x, x + half, x, x + half, x];
    let pos_y = [y + half, y + half, y, y, y + half, y + half, y, y];
    let pos_z = [z + half, z + half, z + half, z + half, z, z, z, z];

    let mut child_mask: u32 = 0;
    for i in 0..8 {
        if voxels.cube_contains_voxels_destructive(pos_x[i], pos_y[i], pos_z[i], half) {
            child_mask |= 128 >> i;
        }
    }

    let child_offset = alloc.len() - descriptor_index;
    let mut has_large_children = false;
    let leaf_mask: u32;

    if half == 1 {
        leaf_mask = 0;
        // Mask bit i addresses query octant 7 - i; children are stored in
        // ascending bit order
        for i in 0..8 {
            if child_mask & (1 << i) != 0 {
                alloc.push_back(voxels.voxel_destructive(pos_x[7 - i], pos_y[7 - i], pos_z[7 - i]));
            }
        }
    } else {
        leaf_mask = child_mask;
        let child_count = child_mask.count_ones() as usize;
        let child_index = alloc.len();
        for _ in 0..child_count {
            alloc.push_back(0);
        }

        // Far-pointer insertions made inside earlier sibling subtrees sit
        // between a later child's descriptor and its referent; `delta`
        // restores the distance they stretch.
        let mut grand_child_offsets = [0u64; 8];
        let mut delta = 0u64;
        let mut insertion_count = alloc.insertion_count();
        let mut emitted = 0usize;

        for i in 0..8 {
            if child_mask & (1 << i) == 0 {
                continue;
            }
            grand_child_offsets[emitted] = delta
                + build_node(
                    alloc,
                    voxels,
                    pos_x[7 - i],
                    pos_y[7 - i],
                    pos_z[7 - i],
                    half,
                    child_index + emitted as u64,
                )?;
            if grand_child_offsets[emitted] > FAR_THRESHOLD {
                has_large_children = true;
            }
            emitted += 1;

            let now = alloc.insertion_count();
            delta += now - insertion_count;
            insertion_count = now;
        }

        for (i, &grand_child_offset) in grand_child_offsets[..child_count].iter().enumerate() {
            let idx = child_index + i as u64;
            let mut offset = grand_child_offset;
            if has_large_children {
                // One far word lands after this descriptor and after each
                // later sibling, all between this child and its referent
                offset += (child_count - i) as u64;
                alloc.insert(idx + 1, offset as u32)?;
                alloc.set(idx, alloc.get(idx) | 0x20000);
                offset >>= 32;
            }
            alloc.set(idx, alloc.get(idx) | ((offset as u32) << 18));
        }
    }

    let mut descriptor = (child_mask << 8) | leaf_mask;
    if has_large_children {
        descriptor |= 0x10000;
    }
    alloc.set(descriptor_index, descriptor);

    Ok(child_offset)
}
