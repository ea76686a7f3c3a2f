//! Triangle-mesh block voxelizer
//!
//! Rasterizes triangles into dense material blocks on demand. A
//! triangle-per-macrocell CSR index gives broad-phase culling, so filling a
//! block only touches the triangles that overlap it. Within a block, one
//! task per macrocell partition runs on the worker pool; partitions write
//! disjoint voxel ranges and need no synchronization.

use std::sync::Arc;

use crate::core::types::{Result, Vec3};
use crate::math::tri_box_overlap;
use crate::mesh::{Mesh, Triangle};
use crate::thread::pool::SharedMut;
use crate::thread::ThreadPool;
use crate::voxel::material::{compress_material, decompress_material, shade_from_color};
use crate::voxel::VoxelSource;

/// Interpolated normals shorter than this keep the previous cell normal
const DEGENERATE_NORMAL: f32 = 1e-3;

pub struct MeshVoxelizer {
    tris: Vec<Triangle>,
    w: u32,
    h: u32,
    d: u32,
    pool: Arc<ThreadPool>,

    // Broad-phase index, built by begin_blocks
    partitions: (u32, u32, u32),
    sub: (u32, u32, u32),
    grid: (u32, u32, u32),
    offsets: Vec<u32>,
    lists: Vec<u32>,
}

impl MeshVoxelizer {
    /// Rescale `mesh` so its longest axis spans `resolution` voxels and set
    /// up for block requests.
    pub fn from_mesh(mesh: &Mesh, resolution: u32, pool: Arc<ThreadPool>) -> Self {
        let extent = mesh.upper - mesh.lower;
        let factor = resolution as f32 / extent.max_element().max(1e-6);

        let dims = (extent * factor).ceil();
        let w = (dims.x as u32).clamp(1, resolution);
        let h = (dims.y as u32).clamp(1, resolution);
        let d = (dims.z as u32).clamp(1, resolution);

        let tris = mesh
            .tris
            .iter()
            .map(|tri| {
                let mut verts = tri.verts;
                for v in &mut verts {
                    v.pos = (v.pos - mesh.lower) * factor;
                }
                Triangle::new(verts[0], verts[1], verts[2])
            })
            .collect();

        log::info!("voxelizing into {}x{}x{} ({} triangles)", w, h, d, mesh.tris.len());

        Self {
            tris,
            w,
            h,
            d,
            pool,
            partitions: (1, 1, 1),
            sub: (0, 0, 0),
            grid: (0, 0, 0),
            offsets: Vec::new(),
            lists: Vec::new(),
        }
    }

    /// Split a block into per-worker partitions by halving its largest
    /// dimension until there is one macrocell per worker.
    fn choose_partitions(block: (u32, u32, u32), workers: u32) -> (u32, u32, u32) {
        let (mut bw, mut bh, mut bd) = block;
        let mut parts = (1u32, 1u32, 1u32);
        while parts.0 * parts.1 * parts.2 < workers {
            if bw >= bh && bw >= bd && bw > 1 {
                bw /= 2;
                parts.0 *= 2;
            } else if bh >= bd && bh > 1 {
                bh /= 2;
                parts.1 *= 2;
            } else if bd > 1 {
                bd /= 2;
                parts.2 *= 2;
            } else {
                break;
            }
        }
        parts
    }

    /// Call `visit` for every (macrocell, triangle) overlap pair
    fn visit_macrocells(&self, mut visit: impl FnMut(usize, u32)) {
        let (sw, sh, sd) = self.sub;
        let (gx, gy, gz) = self.grid;
        let half = Vec3::new(sw as f32, sh as f32, sd as f32) * 0.5;

        for (ti, tri) in self.tris.iter().enumerate() {
            let verts = [tri.verts[0].pos, tri.verts[1].pos, tri.verts[2].pos];

            let lx = (tri.lower.x as u32 / sw).min(gx - 1);
            let ly = (tri.lower.y as u32 / sh).min(gy - 1);
            let lz = (tri.lower.z as u32 / sd).min(gz - 1);
            let ux = (tri.upper.x as u32 / sw).min(gx - 1);
            let uy = (tri.upper.y as u32 / sh).min(gy - 1);
            let uz = (tri.upper.z as u32 / sd).min(gz - 1);

            for cz in lz..=uz {
                for cy in ly..=uy {
                    for cx in lx..=ux {
                        let center = Vec3::new(
                            (cx * sw) as f32,
                            (cy * sh) as f32,
                            (cz * sd) as f32,
                        ) + half;
                        if tri_box_overlap(center, half, &verts) {
                            let cell = cx as usize
                                + gx as usize * (cy as usize + gy as usize * cz as usize);
                            visit(cell, ti as u32);
                        }
                    }
                }
            }
        }
    }

    /// Rasterize all triangles overlapping one partition of the block at
    /// `(bx, by, bz)` into the `w*h*d` destination slab.
    #[allow(clippy::too_many_arguments)]
    fn rasterize_partition(
        &self,
        dst: SharedMut<u32>,
        counts: SharedMut<u8>,
        bx: u32,
        by: u32,
        bz: u32,
        w: u32,
        h: u32,
        d: u32,
        part: (u32, u32, u32),
    ) {
        let (sw, sh, sd) = self.sub;
        let (gx, gy, _) = self.grid;

        // Partition bounds in absolute voxel coordinates, clamped to the
        // filled extent of the block
        let x0 = bx + part.0 * sw;
        let y0 = by + part.1 * sh;
        let z0 = bz + part.2 * sd;
        let x1 = (x0 + sw).min(bx + w);
        let y1 = (y0 + sh).min(by + h);
        let z1 = (z0 + sd).min(bz + d);
        if x0 >= x1 || y0 >= y1 || z0 >= z1 {
            return;
        }

        let cell = (x0 / sw) as usize + gx as usize * ((y0 / sh) as usize + gy as usize * (z0 / sd) as usize);
        let list = &self.lists[self.offsets[cell] as usize..self.offsets[cell + 1] as usize];

        let half = Vec3::splat(0.5);
        for &ti in list {
            let tri = &self.tris[ti as usize];
            let verts = [tri.verts[0].pos, tri.verts[1].pos, tri.verts[2].pos];

            let lx = (tri.lower.x as u32).max(x0);
            let ly = (tri.lower.y as u32).max(y0);
            let lz = (tri.lower.z as u32).max(z0);
            let ux = (tri.upper.x as u32 + 1).min(x1);
            let uy = (tri.upper.y as u32 + 1).min(y1);
            let uz = (tri.upper.z as u32 + 1).min(z1);

            for vz in lz..uz {
                for vy in ly..uy {
                    for vx in lx..ux {
                        let center = Vec3::new(vx as f32 + 0.5, vy as f32 + 0.5, vz as f32 + 0.5);
                        if !tri_box_overlap(center, half, &verts) {
                            continue;
                        }

                        let lambda = tri.barycentric(center);
                        let mut normal = tri.verts[0].normal * lambda.x
                            + tri.verts[1].normal * lambda.y
                            + tri.verts[2].normal * lambda.z;
                        if normal.length_squared() >= DEGENERATE_NORMAL {
                            normal = normal.normalize();
                        }
                        let color = tri.verts[0].color * lambda.x
                            + tri.verts[1].color * lambda.y
                            + tri.verts[2].color * lambda.z;
                        let shade = shade_from_color(color);

                        let idx = (vx - bx) as usize
                            + w as usize * ((vy - by) as usize + h as usize * (vz - bz) as usize);
                        // SAFETY: partitions cover disjoint voxel ranges
                        unsafe {
                            merge_sample(dst.0.add(idx), counts.0.add(idx), normal, shade);
                        }
                    }
                }
            }
        }
    }

    /// Rasterize every triangle overlapping the block at `(x, y, z)` into
    /// `dst` (`w*h*d` words, x fastest), one pool task per partition.
    pub fn process_block(
        &self,
        dst: &mut [u32],
        x: u32,
        y: u32,
        z: u32,
        w: u32,
        h: u32,
        d: u32,
    ) -> Result<()> {
        debug_assert_eq!(dst.len(), (w as usize) * (h as usize) * (d as usize));
        debug_assert!(x % self.sub.0 == 0 && y % self.sub.1 == 0 && z % self.sub.2 == 0);

        let mut counts = vec![0u8; dst.len()];
        let parts = self.partitions;
        let num_tasks = parts.0 * parts.1 * parts.2;

        let dst_ptr = SharedMut(dst.as_mut_ptr());
        let counts_ptr = SharedMut(counts.as_mut_ptr());

        self.pool.parallel_for(num_tasks, move |p, _count, _thread| {
            let part = (p % parts.0, (p / parts.0) % parts.1, p / (parts.0 * parts.1));
            self.rasterize_partition(dst_ptr, counts_ptr, x, y, z, w, h, d, part);
        })
    }
}

/// Merge one surface sample into a cell with an online mean weighted by the
/// saturating per-cell sample count.
unsafe fn merge_sample(word: *mut u32, count: *mut u8, normal: Vec3, shade: f32) {
    let c = *count;
    if c == 0 {
        *word = compress_material(normal, shade);
        *count = 1;
        return;
    }

    let (old_normal, old_shade) = decompress_material(*word);
    let alpha = c as f32 / (c as f32 + 1.0);
    let mut merged = old_normal * alpha + normal * (1.0 - alpha);
    if merged.length_squared() < DEGENERATE_NORMAL {
        merged = old_normal;
    }
    let merged_shade = old_shade * alpha + shade * (1.0 - alpha);

    *word = compress_material(merged, merged_shade);
    *count = c.saturating_add(1);
}

impl VoxelSource for MeshVoxelizer {
    fn dims(&self) -> (u32, u32, u32) {
        (self.w, self.h, self.d)
    }

    fn begin_blocks(&mut self, block_w: u32, block_h: u32, block_d: u32) -> Result<()> {
        let workers = self.pool.thread_count().max(1);
        self.partitions = Self::choose_partitions((block_w, block_h, block_d), workers);
        self.sub = (
            block_w / self.partitions.0,
            block_h / self.partitions.1,
            block_d / self.partitions.2,
        );
        self.grid = (
            self.w.div_ceil(self.sub.0),
            self.h.div_ceil(self.sub.1),
            self.d.div_ceil(self.sub.2),
        );

        // Two-pass CSR: count, prefix-sum, fill
        let cells = self.grid.0 as usize * self.grid.1 as usize * self.grid.2 as usize;
        let mut counts = vec![0u32; cells];
        self.visit_macrocells(|cell, _tri| counts[cell] += 1);

        let mut offsets = vec![0u32; cells + 1];
        for i in 0..cells {
            offsets[i + 1] = offsets[i] + counts[i];
        }

        let mut lists = vec![0u32; offsets[cells] as usize];
        let mut cursor = offsets.clone();
        self.visit_macrocells(|cell, tri| {
            lists[cursor[cell] as usize] = tri;
            cursor[cell] += 1;
        });

        log::debug!(
            "macrocell index: {}x{}x{} cells of {}x{}x{}, {} triangle refs",
            self.grid.0, self.grid.1, self.grid.2,
            self.sub.0, self.sub.1, self.sub.2,
            lists.len()
        );

        self.offsets = offsets;
        self.lists = lists;
        Ok(())
    }

    fn fill_block(
        &mut self,
        dst: &mut [u32],
        x: u32,
        y: u32,
        z: u32,
        w: u32,
        h: u32,
        d: u32,
    ) -> Result<()> {
        self.process_block(dst, x, y, z, w, h, d)
    }

    fn block_empty(&mut self, x: u32, y: u32, z: u32) -> Result<bool> {
        let (sw, sh, sd) = self.sub;
        let (gx, gy, gz) = self.grid;
        let (pw, ph, pd) = self.partitions;

        let cx0 = x / sw;
        let cy0 = y / sh;
        let cz0 = z / sd;
        for cz in cz0..(cz0 + pd).min(gz) {
            for cy in cy0..(cy0 + ph).min(gy) {
                for cx in cx0..(cx0 + pw).min(gx) {
                    let cell = cx as usize + gx as usize * (cy as usize + gy as usize * cz as usize);
                    if self.offsets[cell] != self.offsets[cell + 1] {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Vertex;

    /// A single big triangle near z = 0 spanning the lower-left half of the
    /// unit square
    fn floor_mesh() -> Mesh {
        let white = Vec3::splat(255.0);
        let tri = Triangle::new(
            Vertex::new(Vec3::new(0.0, 0.0, 0.05), Vec3::Z, white),
            Vertex::new(Vec3::new(1.0, 0.0, 0.05), Vec3::Z, white),
            Vertex::new(Vec3::new(0.0, 1.0, 0.05), Vec3::Z, white),
        );
        Mesh {
            tris: vec![tri],
            lower: Vec3::ZERO,
            upper: Vec3::ONE,
        }
    }

    fn voxelize(mesh: &Mesh, resolution: u32) -> (MeshVoxelizer, Vec<u32>) {
        let pool = Arc::new(ThreadPool::new(2));
        let mut voxelizer = MeshVoxelizer::from_mesh(mesh, resolution, pool);
        let (w, h, d) = voxelizer.dims();
        voxelizer.begin_blocks(w, h, d).unwrap();

        let mut dst = vec![0u32; (w * h * d) as usize];
        voxelizer
            .fill_block(&mut dst, 0, 0, 0, w, h, d)
            .unwrap();
        (voxelizer, dst)
    }

    #[test]
    fn test_floor_triangle_rasterizes() {
        let (voxelizer, dst) = voxelize(&floor_mesh(), 8);
        let (w, h, _) = voxelizer.dims();

        // Voxel (0, 0, 0) center projects inside the triangle
        let near = dst[0];
        assert_ne!(near, 0);
        let (n, shade) = decompress_material(near);
        assert!(n.dot(Vec3::Z) > 0.95, "normal {:?}", n);
        assert!((shade - 1.0).abs() < 0.02);

        // Opposite corner of the square is outside the triangle
        let far = dst[(w - 1 + w * (h - 1)) as usize];
        assert_eq!(far, 0);
    }

    #[test]
    fn test_block_empty_matches_contents() {
        let mesh = floor_mesh();
        let pool = Arc::new(ThreadPool::new(2));
        let mut voxelizer = MeshVoxelizer::from_mesh(&mesh, 8, pool);
        voxelizer.begin_blocks(4, 4, 4).unwrap();

        assert!(!voxelizer.block_empty(0, 0, 0).unwrap());
        // The triangle sits near z = 0; the top half of the volume is empty
        assert!(voxelizer.block_empty(0, 0, 4).unwrap());
    }

    #[test]
    fn test_overlapping_samples_blend_shade() {
        // Two coincident triangles with different colors: the cell mean
        // must land strictly between the two shades.
        let dark = Vec3::splat(0.0);
        let light = Vec3::splat(255.0);
        let t0 = Triangle::new(
            Vertex::new(Vec3::new(0.0, 0.0, 0.05), Vec3::Z, dark),
            Vertex::new(Vec3::new(1.0, 0.0, 0.05), Vec3::Z, dark),
            Vertex::new(Vec3::new(0.0, 1.0, 0.05), Vec3::Z, dark),
        );
        let t1 = Triangle::new(
            Vertex::new(Vec3::new(0.0, 0.0, 0.05), Vec3::Z, light),
            Vertex::new(Vec3::new(1.0, 0.0, 0.05), Vec3::Z, light),
            Vertex::new(Vec3::new(0.0, 1.0, 0.05), Vec3::Z, light),
        );
        let mesh = Mesh {
            tris: vec![t0, t1],
            lower: Vec3::ZERO,
            upper: Vec3::ONE,
        };

        let (_voxelizer, dst) = voxelize(&mesh, 4);
        let (_, shade) = decompress_material(dst[0]);
        assert!(shade > 0.25 && shade < 0.75, "shade {}", shade);
    }

    #[test]
    fn test_partition_choice_covers_workers() {
        let parts = MeshVoxelizer::choose_partitions((16, 16, 16), 8);
        assert!(parts.0 * parts.1 * parts.2 >= 8);
        // Degenerate block cannot be split further
        let tiny = MeshVoxelizer::choose_partitions((1, 1, 1), 8);
        assert_eq!(tiny, (1, 1, 1));
    }
}
