//! Occupancy oracle over a block-streamed dense volume
//!
//! Keeps one memory-bounded cache block of the volume resident plus a
//! two-tier occupancy pyramid: the top tier covers the whole virtual volume
//! at cache-block granularity and coarser, the low tier covers the resident
//! block down to 2-voxel cells. `cube_contains_voxels` answers in O(1);
//! streaming cost is paid at block relocation.

use std::sync::Arc;

use crate::core::error::Error;
use crate::core::types::{Result, Vec3};
use crate::thread::pool::SharedMut;
use crate::thread::ThreadPool;
use crate::voxel::VoxelSource;

/// Pyramid levels of `(1 << l)^3` cells or more per axis are upsampled in
/// parallel over z
const PARALLEL_LEVEL: u32 = 8;

/// Occupancy pyramid. Level `l` has `(1 << l)^3` single-byte cells indexed
/// `x + (y << l) + (z << 2l)`; level 0 is a single cell.
struct Pyramid {
    levels: Vec<Vec<u8>>,
}

impl Pyramid {
    fn new(level_count: u32) -> Self {
        Self {
            levels: (0..level_count).map(|l| vec![0u8; 1usize << (3 * l)]).collect(),
        }
    }

    /// Total cell bytes for a pyramid of `level_count` levels
    fn bytes(level_count: u32) -> u64 {
        (0..level_count).map(|l| 1u64 << (3 * l)).sum()
    }

    #[inline]
    fn index(level: u32, x: u32, y: u32, z: u32) -> usize {
        x as usize + ((y as usize) << level) + ((z as usize) << (2 * level))
    }

    #[inline]
    fn get(&self, level: u32, x: u32, y: u32, z: u32) -> u8 {
        self.levels[level as usize][Self::index(level, x, y, z)]
    }

    #[inline]
    fn set(&mut self, level: u32, x: u32, y: u32, z: u32, value: u8) {
        self.levels[level as usize][Self::index(level, x, y, z)] = value;
    }

    fn clear(&mut self) {
        for level in &mut self.levels {
            level.fill(0);
        }
    }

    /// OR-upsample level `level` from level `level + 1`
    fn upsample(&mut self, level: u32, pool: &ThreadPool) -> Result<()> {
        let (head, tail) = self.levels.split_at_mut(level as usize + 1);
        let coarse = head[level as usize].as_mut_slice();
        let fine = tail[0].as_slice();
        let size = 1u32 << level;

        let fill_cell = |x: u32, y: u32, z: u32| -> u8 {
            let mut value = 0;
            for dz in 0..2 {
                for dy in 0..2 {
                    for dx in 0..2 {
                        value |= fine[Self::index(level + 1, 2 * x + dx, 2 * y + dy, 2 * z + dz)];
                    }
                }
            }
            (value != 0) as u8
        };

        if level >= PARALLEL_LEVEL {
            let coarse_ptr = SharedMut(coarse.as_mut_ptr());
            pool.parallel_for(size, move |z, _count, _thread| {
                let coarse_ptr = coarse_ptr;
                for y in 0..size {
                    for x in 0..size {
                        // SAFETY: each task writes only its own z slice
                        unsafe {
                            *coarse_ptr.0.add(Self::index(level, x, y, z)) = fill_cell(x, y, z);
                        }
                    }
                }
            })
        } else {
            for z in 0..size {
                for y in 0..size {
                    for x in 0..size {
                        coarse[Self::index(level, x, y, z)] = fill_cell(x, y, z);
                    }
                }
            }
            Ok(())
        }
    }
}

/// Occupancy oracle and cache block over a [`VoxelSource`]
pub struct VoxelData<S: VoxelSource> {
    source: S,
    pool: Arc<ThreadPool>,

    w: u32,
    h: u32,
    d: u32,
    high_bit: u32,

    low_levels: u32,
    max_cacheable_size: u32,

    top: Pyramid,
    low: Pyramid,

    cache: Vec<u32>,
    buf_x: u32,
    buf_y: u32,
    buf_z: u32,
    buf_w: u32,
    buf_h: u32,
    buf_d: u32,
    buf_valid: bool,
}

impl<S: VoxelSource> VoxelData<S> {
    /// Fit the two-tier pyramid and cache block into `mem_budget` bytes and
    /// build the top pyramid by probing the source block by block.
    pub fn new(mut source: S, mem_budget: u64, pool: Arc<ThreadPool>) -> Result<Self> {
        let (w, h, d) = source.dims();
        let side = w.max(h).max(d).next_power_of_two();
        let high_bit = side.trailing_zeros();

        let cost = |low_levels: u32| -> u64 {
            let top_levels = high_bit - low_levels + 1;
            Pyramid::bytes(top_levels) + Pyramid::bytes(low_levels) + 4 * (1u64 << (3 * low_levels))
        };

        // Cost is not monotonic in low_levels (shrinking the cache grows the
        // top pyramid), so the reported minimum spans all candidates. Blocks
        // must hold at least a 2^3 leaf-parent region, hence the floor of 1.
        let low_levels = (1..=high_bit)
            .rev()
            .find(|&candidate| cost(candidate) <= mem_budget)
            .ok_or_else(|| Error::OutOfBudget {
                smallest_required: (1..=high_bit).map(cost).min().unwrap_or(0),
            })?;

        let max_cacheable_size = 1u32 << low_levels;
        let top_levels = high_bit - low_levels + 1;
        log::info!(
            "voxel cache: {0}x{0}x{0} block, {1} low levels, {2} top levels ({3} KiB budget used)",
            max_cacheable_size,
            low_levels,
            top_levels,
            cost(low_levels) / 1024
        );

        source.begin_blocks(max_cacheable_size, max_cacheable_size, max_cacheable_size)?;

        let mut data = Self {
            source,
            pool,
            w,
            h,
            d,
            high_bit,
            low_levels,
            max_cacheable_size,
            top: Pyramid::new(top_levels),
            low: Pyramid::new(low_levels),
            cache: vec![0u32; 1usize << (3 * low_levels)],
            buf_x: 0,
            buf_y: 0,
            buf_z: 0,
            buf_w: 0,
            buf_h: 0,
            buf_d: 0,
            buf_valid: false,
        };
        data.build_top_pyramid()?;
        Ok(data)
    }

    /// Side length of the virtual (power-of-two cubed) volume
    pub fn side_length(&self) -> u32 {
        1 << self.high_bit
    }

    /// True volume dimensions
    pub fn dims(&self) -> (u32, u32, u32) {
        (self.w, self.h, self.d)
    }

    pub fn max_cacheable_size(&self) -> u32 {
        self.max_cacheable_size
    }

    /// Volume center in octree-normalized units
    pub fn center(&self) -> Vec3 {
        Vec3::new(self.w as f32, self.h as f32, self.d as f32) / (2.0 * self.side_length() as f32)
    }

    fn top_levels(&self) -> u32 {
        self.high_bit - self.low_levels + 1
    }

    fn build_top_pyramid(&mut self) -> Result<()> {
        let finest = self.top_levels() - 1;
        let mcs = self.max_cacheable_size;

        // Blocks beyond the true dimensions stay empty
        let mut bz = 0;
        while bz < self.d {
            let mut by = 0;
            while by < self.h {
                let mut bx = 0;
                while bx < self.w {
                    if !self.source.block_empty(bx, by, bz)? {
                        self.top.set(finest, bx / mcs, by / mcs, bz / mcs, 1);
                    }
                    bx += mcs;
                }
                by += mcs;
            }
            bz += mcs;
        }

        for level in (0..finest).rev() {
            self.top.upsample(level, &self.pool)?;
        }
        Ok(())
    }

    /// Relocate the cache block so the cube `(x, y, z, size)` is resident.
    /// No-op when the cube is already cached or larger than a block.
    pub fn prepare_data_access(&mut self, x: u32, y: u32, z: u32, size: u32) -> Result<()> {
        if size > self.max_cacheable_size || x >= self.w || y >= self.h || z >= self.d {
            return Ok(());
        }
        if self.buf_valid
            && x >= self.buf_x
            && y >= self.buf_y
            && z >= self.buf_z
            && x + size <= self.buf_x + self.buf_w
            && y + size <= self.buf_y + self.buf_h
            && z + size <= self.buf_z + self.buf_d
        {
            return Ok(());
        }

        let w = size.min(self.w - x);
        let h = size.min(self.h - y);
        let d = size.min(self.d - z);

        let words = (w as usize) * (h as usize) * (d as usize);
        self.cache[..words].fill(0);
        self.source.fill_block(&mut self.cache[..words], x, y, z, w, h, d)?;

        self.buf_x = x;
        self.buf_y = y;
        self.buf_z = z;
        self.buf_w = w;
        self.buf_h = h;
        self.buf_d = d;
        self.buf_valid = true;

        log::debug!("cache block -> ({}, {}, {}) {}x{}x{}", x, y, z, w, h, d);
        self.rebuild_low_pyramid()
    }

    /// Rebuild the within-block pyramid from the cache contents
    fn rebuild_low_pyramid(&mut self) -> Result<()> {
        if self.low_levels == 0 {
            return Ok(());
        }
        self.low.clear();
        let finest = self.low_levels - 1;

        let cx_count = self.buf_w.div_ceil(2);
        let cy_count = self.buf_h.div_ceil(2);
        let cz_count = self.buf_d.div_ceil(2);

        {
            let level_ptr = SharedMut(self.low.levels[finest as usize].as_mut_ptr());
            let cache = &self.cache;
            let (bw, bh, bd) = (self.buf_w, self.buf_h, self.buf_d);

            self.pool.parallel_for(cz_count, move |cz, _count, _thread| {
                let level_ptr = level_ptr;
                for cy in 0..cy_count {
                    for cx in 0..cx_count {
                        let mut occupied = 0u8;
                        for vz in (2 * cz)..(2 * cz + 2).min(bd) {
                            for vy in (2 * cy)..(2 * cy + 2).min(bh) {
                                for vx in (2 * cx)..(2 * cx + 2).min(bw) {
                                    let idx = vx as usize
                                        + bw as usize * (vy as usize + bh as usize * vz as usize);
                                    if cache[idx] != 0 {
                                        occupied = 1;
                                    }
                                }
                            }
                        }
                        // SAFETY: each task writes only its own z slice
                        unsafe {
                            *level_ptr.0.add(Pyramid::index(finest, cx, cy, cz)) = occupied;
                        }
                    }
                }
            })?;
        }

        for level in (0..finest).rev() {
            self.low.upsample(level, &self.pool)?;
        }
        Ok(())
    }

    fn cached_voxel(&self, x: u32, y: u32, z: u32) -> u32 {
        if !self.buf_valid
            || x < self.buf_x
            || y < self.buf_y
            || z < self.buf_z
            || x >= self.buf_x + self.buf_w
            || y >= self.buf_y + self.buf_h
            || z >= self.buf_z + self.buf_d
        {
            return 0;
        }
        let idx = (x - self.buf_x) as usize
            + self.buf_w as usize
                * ((y - self.buf_y) as usize + self.buf_h as usize * (z - self.buf_z) as usize);
        self.cache[idx]
    }

    /// Read a cached material word and clear it, so revisits see emptiness
    pub fn voxel_destructive(&mut self, x: u32, y: u32, z: u32) -> u32 {
        let word = self.cached_voxel(x, y, z);
        if word != 0 {
            let idx = (x - self.buf_x) as usize
                + self.buf_w as usize
                    * ((y - self.buf_y) as usize + self.buf_h as usize * (z - self.buf_z) as usize);
            self.cache[idx] = 0;
        }
        word
    }

    /// Does the cube `(x, y, z, size)` contain any voxel? `size` must be a
    /// power of two; cubes smaller than a block must be resident (see
    /// [`VoxelData::prepare_data_access`]).
    pub fn cube_contains_voxels(&self, x: u32, y: u32, z: u32, size: u32) -> bool {
        match self.classify(x, y, z, size) {
            Cell::Outside => false,
            Cell::Voxel => self.cached_voxel(x, y, z) != 0,
            Cell::Low(level, cx, cy, cz) => self.low.get(level, cx, cy, cz) != 0,
            Cell::Top(level, cx, cy, cz) => self.top.get(level, cx, cy, cz) != 0,
        }
    }

    /// Like [`VoxelData::cube_contains_voxels`], but clears the low-pyramid
    /// cell it reads: a second visit of the same subcube reports empty. The
    /// top pyramid is never cleared.
    pub fn cube_contains_voxels_destructive(&mut self, x: u32, y: u32, z: u32, size: u32) -> bool {
        match self.classify(x, y, z, size) {
            Cell::Outside => false,
            Cell::Voxel => self.cached_voxel(x, y, z) != 0,
            Cell::Low(level, cx, cy, cz) => {
                let cell = self.low.get(level, cx, cy, cz);
                self.low.set(level, cx, cy, cz, 0);
                cell != 0
            }
            Cell::Top(level, cx, cy, cz) => self.top.get(level, cx, cy, cz) != 0,
        }
    }

    fn classify(&self, x: u32, y: u32, z: u32, size: u32) -> Cell {
        if x >= self.w || y >= self.h || z >= self.d {
            return Cell::Outside;
        }
        if size == 1 {
            return Cell::Voxel;
        }

        let bit = size.trailing_zeros();
        if bit < self.low_levels {
            debug_assert!(self.buf_valid, "low-pyramid query without resident block");
            let level = self.low_levels - bit;
            Cell::Low(
                level,
                (x - self.buf_x) >> bit,
                (y - self.buf_y) >> bit,
                (z - self.buf_z) >> bit,
            )
        } else {
            let level = self.high_bit - bit;
            Cell::Top(level, x >> bit, y >> bit, z >> bit)
        }
    }

    #[cfg(test)]
    fn low_cell(&self, level: u32, x: u32, y: u32, z: u32) -> u8 {
        self.low.get(level, x, y, z)
    }
}

enum Cell {
    Outside,
    Voxel,
    Low(u32, u32, u32, u32),
    Top(u32, u32, u32, u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory voxel source for oracle tests
    struct MemSource {
        w: u32,
        h: u32,
        d: u32,
        words: Vec<u32>,
        block: u32,
    }

    impl MemSource {
        fn new(w: u32, h: u32, d: u32) -> Self {
            Self {
                w,
                h,
                d,
                words: vec![0; (w * h * d) as usize],
                block: 0,
            }
        }

        fn set(&mut self, x: u32, y: u32, z: u32, word: u32) {
            let idx = (x + self.w * (y + self.h * z)) as usize;
            self.words[idx] = word;
        }

        fn get(&self, x: u32, y: u32, z: u32) -> u32 {
            self.words[(x + self.w * (y + self.h * z)) as usize]
        }
    }

    impl VoxelSource for MemSource {
        fn dims(&self) -> (u32, u32, u32) {
            (self.w, self.h, self.d)
        }

        fn begin_blocks(&mut self, block_w: u32, _block_h: u32, _block_d: u32) -> Result<()> {
            self.block = block_w;
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
            for zz in 0..d {
                for yy in 0..h {
                    for xx in 0..w {
                        dst[(xx + w * (yy + h * zz)) as usize] = self.get(x + xx, y + yy, z + zz);
                    }
                }
            }
            Ok(())
        }

        fn block_empty(&mut self, x: u32, y: u32, z: u32) -> Result<bool> {
            let b = self.block;
            for zz in z..(z + b).min(self.d) {
                for yy in y..(y + b).min(self.h) {
                    for xx in x..(x + b).min(self.w) {
                        if self.get(xx, yy, zz) != 0 {
                            return Ok(false);
                        }
                    }
                }
            }
            Ok(true)
        }
    }

    fn pool() -> Arc<ThreadPool> {
        Arc::new(ThreadPool::new(2))
    }

    #[test]
    fn test_low_pyramid_bottom_up_single_voxel() {
        let mut source = MemSource::new(4, 4, 4);
        source.set(0, 0, 0, 0xDEAD);

        // Budget fits everything: the whole volume is one cache block
        let mut data = VoxelData::new(source, 1 << 20, pool()).unwrap();
        assert_eq!(data.max_cacheable_size(), 4);

        data.prepare_data_access(0, 0, 0, 4).unwrap();

        assert_eq!(data.low_cell(0, 0, 0, 0), 1);
        for z in 0..2 {
            for y in 0..2 {
                for x in 0..2 {
                    let expected = (x, y, z) == (0, 0, 0);
                    assert_eq!(data.low_cell(1, x, y, z) != 0, expected, "cell {:?}", (x, y, z));
                }
            }
        }
    }

    #[test]
    fn test_queries_match_brute_force() {
        let mut source = MemSource::new(8, 8, 8);
        // A scattering of voxels touching several blocks
        for &(x, y, z) in &[(0, 0, 0), (3, 1, 2), (4, 4, 4), (7, 0, 5), (6, 7, 7)] {
            source.set(x, y, z, 0xBEEF);
        }
        let reference = MemSource {
            w: 8,
            h: 8,
            d: 8,
            words: source.words.clone(),
            block: 0,
        };

        // Small budget forces 4-voxel cache blocks
        let mut data = VoxelData::new(source, 600, pool()).unwrap();
        assert_eq!(data.max_cacheable_size(), 4);

        let brute = |x: u32, y: u32, z: u32, size: u32| -> bool {
            for zz in z..(z + size).min(8) {
                for yy in y..(y + size).min(8) {
                    for xx in x..(x + size).min(8) {
                        if reference.get(xx, yy, zz) != 0 {
                            return true;
                        }
                    }
                }
            }
            false
        };

        // Block-sized and larger cubes come from the top pyramid
        for size in [4u32, 8] {
            for z in (0..8).step_by(size as usize) {
                for y in (0..8).step_by(size as usize) {
                    for x in (0..8).step_by(size as usize) {
                        assert_eq!(
                            data.cube_contains_voxels(x, y, z, size),
                            brute(x, y, z, size),
                            "top query {:?}",
                            (x, y, z, size)
                        );
                    }
                }
            }
        }

        // Within-block cubes need the block resident
        for bz in (0..8).step_by(4) {
            for by in (0..8).step_by(4) {
                for bx in (0..8).step_by(4) {
                    data.prepare_data_access(bx, by, bz, 4).unwrap();
                    for size in [1u32, 2] {
                        for z in (bz..bz + 4).step_by(size as usize) {
                            for y in (by..by + 4).step_by(size as usize) {
                                for x in (bx..bx + 4).step_by(size as usize) {
                                    assert_eq!(
                                        data.cube_contains_voxels(x, y, z, size),
                                        brute(x, y, z, size),
                                        "low query {:?}",
                                        (x, y, z, size)
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_destructive_query_clears_low_cells_only() {
        let mut source = MemSource::new(4, 4, 4);
        source.set(1, 1, 1, 7);

        let mut data = VoxelData::new(source, 1 << 20, pool()).unwrap();
        data.prepare_data_access(0, 0, 0, 4).unwrap();

        assert!(data.cube_contains_voxels_destructive(0, 0, 0, 2));
        // Second visit of the same subcube reports empty
        assert!(!data.cube_contains_voxels_destructive(0, 0, 0, 2));
        // The top pyramid still sees the volume as occupied
        assert!(data.cube_contains_voxels(0, 0, 0, 4));
    }

    #[test]
    fn test_voxel_destructive_clears_cache() {
        let mut source = MemSource::new(4, 4, 4);
        source.set(2, 3, 1, 99);

        let mut data = VoxelData::new(source, 1 << 20, pool()).unwrap();
        data.prepare_data_access(0, 0, 0, 4).unwrap();

        assert_eq!(data.voxel_destructive(2, 3, 1), 99);
        assert_eq!(data.voxel_destructive(2, 3, 1), 0);
        assert!(!data.cube_contains_voxels(2, 3, 1, 1));
    }

    #[test]
    fn test_out_of_bounds_is_empty() {
        let source = MemSource::new(4, 4, 4);
        let data = VoxelData::new(source, 1 << 20, pool()).unwrap();
        assert!(!data.cube_contains_voxels(4, 0, 0, 1));
        assert!(!data.cube_contains_voxels(0, 17, 0, 2));
    }

    #[test]
    fn test_budget_too_small() {
        let source = MemSource::new(8, 8, 8);
        match VoxelData::new(source, 16, pool()) {
            Err(Error::OutOfBudget { smallest_required }) => {
                // Cheapest split for 8^3: two-voxel blocks, a 3-level top
                // pyramid (73 B), a 1-cell low pyramid, and an 8-word cache
                assert_eq!(smallest_required, 73 + 1 + 32);
            }
            other => panic!("expected OutOfBudget, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_center_of_cubic_volume() {
        let source = MemSource::new(8, 8, 8);
        let data = VoxelData::new(source, 1 << 20, pool()).unwrap();
        assert_eq!(data.center(), Vec3::splat(0.5));
    }
}
