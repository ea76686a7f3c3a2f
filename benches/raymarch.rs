//! Raymarch micro-benchmark over a procedurally filled octree

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use glam::Vec3;

use voxmarch::core::types::Result;
use voxmarch::octree::build_octree;
use voxmarch::thread::ThreadPool;
use voxmarch::voxel::material::compress_material;
use voxmarch::voxel::{VoxelData, VoxelSource};

/// Dense procedural source: a solid sphere centered in the volume
struct SphereSource {
    size: u32,
}

impl VoxelSource for SphereSource {
    fn dims(&self) -> (u32, u32, u32) {
        (self.size, self.size, self.size)
    }

    fn begin_blocks(&mut self, _w: u32, _h: u32, _d: u32) -> Result<()> {
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
        let center = self.size as f32 * 0.5;
        let radius = self.size as f32 * 0.4;
        for zz in 0..d {
            for yy in 0..h {
                for xx in 0..w {
                    let p = Vec3::new(
                        (x + xx) as f32 + 0.5 - center,
                        (y + yy) as f32 + 0.5 - center,
                        (z + zz) as f32 + 0.5 - center,
                    );
                    if p.length() <= radius {
                        let n = p.normalize_or(Vec3::X);
                        dst[(xx + w * (yy + h * zz)) as usize] = compress_material(n, 0.8);
                    }
                }
            }
        }
        Ok(())
    }

    fn block_empty(&mut self, _x: u32, _y: u32, _z: u32) -> Result<bool> {
        Ok(false)
    }
}

fn bench_raymarch(c: &mut Criterion) {
    let pool = Arc::new(ThreadPool::new(4));
    let mut voxels = VoxelData::new(SphereSource { size: 64 }, 1 << 26, pool).unwrap();
    let tree = build_octree(&mut voxels).unwrap();

    c.bench_function("raymarch_sphere64_hit", |b| {
        let origin = Vec3::new(-0.5, 1.5, 1.5);
        b.iter(|| black_box(tree.raymarch(black_box(origin), Vec3::X, 0.0)))
    });

    c.bench_function("raymarch_sphere64_miss", |b| {
        let origin = Vec3::new(-0.5, 1.01, 1.01);
        b.iter(|| black_box(tree.raymarch(black_box(origin), Vec3::X, 0.0)))
    });
}

criterion_group!(benches, bench_raymarch);
criterion_main!(benches);
