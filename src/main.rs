//! Voxmarch CLI
//!
//! Usage:
//!   voxmarch -builder [OPTIONS] <input.ply|input.voxel> <output.oct>
//!   voxmarch -viewer [OPTIONS] <input.oct>
//!   voxmarch -sample [--resolution R] <output.voxel>
//!
//! A `.voxel` input is a dense volume file and skips voxelization; `-sample`
//! generates a procedural dense volume for trying the pipeline without a
//! mesh.
//!
//! Builder options:
//!   --resolution <R>   Voxel resolution along the longest axis, power of
//!                      two (default: 256)
//!   --mode <M>         0 = in-memory, 1 = on-disk via a temporary dense
//!                      voxel file (default: 0)
//!   --mem <BYTES>      Memory budget for the voxel cache and occupancy
//!                      pyramids (default: 536870912)
//!   --threads <N>      Worker threads (default: available parallelism)
//!
//! Viewer options:
//!   --width <W>        Frame width (default: 800)
//!   --height <H>       Frame height (default: 600)
//!   --frames <N>       Frames to render before exiting (default: 1)
//!   --screenshot <P>   Write the last frame as a PPM image
//!   --threads <N>      Render workers (default: available parallelism)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use voxmarch::core::types::{Result, Vec3};
use voxmarch::mesh::Mesh;
use voxmarch::octree::{self, build_octree};
use voxmarch::render::{HeadlessSink, Renderer};
use voxmarch::thread::ThreadPool;
use voxmarch::voxel::{compress_material, volume, MeshVoxelizer, VolumeFile, VoxelData};

fn main() {
    voxmarch::core::logging::init();

    let args: Vec<String> = std::env::args().collect();
    let result = match args.get(1).map(String::as_str) {
        Some("-builder") => build(&args),
        Some("-viewer") => view(&args),
        Some("-sample") => sample(&args),
        _ => {
            usage();
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn usage() {
    eprintln!("usage: voxmarch -builder [--resolution R] [--mode M] [--mem BYTES] [--threads N] <input.ply|input.voxel> <output.oct>");
    eprintln!("       voxmarch -viewer [--width W] [--height H] [--frames N] [--screenshot P] [--threads N] <input.oct>");
    eprintln!("       voxmarch -sample [--resolution R] <output.voxel>");
}

fn build(args: &[String]) -> Result<()> {
    let resolution = parse_u32_arg(args, "--resolution").unwrap_or(256);
    let mode = parse_u32_arg(args, "--mode").unwrap_or(0);
    let mem = parse_u64_arg(args, "--mem").unwrap_or(512 * 1024 * 1024);
    let threads = parse_u32_arg(args, "--threads").unwrap_or_else(default_threads);

    if !resolution.is_power_of_two() || resolution < 2 {
        eprintln!("--resolution must be a power of two >= 2");
        std::process::exit(2);
    }
    if mode > 1 {
        eprintln!("--mode must be 0 (in-memory) or 1 (on-disk)");
        std::process::exit(2);
    }

    let positional = positional_args(args);
    let [input, output] = positional.as_slice() else {
        usage();
        std::process::exit(2);
    };

    let pool = Arc::new(ThreadPool::new(threads));
    let start = Instant::now();

    // Dense volume inputs skip voxelization entirely
    if input.ends_with(".voxel") {
        let file = VolumeFile::open(Path::new(input))?;
        let mut voxels = VoxelData::new(file, mem, pool)?;
        let tree = build_octree(&mut voxels)?;
        log::info!("build finished in {:.1}s", start.elapsed().as_secs_f32());
        return octree::io::save(&tree, Path::new(output));
    }

    let mesh = Mesh::load_ply(Path::new(input))?;
    let mut voxelizer = MeshVoxelizer::from_mesh(&mesh, resolution, Arc::clone(&pool));
    drop(mesh);

    let tree = if mode == 0 {
        let mut voxels = VoxelData::new(voxelizer, mem, pool)?;
        build_octree(&mut voxels)?
    } else {
        let dense_path = PathBuf::from(format!("{}.dense", output));
        volume::write_dense(&dense_path, &mut voxelizer, 32)?;
        drop(voxelizer);

        let file = VolumeFile::open(&dense_path)?;
        let mut voxels = VoxelData::new(file, mem, pool)?;
        let tree = build_octree(&mut voxels)?;
        drop(voxels);

        if let Err(e) = std::fs::remove_file(&dense_path) {
            log::warn!("could not remove {}: {}", dense_path.display(), e);
        }
        tree
    };
    log::info!("build finished in {:.1}s", start.elapsed().as_secs_f32());

    octree::io::save(&tree, Path::new(output))
}

fn view(args: &[String]) -> Result<()> {
    let width = parse_u32_arg(args, "--width").unwrap_or(800) as usize;
    let height = parse_u32_arg(args, "--height").unwrap_or(600) as usize;
    let frames = parse_u32_arg(args, "--frames").unwrap_or(1) as usize;
    let screenshot = parse_str_arg(args, "--screenshot").map(PathBuf::from);
    let threads = parse_u32_arg(args, "--threads").unwrap_or_else(default_threads) as usize;

    let positional = positional_args(args);
    let [input] = positional.as_slice() else {
        usage();
        std::process::exit(2);
    };

    let tree = octree::io::load(Path::new(input))?;
    let renderer = Renderer::new(tree, width, height, threads);
    renderer.run(Box::new(HeadlessSink::new(frames.max(1), screenshot)))
}

/// Generate a procedural dense volume: a thresholded sine-product blob with
/// gradient normals, enough to exercise the builder and viewer without a
/// mesh.
fn sample(args: &[String]) -> Result<()> {
    let resolution = parse_u32_arg(args, "--resolution").unwrap_or(128);

    let positional = positional_args(args);
    let [output] = positional.as_slice() else {
        usage();
        std::process::exit(2);
    };

    let r = resolution;
    let field = |x: f32, y: f32, z: f32| (x * 0.1).sin() * (y * 0.1).sin() * (z * 0.1).sin();

    let mut words = vec![0u32; (r as usize).pow(3)];
    for z in 0..r {
        for y in 0..r {
            for x in 0..r {
                let (fx, fy, fz) = (x as f32 + 0.5, y as f32 + 0.5, z as f32 + 0.5);
                let f = field(fx, fy, fz);
                if f < 0.4 {
                    continue;
                }

                let step = 1.0;
                let gradient = Vec3::new(
                    field(fx + step, fy, fz) - field(fx - step, fy, fz),
                    field(fx, fy + step, fz) - field(fx, fy - step, fz),
                    field(fx, fy, fz + step) - field(fx, fy, fz - step),
                );
                let normal = (-gradient).normalize_or(Vec3::Y);
                let shade = 0.5 + 0.5 * (f - 0.4) / 0.6;

                let idx = (x + r * (y + r * z)) as usize;
                words[idx] = compress_material(normal, shade);
            }
        }
    }

    volume::write_raw(Path::new(output), r, r, r, &words)
}

fn default_threads() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
}

/// Flags that consume a value; everything else after the mode flag is
/// positional
const VALUE_FLAGS: [&str; 8] = [
    "--resolution",
    "--mode",
    "--mem",
    "--threads",
    "--width",
    "--height",
    "--frames",
    "--screenshot",
];

fn positional_args(args: &[String]) -> Vec<String> {
    let mut positional = Vec::new();
    let mut i = 2;
    while i < args.len() {
        let arg = &args[i];
        if VALUE_FLAGS.contains(&arg.as_str()) {
            i += 2;
        } else if arg.starts_with('-') {
            i += 1;
        } else {
            positional.push(arg.clone());
            i += 1;
        }
    }
    positional
}

fn parse_str_arg(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_u32_arg(args: &[String], name: &str) -> Option<u32> {
    parse_str_arg(args, name).and_then(|v| v.parse().ok())
}

fn parse_u64_arg(args: &[String], name: &str) -> Option<u64> {
    parse_str_arg(args, name).and_then(|v| v.parse().ok())
}
