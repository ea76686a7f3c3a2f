//! Multithreaded CPU tile renderer
//!
//! The image is split into an 8-pixel tile grid; each worker owns a
//! horizontal band of tile rows. Per frame a worker first marches one
//! coarse ray per tile corner into a local depth grid, then refines the
//! pixels of tiles whose corners hit, starting each refined ray just in
//! front of the closest corner hit. Frames are fenced by the two-phase
//! barrier; worker 0 presents the frame, polls input, and updates the
//! matrices while the others wait at the next frame's entry.

use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::core::time::FrameTimer;
use crate::core::types::{Mat4, Result, Vec3, Vec4};
use crate::math::{MatrixStack, Stack};
use crate::octree::VoxelOctree;
use crate::render::framebuffer::FramebufferSink;
use crate::thread::pool::SharedMut;
use crate::thread::RenderBarrier;
use crate::voxel::decompress_material;

const TILE_SIZE: usize = 8;
/// Refined rays start this far in front of the coarse depth
const REFINE_EPSILON: f32 = 1e-3;
const DRAG_SENSITIVITY: f32 = 0.01;
const ZOOM_SENSITIVITY: f32 = 0.02;
const MIN_RADIUS: f32 = 0.5;
const MAX_RADIUS: f32 = 25.0;

/// Per-frame camera snapshot shared with all workers
#[derive(Clone, Copy)]
struct FrameState {
    /// Inverse modelview; rotation part transforms ray directions
    transform: Mat4,
    /// Camera position in octree coordinates
    origin: Vec3,
    light: Vec3,
    /// Render one pixel per 3x3 block
    half_size: bool,
}

struct RenderShared<'a> {
    tree: &'a VoxelOctree,
    barrier: RenderBarrier,
    terminate: AtomicBool,
    frame: Mutex<FrameState>,
}

pub struct Renderer {
    tree: VoxelOctree,
    width: usize,
    height: usize,
    num_threads: usize,
}

impl Renderer {
    pub fn new(tree: VoxelOctree, width: usize, height: usize, num_threads: usize) -> Self {
        Self {
            tree,
            width,
            height,
            num_threads: num_threads.max(1),
        }
    }

    /// Run the render loop until the sink requests termination
    pub fn run(self, sink: Box<dyn FramebufferSink + Send>) -> Result<()> {
        let width = self.width;
        let height = self.height;
        let tiles_x = width.div_ceil(TILE_SIZE);
        let tiles_y = height.div_ceil(TILE_SIZE);
        let num_threads = self.num_threads.min(tiles_y);

        // The model sits at the origin; the octree cube starts at 1
        let model_offset = Vec3::ONE + self.tree.center();

        let mut stacks = MatrixStack::new();
        stacks.set(Stack::View, Mat4::from_translation(Vec3::new(0.0, 0.0, -2.0)));

        let initial = Self::frame_state(&stacks, model_offset, false);
        let shared = RenderShared {
            tree: &self.tree,
            barrier: RenderBarrier::new(num_threads),
            terminate: AtomicBool::new(false),
            frame: Mutex::new(initial),
        };

        let mut framebuffer = vec![0u32; width * height];
        let fb = SharedMut(framebuffer.as_mut_ptr());
        let fb_len = framebuffer.len();

        log::info!(
            "rendering {}x{} with {} workers ({} tile rows)",
            width, height, num_threads, tiles_y
        );

        let stride = tiles_y.div_ceil(num_threads);
        std::thread::scope(|scope| {
            let shared = &shared;
            let mut sink = sink;
            let mut stacks = stacks;

            for worker in 1..num_threads {
                let band = (worker * stride, ((worker + 1) * stride).min(tiles_y));
                scope.spawn(move || {
                    while !shared.terminate.load(Ordering::Acquire) {
                        shared.barrier.wait_pre();
                        let frame = *shared.frame.lock().unwrap();
                        render_band(shared.tree, &frame, fb, width, height, band);
                        shared.barrier.wait_post();
                    }
                });
            }

            // Worker 0: first band, presentation, input, matrices
            let band = (0, stride.min(tiles_y));
            let mut timer = FrameTimer::new();
            let mut radius = 2.0f32;

            while !shared.terminate.load(Ordering::Acquire) {
                shared.barrier.wait_pre();
                let frame = *shared.frame.lock().unwrap();
                render_band(shared.tree, &frame, fb, width, height, band);
                shared.barrier.wait_post();

                timer.tick();
                if timer.frame_count() % 32 == 0 {
                    log::debug!("{:.1} fps", timer.fps());
                }

                // All bands are fenced by wait_post; the buffer is stable
                // until the workers pass the next wait_pre, which needs us
                let pixels = unsafe { std::slice::from_raw_parts(fb.0, fb_len) };
                let input = sink.present(pixels, width, height);

                if input.quit {
                    shared.terminate.store(true, Ordering::Release);
                    shared.barrier.release_all();
                    break;
                }

                if input.button0 {
                    let yaw = input.mouse_dx * DRAG_SENSITIVITY;
                    let pitch = -input.mouse_dy * DRAG_SENSITIVITY;
                    stacks.mul_r(
                        Stack::Model,
                        Mat4::from_rotation_y(yaw) * Mat4::from_rotation_x(pitch),
                    );
                }
                if input.button1 {
                    radius = (radius + input.mouse_dy * ZOOM_SENSITIVITY)
                        .clamp(MIN_RADIUS, MAX_RADIUS);
                    stacks.set(
                        Stack::View,
                        Mat4::from_translation(Vec3::new(0.0, 0.0, -radius)),
                    );
                }

                let half_size = input.button0 || input.button1;
                *shared.frame.lock().unwrap() =
                    Self::frame_state(&stacks, model_offset, half_size);
            }
        });

        Ok(())
    }

    fn frame_state(stacks: &MatrixStack, model_offset: Vec3, half_size: bool) -> FrameState {
        let transform = stacks.get(Stack::InvModelView);
        let origin = transform.transform_point3(Vec3::ZERO) + model_offset;
        let light = transform.transform_vector3(Vec3::ONE).normalize();
        FrameState {
            transform,
            origin,
            light,
            half_size,
        }
    }
}

/// Render the tile rows `band.0 .. band.1` of the frame
fn render_band(
    tree: &VoxelOctree,
    frame: &FrameState,
    fb: SharedMut<u32>,
    width: usize,
    height: usize,
    band: (usize, usize),
) {
    let (ty0, ty1) = band;
    if ty0 >= ty1 {
        return;
    }
    let tiles_x = width.div_ceil(TILE_SIZE);

    let scale = 2.0 / width as f32;
    let plane_dist = 1.0 / (PI / 6.0).tan();
    let pixel_scale = scale / plane_dist;

    let ray_dir = |px: f32, py: f32| -> Vec3 {
        let dx = px * scale - 1.0;
        let dy = (height as f32 * 0.5 - py) * scale;
        frame
            .transform
            .mul_vec4(Vec4::new(dx, dy, -plane_dist, 0.0))
            .truncate()
            .normalize()
    };

    // Coarse pass: one ray per tile corner of this band
    let corner_rows = ty1 - ty0 + 1;
    let mut depth = vec![f32::INFINITY; (tiles_x + 1) * corner_rows];
    for row in 0..corner_rows {
        for tx in 0..=tiles_x {
            let px = (tx * TILE_SIZE) as f32;
            let py = ((ty0 + row) * TILE_SIZE) as f32;
            let dir = ray_dir(px, py);
            if let Some(hit) = tree.raymarch(frame.origin, dir, pixel_scale * TILE_SIZE as f32) {
                depth[row * (tiles_x + 1) + tx] = hit.t;
            }
        }
    }

    let step = if frame.half_size { 3 } else { 1 };
    for ty in ty0..ty1 {
        let row = ty - ty0;
        for tx in 0..tiles_x {
            let corners = [
                depth[row * (tiles_x + 1) + tx],
                depth[row * (tiles_x + 1) + tx + 1],
                depth[(row + 1) * (tiles_x + 1) + tx],
                depth[(row + 1) * (tiles_x + 1) + tx + 1],
            ];

            let x0 = tx * TILE_SIZE;
            let y0 = ty * TILE_SIZE;
            let x1 = (x0 + TILE_SIZE).min(width);
            let y1 = (y0 + TILE_SIZE).min(height);

            if corners.iter().all(|t| t.is_infinite()) {
                for y in y0..y1 {
                    for x in x0..x1 {
                        // SAFETY: bands write disjoint rows
                        unsafe { *fb.0.add(y * width + x) = 0xFF000000 };
                    }
                }
                continue;
            }

            // Skip ahead to just before the nearest corner hit when the
            // whole tile is known to be covered
            let start = if corners.iter().all(|t| t.is_finite()) {
                corners.iter().fold(f32::INFINITY, |a, &b| a.min(b)) - REFINE_EPSILON
            } else {
                0.0
            };

            let mut y = y0;
            while y < y1 {
                let mut x = x0;
                while x < x1 {
                    let dir = ray_dir(x as f32 + 0.5, y as f32 + 0.5);
                    let origin = frame.origin + dir * start;
                    let color = match tree.raymarch(origin, dir, pixel_scale) {
                        Some(hit) => shade_pixel(hit.normal, frame.light),
                        None => 0xFF000000,
                    };

                    for sy in y..(y + step).min(y1) {
                        for sx in x..(x + step).min(x1) {
                            // SAFETY: bands write disjoint rows
                            unsafe { *fb.0.add(sy * width + sx) = color };
                        }
                    }
                    x += step;
                }
                y += step;
            }
        }
    }
}

/// Single directional light on the decompressed leaf normal
fn shade_pixel(normal_word: u32, light: Vec3) -> u32 {
    let brightness = if normal_word == 0 {
        // Coarse early-out hit: no normal to shade with
        0.5
    } else {
        let (n, shade) = decompress_material(normal_word);
        n.dot(light).max(0.0) * shade
    };

    let grey = (brightness.min(1.0) * 255.0) as u32;
    0xFF000000 | (grey << 16) | (grey << 8) | grey
}
