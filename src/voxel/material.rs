//! 32-bit material words
//!
//! Layout: `[sign:1 | face:2 | u:11 | v:11 | shade:7]`. The dominant normal
//! axis picks the face; the other two components are stored as ratios
//! against it, mapped from [-1, 1] to [0, 2047]. `shade` is luminance.

use crate::core::types::Vec3;

const RATIO_MAX: f32 = 2047.0;
const SHADE_MAX: f32 = 127.0;

/// Pack a shaded normal into a material word
pub fn compress_material(n: Vec3, shade: f32) -> u32 {
    let abs = n.abs();
    let (face, dominant, a, b) = if abs.x >= abs.y && abs.x >= abs.z {
        (0u32, n.x, n.y, n.z)
    } else if abs.y >= abs.z {
        (1u32, n.y, n.x, n.z)
    } else {
        (2u32, n.z, n.x, n.y)
    };

    let sign = (dominant < 0.0) as u32;
    let scale = if dominant.abs() > 1e-12 {
        1.0 / dominant.abs()
    } else {
        0.0
    };

    let u = (((a * scale) * 0.5 + 0.5) * RATIO_MAX).round().clamp(0.0, RATIO_MAX) as u32;
    let v = (((b * scale) * 0.5 + 0.5) * RATIO_MAX).round().clamp(0.0, RATIO_MAX) as u32;
    let c = (shade * SHADE_MAX).round().clamp(0.0, SHADE_MAX) as u32;

    (sign << 31) | (face << 29) | (u << 18) | (v << 7) | c
}

/// Unpack a material word into (normal, shade)
pub fn decompress_material(word: u32) -> (Vec3, f32) {
    let shade = (word & 0x7F) as f32 / SHADE_MAX;
    let v = ((word >> 7) & 0x7FF) as f32 / RATIO_MAX * 2.0 - 1.0;
    let u = ((word >> 18) & 0x7FF) as f32 / RATIO_MAX * 2.0 - 1.0;
    let face = (word >> 29) & 3;
    let dominant = if word >> 31 != 0 { -1.0 } else { 1.0 };

    let n = match face {
        0 => Vec3::new(dominant, u, v),
        1 => Vec3::new(u, dominant, v),
        _ => Vec3::new(u, v, dominant),
    };
    (fast_normalize(n), shade)
}

/// Luminance of a [0, 255] color, as the shade channel expects it
pub fn shade_from_color(color: Vec3) -> f32 {
    (color.x + color.y + color.z) / (3.0 * 255.0)
}

/// Quake-III inverse square root (magic 0x5f3759df, one Newton step)
pub fn fast_inv_sqrt(x: f32) -> f32 {
    let half = 0.5 * x;
    let y = f32::from_bits(0x5f3759df - (x.to_bits() >> 1));
    y * (1.5 - half * y * y)
}

fn fast_normalize(v: Vec3) -> Vec3 {
    v * fast_inv_sqrt(v.length_squared())
}
