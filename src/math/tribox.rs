//! Triangle / axis-aligned box overlap test
//!
//! Separating-axis test over the 13 candidate axes: the three box face
//! normals, the triangle plane normal, and the nine edge cross products.

use crate::core::types::Vec3;

/// True if the triangle intersects the box `(center, half_size)`
pub fn tri_box_overlap(center: Vec3, half_size: Vec3, tri: &[Vec3; 3]) -> bool {
    let v0 = tri[0] - center;
    let v1 = tri[1] - center;
    let v2 = tri[2] - center;

    let e0 = v1 - v0;
    let e1 = v2 - v1;
    let e2 = v0 - v2;

    // Projections onto `axis` are disjoint from the box projection radius
    let separated = |axis: Vec3| -> bool {
        let p0 = v0.dot(axis);
        let p1 = v1.dot(axis);
        let p2 = v2.dot(axis);
        let r = half_size.x * axis.x.abs() + half_size.y * axis.y.abs() + half_size.z * axis.z.abs();
        p0.min(p1).min(p2) > r || p0.max(p1).max(p2) < -r
    };

    for unit in [Vec3::X, Vec3::Y, Vec3::Z] {
        if separated(unit) {
            return false;
        }
        for edge in [e0, e1, e2] {
            // Degenerate (parallel) cross products project everything to
            // zero and never separate, which is the safe outcome.
            if separated(edge.cross(unit)) {
                return false;
            }
        }
    }

    !separated(e0.cross(e1))
}
