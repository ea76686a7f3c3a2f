//! Vertex and triangle types used by the voxelizer

use crate::core::types::Vec3;

/// Mesh vertex: position, normal, color with channels in [0, 255]
#[derive(Clone, Copy, Debug)]
pub struct Vertex {
    pub pos: Vec3,
    pub normal: Vec3,
    pub color: Vec3,
}

impl Vertex {
    pub fn new(pos: Vec3, normal: Vec3, color: Vec3) -> Self {
        Self { pos, normal, color }
    }
}

/// Triangle with precomputed bounds
#[derive(Clone, Copy, Debug)]
pub struct Triangle {
    pub verts: [Vertex; 3],
    pub lower: Vec3,
    pub upper: Vec3,
}

impl Triangle {
    pub fn new(v0: Vertex, v1: Vertex, v2: Vertex) -> Self {
        Self {
            verts: [v0, v1, v2],
            lower: v0.pos.min(v1.pos).min(v2.pos),
            upper: v0.pos.max(v1.pos).max(v2.pos),
        }
    }

    /// Geometric face normal, zero for degenerate triangles
    pub fn face_normal(&self) -> Vec3 {
        let n = (self.verts[1].pos - self.verts[0].pos).cross(self.verts[2].pos - self.verts[0].pos);
        if n.length_squared() > 0.0 {
            n.normalize()
        } else {
            Vec3::ZERO
        }
    }

    /// Barycentric coordinates of `p`, clamped back into the triangle when
    /// the projection falls outside it (grazing voxel centers would
    /// otherwise extrapolate attributes).
    pub fn barycentric(&self, p: Vec3) -> Vec3 {
        let a = self.verts[0].pos;
        let ab = self.verts[1].pos - a;
        let ac = self.verts[2].pos - a;
        let ap = p - a;

        let d00 = ab.dot(ab);
        let d01 = ab.dot(ac);
        let d11 = ac.dot(ac);
        let d20 = ap.dot(ab);
        let d21 = ap.dot(ac);

        let denom = d00 * d11 - d01 * d01;
        if denom.abs() < 1e-12 {
            return Vec3::new(1.0, 0.0, 0.0);
        }

        let l1 = (d11 * d20 - d01 * d21) / denom;
        let l2 = (d00 * d21 - d01 * d20) / denom;
        let lambda = Vec3::new(1.0 - l1 - l2, l1, l2);

        if lambda.min_element() >= 0.0 {
            return lambda;
        }

        let clamped = lambda.clamp(Vec3::ZERO, Vec3::ONE);
        clamped / clamped.element_sum()
    }
}
