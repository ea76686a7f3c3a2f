//! Named matrix stacks for the viewer
//!
//! Three base stacks are stored; the derived stacks are composed on demand
//! so they can never fall out of sync with their sources.

use crate::core::types::Mat4;

/// Logical matrix stacks recognized by [`MatrixStack::get`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stack {
    Projection,
    Model,
    View,
    ModelView,
    ModelViewProjection,
    InvModel,
    InvView,
    InvModelView,
}

/// Base matrices plus on-demand derived products
#[derive(Clone, Debug)]
pub struct MatrixStack {
    projection: Mat4,
    model: Mat4,
    view: Mat4,
}

impl MatrixStack {
    pub fn new() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            model: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
        }
    }

    fn base_mut(&mut self, stack: Stack) -> &mut Mat4 {
        match stack {
            Stack::Projection => &mut self.projection,
            Stack::Model => &mut self.model,
            Stack::View => &mut self.view,
            _ => panic!("derived stack {:?} is not assignable", stack),
        }
    }

    /// Replace a base stack. Derived stacks cannot be assigned.
    pub fn set(&mut self, stack: Stack, m: Mat4) {
        *self.base_mut(stack) = m;
    }

    /// Right-multiply a base stack
    pub fn mul_r(&mut self, stack: Stack, m: Mat4) {
        let base = self.base_mut(stack);
        *base = *base * m;
    }

    pub fn get(&self, stack: Stack) -> Mat4 {
        match stack {
            Stack::Projection => self.projection,
            Stack::Model => self.model,
            Stack::View => self.view,
            Stack::ModelView => self.view * self.model,
            Stack::ModelViewProjection => self.projection * self.view * self.model,
            Stack::InvModel => self.model.inverse(),
            Stack::InvView => self.view.inverse(),
            Stack::InvModelView => (self.view * self.model).inverse(),
        }
    }
}

impl Default for MatrixStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Vec3, Vec4};

    #[test]
    fn test_modelview_composition() {
        let mut stacks = MatrixStack::new();
        stacks.set(Stack::View, Mat4::from_translation(Vec3::new(0.0, 0.0, -2.0)));
        stacks.set(Stack::Model, Mat4::from_rotation_y(std::f32::consts::FRAC_PI_2));

        let mv = stacks.get(Stack::ModelView);
        let expected = stacks.get(Stack::View) * stacks.get(Stack::Model);
        assert!((mv * Vec4::ONE - expected * Vec4::ONE).length() < 1e-6);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let mut stacks = MatrixStack::new();
        stacks.set(Stack::View, Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        stacks.mul_r(Stack::View, Mat4::from_rotation_x(0.5));

        let round_trip = stacks.get(Stack::InvView) * stacks.get(Stack::View);
        let p = round_trip * Vec4::new(0.3, -0.7, 1.1, 1.0);
        assert!((p - Vec4::new(0.3, -0.7, 1.1, 1.0)).length() < 1e-5);
    }
}
