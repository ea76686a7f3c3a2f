//! Mathematical utilities

pub mod matrix_stack;
pub mod tribox;

pub use matrix_stack::{MatrixStack, Stack};
pub use tribox::tri_box_overlap;
