//! Shape expressions and strided views.

pub mod expr;
pub mod view;

pub use expr::{Bindings, ShapeExpr};
pub use view::View;

use crate::error::ShapeError;

/// Resolve a symbolic shape against variable bindings.
pub fn resolve_shape(shape: &[ShapeExpr], bindings: &Bindings) -> Result<Vec<usize>, ShapeError> {
    shape
        .iter()
        .map(|e| {
            let v = e.eval(bindings)?;
            if v < 0 {
                Err(ShapeError::NegativeDim { dim: v })
            } else {
                Ok(v as usize)
            }
        })
        .collect()
}

/// Number of elements of a concrete shape.
pub fn num_elements(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major strides for a contiguous shape.
pub fn contiguous_strides(shape: &[usize]) -> Vec<isize> {
    let mut strides = vec![0isize; shape.len()];
    let mut acc = 1isize;
    for (i, &s) in shape.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= s as isize;
    }
    strides
}
