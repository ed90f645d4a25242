//! Lightweight validation helpers shared across the normalisation layers.
//!
//! These routines provide concise shape assertions that can be wired into
//! `build` or forward paths. They return the crate [`Result`] so call
//! sites can propagate errors without panicking.

use candle_core::Tensor;

use crate::{NormError, Result};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(NormError::shape(format!(
            "{name}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

/// Resolves a partially known input shape, failing on an undefined rank.
pub fn expect_known_rank(name: &str, shape: &[Option<usize>]) -> Result<usize> {
    if shape.is_empty() {
        Err(NormError::shape(format!("{name}: input has undefined rank")))
    } else {
        Ok(shape.len())
    }
}

/// Returns the size of `axis`, failing when the build shape leaves it undefined.
pub fn expect_defined_dim(name: &str, shape: &[Option<usize>], axis: usize) -> Result<usize> {
    shape.get(axis).copied().flatten().ok_or_else(|| {
        NormError::shape(format!(
            "{name}: input has undefined `axis` dimension. Received input with shape {} \
             (axis {axis})",
            format_shape(shape)
        ))
    })
}

/// Checks a concrete input against the rank and feature sizes fixed at build time.
pub fn expect_input_spec(
    name: &str,
    tensor: &Tensor,
    rank: usize,
    axis_dims: &[(usize, usize)],
) -> Result<()> {
    let dims = tensor.dims();
    if dims.len() != rank {
        return Err(NormError::shape(format!(
            "{name}: expected input of rank {rank}, got shape {dims:?}"
        )));
    }
    for &(axis, size) in axis_dims {
        if dims[axis] != size {
            return Err(NormError::shape(format!(
                "{name}: expected axis {axis} to have size {size}, got shape {dims:?}"
            )));
        }
    }
    Ok(())
}

/// Renders a build shape with `None` for unknown dimensions.
pub fn format_shape(shape: &[Option<usize>]) -> String {
    let parts = shape
        .iter()
        .map(|dim| match dim {
            Some(size) => size.to_string(),
            None => "None".to_string(),
        })
        .collect::<Vec<_>>();
    format!("({})", parts.join(", "))
}

/// Converts concrete dims into a fully known build shape.
pub fn known_shape(dims: &[usize]) -> Vec<Option<usize>> {
    dims.iter().copied().map(Some).collect()
}
