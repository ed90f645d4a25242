//! The normalise-scale-shift transform and its broadcasting rules.
//!
//! `output = (x - mean) / sqrt(variance + epsilon) * scale + offset`, with the
//! statistics and affine parameters broadcast across every non-feature axis.

use candle_core::Tensor;

use crate::axis::ResolvedAxes;
use crate::Result;

/// Applies batch normalisation with precomputed statistics.
///
/// The scale is folded into the inverse standard deviation. Centering happens
/// before scaling, so an input equal to its mean maps exactly to `offset`.
pub fn batch_normalization(
    input: &Tensor,
    mean: &Tensor,
    variance: &Tensor,
    offset: Option<&Tensor>,
    scale: Option<&Tensor>,
    epsilon: f64,
) -> Result<Tensor> {
    let mut inv = (variance + epsilon)?.sqrt()?.recip()?;
    if let Some(scale) = scale {
        inv = inv.broadcast_mul(scale)?;
    }
    let normalized = input.broadcast_sub(mean)?.broadcast_mul(&inv)?;
    match offset {
        Some(offset) => Ok(normalized.broadcast_add(offset)?),
        None => Ok(normalized),
    }
}

/// Reshapes per-feature vectors so they broadcast against an input of known rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcaster {
    shape: Vec<usize>,
    needs_reshape: bool,
}

impl Broadcaster {
    /// Builds the broadcast shape for `dims`, with feature sizes on `axes`.
    ///
    /// Vectors already line up with the input when the only feature axis is
    /// the last one; the reshape is skipped in that case.
    pub fn new(dims: &[usize], axes: &ResolvedAxes) -> Self {
        let rank = dims.len();
        let needs_reshape = axes.as_slice() != [rank.saturating_sub(1)];
        Self {
            shape: axes.broadcast_shape(dims),
            needs_reshape,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn needs_reshape(&self) -> bool {
        self.needs_reshape
    }

    /// Brings `value` to the broadcast shape unless it already has full rank.
    pub fn apply(&self, value: &Tensor) -> Result<Tensor> {
        if self.needs_reshape && value.rank() != self.shape.len() {
            Ok(value.reshape(self.shape.clone())?)
        } else {
            Ok(value.clone())
        }
    }
}
