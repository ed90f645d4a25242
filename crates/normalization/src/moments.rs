//! Mean and variance reductions, plus the count-weighted accumulator used by
//! adapt-style layers.
//!
//! Moments are population statistics: `variance = E[x²] − E[x]²`, evaluated
//! as the mean squared deviation from the mean, which is the same quantity with
//! less cancellation. Inputs are promoted to the policy's reduction dtype.

use candle_core::{DType, Tensor};

use crate::dtypes::{cast_tensor, PrecisionPolicy};
use crate::Result;

/// Mean and variance over a set of reduction axes.
#[derive(Debug, Clone)]
pub struct Moments {
    pub mean: Tensor,
    pub variance: Tensor,
}

/// Shape of a reduction result, with reduced axes kept as 1 or dropped.
pub fn reduced_shape(dims: &[usize], reduction_axes: &[usize], keep_dims: bool) -> Vec<usize> {
    dims.iter()
        .enumerate()
        .filter_map(|(axis, &size)| {
            if !reduction_axes.contains(&axis) {
                Some(size)
            } else if keep_dims {
                Some(1)
            } else {
                None
            }
        })
        .collect()
}

/// Computes mean and variance of `input` along `reduction_axes`.
///
/// Statistics come back in `policy.reduction()`. With `zero_size_guard` set,
/// an empty batch dimension yields zero statistics instead of `NaN`.
pub fn moments(
    input: &Tensor,
    reduction_axes: &[usize],
    keep_dims: bool,
    policy: &PrecisionPolicy,
    zero_size_guard: bool,
) -> Result<Moments> {
    let dims = input.dims().to_vec();
    let out_shape = reduced_shape(&dims, reduction_axes, keep_dims);
    let dtype = policy.reduction();

    if zero_size_guard && dims.first() == Some(&0) {
        log::debug!("zero-sized batch, returning zero moments of shape {out_shape:?}");
        let zeros = Tensor::zeros(out_shape, dtype, input.device())?;
        return Ok(Moments {
            mean: zeros.clone(),
            variance: zeros,
        });
    }

    let compute = policy.cast_for_reduction(input)?;
    if reduction_axes.is_empty() {
        return Ok(Moments {
            variance: compute.zeros_like()?,
            mean: compute,
        });
    }

    let mean = compute.mean_keepdim(reduction_axes.to_vec())?;
    let variance = compute
        .broadcast_sub(&mean)?
        .sqr()?
        .mean_keepdim(reduction_axes.to_vec())?;

    if keep_dims {
        Ok(Moments { mean, variance })
    } else {
        Ok(Moments {
            mean: mean.reshape(out_shape.clone())?,
            variance: variance.reshape(out_shape)?,
        })
    }
}

/// Running count, mean and variance merged with the parallel-variance rule.
///
/// Two accumulators that saw disjoint shards merge into the statistics of the
/// concatenated data, so merging is associative and order independent.
#[derive(Debug, Clone)]
pub struct MomentAccumulator {
    count: f64,
    mean: Tensor,
    variance: Tensor,
}

impl MomentAccumulator {
    /// Starts from the moments of one batch holding `count` samples per feature.
    pub fn new(count: f64, mean: Tensor, variance: Tensor) -> Result<Self> {
        Ok(Self {
            count,
            mean: cast_tensor(&mean, DType::F32)?,
            variance: cast_tensor(&variance, DType::F32)?,
        })
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    pub fn variance(&self) -> &Tensor {
        &self.variance
    }

    /// Folds another batch (or another accumulator's state) into this one.
    pub fn update(&mut self, count: f64, mean: &Tensor, variance: &Tensor) -> Result<()> {
        if count <= 0.0 {
            return Ok(());
        }
        if self.count <= 0.0 {
            *self = Self::new(count, mean.clone(), variance.clone())?;
            return Ok(());
        }
        let mean = cast_tensor(mean, DType::F32)?;
        let variance = cast_tensor(variance, DType::F32)?;
        let total = self.count + count;
        let own_weight = self.count / total;
        let other_weight = count / total;

        let merged_mean = (self.mean.affine(own_weight, 0.0)? + mean.affine(other_weight, 0.0)?)?;
        let own_shift = (&self.mean - &merged_mean)?.sqr()?;
        let other_shift = (&mean - &merged_mean)?.sqr()?;
        let merged_variance = ((&self.variance + &own_shift)?.affine(own_weight, 0.0)?
            + (&variance + &other_shift)?.affine(other_weight, 0.0)?)?;

        self.count = total;
        self.mean = merged_mean;
        self.variance = merged_variance;
        Ok(())
    }

    /// Merges another accumulator into this one.
    pub fn merge(&mut self, other: &MomentAccumulator) -> Result<()> {
        self.update(other.count, &other.mean, &other.variance)
    }
}
