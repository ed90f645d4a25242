//! Ghost (virtual) batches.
//!
//! The leading batch dimension `B` is reshaped to `[V, B / V, ...]`. Axis 1
//! is kept out of the reduction, so each of the `B / V` groups gets its own
//! batch statistics while every group shares the layer's variables. A group
//! holds the rows `j, j + B/V, j + 2·B/V, ...` of the original batch.
//!
//! Moving statistics are updated once per call with the statistics averaged
//! over the groups rather than once per group in sequence; the running
//! averages only serve inference, where the difference is negligible.

use candle_core::Tensor;

use crate::axis::ResolvedAxes;
use crate::{NormError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualBatch {
    size: usize,
}

impl VirtualBatch {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(NormError::config(
                "virtual_batch_size must be a positive integer that divides the true batch \
                 size of the input tensor",
            ));
        }
        Ok(Self { size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Rejects axis sets that name the batch dimension and custom adjustments.
    pub fn validate(&self, axes: &ResolvedAxes, has_adjustment: bool) -> Result<()> {
        if axes.contains(0) {
            return Err(NormError::config(format!(
                "when using virtual_batch_size, the batch dimension must be 0 and thus axis \
                 cannot include 0. Received axis={:?}",
                axes.as_slice()
            )));
        }
        if has_adjustment {
            return Err(NormError::config(
                "when using virtual_batch_size, adjustment cannot be specified",
            ));
        }
        Ok(())
    }

    /// Feature axes after the group dimension is inserted at index 1.
    pub fn shift_axes(&self, axes: &ResolvedAxes) -> ResolvedAxes {
        axes.shifted(1)
    }

    /// Parameter shape with the extra group dimension.
    pub fn param_shape(&self, rank_shape: &[usize]) -> Vec<usize> {
        let mut shape = rank_shape.to_vec();
        shape.insert(1, 1);
        shape
    }

    /// Reduction axes of the expanded input, leaving out the group axis.
    pub fn reduction_axes(&self, axes: &ResolvedAxes, expanded_rank: usize) -> Vec<usize> {
        axes.reduction_axes(expanded_rank)
            .into_iter()
            .filter(|&axis| axis != 1)
            .collect()
    }

    /// Dims of the expanded input. A batch that `size` does not divide yields
    /// dims whose element count no longer matches, and the reshape fails.
    pub fn expanded_dims(&self, dims: &[usize]) -> Vec<usize> {
        let mut expanded = Vec::with_capacity(dims.len() + 1);
        expanded.push(self.size);
        expanded.push(dims.first().copied().unwrap_or(0) / self.size);
        expanded.extend_from_slice(dims.get(1..).unwrap_or(&[]));
        expanded
    }

    pub fn split(&self, input: &Tensor) -> Result<Tensor> {
        Ok(input.reshape(self.expanded_dims(input.dims()))?)
    }

    pub fn merge(&self, output: &Tensor, original_dims: &[usize]) -> Result<Tensor> {
        Ok(output.reshape(original_dims)?)
    }

    /// Averages per-group statistics for the single moving-average update.
    pub fn average_sub_batches(&self, stat: &Tensor) -> Result<Tensor> {
        Ok(stat.mean_keepdim(1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::AxisSpec;
    use candle_core::{DType, Device};

    #[test]
    fn non_positive_size_is_rejected() {
        assert!(matches!(VirtualBatch::new(0), Err(NormError::Config(_))));
        assert_eq!(VirtualBatch::new(4).unwrap().size(), 4);
    }

    #[test]
    fn batch_axis_and_adjustment_conflict() -> Result<()> {
        let vb = VirtualBatch::new(2)?;
        let with_batch = AxisSpec::Multiple(vec![0, 1]).resolve(3)?;
        assert!(vb.validate(&with_batch, false).is_err());
        let features = AxisSpec::Single(-1).resolve(3)?;
        vb.validate(&features, false)?;
        assert!(vb.validate(&features, true).is_err());
        Ok(())
    }

    #[test]
    fn split_and_merge_round_trip_shapes() -> Result<()> {
        let vb = VirtualBatch::new(2)?;
        let input = Tensor::arange(0f32, 24.0, &Device::Cpu)?.reshape((6, 4))?;
        let split = vb.split(&input)?;
        assert_eq!(split.dims(), &[2, 3, 4]);
        let merged = vb.merge(&split, &[6, 4])?;
        assert_eq!(merged.to_vec2::<f32>()?, input.to_vec2::<f32>()?);

        let axes = vb.shift_axes(&AxisSpec::Single(-1).resolve(2)?);
        assert_eq!(axes.as_slice(), &[2]);
        assert_eq!(vb.reduction_axes(&axes, 3), vec![0]);
        assert_eq!(vb.param_shape(&[1, 4]), vec![1, 1, 4]);
        Ok(())
    }

    #[test]
    fn indivisible_batch_fails_in_the_engine() -> Result<()> {
        let vb = VirtualBatch::new(4)?;
        let input = Tensor::zeros((6, 2), DType::F32, &Device::Cpu)?;
        assert!(matches!(vb.split(&input), Err(NormError::Backend(_))));
        Ok(())
    }

    #[test]
    fn group_statistics_average_into_one_update() -> Result<()> {
        let vb = VirtualBatch::new(2)?;
        let stat = Tensor::new(&[[[1f32], [3.0]]], &Device::Cpu)?;
        let averaged = vb.average_sub_batches(&stat)?;
        assert_eq!(averaged.dims(), &[1, 1, 1]);
        assert_eq!(averaged.flatten_all()?.to_vec1::<f32>()?, vec![2.0]);
        Ok(())
    }
}
