//! Fused batch normalisation: path selection and the single-pass kernel.
//!
//! The fused kernel handles one channel axis of a 4-D or 5-D input in either
//! channels-first or channels-last layout. It reduces `Σx` and `Σx²` in one
//! sweep, folds scale and offset into a per-channel multiply-add, and can
//! report the updated exponential moving averages directly.
//!
//! Selection happens twice: at construction only the configuration is known,
//! and the input rank is checked once the layer is built.

use candle_core::{DType, Tensor};

use crate::axis::{AxisSpec, ResolvedAxes};
use crate::dtypes::cast_tensor;
use crate::moving::exponential_average;
use crate::{NormError, Result};

/// Raw axis values the fused kernel accepts before the rank is known.
const FUSED_AXES: [isize; 6] = [-4, -3, -1, 1, 3, 4];

/// Memory layouts supported by the fused kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Nchw,
    Ncdhw,
    Nhwc,
    Ndhwc,
}

impl DataFormat {
    /// Layout for a single channel `axis` of an input with `rank` dims.
    pub fn from_axis(axis: usize, rank: usize) -> Option<Self> {
        match (axis, rank) {
            (1, 4) => Some(DataFormat::Nchw),
            (1, 5) => Some(DataFormat::Ncdhw),
            (3, 4) => Some(DataFormat::Nhwc),
            (4, 5) => Some(DataFormat::Ndhwc),
            _ => None,
        }
    }

    pub fn rank(&self) -> usize {
        match self {
            DataFormat::Nchw | DataFormat::Nhwc => 4,
            DataFormat::Ncdhw | DataFormat::Ndhwc => 5,
        }
    }

    pub fn channel_axis(&self) -> usize {
        match self {
            DataFormat::Nchw | DataFormat::Ncdhw => 1,
            DataFormat::Nhwc => 3,
            DataFormat::Ndhwc => 4,
        }
    }

    pub fn channels_last(&self) -> bool {
        matches!(self, DataFormat::Nhwc | DataFormat::Ndhwc)
    }
}

/// Configuration facts that decide whether the fused kernel applies.
#[derive(Debug, Clone, Copy)]
pub struct FusedRequest<'a> {
    pub axis: &'a AxisSpec,
    pub renorm: bool,
    pub virtual_batch_size: Option<usize>,
    pub has_adjustment: bool,
    pub compute_dtype: Option<DType>,
}

/// Fails with the first reason the fused kernel cannot serve `request`.
///
/// The input rank is checked separately at build time.
pub fn check_fused_feasible(request: &FusedRequest<'_>) -> Result<()> {
    if request.renorm {
        return Err(NormError::config(
            "passing both `fused=true` and `renorm=true` is not supported",
        ));
    }
    let axes = request.axis.to_vec();
    if axes.len() != 1 || !FUSED_AXES.contains(&axes[0]) {
        return Err(NormError::config(format!(
            "passing `fused=true` is only supported when axis is 1 or 3 for input rank 4 \
             or 1 or 4 for input rank 5. Got axis {}",
            request.axis
        )));
    }
    if request.virtual_batch_size.is_some() {
        return Err(NormError::config(
            "passing `fused=true` is not supported when `virtual_batch_size` is specified",
        ));
    }
    if request.has_adjustment {
        return Err(NormError::config(
            "passing `fused=true` is not supported when `adjustment` is specified",
        ));
    }
    match request.compute_dtype {
        None | Some(DType::F16) | Some(DType::BF16) | Some(DType::F32) => Ok(()),
        Some(other) => Err(NormError::config(format!(
            "passing `fused=true` is only supported when the compute dtype is f16, bf16 or \
             f32. Got dtype: {other:?}"
        ))),
    }
}

pub fn fused_can_be_used(request: &FusedRequest<'_>) -> bool {
    check_fused_feasible(request).is_ok()
}

/// Resolves the caller's `fused` option at construction time.
///
/// An explicit `Some(true)` must be feasible. `None` stays undecided when the
/// configuration allows fusing, since the rank may still rule it out. The
/// legacy behaviour defaults `None` to `Some(true)` and re-checks at build.
pub fn resolve_requested(
    requested: Option<bool>,
    legacy: bool,
    request: &FusedRequest<'_>,
) -> Result<Option<bool>> {
    if legacy {
        return Ok(Some(requested.unwrap_or(true)));
    }
    match requested {
        Some(true) => {
            check_fused_feasible(request)?;
            Ok(Some(true))
        }
        None if !fused_can_be_used(request) => Ok(Some(false)),
        other => Ok(other),
    }
}

/// Final fused decision once the input rank is known.
///
/// Returns the kernel layout, or `None` for the generic path.
pub fn resolve_at_build(
    fused: Option<bool>,
    legacy: bool,
    feasible: bool,
    rank: usize,
    axes: &ResolvedAxes,
) -> Result<Option<DataFormat>> {
    let rank_supported = rank == 4 || rank == 5;
    let enabled = match fused {
        Some(false) => false,
        _ if legacy => rank_supported && feasible,
        None => rank_supported,
        Some(true) if !rank_supported => {
            return Err(NormError::config(format!(
                "batch normalization layers with `fused=true` only support 4D or 5D input \
                 tensors. Received tensor of rank {rank}"
            )));
        }
        Some(true) => true,
    };
    if !enabled {
        if fused != Some(false) {
            log::debug!(
                "fused batch norm needs 4D or 5D input, got rank {rank} (axis={:?}); \
                 using the generic path",
                axes.as_slice()
            );
        }
        return Ok(None);
    }

    let format = match axes.as_slice() {
        [axis] => DataFormat::from_axis(*axis, rank),
        _ => None,
    };
    match format {
        Some(format) => Ok(Some(format)),
        None if rank == 5 => {
            log::debug!(
                "no fused data format for axis={:?} at rank 5; using the generic path",
                axes.as_slice()
            );
            Ok(None)
        }
        None => Err(NormError::config(format!(
            "unsupported axis. The use of `fused=true` is only possible with `axis=1` or \
             `axis=3` for 4D input tensors. Received axis={:?}",
            axes.as_slice()
        ))),
    }
}

/// Output of the fused kernel together with the statistics it reports.
#[derive(Debug, Clone)]
pub struct FusedBatchNorm {
    pub output: Tensor,
    /// Batch mean, running mean, or the updated average (see [`fused_batch_norm`]).
    pub mean: Tensor,
    pub variance: Tensor,
}

/// Single-pass batch normalisation over the channel axis of `format`.
///
/// `scale`, `offset`, `mean` and `variance` are per-channel vectors in the
/// statistics dtype. In inference the given `mean`/`variance` normalise the
/// input and are returned as is. In training the batch moments are used; with
/// `exponential_avg_factor = f` the returned statistics are the running
/// averages `(1 - f) * running + f * batch`, otherwise the batch moments. An
/// empty batch in training returns the input and the running statistics.
#[allow(clippy::too_many_arguments)]
pub fn fused_batch_norm(
    input: &Tensor,
    scale: &Tensor,
    offset: &Tensor,
    mean: &Tensor,
    variance: &Tensor,
    epsilon: f64,
    format: DataFormat,
    training: bool,
    exponential_avg_factor: Option<f64>,
) -> Result<FusedBatchNorm> {
    let dims = input.dims().to_vec();
    if dims.len() != format.rank() {
        return Err(NormError::shape(format!(
            "fused batch norm with {format:?} expects rank {}, got shape {dims:?}",
            format.rank()
        )));
    }
    let channels = dims[format.channel_axis()];
    let count = input.elem_count() / channels.max(1);

    if training && count == 0 {
        return Ok(FusedBatchNorm {
            output: input.clone(),
            mean: mean.clone(),
            variance: variance.clone(),
        });
    }

    let stat_dtype = variance.dtype();
    let compute = cast_tensor(input, stat_dtype)?;
    let (view, reduce_dims, stat_shape) = if format.channels_last() {
        (
            compute.reshape((count, channels))?,
            vec![0],
            vec![1, channels],
        )
    } else {
        let spatial = count / dims[0].max(1);
        (
            compute.reshape((dims[0], channels, spatial))?,
            vec![0, 2],
            vec![1, channels, 1],
        )
    };

    let (use_mean, use_variance) = if training {
        let n = count as f64;
        let batch_mean = view.sum_keepdim(reduce_dims.clone())?.affine(1.0 / n, 0.0)?;
        let mean_sq = view.sqr()?.sum_keepdim(reduce_dims)?.affine(1.0 / n, 0.0)?;
        let batch_variance = (mean_sq - batch_mean.sqr()?)?.relu()?;
        (batch_mean, batch_variance)
    } else {
        (
            mean.reshape(stat_shape.clone())?,
            variance.reshape(stat_shape.clone())?,
        )
    };

    let inv = (&use_variance + epsilon)?
        .sqrt()?
        .recip()?
        .broadcast_mul(&cast_tensor(scale, stat_dtype)?.reshape(stat_shape.clone())?)?;
    let shift = cast_tensor(offset, stat_dtype)?
        .reshape(stat_shape)?
        .broadcast_sub(&use_mean.broadcast_mul(&inv)?)?;
    let output = view
        .broadcast_mul(&inv)?
        .broadcast_add(&shift)?
        .reshape(dims)?
        .to_dtype(input.dtype())?;

    if !training {
        return Ok(FusedBatchNorm {
            output,
            mean: mean.clone(),
            variance: variance.clone(),
        });
    }

    let batch_mean = use_mean.reshape(channels)?;
    let batch_variance = use_variance.reshape(channels)?;
    let (mean, variance) = match exponential_avg_factor {
        Some(factor) => (
            exponential_average(mean, &batch_mean, factor)?,
            exponential_average(variance, &batch_variance, factor)?,
        ),
        None => (batch_mean, batch_variance),
    };
    Ok(FusedBatchNorm {
        output,
        mean,
        variance,
    })
}
