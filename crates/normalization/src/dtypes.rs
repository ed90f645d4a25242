//! Precision and dtype policy utilities used throughout the normalisation layers.
//!
//! Inputs may arrive in `f16`/`bf16`, but statistics overflow easily in half
//! precision, so moments, moving averages and the normalisation itself are
//! promoted to `f32`. [`PrecisionPolicy`] records which dtype each phase uses
//! so that layers cast consistently before reductions and for their output.

use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Serialisable floating point type selected for a layer's variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloatType {
    F16,
    Bf16,
    F32,
    F64,
}

impl FloatType {
    pub fn to_dtype(self) -> DType {
        match self {
            FloatType::F16 => DType::F16,
            FloatType::Bf16 => DType::BF16,
            FloatType::F32 => DType::F32,
            FloatType::F64 => DType::F64,
        }
    }
}

/// Returns true for the 16-bit float types that need promotion.
pub fn is_half(dtype: DType) -> bool {
    matches!(dtype, DType::F16 | DType::BF16)
}

/// Dtype used for parameters and running statistics of a layer declared with `dtype`.
///
/// Half precision layers keep their variables in `f32`; an undeclared dtype
/// defaults to `f32`.
pub fn param_dtype(dtype: Option<DType>) -> DType {
    match dtype {
        Some(DType::F16) | Some(DType::BF16) | None => DType::F32,
        Some(other) => other,
    }
}

/// Describes how tensors should be cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Constructs a new policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Builds a policy from the dtype the caller feeds into the layer.
    pub fn from_input_dtype(storage: DType) -> Self {
        let compute = if is_half(storage) { DType::F32 } else { storage };
        let reduction = match compute {
            DType::F64 => DType::F64,
            _ => DType::F32,
        };
        Self::new(storage, compute, reduction)
    }

    /// Returns the dtype of inputs and outputs.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype the normalisation arithmetic runs in.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Returns the dtype used for mean and variance reductions.
    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Casts a tensor to the compute dtype.
    pub fn cast_for_compute(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

/// Casts only when the dtype differs, avoiding a copy otherwise.
pub fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
