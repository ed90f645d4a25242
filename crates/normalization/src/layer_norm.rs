//! Layer normalisation over one or more feature axes.
//!
//! Each example is normalised independently with its own mean and variance;
//! there are no running statistics and training and inference behave the
//! same. When the feature axes form a trailing block the input is viewed as
//! `(rows, features)` and reduced row by row; other axis sets use the generic
//! moments path.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::axis::{AxisSpec, ResolvedAxes};
use crate::dtypes::{self, cast_tensor, FloatType, PrecisionPolicy};
use crate::mode::TrainingMode;
use crate::moments::moments;
use crate::moving::StatVariable;
use crate::norm::NormalizationLayer;
use crate::transform::{batch_normalization, Broadcaster};
use crate::variables::{Initializer, VariableRegistry, WeightSpec};
use crate::{checks, NormError, Result};

/// Smallest epsilon the row-wise path accepts.
const FUSED_MIN_EPSILON: f64 = 1.001e-5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerNormConfig {
    pub name: String,
    pub axis: AxisSpec,
    pub epsilon: f64,
    pub center: bool,
    pub scale: bool,
    pub beta_initializer: Initializer,
    pub gamma_initializer: Initializer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<FloatType>,
}

impl Default for LayerNormConfig {
    fn default() -> Self {
        Self {
            name: "layer_normalization".to_string(),
            axis: AxisSpec::Single(-1),
            epsilon: 1e-3,
            center: true,
            scale: true,
            beta_initializer: Initializer::Zeros,
            gamma_initializer: Initializer::Ones,
            dtype: None,
        }
    }
}

impl LayerNormConfig {
    pub fn new(axis: impl Into<AxisSpec>) -> Self {
        Self {
            axis: axis.into(),
            ..Self::default()
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Debug, Clone)]
struct BuiltState {
    rank: usize,
    axes: ResolvedAxes,
    axis_dims: Vec<(usize, usize)>,
    param_shape: Vec<usize>,
    param_dtype: DType,
    row_wise: bool,
    gamma: Option<StatVariable>,
    beta: Option<StatVariable>,
}

#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: LayerNormConfig,
    state: Option<BuiltState>,
}

impl LayerNorm {
    pub fn new(config: LayerNormConfig) -> Result<Self> {
        if !(config.epsilon >= 0.0 && config.epsilon.is_finite()) {
            return Err(NormError::config(format!(
                "epsilon must be a finite non-negative number, got {}",
                config.epsilon
            )));
        }
        if config.axis.is_empty() {
            return Err(NormError::config("layer normalization needs at least one axis"));
        }
        Ok(Self {
            config,
            state: None,
        })
    }

    pub fn config(&self) -> &LayerNormConfig {
        &self.config
    }

    fn built(&self) -> Result<&BuiltState> {
        self.state.as_ref().ok_or(NormError::NotBuilt("layer_normalization"))
    }

    /// Whether inputs are reduced row by row over a trailing block of axes.
    pub fn is_fused(&self) -> Result<bool> {
        Ok(self.built()?.row_wise)
    }

    pub fn param_shape(&self) -> Result<&[usize]> {
        Ok(&self.built()?.param_shape)
    }

    pub fn gamma(&self) -> Result<Option<Tensor>> {
        self.built()?.gamma.as_ref().map(StatVariable::read).transpose()
    }

    pub fn beta(&self) -> Result<Option<Tensor>> {
        self.built()?.beta.as_ref().map(StatVariable::read).transpose()
    }

    pub fn build_for(&mut self, input: &Tensor, registry: &mut dyn VariableRegistry) -> Result<()> {
        self.build(&checks::known_shape(input.dims()), registry)
    }

    pub fn build(
        &mut self,
        input_shape: &[Option<usize>],
        registry: &mut dyn VariableRegistry,
    ) -> Result<()> {
        if self.state.is_some() {
            return Err(NormError::config(format!(
                "layer `{}` is already built",
                self.config.name
            )));
        }
        let cfg = &self.config;
        let rank = checks::expect_known_rank(&cfg.name, input_shape)?;
        let axes = cfg.axis.resolve(rank)?.sorted();
        let axis_dims = axes
            .as_slice()
            .iter()
            .map(|&axis| Ok((axis, checks::expect_defined_dim(&cfg.name, input_shape, axis)?)))
            .collect::<Result<Vec<_>>>()?;
        let param_shape = axis_dims.iter().map(|(_, size)| *size).collect::<Vec<_>>();

        let layer_dtype = cfg.dtype.map(FloatType::to_dtype).unwrap_or(DType::F32);
        let param_dtype = dtypes::param_dtype(cfg.dtype.map(FloatType::to_dtype));
        let row_wise = axes.is_trailing_block(rank)
            && cfg.epsilon >= FUSED_MIN_EPSILON
            && layer_dtype == DType::F32;

        let gamma = if cfg.scale {
            Some(registry.add_weight(WeightSpec::trainable(
                format!("{}/gamma", cfg.name),
                &param_shape,
                param_dtype,
                cfg.gamma_initializer,
            ))?)
        } else {
            None
        };
        let beta = if cfg.center {
            Some(registry.add_weight(WeightSpec::trainable(
                format!("{}/beta", cfg.name),
                &param_shape,
                param_dtype,
                cfg.beta_initializer,
            ))?)
        } else {
            None
        };

        log::info!(
            "built {}: axes={:?} param_shape={param_shape:?} row_wise={row_wise}",
            cfg.name,
            axes.as_slice()
        );
        self.state = Some(BuiltState {
            rank,
            axes,
            axis_dims,
            param_shape,
            param_dtype,
            row_wise,
            gamma,
            beta,
        });
        Ok(())
    }

    /// Normalises each example over the feature axes. The mode has no effect.
    ///
    /// A declared layer `dtype` wins over the input dtype, as in batch norm.
    pub fn forward(&self, input: &Tensor, _mode: &TrainingMode) -> Result<Tensor> {
        let state = self.built()?;
        checks::expect_input_spec(&self.config.name, input, state.rank, &state.axis_dims)?;
        let input = &match self.config.dtype {
            Some(dtype) => cast_tensor(input, dtype.to_dtype())?,
            None => input.clone(),
        };
        let policy = PrecisionPolicy::from_input_dtype(input.dtype());
        let normalized = if state.row_wise {
            self.forward_rows(state, input, &policy)?
        } else {
            self.forward_generic(state, input, &policy)?
        };
        Ok(policy.cast_to_storage(&normalized)?)
    }

    fn affine(
        &self,
        state: &BuiltState,
        dims: &[usize],
        dtype: DType,
    ) -> Result<(Option<Tensor>, Option<Tensor>)> {
        let broadcaster = Broadcaster::new(dims, &state.axes);
        let read = |var: &Option<StatVariable>| -> Result<Option<Tensor>> {
            match var {
                Some(var) => Ok(Some(broadcaster.apply(&cast_tensor(&var.read()?, dtype)?)?)),
                None => Ok(None),
            }
        };
        Ok((read(&state.gamma)?, read(&state.beta)?))
    }

    fn forward_rows(
        &self,
        state: &BuiltState,
        input: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        let dims = input.dims().to_vec();
        let first = state.axes.first().unwrap_or(dims.len());
        let rows = dims[..first].iter().product::<usize>();
        let features = dims[first..].iter().product::<usize>();

        let compute = policy.cast_for_reduction(input)?.reshape((rows, features))?;
        let size = features as f64;
        let mean = (compute.sum_keepdim(1)? / size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(1)? / size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = centered
            .broadcast_div(&denom)?
            .reshape(dims.as_slice())?
            .to_dtype(policy.compute())?;

        let (gamma, beta) = self.affine(state, &dims, policy.compute())?;
        if let Some(gamma) = &gamma {
            normalized = normalized.broadcast_mul(gamma)?;
        }
        if let Some(beta) = &beta {
            normalized = normalized.broadcast_add(beta)?;
        }
        Ok(normalized)
    }

    fn forward_generic(
        &self,
        state: &BuiltState,
        input: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        let compute = policy.cast_for_compute(input)?;
        let dims = compute.dims().to_vec();
        let stat_policy = PrecisionPolicy::new(input.dtype(), compute.dtype(), state.param_dtype);
        let stats = moments(&compute, state.axes.as_slice(), true, &stat_policy, false)?;
        let mean = cast_tensor(&stats.mean, compute.dtype())?;
        let variance = cast_tensor(&stats.variance, compute.dtype())?;
        let (gamma, beta) = self.affine(state, &dims, compute.dtype())?;
        batch_normalization(
            &compute,
            &mean,
            &variance,
            beta.as_ref(),
            gamma.as_ref(),
            self.config.epsilon,
        )
    }
}

impl NormalizationLayer for LayerNorm {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn build(
        &mut self,
        input_shape: &[Option<usize>],
        registry: &mut dyn VariableRegistry,
    ) -> Result<()> {
        LayerNorm::build(self, input_shape, registry)
    }

    fn is_built(&self) -> bool {
        self.state.is_some()
    }

    fn forward(&self, input: &Tensor, mode: &TrainingMode) -> Result<Tensor> {
        LayerNorm::forward(self, input, mode)
    }

    fn config_value(&self) -> Result<serde_json::Value> {
        self.config.to_value()
    }
}
