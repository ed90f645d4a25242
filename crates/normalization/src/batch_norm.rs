//! Batch normalisation with moving statistics.
//!
//! A single configuration-driven layer covers both behaviours of the layer:
//! the default one and the `legacy` one, which differs only in how the fused
//! kernel is chosen and in ignoring the `trainable` override. Variables are
//! allocated from a [`VariableRegistry`] at build time; every forward call
//! takes an explicit [`TrainingMode`].
//!
//! In training the layer normalises with batch moments and queues moving
//! average updates, which are committed only after the output was produced.
//! In inference it normalises with the moving averages.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::axis::{AxisSpec, ResolvedAxes};
use crate::dtypes::{self, cast_tensor, FloatType, PrecisionPolicy};
use crate::fused::{self, DataFormat, FusedRequest};
use crate::ghost::VirtualBatch;
use crate::mode::{LearningPhase, TrainingMode};
use crate::moments::moments;
use crate::moving::{merge_replicas, PendingUpdate, StatVariable, UpdateBatch};
use crate::norm::NormalizationLayer;
use crate::renorm::{compose_transforms, RenormClipping, RenormState};
use crate::transform::{batch_normalization, Broadcaster};
use crate::variables::{Initializer, VariableRegistry, WeightSpec};
use crate::{checks, config, NormError, Result};

/// Training-time scale and bias derived from the (expanded) input dims.
///
/// The returned tensors must broadcast against the input. They are composed
/// in front of `gamma`/`beta` and only applied while training.
#[derive(Clone)]
pub struct Adjustment(Arc<dyn Fn(&[usize]) -> Result<(Tensor, Tensor)> + Send + Sync>);

impl Adjustment {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[usize]) -> Result<(Tensor, Tensor)> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, dims: &[usize]) -> Result<(Tensor, Tensor)> {
        (self.0)(dims)
    }
}

impl fmt::Debug for Adjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Adjustment(..)")
    }
}

/// Options of a [`BatchNorm`] layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchNormConfig {
    pub name: String,
    /// Feature axes; statistics are reduced over all others.
    pub axis: AxisSpec,
    /// Decay of the moving averages.
    pub momentum: f64,
    pub epsilon: f64,
    /// Learn an offset `beta`.
    pub center: bool,
    /// Learn a scale `gamma`.
    pub scale: bool,
    pub beta_initializer: Initializer,
    pub gamma_initializer: Initializer,
    pub moving_mean_initializer: Initializer,
    pub moving_variance_initializer: Initializer,
    pub renorm: bool,
    /// Bounds keyed by `rmin`, `rmax` and `dmax`.
    pub renorm_clipping: BTreeMap<String, f64>,
    pub renorm_momentum: f64,
    /// `Some(true)` requires the fused kernel, `Some(false)` disables it and
    /// `None` uses it whenever possible.
    pub fused: Option<bool>,
    pub trainable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_batch_size: Option<usize>,
    /// Layer dtype; half precision keeps its variables in `f32`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<FloatType>,
    /// Legacy fused selection, ignoring `trainable = false` in forward calls.
    pub legacy: bool,
    /// Return zero statistics and skip updates for empty batches.
    pub support_zero_size_input: bool,
    #[serde(skip)]
    pub adjustment: Option<Adjustment>,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        Self {
            name: "batch_normalization".to_string(),
            axis: AxisSpec::Single(-1),
            momentum: 0.99,
            epsilon: 1e-3,
            center: true,
            scale: true,
            beta_initializer: Initializer::Zeros,
            gamma_initializer: Initializer::Ones,
            moving_mean_initializer: Initializer::Zeros,
            moving_variance_initializer: Initializer::Ones,
            renorm: false,
            renorm_clipping: BTreeMap::new(),
            renorm_momentum: 0.99,
            fused: None,
            trainable: true,
            virtual_batch_size: None,
            dtype: None,
            legacy: false,
            support_zero_size_input: false,
            adjustment: None,
        }
    }
}

impl BatchNormConfig {
    pub fn new(axis: impl Into<AxisSpec>) -> Self {
        Self {
            axis: axis.into(),
            ..Self::default()
        }
    }

    /// Key-value form of the configuration.
    ///
    /// Renorm options are emitted only when renorm is enabled. The adjustment
    /// function cannot be represented and is dropped with a warning.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(self)?;
        if !self.renorm {
            config::remove_keys(&mut value, &["renorm", "renorm_clipping", "renorm_momentum"]);
        }
        if self.adjustment.is_some() {
            log::warn!(
                "the `adjustment` function of batch normalization layer `{}` cannot be \
                 serialized and has been omitted from the layer config; it will not be \
                 included when re-creating the layer from the saved config",
                self.name
            );
        }
        Ok(value)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    fn fused_request(&self) -> FusedRequest<'_> {
        FusedRequest {
            axis: &self.axis,
            renorm: self.renorm,
            virtual_batch_size: self.virtual_batch_size,
            has_adjustment: self.adjustment.is_some(),
            compute_dtype: self.dtype.map(FloatType::to_dtype),
        }
    }
}

fn validate_unit_interval(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(NormError::config(format!("{name} must lie in [0, 1], got {value}")))
    }
}

#[derive(Debug, Clone)]
struct RenormVariables {
    moving_stddev: StatVariable,
    state: RenormState,
}

#[derive(Debug, Clone)]
struct LayerVariables {
    gamma: Option<StatVariable>,
    beta: Option<StatVariable>,
    moving_mean: StatVariable,
    moving_variance: StatVariable,
    renorm: Option<RenormVariables>,
}

#[derive(Debug, Clone)]
struct BuiltState {
    rank: usize,
    /// Feature axes of the tensor the math runs on (shifted under ghost batches).
    axes: ResolvedAxes,
    /// `(axis, size)` pairs of the caller-facing input.
    axis_dims: Vec<(usize, usize)>,
    param_shape: Vec<usize>,
    param_dtype: DType,
    data_format: Option<DataFormat>,
    vars: LayerVariables,
}

/// Batch normalisation layer.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    config: BatchNormConfig,
    fused: Option<bool>,
    clipping: RenormClipping,
    virtual_batch: Option<VirtualBatch>,
    state: Option<BuiltState>,
}

impl BatchNorm {
    /// Validates the options that do not depend on the input shape.
    pub fn new(config: BatchNormConfig) -> Result<Self> {
        validate_unit_interval("momentum", config.momentum)?;
        if !(config.epsilon >= 0.0 && config.epsilon.is_finite()) {
            return Err(NormError::config(format!(
                "epsilon must be a finite non-negative number, got {}",
                config.epsilon
            )));
        }
        let clipping = if config.renorm {
            validate_unit_interval("renorm_momentum", config.renorm_momentum)?;
            RenormClipping::from_map(&config.renorm_clipping)?
        } else {
            RenormClipping::default()
        };
        let virtual_batch = config.virtual_batch_size.map(VirtualBatch::new).transpose()?;
        let fused = fused::resolve_requested(config.fused, config.legacy, &config.fused_request())?;
        Ok(Self {
            config,
            fused,
            clipping,
            virtual_batch,
            state: None,
        })
    }

    pub fn config(&self) -> &BatchNormConfig {
        &self.config
    }

    /// Current fused decision: undecided (`None`) until built when automatic.
    pub fn fused(&self) -> Option<bool> {
        match &self.state {
            Some(state) => Some(state.data_format.is_some()),
            None => self.fused,
        }
    }

    pub fn data_format(&self) -> Option<DataFormat> {
        self.state.as_ref().and_then(|state| state.data_format)
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        self.config.trainable = trainable;
    }

    pub fn output_shape(&self, input_shape: &[usize]) -> Vec<usize> {
        input_shape.to_vec()
    }

    fn built(&self) -> Result<&BuiltState> {
        self.state.as_ref().ok_or(NormError::NotBuilt("batch_normalization"))
    }

    pub fn param_shape(&self) -> Result<&[usize]> {
        Ok(&self.built()?.param_shape)
    }

    pub fn gamma(&self) -> Result<Option<Tensor>> {
        self.built()?.vars.gamma.as_ref().map(StatVariable::read).transpose()
    }

    pub fn beta(&self) -> Result<Option<Tensor>> {
        self.built()?.vars.beta.as_ref().map(StatVariable::read).transpose()
    }

    pub fn moving_mean(&self) -> Result<Tensor> {
        self.built()?.vars.moving_mean.read()
    }

    pub fn moving_variance(&self) -> Result<Tensor> {
        self.built()?.vars.moving_variance.read()
    }

    pub fn moving_stddev(&self) -> Result<Option<Tensor>> {
        self.built()?
            .vars
            .renorm
            .as_ref()
            .map(|renorm| renorm.moving_stddev.read())
            .transpose()
    }

    /// Every variable in creation order.
    pub fn variables(&self) -> Result<Vec<StatVariable>> {
        let state = self.built()?;
        let mut vars = Vec::new();
        vars.extend(state.vars.gamma.clone());
        vars.extend(state.vars.beta.clone());
        vars.push(state.vars.moving_mean.clone());
        vars.push(state.vars.moving_variance.clone());
        if let Some(renorm) = &state.vars.renorm {
            vars.push(renorm.moving_stddev.clone());
            vars.push(renorm.state.mean.clone());
            vars.push(renorm.state.stddev.clone());
        }
        Ok(vars)
    }

    /// Replaces the running statistics of this layer and every replica with
    /// their mean across all of them.
    ///
    /// Replicas are layers built with the same shapes that trained on
    /// separate shards; the gamma/beta they share with an optimiser are left
    /// alone. All statistics are written together.
    pub fn sync_replicas(&self, replicas: &[&BatchNorm]) -> Result<()> {
        let state = self.built()?;
        let others = replicas
            .iter()
            .map(|replica| replica.built())
            .collect::<Result<Vec<_>>>()?;
        let statistics = |vars: &LayerVariables| {
            let mut stats = vec![vars.moving_mean.clone(), vars.moving_variance.clone()];
            if let Some(renorm) = &vars.renorm {
                stats.push(renorm.moving_stddev.clone());
                stats.push(renorm.state.mean.clone());
                stats.push(renorm.state.stddev.clone());
            }
            stats
        };

        let own = statistics(&state.vars);
        let mut per_replica = Vec::with_capacity(others.len());
        for other in &others {
            let stats = statistics(&other.vars);
            if stats.len() != own.len() {
                return Err(NormError::config(format!(
                    "cannot sync `{}` with a replica that differs in renorm",
                    self.config.name
                )));
            }
            per_replica.push(stats);
        }

        let mut updates = UpdateBatch::new();
        for (index, variable) in own.iter().enumerate() {
            let mut values = vec![variable.read()?];
            for stats in &per_replica {
                values.push(stats[index].read()?);
            }
            let merged = merge_replicas(&values)?;
            updates.push(PendingUpdate::assign(variable, &merged)?);
            for stats in &per_replica {
                updates.push(PendingUpdate::assign(&stats[index], &merged)?);
            }
        }
        log::debug!(
            "synced {} with {} replicas",
            self.config.name,
            replicas.len()
        );
        updates.commit()
    }

    /// Builds from a concrete tensor's shape.
    pub fn build_for(&mut self, input: &Tensor, registry: &mut dyn VariableRegistry) -> Result<()> {
        self.build(&checks::known_shape(input.dims()), registry)
    }

    fn add_variables(
        &self,
        registry: &mut dyn VariableRegistry,
        param_shape: &[usize],
        param_dtype: DType,
    ) -> Result<LayerVariables> {
        let cfg = &self.config;
        let name = |suffix: &str| format!("{}/{suffix}", cfg.name);
        let gamma = if cfg.scale {
            Some(registry.add_weight(WeightSpec::trainable(
                name("gamma"),
                param_shape,
                param_dtype,
                cfg.gamma_initializer,
            ))?)
        } else {
            None
        };
        let beta = if cfg.center {
            Some(registry.add_weight(WeightSpec::trainable(
                name("beta"),
                param_shape,
                param_dtype,
                cfg.beta_initializer,
            ))?)
        } else {
            None
        };
        let moving_mean = registry.add_weight(WeightSpec::running_statistic(
            name("moving_mean"),
            param_shape,
            param_dtype,
            cfg.moving_mean_initializer,
        ))?;
        let moving_variance = registry.add_weight(WeightSpec::running_statistic(
            name("moving_variance"),
            param_shape,
            param_dtype,
            cfg.moving_variance_initializer,
        ))?;

        let renorm = if cfg.renorm {
            // Renorm tracks the inference stddev rather than the variance.
            let stddev_init = cfg.moving_variance_initializer.sqrt();
            let moving_stddev = registry.add_weight(WeightSpec::running_statistic(
                name("moving_stddev"),
                param_shape,
                param_dtype,
                stddev_init,
            ))?;
            let mean = registry.add_weight(WeightSpec::running_statistic(
                name("renorm_mean"),
                param_shape,
                param_dtype,
                cfg.moving_mean_initializer,
            ))?;
            let stddev = registry.add_weight(WeightSpec::running_statistic(
                name("renorm_stddev"),
                param_shape,
                param_dtype,
                stddev_init,
            ))?;
            Some(RenormVariables {
                moving_stddev,
                state: RenormState {
                    mean,
                    stddev,
                    momentum: cfg.renorm_momentum,
                    clipping: self.clipping,
                },
            })
        } else {
            None
        };
        Ok(LayerVariables {
            gamma,
            beta,
            moving_mean,
            moving_variance,
            renorm,
        })
    }

    /// Resolves axes and the fused path for `input_shape` and creates the variables.
    ///
    /// Unknown dimensions are `None`; the feature axes must be known.
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
        let name = self.config.name.clone();
        let rank = checks::expect_known_rank(&name, input_shape)?;
        let axes = self.config.axis.resolve(rank)?;
        if let Some(vb) = &self.virtual_batch {
            vb.validate(&axes, self.config.adjustment.is_some())?;
        }

        let feasible = fused::fused_can_be_used(&self.config.fused_request());
        let data_format =
            fused::resolve_at_build(self.fused, self.config.legacy, feasible, rank, &axes)?;

        let axis_dims = axes
            .as_slice()
            .iter()
            .map(|&axis| Ok((axis, checks::expect_defined_dim(&name, input_shape, axis)?)))
            .collect::<Result<Vec<_>>>()?;

        let full = (0..rank)
            .map(|axis| axis_size(&axis_dims, axis))
            .collect::<Vec<_>>();
        let (axes, param_shape) = match &self.virtual_batch {
            Some(vb) => (vb.shift_axes(&axes), vb.param_shape(&full)),
            None => {
                let param_shape = axes.param_shape(&full);
                (axes, param_shape)
            }
        };

        let param_dtype = dtypes::param_dtype(self.config.dtype.map(FloatType::to_dtype));
        let vars = self.add_variables(registry, &param_shape, param_dtype)?;

        log::info!(
            "built {name}: axes={:?} param_shape={param_shape:?} path={}",
            axes.as_slice(),
            match data_format {
                Some(format) => format!("fused {format:?}"),
                None => "generic".to_string(),
            }
        );

        self.state = Some(BuiltState {
            rank,
            axes,
            axis_dims,
            param_shape,
            param_dtype,
            data_format,
            vars,
        });
        Ok(())
    }

    /// Mode after applying the `trainable` override.
    fn effective_mode(&self, mode: &TrainingMode) -> TrainingMode {
        if !self.config.legacy && !self.config.trainable {
            return TrainingMode::Infer;
        }
        match mode.constant_value() {
            Some(_) => mode.clone(),
            // Read the flag once so a concurrent flip cannot mix both paths.
            None => TrainingMode::RuntimeDecided(LearningPhase::new(mode.is_training())),
        }
    }

    /// Normalises `input` and, in training, updates the moving statistics.
    ///
    /// With a declared layer `dtype` the input is cast to it first and the
    /// output comes back in that dtype; otherwise the input dtype is kept.
    pub fn forward(&self, input: &Tensor, mode: &TrainingMode) -> Result<Tensor> {
        let state = self.built()?;
        checks::expect_input_spec(&self.config.name, input, state.rank, &state.axis_dims)?;
        let input = match self.config.dtype {
            Some(dtype) => cast_tensor(input, dtype.to_dtype())?,
            None => input.clone(),
        };
        let input = &input;
        let mode = self.effective_mode(mode);
        let mut updates = UpdateBatch::new();
        let output = match state.data_format {
            Some(format) => self.forward_fused(state, input, &mode, format, &mut updates)?,
            None => self.forward_generic(state, input, &mode, &mut updates)?,
        };
        updates.commit()?;
        Ok(output)
    }

    fn batch_size(&self, input: &Tensor) -> Option<usize> {
        if self.config.support_zero_size_input {
            input.dims().first().copied()
        } else {
            None
        }
    }

    fn forward_fused(
        &self,
        state: &BuiltState,
        input: &Tensor,
        mode: &TrainingMode,
        format: DataFormat,
        updates: &mut UpdateBatch,
    ) -> Result<Tensor> {
        let device = input.device();
        let gamma = match &state.vars.gamma {
            Some(gamma) => gamma.read()?,
            None => Tensor::ones(state.param_shape.as_slice(), state.param_dtype, device)?,
        };
        let beta = match &state.vars.beta {
            Some(beta) => beta.read()?,
            None => Tensor::zeros(state.param_shape.as_slice(), state.param_dtype, device)?,
        };
        let moving_mean = state.vars.moving_mean.read()?;
        let moving_variance = state.vars.moving_variance.read()?;
        let epsilon = self.config.epsilon;
        let momentum = self.config.momentum;

        match mode {
            TrainingMode::Infer => {
                let result = fused::fused_batch_norm(
                    input,
                    &gamma,
                    &beta,
                    &moving_mean,
                    &moving_variance,
                    epsilon,
                    format,
                    false,
                    None,
                )?;
                Ok(result.output)
            }
            TrainingMode::Train => {
                // Averaged with the kernel's factor against the value held at commit.
                let result = fused::fused_batch_norm(
                    input,
                    &gamma,
                    &beta,
                    &moving_mean,
                    &moving_variance,
                    epsilon,
                    format,
                    true,
                    None,
                )?;
                let factor = 1.0 - momentum;
                updates.push(PendingUpdate::exponential_average(
                    &state.vars.moving_mean,
                    &result.mean,
                    factor,
                )?);
                updates.push(PendingUpdate::exponential_average(
                    &state.vars.moving_variance,
                    &result.variance,
                    factor,
                )?);
                Ok(result.output)
            }
            TrainingMode::RuntimeDecided(phase) => {
                let training = phase.is_training();
                let result = fused::fused_batch_norm(
                    input,
                    &gamma,
                    &beta,
                    &moving_mean,
                    &moving_variance,
                    epsilon,
                    format,
                    training,
                    None,
                )?;
                if training {
                    let batch_size = self.batch_size(input);
                    updates.push(PendingUpdate::moving_average(
                        &state.vars.moving_mean,
                        &result.mean,
                        momentum,
                        batch_size,
                    )?);
                    updates.push(PendingUpdate::moving_average(
                        &state.vars.moving_variance,
                        &result.variance,
                        momentum,
                        batch_size,
                    )?);
                }
                Ok(result.output)
            }
        }
    }

    fn forward_generic(
        &self,
        state: &BuiltState,
        input: &Tensor,
        mode: &TrainingMode,
        updates: &mut UpdateBatch,
    ) -> Result<Tensor> {
        let input_dtype = input.dtype();
        let policy = PrecisionPolicy::from_input_dtype(input_dtype);
        let original_dims = input.dims().to_vec();
        let mut inputs = policy.cast_for_compute(input)?;
        if let Some(vb) = &self.virtual_batch {
            inputs = vb.split(&inputs)?;
        }
        let dims = inputs.dims().to_vec();
        let broadcaster = Broadcaster::new(&dims, &state.axes);

        let mut scale = match &state.vars.gamma {
            Some(gamma) => Some(broadcaster.apply(&gamma.read()?)?),
            None => None,
        };
        let mut offset = match &state.vars.beta {
            Some(beta) => Some(broadcaster.apply(&beta.read()?)?),
            None => None,
        };

        let training = mode.is_training();

        let (mean, variance) = if training {
            if let Some(adjustment) = &self.config.adjustment {
                let (adj_scale, adj_bias) = adjustment.call(&dims)?;
                let (s, o) =
                    compose_transforms(&adj_scale, &adj_bias, scale.as_ref(), offset.as_ref())?;
                scale = Some(s);
                offset = Some(o);
            }

            let reduction_axes = match &self.virtual_batch {
                Some(vb) => vb.reduction_axes(&state.axes, dims.len()),
                None => state.axes.reduction_axes(dims.len()),
            };
            let keep_dims = self.virtual_batch.is_some() || state.axes.len() > 1;
            let stat_policy = PrecisionPolicy::new(input_dtype, inputs.dtype(), state.param_dtype);
            let batch = moments(
                &inputs,
                &reduction_axes,
                keep_dims,
                &stat_policy,
                self.config.support_zero_size_input,
            )?;

            let (mut new_mean, mut new_variance) = match &self.virtual_batch {
                Some(vb) => (
                    vb.average_sub_batches(&batch.mean)?,
                    vb.average_sub_batches(&batch.variance)?,
                ),
                None => (batch.mean.clone(), batch.variance.clone()),
            };
            let batch_size = if self.config.support_zero_size_input {
                original_dims.first().copied()
            } else {
                None
            };

            if let Some(renorm) = &state.vars.renorm {
                let correction = renorm.state.correction_and_moments(
                    &new_mean,
                    &new_variance,
                    self.config.epsilon,
                    true,
                    batch_size,
                    updates,
                )?;
                let r = broadcaster.apply(&correction.r)?;
                let d = broadcaster.apply(&correction.d)?;
                let (s, o) = compose_transforms(&r, &d, scale.as_ref(), offset.as_ref())?;
                scale = Some(s);
                offset = Some(o);
                new_mean = correction.mean;
                new_variance = correction.variance;
            }

            self.queue_moving_updates(state, &new_mean, &new_variance, batch_size, updates)?;
            (batch.mean, batch.variance)
        } else {
            (state.vars.moving_mean.read()?, state.vars.moving_variance.read()?)
        };

        let compute_dtype = inputs.dtype();
        let mean = broadcaster.apply(&cast_tensor(&mean, compute_dtype)?)?;
        let variance = broadcaster.apply(&cast_tensor(&variance, compute_dtype)?)?;
        let scale = scale.map(|s| cast_tensor(&s, compute_dtype)).transpose()?;
        let offset = offset.map(|o| cast_tensor(&o, compute_dtype)).transpose()?;

        let output = batch_normalization(
            &inputs,
            &mean,
            &variance,
            offset.as_ref(),
            scale.as_ref(),
            self.config.epsilon,
        )?;
        let output = policy.cast_to_storage(&output)?;
        match &self.virtual_batch {
            Some(vb) => vb.merge(&output, &original_dims),
            None => Ok(output),
        }
    }

    fn queue_moving_updates(
        &self,
        state: &BuiltState,
        new_mean: &Tensor,
        new_variance: &Tensor,
        batch_size: Option<usize>,
        updates: &mut UpdateBatch,
    ) -> Result<()> {
        let momentum = self.config.momentum;
        let epsilon = self.config.epsilon;
        updates.push(PendingUpdate::moving_average(
            &state.vars.moving_mean,
            new_mean,
            momentum,
            batch_size,
        )?);
        match &state.vars.renorm {
            Some(renorm) => {
                // Epsilon is folded into the moving stddev to mirror the training path.
                let stddev = (new_variance + epsilon)?.sqrt()?;
                updates.push(PendingUpdate::moving_average(
                    &renorm.moving_stddev,
                    &stddev,
                    momentum,
                    batch_size,
                )?);
                updates.push(PendingUpdate::variance_from_stddev(
                    &state.vars.moving_variance,
                    &renorm.moving_stddev,
                    epsilon,
                )?);
            }
            None => updates.push(PendingUpdate::moving_average(
                &state.vars.moving_variance,
                new_variance,
                momentum,
                batch_size,
            )?),
        }
        Ok(())
    }
}

fn axis_size(axis_dims: &[(usize, usize)], axis: usize) -> usize {
    axis_dims
        .iter()
        .find(|(a, _)| *a == axis)
        .map(|(_, size)| *size)
        .unwrap_or(1)
}

impl NormalizationLayer for BatchNorm {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn build(
        &mut self,
        input_shape: &[Option<usize>],
        registry: &mut dyn VariableRegistry,
    ) -> Result<()> {
        BatchNorm::build(self, input_shape, registry)
    }

    fn is_built(&self) -> bool {
        self.state.is_some()
    }

    fn forward(&self, input: &Tensor, mode: &TrainingMode) -> Result<Tensor> {
        BatchNorm::forward(self, input, mode)
    }

    fn config_value(&self) -> Result<serde_json::Value> {
        self.config.to_value()
    }
}
