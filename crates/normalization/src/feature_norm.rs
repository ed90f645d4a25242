//! Feature normalisation with statistics learned ahead of time.
//!
//! Unlike batch normalisation the statistics are not tracked during training:
//! they are either given directly or learned by `adapt`, which folds a
//! sequence of batches into a running count, mean and variance. Layers that
//! adapted on disjoint shards can be merged into the statistics of the whole
//! dataset.
//!
//! The kept `axis` values select the features that get their own mean and
//! variance; every other axis is reduced. `axis = None` learns one global
//! statistic.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::axis::AxisSpec;
use crate::dtypes::{cast_tensor, PrecisionPolicy};
use crate::mode::TrainingMode;
use crate::moments::{moments, MomentAccumulator};
use crate::moving::StatVariable;
use crate::norm::NormalizationLayer;
use crate::variables::{Initializer, VariableRegistry, WeightSpec};
use crate::{checks, NormError, Result};

/// Floor applied to the standard deviation, so zero-variance features map to 0.
const STDDEV_FLOOR: f64 = 1e-7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureNormConfig {
    pub name: String,
    /// Kept axes; `None` computes a single global mean and variance.
    pub axis: Option<AxisSpec>,
    /// Fixed mean, broadcast to the kept-axis shape at build time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variance: Option<Vec<f64>>,
}

impl Default for FeatureNormConfig {
    fn default() -> Self {
        Self {
            name: "normalization".to_string(),
            axis: Some(AxisSpec::Single(-1)),
            mean: None,
            variance: None,
        }
    }
}

impl FeatureNormConfig {
    pub fn new(axis: Option<AxisSpec>) -> Self {
        Self {
            axis,
            ..Self::default()
        }
    }

    /// Configuration with fixed statistics instead of adapted ones.
    pub fn with_statistics(axis: Option<AxisSpec>, mean: Vec<f64>, variance: Vec<f64>) -> Self {
        Self {
            axis,
            mean: Some(mean),
            variance: Some(variance),
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
    keep_dims: Vec<(usize, usize)>,
    reduce_axes: Vec<usize>,
    stat_shape: Vec<usize>,
    broadcast_shape: Vec<usize>,
    mean: StatVariable,
    variance: StatVariable,
    count: StatVariable,
}

impl BuiltState {
    fn accumulator(&self) -> Result<MomentAccumulator> {
        let count = self.count.read()?.to_scalar::<f64>()?;
        MomentAccumulator::new(count, self.mean.read()?, self.variance.read()?)
    }

    fn store(&self, acc: &MomentAccumulator) -> Result<()> {
        let count = Tensor::new(acc.count(), self.count.read()?.device())?;
        self.mean.assign(acc.mean())?;
        self.variance.assign(acc.variance())?;
        self.count.assign(&count)?;
        Ok(())
    }
}

/// Standardises inputs with a learned or fixed mean and variance.
#[derive(Debug, Clone)]
pub struct FeatureNormalization {
    config: FeatureNormConfig,
    state: Option<BuiltState>,
}

impl FeatureNormalization {
    pub fn new(config: FeatureNormConfig) -> Result<Self> {
        if let Some(axis) = &config.axis {
            if axis.names_batch_axis() {
                return Err(NormError::config(format!(
                    "The argument 'axis' may not be 0. Received: axis={axis}"
                )));
            }
        }
        if config.mean.is_some() != config.variance.is_some() {
            return Err(NormError::config(format!(
                "when setting values directly, both `mean` and `variance` must be set. \
                 Received: mean {:?} and variance {:?}",
                config.mean, config.variance
            )));
        }
        Ok(Self {
            config,
            state: None,
        })
    }

    pub fn config(&self) -> &FeatureNormConfig {
        &self.config
    }

    fn built(&self) -> Result<&BuiltState> {
        self.state.as_ref().ok_or(NormError::NotBuilt("normalization"))
    }

    /// 0-D inputs become `[1, 1]` and 1-D inputs `[N, 1]`; integers are cast to `f32`.
    fn prepare(input: &Tensor) -> Result<Tensor> {
        let input = match input.dtype() {
            DType::F16 | DType::BF16 | DType::F32 | DType::F64 => input.clone(),
            _ => input.to_dtype(DType::F32)?,
        };
        Ok(match input.rank() {
            0 => input.reshape((1, 1))?,
            1 => input.unsqueeze(1)?,
            _ => input,
        })
    }

    fn prepared_shape(input_shape: &[Option<usize>]) -> Vec<Option<usize>> {
        match input_shape.len() {
            0 => vec![Some(1), Some(1)],
            1 => vec![input_shape[0], Some(1)],
            _ => input_shape.to_vec(),
        }
    }

    /// Resolves the kept axes and creates the statistic variables.
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
        let shape = Self::prepared_shape(input_shape);
        let rank = shape.len();

        let keep_axes = match &self.config.axis {
            Some(axis) => {
                // The batch axis cannot be kept, so `-ndim` is out of range too.
                let signed_rank = rank as isize;
                if axis.to_vec().iter().any(|&a| a <= -signed_rank || a >= signed_rank) {
                    return Err(NormError::config(format!(
                        "All `axis` values must be in the range [1 - ndim, ndim). Received \
                         inputs with ndim={rank}, while axis={axis}"
                    )));
                }
                axis.resolve(rank)?.sorted().as_slice().to_vec()
            }
            None => Vec::new(),
        };
        let keep_dims = keep_axes
            .iter()
            .map(|&axis| Ok((axis, checks::expect_defined_dim(&name, &shape, axis)?)))
            .collect::<Result<Vec<_>>>()?;
        let stat_shape = keep_dims.iter().map(|(_, size)| *size).collect::<Vec<_>>();
        let broadcast_shape = (0..rank)
            .map(|axis| {
                keep_dims
                    .iter()
                    .find(|(kept, _)| *kept == axis)
                    .map_or(1, |(_, size)| *size)
            })
            .collect::<Vec<_>>();
        let reduce_axes = (0..rank).filter(|axis| !keep_axes.contains(axis)).collect();

        let stat = |suffix: &str, shape: &[usize], dtype: DType| {
            WeightSpec::running_statistic(
                format!("{name}/{suffix}"),
                shape,
                dtype,
                Initializer::Zeros,
            )
        };
        let mean = registry.add_weight(stat("mean", &stat_shape, DType::F32))?;
        let variance = registry.add_weight(stat("variance", &stat_shape, DType::F32))?;
        let count = registry.add_weight(stat("count", &[], DType::F64))?;

        if let (Some(mean_values), Some(variance_values)) =
            (&self.config.mean, &self.config.variance)
        {
            let device = mean.read()?.device().clone();
            mean.assign(&broadcast_values(mean_values, &stat_shape, &device)?)?;
            variance.assign(&broadcast_values(variance_values, &stat_shape, &device)?)?;
        }

        log::info!("built {name}: kept axes={keep_axes:?} statistic shape={stat_shape:?}");
        self.state = Some(BuiltState {
            rank,
            keep_dims,
            reduce_axes,
            stat_shape,
            broadcast_shape,
            mean,
            variance,
            count,
        });
        Ok(())
    }

    pub fn build_for(&mut self, input: &Tensor, registry: &mut dyn VariableRegistry) -> Result<()> {
        let prepared = Self::prepare(input)?;
        let mut shape = checks::known_shape(prepared.dims());
        shape[0] = None;
        self.build(&shape, registry)
    }

    pub fn is_adapted(&self) -> Result<bool> {
        Ok(self.built()?.count.read()?.to_scalar::<f64>()? > 0.0)
    }

    /// Clears the adapted statistics.
    pub fn reset_state(&mut self) -> Result<()> {
        let state = self.built()?;
        state.mean.assign(&state.mean.read()?.zeros_like()?)?;
        state.variance.assign(&state.variance.read()?.zeros_like()?)?;
        state.count.assign(&state.count.read()?.zeros_like()?)?;
        Ok(())
    }

    fn batch_moments(state: &BuiltState, name: &str, batch: &Tensor) -> Result<MomentAccumulator> {
        let batch = Self::prepare(batch)?;
        checks::expect_input_spec(name, &batch, state.rank, &state.keep_dims)?;
        let dims = batch.dims();
        let count = state.reduce_axes.iter().map(|&axis| dims[axis]).product::<usize>();
        let policy = PrecisionPolicy::new(batch.dtype(), batch.dtype(), DType::F32);
        let stats = moments(&batch, &state.reduce_axes, false, &policy, false)?;
        MomentAccumulator::new(count as f64, stats.mean, stats.variance)
    }

    /// Folds one more batch into the adapted statistics.
    pub fn update_state(&mut self, batch: &Tensor) -> Result<()> {
        let state = self.built()?;
        let mut acc = state.accumulator()?;
        let batch = Self::batch_moments(state, &self.config.name, batch)?;
        acc.merge(&batch)?;
        state.store(&acc)
    }

    /// Learns the statistics of `batches`, replacing previous ones.
    ///
    /// Builds the layer from the first batch when needed. The statistics are
    /// written only after every batch was processed.
    pub fn adapt<'a, I>(&mut self, batches: I, registry: &mut dyn VariableRegistry) -> Result<()>
    where
        I: IntoIterator<Item = &'a Tensor>,
    {
        let mut batches = batches.into_iter().peekable();
        let first = batches
            .peek()
            .copied()
            .ok_or_else(|| NormError::config("adapt needs at least one batch"))?;
        if self.state.is_none() {
            self.build_for(first, registry)?;
        }
        let state = self.built()?;
        let mut acc: Option<MomentAccumulator> = None;
        for batch in batches {
            let batch = Self::batch_moments(state, &self.config.name, batch)?;
            match acc.as_mut() {
                Some(acc) => acc.merge(&batch)?,
                None => acc = Some(batch),
            }
        }
        if let Some(acc) = acc {
            log::debug!("{} adapted on {} samples", self.config.name, acc.count());
            state.store(&acc)?;
        }
        Ok(())
    }

    /// Merges the statistics of layers adapted on other shards into this one.
    pub fn merge_state(&mut self, others: &[&FeatureNormalization]) -> Result<()> {
        let state = self.built()?;
        let mut acc = state.accumulator()?;
        for other in others {
            let other_state = other.built()?;
            if other_state.stat_shape != state.stat_shape {
                return Err(NormError::shape(format!(
                    "cannot merge statistics of shape {:?} into {:?}",
                    other_state.stat_shape, state.stat_shape
                )));
            }
            acc.merge(&other_state.accumulator()?)?;
        }
        state.store(&acc)
    }

    /// Statistics shaped by the kept axes.
    pub fn mean(&self) -> Result<Tensor> {
        self.built()?.mean.read()
    }

    pub fn variance(&self) -> Result<Tensor> {
        self.built()?.variance.read()
    }

    /// `[mean, variance, count]`.
    pub fn get_weights(&self) -> Result<Vec<Tensor>> {
        let state = self.built()?;
        Ok(vec![state.mean.read()?, state.variance.read()?, state.count.read()?])
    }

    /// `(x - mean) / max(sqrt(variance), 1e-7)`.
    pub fn forward(&self, input: &Tensor, _mode: &TrainingMode) -> Result<Tensor> {
        let state = self.built()?;
        let input = Self::prepare(input)?;
        checks::expect_input_spec(&self.config.name, &input, state.rank, &state.keep_dims)?;
        let policy = PrecisionPolicy::from_input_dtype(input.dtype());
        let compute = policy.cast_for_compute(&input)?;
        let dtype = compute.dtype();

        let shape = state.broadcast_shape.as_slice();
        let mean = cast_tensor(&state.mean.read()?, dtype)?.reshape(shape)?;
        let stddev = cast_tensor(&state.variance.read()?, dtype)?.reshape(shape)?.sqrt()?;
        let floor = Tensor::new(STDDEV_FLOOR, compute.device())?.to_dtype(dtype)?;
        let denom = stddev.broadcast_maximum(&floor)?;
        let output = compute.broadcast_sub(&mean)?.broadcast_div(&denom)?;
        Ok(policy.cast_to_storage(&output)?)
    }

    pub fn output_shape(&self, input_shape: &[usize]) -> Vec<usize> {
        match input_shape.len() {
            0 => vec![1, 1],
            1 => vec![input_shape[0], 1],
            _ => input_shape.to_vec(),
        }
    }
}

/// Broadcasts directly given values to `shape`: one value fills every entry.
fn broadcast_values(values: &[f64], shape: &[usize], device: &Device) -> Result<Tensor> {
    let expected = shape.iter().product::<usize>();
    let data = match values.len() {
        1 => vec![values[0] as f32; expected],
        n if n == expected => values.iter().map(|&v| v as f32).collect(),
        n => {
            return Err(NormError::shape(format!(
                "cannot broadcast {n} statistic values to shape {shape:?}"
            )))
        }
    };
    Ok(Tensor::from_vec(data, shape, device)?)
}

impl NormalizationLayer for FeatureNormalization {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn build(
        &mut self,
        input_shape: &[Option<usize>],
        registry: &mut dyn VariableRegistry,
    ) -> Result<()> {
        FeatureNormalization::build(self, input_shape, registry)
    }

    fn is_built(&self) -> bool {
        self.state.is_some()
    }

    fn forward(&self, input: &Tensor, mode: &TrainingMode) -> Result<Tensor> {
        FeatureNormalization::forward(self, input, mode)
    }

    fn output_shape(&self, input_shape: &[usize]) -> Vec<usize> {
        FeatureNormalization::output_shape(self, input_shape)
    }

    fn config_value(&self) -> Result<serde_json::Value> {
        self.config.to_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::ParameterStore;
    use candle_core::Device;

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok(a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?)
    }

    fn adapted(axis: Option<AxisSpec>, batches: &[Tensor]) -> Result<FeatureNormalization> {
        let mut store = ParameterStore::default();
        let mut layer = FeatureNormalization::new(FeatureNormConfig::new(axis))?;
        layer.adapt(batches, &mut store)?;
        Ok(layer)
    }

    fn infer(layer: &FeatureNormalization, input: &Tensor) -> Result<Tensor> {
        layer.forward(input, &TrainingMode::Infer)
    }

    #[test]
    fn adapt_standardises_a_single_feature() -> Result<()> {
        let device = Device::Cpu;
        let data = Tensor::new(&[[1f32], [2.0], [3.0]], &device)?;
        let layer = adapted(Some(AxisSpec::Single(-1)), &[data.clone()])?;
        assert!((layer.mean()?.to_vec1::<f32>()?[0] - 2.0).abs() < 1e-6);
        assert!((layer.variance()?.to_vec1::<f32>()?[0] - 2.0 / 3.0).abs() < 1e-6);

        let output = infer(&layer, &data)?.flatten_all()?.to_vec1::<f32>()?;
        for (value, expected) in output.iter().zip([-1.2247f32, 0.0, 1.2247]) {
            assert!((value - expected).abs() < 1e-4, "{output:?}");
        }
        Ok(())
    }

    #[test]
    fn batched_adapt_matches_one_shot_adapt() -> Result<()> {
        let device = Device::Cpu;
        let full = Tensor::new(&[[1f32], [2.0], [3.0], [4.0], [5.0]], &device)?;
        let parts = [full.narrow(0, 0, 2)?, full.narrow(0, 2, 2)?, full.narrow(0, 4, 1)?];
        let test = Tensor::new(&[[1f32], [2.0], [3.0]], &device)?;
        let expected = Tensor::new(&[[-1.414214f32], [-0.707107], [0.0]], &device)?;

        for axis in [Some(AxisSpec::Single(-1)), None] {
            let batched = adapted(axis.clone(), &parts)?;
            let one_shot = adapted(axis, &[full.clone()])?;
            assert!(max_diff(&infer(&batched, &test)?, &expected)? < 1e-5);
            assert!(max_diff(&infer(&one_shot, &test)?, &expected)? < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn global_statistics_ignore_the_input_layout() -> Result<()> {
        let device = Device::Cpu;
        let flat = Tensor::new(&[[1f32, 2.0, 3.0, 4.0, 5.0]], &device)?;
        let layer = adapted(None, &[flat])?;
        assert_eq!(layer.mean()?.dims(), &[] as &[usize]);
        let test = Tensor::new(&[[1f32], [2.0], [3.0]], &device)?;
        let expected = Tensor::new(&[[-1.414214f32], [-0.707107], [0.0]], &device)?;
        assert!(max_diff(&infer(&layer, &test)?, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn integer_inputs_are_cast() -> Result<()> {
        let device = Device::Cpu;
        let data = Tensor::new(&[[1i64], [2], [3], [4], [5]], &device)?;
        let layer = adapted(Some(AxisSpec::Single(-1)), &[data])?;
        let output = infer(&layer, &Tensor::new(&[[1u32], [2], [3]], &device)?)?;
        assert_eq!(output.dtype(), DType::F32);
        let expected = Tensor::new(&[[-1.414214f32], [-0.707107], [0.0]], &device)?;
        assert!(max_diff(&output, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn internal_axis_keeps_its_own_statistics() -> Result<()> {
        let device = Device::Cpu;
        let data = Tensor::new(
            &[[[1f32, 2., 3.], [2., 3., 4.]], [[3., 4., 5.], [4., 5., 6.]]],
            &device,
        )?;
        let layer = adapted(Some(AxisSpec::Single(1)), &[data.clone()])?;
        let expected = Tensor::new(
            &[
                [[-1.549193f32, -0.774597, 0.], [-1.549193, -0.774597, 0.]],
                [[0., 0.774597, 1.549193], [0., 0.774597, 1.549193]],
            ],
            &device,
        )?;
        assert!(max_diff(&infer(&layer, &data)?, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn multiple_axes_against_new_data() -> Result<()> {
        let device = Device::Cpu;
        let adapt = Tensor::new(
            &[[[1f32, 0., 3.], [2., 3., 4.]], [[3., -1., 5.], [4., 5., 8.]]],
            &device,
        )?;
        let test = Tensor::new(
            &[[[3f32, 1., -1.], [2., 5., 4.]], [[3., 0., 5.], [2., 5., 8.]]],
            &device,
        )?;
        let expected = Tensor::new(
            &[[[1f32, 3., -5.], [-1., 1., -1.]], [[1., 1., 1.], [-1., 1., 1.]]],
            &device,
        )?;
        let layer = adapted(Some(AxisSpec::Multiple(vec![1, 2])), &[adapt])?;
        assert!(max_diff(&infer(&layer, &test)?, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn axis_order_does_not_matter() -> Result<()> {
        let device = Device::Cpu;
        let data = Tensor::new(
            &[[[0f32, 1., 2.], [0., 2., 6.]], [[2., 3., 4.], [3., 6., 10.]]],
            &device,
        )?;
        let expected = Tensor::new(
            &[[[-1f32, -1., -1.], [-1., -1., -1.]], [[1., 1., 1.], [1., 1., 1.]]],
            &device,
        )?;
        for axis in [vec![1, 2], vec![2, 1], vec![1, -1], vec![-1, 1]] {
            let layer = adapted(Some(AxisSpec::Multiple(axis)), &[data.clone()])?;
            assert!(max_diff(&infer(&layer, &data)?, &expected)? < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn zero_variance_maps_to_zero() -> Result<()> {
        let device = Device::Cpu;
        let zeros = Tensor::zeros((3, 4), DType::F32, &device)?;
        let layer = adapted(Some(AxisSpec::Single(-1)), &[zeros.clone()])?;
        let output = infer(&layer, &zeros)?;
        assert_eq!(output.to_vec2::<f32>()?, vec![vec![0f32; 4]; 3]);
        Ok(())
    }

    #[test]
    fn low_rank_inputs_are_promoted() -> Result<()> {
        let device = Device::Cpu;
        let data = Tensor::new(&[0f32, 2.0, 0.0, 2.0], &device)?;
        let layer = adapted(Some(AxisSpec::Single(-1)), &[data.clone()])?;
        let output = infer(&layer, &data)?;
        assert_eq!(output.dims(), &[4, 1]);
        assert_eq!(output.flatten_all()?.to_vec1::<f32>()?, vec![-1.0, 1.0, -1.0, 1.0]);

        let scalar = infer(&layer, &Tensor::new(0f32, &device)?)?;
        assert_eq!(scalar.dims(), &[1, 1]);
        assert_eq!(scalar.flatten_all()?.to_vec1::<f32>()?, vec![-1.0]);
        assert_eq!(layer.output_shape(&[]), vec![1, 1]);
        Ok(())
    }

    #[test]
    fn direct_statistics_broadcast_at_build() -> Result<()> {
        let mut store = ParameterStore::default();
        let config =
            FeatureNormConfig::with_statistics(Some(AxisSpec::Single(-1)), vec![1.0], vec![2.0]);
        let mut layer = FeatureNormalization::new(config)?;
        layer.build(&[None, Some(2)], &mut store)?;
        let weights = layer.get_weights()?;
        assert_eq!(weights[0].to_vec1::<f32>()?, vec![1.0, 1.0]);
        assert_eq!(weights[1].to_vec1::<f32>()?, vec![2.0, 2.0]);
        assert!(!layer.is_adapted()?);
        Ok(())
    }

    #[test]
    fn adapted_weights_reproduce_the_layer() -> Result<()> {
        let device = Device::Cpu;
        let adapt = Tensor::new(
            &[[1f32, 2., 1.], [2., 3., 4.], [1., 2., 1.], [2., 3., 4.]],
            &device,
        )?;
        let layer = adapted(Some(AxisSpec::Single(-1)), &[adapt])?;
        let input = Tensor::new(&[[3f32, 1., 2.], [6., 5., 4.]], &device)?;
        let expected = Tensor::new(&[[3f32, -3., -0.33333333], [9., 5., 1.]], &device)?;
        let output = infer(&layer, &input)?;
        assert!(max_diff(&output, &expected)? < 1e-5);

        let weights = layer.get_weights()?;
        assert_eq!(weights[2].to_scalar::<f64>()?, 4.0);
        let to_vec = |t: &Tensor| -> Result<Vec<f64>> {
            Ok(t.to_dtype(DType::F64)?.to_vec1::<f64>()?)
        };
        let config = FeatureNormConfig::with_statistics(
            Some(AxisSpec::Single(-1)),
            to_vec(&weights[0])?,
            to_vec(&weights[1])?,
        );
        let mut direct = FeatureNormalization::new(config)?;
        direct.build(&[None, Some(3)], &mut ParameterStore::default())?;
        assert!(max_diff(&infer(&direct, &input)?, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn merged_shards_match_full_adapt() -> Result<()> {
        let device = Device::Cpu;
        let data = Tensor::rand(0f32, 1.0, (30, 10, 2), &device)?;
        let batches = (0..15)
            .map(|i| data.narrow(0, i * 2, 2))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let axis = Some(AxisSpec::Multiple(vec![1, 2]));
        let full = adapted(axis.clone(), &batches)?;

        let shard = |k: usize| batches.iter().skip(k).step_by(3).cloned().collect::<Vec<_>>();
        let mut first = adapted(axis.clone(), &shard(0))?;
        let second = adapted(axis.clone(), &shard(1))?;
        let third = adapted(axis, &shard(2))?;
        first.merge_state(&[&second, &third])?;

        assert!(max_diff(&infer(&full, &data)?, &infer(&first, &data)?)? < 1e-4);
        Ok(())
    }

    #[test]
    fn merge_matches_concatenated_statistics() -> Result<()> {
        let device = Device::Cpu;
        let mut a = adapted(None, &[Tensor::new(&[[1f32], [2.0], [3.0]], &device)?])?;
        let b = adapted(None, &[Tensor::new(&[[4f32], [5.0]], &device)?])?;
        a.merge_state(&[&b])?;
        assert!((a.mean()?.to_scalar::<f32>()? - 3.0).abs() < 1e-6);
        assert!((a.variance()?.to_scalar::<f32>()? - 2.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn incremental_updates_accumulate() -> Result<()> {
        let device = Device::Cpu;
        let mut store = ParameterStore::default();
        let mut layer = FeatureNormalization::new(FeatureNormConfig::default())?;
        layer.build(&[None, Some(1)], &mut store)?;
        layer.update_state(&Tensor::new(&[[1f32], [2.0], [3.0]], &device)?)?;
        layer.update_state(&Tensor::new(&[[4f32], [5.0]], &device)?)?;
        assert!((layer.mean()?.to_vec1::<f32>()?[0] - 3.0).abs() < 1e-6);
        layer.reset_state()?;
        assert!(!layer.is_adapted()?);
        Ok(())
    }

    #[test]
    fn axis_zero_is_rejected() {
        for axis in [AxisSpec::Single(0), AxisSpec::Multiple(vec![-1, 0])] {
            let err = FeatureNormalization::new(FeatureNormConfig::new(Some(axis))).unwrap_err();
            assert!(err.to_string().contains("may not be 0"));
        }
        let config = FeatureNormConfig {
            mean: Some(vec![1.0]),
            ..FeatureNormConfig::default()
        };
        assert!(FeatureNormalization::new(config).is_err());
    }

    #[test]
    fn out_of_range_axes_fail_build() {
        for axis in [
            AxisSpec::Single(3),
            AxisSpec::Single(-3),
            AxisSpec::Multiple(vec![1, 3]),
            AxisSpec::Multiple(vec![1, -3]),
        ] {
            let mut layer =
                FeatureNormalization::new(FeatureNormConfig::new(Some(axis))).expect("constructs");
            let err = layer
                .build(&[None, Some(2), Some(3)], &mut ParameterStore::default())
                .unwrap_err();
            assert!(err.to_string().contains("in the range"), "{err}");
        }
    }

    #[test]
    fn shape_mismatch_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let layer = adapted(
            Some(AxisSpec::Single(-1)),
            &[Tensor::zeros((2, 3), DType::F32, &device)?],
        )?;
        let wrong = Tensor::zeros((2, 4), DType::F32, &device)?;
        assert!(matches!(infer(&layer, &wrong), Err(NormError::Shape(_))));
        Ok(())
    }
}
