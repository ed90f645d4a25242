//! Shared statistic variables and their exponential moving-average updates.
//!
//! A forward pass never writes a variable directly. It records
//! [`PendingUpdate`]s in an [`UpdateBatch`] and commits the batch only once
//! the whole pass has succeeded. The commit locks every target before
//! evaluating any update rule, so averages are taken against the value held
//! at commit time and concurrent steps on a shared layer compose like
//! sequential ones. A failing call leaves the running statistics untouched.

use std::sync::{Arc, Mutex, MutexGuard};

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::dtypes::cast_tensor;
use crate::{checks, NormError, Result};

/// Whether a variable is optimised or maintained by the layer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    /// Updated by an external optimiser (`gamma`, `beta`).
    Trainable,
    /// Running statistic updated once per training step.
    RunningStatistic,
}

/// Named tensor whose storage is shared between clones.
#[derive(Debug, Clone)]
pub struct StatVariable {
    name: Arc<str>,
    kind: VariableKind,
    value: Arc<Mutex<Tensor>>,
}

impl StatVariable {
    pub fn new(name: impl Into<String>, kind: VariableKind, value: Tensor) -> Self {
        Self {
            name: Arc::from(name.into()),
            kind,
            value: Arc::new(Mutex::new(value)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> VariableKind {
        self.kind
    }

    pub fn is_trainable(&self) -> bool {
        self.kind == VariableKind::Trainable
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tensor>> {
        self.value
            .lock()
            .map_err(|_| NormError::Poisoned(self.name.to_string()))
    }

    /// Identity of the shared storage; clones of one variable agree.
    fn storage_key(&self) -> usize {
        Arc::as_ptr(&self.value) as *const () as usize
    }

    fn dims(&self) -> Result<Vec<usize>> {
        Ok(self.lock()?.dims().to_vec())
    }

    /// Returns a clone of the current value.
    pub fn read(&self) -> Result<Tensor> {
        Ok(self.lock()?.clone())
    }

    /// Overwrites the value, keeping the variable's shape and dtype.
    pub fn assign(&self, value: &Tensor) -> Result<()> {
        let mut current = self.lock()?;
        checks::expect_shape(&self.name, value, current.dims())?;
        *current = cast_tensor(value, current.dtype())?;
        Ok(())
    }

    /// Applies one moving-average step immediately and returns the new value.
    ///
    /// `var - (var - value) * (1 - momentum)`; when `batch_size` is known to be
    /// zero the delta is suppressed and the value is left as is.
    pub fn assign_moving_average(
        &self,
        value: &Tensor,
        momentum: f64,
        batch_size: Option<usize>,
    ) -> Result<Tensor> {
        let mut batch = UpdateBatch::new();
        batch.push(PendingUpdate::moving_average(self, value, momentum, batch_size)?);
        batch.commit()?;
        self.read()
    }
}

/// One moving-average step of `current` towards `value`.
pub fn moving_average(current: &Tensor, value: &Tensor, momentum: f64) -> Result<Tensor> {
    let value = cast_tensor(value, current.dtype())?;
    let delta = (current - &value)?.affine(1.0 - momentum, 0.0)?;
    Ok((current - &delta)?)
}

/// `(1 - factor) * running + factor * batch`, the form reported by fused kernels.
pub fn exponential_average(running: &Tensor, batch: &Tensor, factor: f64) -> Result<Tensor> {
    let batch = cast_tensor(batch, running.dtype())?;
    Ok((running.affine(1.0 - factor, 0.0)? + batch.affine(factor, 0.0)?)?)
}

#[derive(Debug, Clone)]
enum UpdateRule {
    /// The batch was empty; the value stays as is.
    Unchanged,
    MovingAverage { value: Tensor, momentum: f64 },
    ExponentialAverage { value: Tensor, factor: f64 },
    Assign(Tensor),
    /// `relu(stddev² - epsilon)`, read after the stddev's own update in the batch.
    VarianceFromStddev { stddev: StatVariable, epsilon: f64 },
}

/// A write to a statistic variable, evaluated when its batch commits.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    variable: StatVariable,
    rule: UpdateRule,
}

impl PendingUpdate {
    fn checked(variable: &StatVariable, value: &Tensor, rule: UpdateRule) -> Result<Self> {
        checks::expect_shape(variable.name(), value, &variable.dims()?)?;
        Ok(Self {
            variable: variable.clone(),
            rule,
        })
    }

    /// Moving-average step towards `value`, suppressed for empty batches.
    pub fn moving_average(
        variable: &StatVariable,
        value: &Tensor,
        momentum: f64,
        batch_size: Option<usize>,
    ) -> Result<Self> {
        let rule = if batch_size == Some(0) {
            log::debug!("zero-sized batch, skipping moving average of {}", variable.name());
            UpdateRule::Unchanged
        } else {
            UpdateRule::MovingAverage {
                value: value.clone(),
                momentum,
            }
        };
        Self::checked(variable, value, rule)
    }

    /// Exponential average with `factor = 1 - momentum`, assigned directly.
    pub fn exponential_average(variable: &StatVariable, value: &Tensor, factor: f64) -> Result<Self> {
        let rule = UpdateRule::ExponentialAverage {
            value: value.clone(),
            factor,
        };
        Self::checked(variable, value, rule)
    }

    /// Direct overwrite.
    pub fn assign(variable: &StatVariable, value: &Tensor) -> Result<Self> {
        Self::checked(variable, value, UpdateRule::Assign(value.clone()))
    }

    /// Variance implied by `stddev`, which must be updated earlier in the same batch.
    pub fn variance_from_stddev(
        variable: &StatVariable,
        stddev: &StatVariable,
        epsilon: f64,
    ) -> Result<Self> {
        let dims = variable.dims()?;
        if stddev.dims()? != dims {
            return Err(NormError::shape(format!(
                "{}: stddev {} has a different shape",
                variable.name(),
                stddev.name()
            )));
        }
        Ok(Self {
            variable: variable.clone(),
            rule: UpdateRule::VarianceFromStddev {
                stddev: stddev.clone(),
                epsilon,
            },
        })
    }

    fn sources(&self) -> impl Iterator<Item = &StatVariable> {
        let source = match &self.rule {
            UpdateRule::VarianceFromStddev { stddev, .. } => Some(stddev),
            _ => None,
        };
        std::iter::once(&self.variable).chain(source)
    }
}

/// Updates produced by one forward pass, applied together.
#[derive(Debug, Default)]
pub struct UpdateBatch {
    updates: Vec<PendingUpdate>,
}

impl UpdateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, update: PendingUpdate) {
        self.updates.push(update);
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Evaluates every rule against the locked values and writes the results.
    ///
    /// Locks are taken once per distinct variable, in storage order, before
    /// anything is written. Rules run in push order and see the results of
    /// earlier rules in the batch.
    pub fn commit(self) -> Result<()> {
        let mut targets = self
            .updates
            .iter()
            .flat_map(PendingUpdate::sources)
            .collect::<Vec<_>>();
        targets.sort_by_key(|var| var.storage_key());
        targets.dedup_by_key(|var| var.storage_key());

        let mut guards = targets
            .iter()
            .map(|var| var.lock())
            .collect::<Result<Vec<_>>>()?;
        let slot = |var: &StatVariable| -> Result<usize> {
            targets
                .binary_search_by_key(&var.storage_key(), |t| t.storage_key())
                .map_err(|_| NormError::Poisoned(var.name().to_string()))
        };

        let mut staged: Vec<Option<Tensor>> = vec![None; targets.len()];
        for update in &self.updates {
            let index = slot(&update.variable)?;
            let current = match &staged[index] {
                Some(value) => value.clone(),
                None => guards[index].clone(),
            };
            let next = match &update.rule {
                UpdateRule::Unchanged => continue,
                UpdateRule::MovingAverage { value, momentum } => {
                    moving_average(&current, value, *momentum)?
                }
                UpdateRule::ExponentialAverage { value, factor } => {
                    exponential_average(&current, value, *factor)?
                }
                UpdateRule::Assign(value) => value.clone(),
                UpdateRule::VarianceFromStddev { stddev, epsilon } => {
                    let source = slot(stddev)?;
                    let stddev = match &staged[source] {
                        Some(value) => value.clone(),
                        None => guards[source].clone(),
                    };
                    (stddev.sqr()? - *epsilon)?.relu()?
                }
            };
            staged[index] = Some(cast_tensor(&next, current.dtype())?);
        }

        for (guard, value) in guards.iter_mut().zip(staged) {
            if let Some(value) = value {
                **guard = value;
            }
        }
        Ok(())
    }
}

/// Mean-aggregates statistics computed independently on several replicas.
pub fn merge_replicas(values: &[Tensor]) -> Result<Tensor> {
    if values.is_empty() {
        return Err(NormError::config("cannot merge an empty set of replicas"));
    }
    Ok(Tensor::stack(values, 0)?.mean(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn variable(values: &[f32]) -> Result<StatVariable> {
        let tensor = Tensor::from_vec(values.to_vec(), (values.len(),), &Device::Cpu)?;
        Ok(StatVariable::new("moving_mean", VariableKind::RunningStatistic, tensor))
    }

    #[test]
    fn one_step_update_is_exact() -> Result<()> {
        let var = variable(&[1.0, -2.0])?;
        let batch = Tensor::new(&[3f32, 2.0], &Device::Cpu)?;
        let momentum = 0.9;
        let next = var.assign_moving_average(&batch, momentum, None)?;
        let expected = [0.9 * 1.0 + 0.1 * 3.0, 0.9 * -2.0 + 0.1 * 2.0];
        for (got, want) in next.to_vec1::<f32>()?.iter().zip(expected) {
            assert!((got - want as f32).abs() < 1e-6);
        }
        assert_eq!(var.read()?.to_vec1::<f32>()?, next.to_vec1::<f32>()?);
        Ok(())
    }

    #[test]
    fn constant_statistics_converge_geometrically() -> Result<()> {
        let var = variable(&[0.0])?;
        let target = Tensor::new(&[1f32], &Device::Cpu)?;
        let momentum = 0.5f64;
        for _ in 0..10 {
            var.assign_moving_average(&target, momentum, None)?;
        }
        let gap = 1.0 - var.read()?.to_vec1::<f32>()?[0] as f64;
        assert!((gap - momentum.powi(10)).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn zero_sized_batches_do_not_move_statistics() -> Result<()> {
        let var = variable(&[0.25])?;
        let batch = Tensor::new(&[10f32], &Device::Cpu)?;
        var.assign_moving_average(&batch, 0.5, Some(0))?;
        assert_eq!(var.read()?.to_vec1::<f32>()?, vec![0.25]);
        var.assign_moving_average(&batch, 0.5, Some(4))?;
        assert!((var.read()?.to_vec1::<f32>()?[0] - 5.125).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn pending_updates_use_pre_update_values() -> Result<()> {
        let var = variable(&[0.0])?;
        let one = Tensor::new(&[1f32], &Device::Cpu)?;
        let mut batch = UpdateBatch::new();
        batch.push(PendingUpdate::moving_average(&var, &one, 0.5, None)?);
        assert_eq!(var.read()?.to_vec1::<f32>()?, vec![0.0]);
        assert_eq!(batch.len(), 1);
        batch.commit()?;
        assert_eq!(var.read()?.to_vec1::<f32>()?, vec![0.5]);
        Ok(())
    }

    #[test]
    fn shape_mismatch_is_rejected_before_commit() -> Result<()> {
        let var = variable(&[0.0, 0.0])?;
        let wrong = Tensor::zeros((3,), DType::F32, &Device::Cpu)?;
        assert!(PendingUpdate::assign(&var, &wrong).is_err());
        assert!(PendingUpdate::moving_average(&var, &wrong, 0.9, None).is_err());
        Ok(())
    }

    #[test]
    fn concurrent_commits_compose_like_sequential_steps() -> Result<()> {
        let var = variable(&[0.0])?;
        let target = Tensor::new(&[4f32], &Device::Cpu)?;
        let barrier = std::sync::Barrier::new(4);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let update = PendingUpdate::moving_average(&var, &target, 0.5, None).unwrap();
                    barrier.wait();
                    let mut batch = UpdateBatch::new();
                    batch.push(update);
                    batch.commit().unwrap();
                });
            }
        });
        // 4 * (1 - 0.5^4)
        assert_eq!(var.read()?.to_vec1::<f32>()?, vec![3.75]);
        Ok(())
    }

    #[test]
    fn poisoned_target_blocks_the_whole_batch() -> Result<()> {
        let healthy = variable(&[1.0])?;
        let poisoned = variable(&[2.0])?;
        let handle = poisoned.clone();
        let _ = std::thread::spawn(move || {
            let _guard = handle.value.lock().unwrap();
            panic!("writer died");
        })
        .join();

        let value = Tensor::new(&[5f32], &Device::Cpu)?;
        let mut batch = UpdateBatch::new();
        batch.push(PendingUpdate::assign(&healthy, &value)?);
        batch.push(PendingUpdate {
            variable: poisoned.clone(),
            rule: UpdateRule::Assign(value),
        });
        assert!(matches!(batch.commit(), Err(NormError::Poisoned(name)) if name == "moving_mean"));
        assert_eq!(healthy.read()?.to_vec1::<f32>()?, vec![1.0]);
        Ok(())
    }

    #[test]
    fn variance_follows_the_stddev_updated_in_the_same_batch() -> Result<()> {
        let stddev = variable(&[1.0])?;
        let variance = variable(&[1.0])?;
        let target = Tensor::new(&[3f32], &Device::Cpu)?;
        let mut batch = UpdateBatch::new();
        batch.push(PendingUpdate::moving_average(&stddev, &target, 0.5, None)?);
        batch.push(PendingUpdate::variance_from_stddev(&variance, &stddev, 0.25)?);
        batch.commit()?;
        assert_eq!(stddev.read()?.to_vec1::<f32>()?, vec![2.0]);
        assert_eq!(variance.read()?.to_vec1::<f32>()?, vec![3.75]);
        Ok(())
    }

    #[test]
    fn exponential_average_weights_the_batch_by_factor() -> Result<()> {
        let var = variable(&[2.0])?;
        let batch_value = Tensor::new(&[6f32], &Device::Cpu)?;
        let mut batch = UpdateBatch::new();
        batch.push(PendingUpdate::exponential_average(&var, &batch_value, 0.25)?);
        batch.commit()?;
        assert_eq!(var.read()?.to_vec1::<f32>()?, vec![3.0]);
        Ok(())
    }

    #[test]
    fn replica_statistics_merge_by_mean() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::new(&[1f32, 4.0], &device)?;
        let b = Tensor::new(&[3f32, 0.0], &device)?;
        let ab = merge_replicas(&[a.clone(), b.clone()])?.to_vec1::<f32>()?;
        let ba = merge_replicas(&[b, a])?.to_vec1::<f32>()?;
        assert_eq!(ab, vec![2.0, 2.0]);
        assert_eq!(ab, ba);
        assert!(merge_replicas(&[]).is_err());
        Ok(())
    }
}
