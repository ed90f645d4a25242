//! Batch renormalisation corrections.
//!
//! During training the normalised value `x̂` is corrected to `x̂ · r + d`, where
//! `r = σ_batch / σ_running` and `d = (μ_batch − μ_running) / σ_running` are
//! computed against separate running averages and clipped to configured
//! bounds. Outside training `r = 1` and `d = 0`. Because the correction is
//! affine it folds into the layer's scale and offset:
//! `scale' = r · gamma`, `offset' = d · gamma + beta`.

use std::collections::BTreeMap;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::moving::{PendingUpdate, StatVariable, UpdateBatch};
use crate::{NormError, Result};

const CLIPPING_KEYS: [&str; 3] = ["rmax", "rmin", "dmax"];

/// Bounds for the renormalisation corrections; unset bounds do not clip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RenormClipping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rmin: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rmax: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dmax: Option<f64>,
}

impl RenormClipping {
    /// Reads bounds from a key map, rejecting keys other than `rmax`, `rmin`, `dmax`.
    pub fn from_map(map: &BTreeMap<String, f64>) -> Result<Self> {
        let unknown = map
            .keys()
            .filter(|key| !CLIPPING_KEYS.contains(&key.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        if !unknown.is_empty() {
            return Err(NormError::config(format!(
                "renorm_clipping {unknown:?} contains keys not in {CLIPPING_KEYS:?}"
            )));
        }
        Ok(Self {
            rmin: map.get("rmin").copied(),
            rmax: map.get("rmax").copied(),
            dmax: map.get("dmax").copied(),
        })
    }

    pub fn clip_r(&self, r: &Tensor) -> Result<Tensor> {
        let mut r = r.clone();
        if let Some(rmin) = self.rmin {
            r = r.broadcast_maximum(&scalar_like(&r, rmin)?)?;
        }
        if let Some(rmax) = self.rmax {
            r = r.broadcast_minimum(&scalar_like(&r, rmax)?)?;
        }
        Ok(r)
    }

    pub fn clip_d(&self, d: &Tensor) -> Result<Tensor> {
        match self.dmax {
            Some(dmax) => Ok(d
                .broadcast_maximum(&scalar_like(d, -dmax)?)?
                .broadcast_minimum(&scalar_like(d, dmax)?)?),
            None => Ok(d.clone()),
        }
    }
}

fn scalar_like(tensor: &Tensor, value: f64) -> Result<Tensor> {
    Ok(Tensor::new(value, tensor.device())?.to_dtype(tensor.dtype())?)
}

/// Corrections and the moments to feed into the moving-average updates.
#[derive(Debug, Clone)]
pub struct RenormCorrection {
    pub r: Tensor,
    pub d: Tensor,
    pub mean: Tensor,
    pub variance: Tensor,
}

/// Running mean and standard deviation used only for the corrections.
#[derive(Debug, Clone)]
pub struct RenormState {
    pub mean: StatVariable,
    pub stddev: StatVariable,
    pub momentum: f64,
    pub clipping: RenormClipping,
}

impl RenormState {
    /// Computes `(r, d)` for one batch and queues the renorm average updates.
    ///
    /// Corrections always use the pre-update running values. `batch_size` of
    /// zero suppresses the updates like any other moving average.
    pub fn correction_and_moments(
        &self,
        mean: &Tensor,
        variance: &Tensor,
        epsilon: f64,
        training: bool,
        batch_size: Option<usize>,
        updates: &mut UpdateBatch,
    ) -> Result<RenormCorrection> {
        let stddev = (variance + epsilon)?.sqrt()?;
        let renorm_mean = self.mean.read()?;
        let renorm_stddev = self.stddev.read()?;
        let floor = scalar_like(&renorm_stddev, epsilon.sqrt())?;
        let renorm_stddev = renorm_stddev.broadcast_maximum(&floor)?;

        let (r, d) = if training {
            let r = stddev.div(&renorm_stddev)?;
            let d = (mean - &renorm_mean)?.div(&renorm_stddev)?;
            (self.clipping.clip_r(&r)?, self.clipping.clip_d(&d)?)
        } else {
            (stddev.ones_like()?, mean.zeros_like()?)
        };

        if training {
            updates.push(PendingUpdate::moving_average(
                &self.mean,
                mean,
                self.momentum,
                batch_size,
            )?);
            updates.push(PendingUpdate::moving_average(
                &self.stddev,
                &stddev,
                self.momentum,
                batch_size,
            )?);
        }

        Ok(RenormCorrection {
            r,
            d,
            mean: mean.clone(),
            variance: variance.clone(),
        })
    }
}

/// Composes `(scale, offset)` with a following affine step.
///
/// Produces the transform `x * scale * then_scale + offset * then_scale + then_offset`.
pub fn compose_transforms(
    scale: &Tensor,
    offset: &Tensor,
    then_scale: Option<&Tensor>,
    then_offset: Option<&Tensor>,
) -> Result<(Tensor, Tensor)> {
    let (mut scale, mut offset) = (scale.clone(), offset.clone());
    if let Some(then_scale) = then_scale {
        scale = scale.broadcast_mul(then_scale)?;
        offset = offset.broadcast_mul(then_scale)?;
    }
    if let Some(then_offset) = then_offset {
        offset = offset.broadcast_add(then_offset)?;
    }
    Ok((scale, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moving::VariableKind;
    use candle_core::Device;

    fn state(mean: f32, stddev: f32, clipping: RenormClipping) -> Result<RenormState> {
        let device = Device::Cpu;
        Ok(RenormState {
            mean: StatVariable::new(
                "renorm_mean",
                VariableKind::RunningStatistic,
                Tensor::new(&[mean], &device)?,
            ),
            stddev: StatVariable::new(
                "renorm_stddev",
                VariableKind::RunningStatistic,
                Tensor::new(&[stddev], &device)?,
            ),
            momentum: 0.5,
            clipping,
        })
    }

    #[test]
    fn corrections_follow_running_statistics() -> Result<()> {
        let device = Device::Cpu;
        let renorm = state(1.0, 2.0, RenormClipping::default())?;
        let mean = Tensor::new(&[3f32], &device)?;
        let variance = Tensor::new(&[16f32], &device)?;
        let mut updates = UpdateBatch::new();
        let out = renorm.correction_and_moments(&mean, &variance, 0.0, true, None, &mut updates)?;

        assert!((out.r.to_vec1::<f32>()?[0] - 2.0).abs() < 1e-6);
        assert!((out.d.to_vec1::<f32>()?[0] - 1.0).abs() < 1e-6);
        assert_eq!(updates.len(), 2);
        assert_eq!(renorm.mean.read()?.to_vec1::<f32>()?, vec![1.0]);
        updates.commit()?;
        assert_eq!(renorm.mean.read()?.to_vec1::<f32>()?, vec![2.0]);
        assert_eq!(renorm.stddev.read()?.to_vec1::<f32>()?, vec![3.0]);
        Ok(())
    }

    #[test]
    fn clipping_bounds_r_and_d() -> Result<()> {
        let device = Device::Cpu;
        let clipping = RenormClipping {
            rmin: Some(0.5),
            rmax: Some(1.5),
            dmax: Some(0.25),
        };
        let renorm = state(0.0, 1.0, clipping)?;
        let mean = Tensor::new(&[-4f32], &device)?;
        let variance = Tensor::new(&[9f32], &device)?;
        let mut updates = UpdateBatch::new();
        let out = renorm.correction_and_moments(&mean, &variance, 0.0, true, None, &mut updates)?;
        assert_eq!(out.r.to_vec1::<f32>()?, vec![1.5]);
        assert_eq!(out.d.to_vec1::<f32>()?, vec![-0.25]);

        let small = Tensor::new(&[0.01f32], &device)?;
        let out = renorm.correction_and_moments(&small, &small, 0.0, true, None, &mut updates)?;
        assert_eq!(out.r.to_vec1::<f32>()?, vec![0.5]);
        Ok(())
    }

    #[test]
    fn inference_uses_identity_correction_without_updates() -> Result<()> {
        let device = Device::Cpu;
        let renorm = state(5.0, 0.0, RenormClipping::default())?;
        let mean = Tensor::new(&[1f32], &device)?;
        let variance = Tensor::new(&[1f32], &device)?;
        let mut updates = UpdateBatch::new();
        let out = renorm.correction_and_moments(&mean, &variance, 1e-3, false, None, &mut updates)?;
        assert_eq!(out.r.to_vec1::<f32>()?, vec![1.0]);
        assert_eq!(out.d.to_vec1::<f32>()?, vec![0.0]);
        assert!(updates.is_empty());
        Ok(())
    }

    #[test]
    fn zero_running_stddev_is_floored() -> Result<()> {
        let device = Device::Cpu;
        let renorm = state(0.0, 0.0, RenormClipping::default())?;
        let mean = Tensor::new(&[0f32], &device)?;
        let variance = Tensor::new(&[0f32], &device)?;
        let mut updates = UpdateBatch::new();
        let out = renorm.correction_and_moments(&mean, &variance, 1e-4, true, None, &mut updates)?;
        let r = out.r.to_vec1::<f32>()?[0];
        assert!(r.is_finite());
        assert!((r - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn clipping_map_rejects_unknown_keys() {
        let mut map = BTreeMap::new();
        map.insert("rmax".to_string(), 3.0);
        let clipping = RenormClipping::from_map(&map).unwrap();
        assert_eq!(clipping.rmax, Some(3.0));
        assert_eq!((clipping.rmin, clipping.dmax), (None, None));
        map.insert("rmean".to_string(), 1.0);
        assert!(matches!(
            RenormClipping::from_map(&map),
            Err(NormError::Config(msg)) if msg.contains("not in")
        ));
    }

    #[test]
    fn composed_transform_folds_correction_into_affine() -> Result<()> {
        let device = Device::Cpu;
        let r = Tensor::new(&[2f32], &device)?;
        let d = Tensor::new(&[0.5f32], &device)?;
        let gamma = Tensor::new(&[3f32], &device)?;
        let beta = Tensor::new(&[1f32], &device)?;
        let (scale, offset) = compose_transforms(&r, &d, Some(&gamma), Some(&beta))?;
        assert_eq!(scale.to_vec1::<f32>()?, vec![6.0]);
        assert_eq!(offset.to_vec1::<f32>()?, vec![2.5]);
        Ok(())
    }
}
