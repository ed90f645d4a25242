//! Variable allocation for layers.
//!
//! Layers never create their own storage: during `build` they describe each
//! weight with a [`WeightSpec`] and ask a [`VariableRegistry`] for it. The
//! in-memory [`ParameterStore`] is the default registry; an optimiser or a
//! checkpoint loader can provide another implementation.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::moving::{StatVariable, VariableKind};
use crate::{NormError, Result};

/// Initial value of a weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initializer {
    Zeros,
    Ones,
    Constant(f64),
}

impl Initializer {
    pub fn sample(&self, shape: &[usize], dtype: DType, device: &Device) -> Result<Tensor> {
        let tensor = match self {
            Initializer::Zeros => Tensor::zeros(shape, dtype, device)?,
            Initializer::Ones => Tensor::ones(shape, dtype, device)?,
            Initializer::Constant(value) => {
                Tensor::full(*value, shape, device)?.to_dtype(dtype)?
            }
        };
        Ok(tensor)
    }

    /// Initializer producing the square root of this one's values.
    pub fn sqrt(&self) -> Initializer {
        match self {
            Initializer::Zeros => Initializer::Zeros,
            Initializer::Ones => Initializer::Ones,
            Initializer::Constant(value) => Initializer::Constant(value.sqrt()),
        }
    }
}

/// Description of a weight requested during `build`.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub initializer: Initializer,
    pub kind: VariableKind,
}

impl WeightSpec {
    pub fn trainable(
        name: impl Into<String>,
        shape: &[usize],
        dtype: DType,
        initializer: Initializer,
    ) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            dtype,
            initializer,
            kind: VariableKind::Trainable,
        }
    }

    pub fn running_statistic(
        name: impl Into<String>,
        shape: &[usize],
        dtype: DType,
        initializer: Initializer,
    ) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            dtype,
            initializer,
            kind: VariableKind::RunningStatistic,
        }
    }
}

/// Source of layer variables.
pub trait VariableRegistry {
    /// Allocates and initialises a variable described by `spec`.
    fn add_weight(&mut self, spec: WeightSpec) -> Result<StatVariable>;
}

/// In-memory registry holding every variable on one device.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    device: Device,
    variables: Vec<StatVariable>,
}

impl ParameterStore {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            variables: Vec::new(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&StatVariable> {
        self.variables.iter().find(|var| var.name() == name)
    }

    pub fn variables(&self) -> &[StatVariable] {
        &self.variables
    }

    /// Variables handed to an optimiser.
    pub fn trainable_variables(&self) -> Vec<&StatVariable> {
        self.variables.iter().filter(|var| var.is_trainable()).collect()
    }

    /// Running statistics maintained by the layers.
    pub fn non_trainable_variables(&self) -> Vec<&StatVariable> {
        self.variables.iter().filter(|var| !var.is_trainable()).collect()
    }

    /// Snapshot of every variable value in creation order.
    pub fn get_weights(&self) -> Result<Vec<Tensor>> {
        self.variables.iter().map(StatVariable::read).collect()
    }
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new(Device::Cpu)
    }
}

impl VariableRegistry for ParameterStore {
    fn add_weight(&mut self, spec: WeightSpec) -> Result<StatVariable> {
        if self.get(&spec.name).is_some() {
            return Err(NormError::config(format!(
                "variable `{}` already exists",
                spec.name
            )));
        }
        let value = spec.initializer.sample(&spec.shape, spec.dtype, &self.device)?;
        let variable = StatVariable::new(spec.name, spec.kind, value);
        self.variables.push(variable.clone());
        Ok(variable)
    }
}
