//! Shared interface of the normalisation layers.
//!
//! Layers are created from their config, built once against a (partially
//! known) input shape, which allocates their variables from a
//! [`VariableRegistry`], and then called with an explicit [`TrainingMode`].

use candle_core::Tensor;

use crate::mode::TrainingMode;
use crate::variables::VariableRegistry;
use crate::Result;

pub trait NormalizationLayer: Send + Sync {
    fn name(&self) -> &str;

    /// Resolves axes against `input_shape` and creates the layer variables.
    ///
    /// Unknown dimensions are `None`. Building twice is an error.
    fn build(
        &mut self,
        input_shape: &[Option<usize>],
        registry: &mut dyn VariableRegistry,
    ) -> Result<()>;

    fn is_built(&self) -> bool;

    /// Normalises `input`. Layers with running statistics update them only in training.
    fn forward(&self, input: &Tensor, mode: &TrainingMode) -> Result<Tensor>;

    /// Output dims for an input of `input_shape`; normalisation keeps the shape.
    fn output_shape(&self, input_shape: &[usize]) -> Vec<usize> {
        input_shape.to_vec()
    }

    /// Key-value form of the layer configuration.
    fn config_value(&self) -> Result<serde_json::Value>;
}
