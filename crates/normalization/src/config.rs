//! Layer configurations as key-value documents.
//!
//! A saved layer is `{"class_name": ..., "config": {...}}`, where the inner
//! map holds the layer's options. Documents can be loaded from JSON or TOML.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::batch_norm::{BatchNorm, BatchNormConfig};
use crate::feature_norm::{FeatureNormConfig, FeatureNormalization};
use crate::layer_norm::{LayerNorm, LayerNormConfig};
use crate::norm::NormalizationLayer;
use crate::{NormError, Result};

/// Configuration of any normalisation layer, tagged with its class name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "class_name", content = "config")]
pub enum NormLayerConfig {
    BatchNormalization(BatchNormConfig),
    LayerNormalization(LayerNormConfig),
    Normalization(FeatureNormConfig),
}

impl NormLayerConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)
                .map_err(|err| NormError::ConfigFormat(err.to_string()))?,
            Some(other) => {
                return Err(NormError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        log::debug!("loaded layer config from {}", path.display());
        Ok(config)
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            NormLayerConfig::BatchNormalization(_) => "BatchNormalization",
            NormLayerConfig::LayerNormalization(_) => "LayerNormalization",
            NormLayerConfig::Normalization(_) => "Normalization",
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        let config = match self {
            NormLayerConfig::BatchNormalization(config) => config.to_value()?,
            NormLayerConfig::LayerNormalization(config) => config.to_value()?,
            NormLayerConfig::Normalization(config) => config.to_value()?,
        };
        Ok(serde_json::json!({
            "class_name": self.class_name(),
            "config": config,
        }))
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Validates the options and creates the (unbuilt) layer.
    pub fn into_layer(self) -> Result<Box<dyn NormalizationLayer>> {
        Ok(match self {
            NormLayerConfig::BatchNormalization(config) => Box::new(BatchNorm::new(config)?),
            NormLayerConfig::LayerNormalization(config) => Box::new(LayerNorm::new(config)?),
            NormLayerConfig::Normalization(config) => Box::new(FeatureNormalization::new(config)?),
        })
    }
}

/// Drops `keys` from a serialized config map.
pub(crate) fn remove_keys(value: &mut Value, keys: &[&str]) {
    if let Value::Object(map) = value {
        for key in keys {
            map.remove(*key);
        }
    }
}
