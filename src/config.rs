use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Training options consumed by the optimizer.
///
/// Keys are kebab-case, every missing key takes its default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OptimizerConfig {
    /// The update rule: `sgd`, `adagrad` or `adam`.
    pub optimizer: String,
    /// Positional hyperparameters of the update rule.
    pub optimizer_params: Vec<f32>,
    pub learn_rate: f32,
    /// The minibatch size hyperparameters were tuned for, `0` disables the adjustment.
    pub mini_batch_words_ref: usize,
    /// The factor the loss was multiplied by.
    pub cost_scaling: f32,
    /// The largest gradient norm, `0` disables clipping.
    pub clip_norm: f32,
    /// The weight of the new parameters in the moving average, `0` disables it.
    pub exponential_smoothing: f32,
    pub exponential_smoothing_ref_words: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer: "adam".to_string(),
            optimizer_params: Vec::new(),
            learn_rate: 1e-4,
            mini_batch_words_ref: 0,
            cost_scaling: 1.,
            clip_norm: 1.,
            exponential_smoothing: 0.,
            exponential_smoothing_ref_words: 0,
        }
    }
}

impl OptimizerConfig {
    /// Parses a configuration from its json representation.
    ///
    /// # Arguments
    /// * `json` - The json document.
    ///
    /// # Returns
    /// The configuration or a `Config` error.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
