use log::debug;

use super::{ExponentialSmoothing, NormClipper, Optimizer, UpdateRule};
use crate::{config::OptimizerConfig, error::Result};

/// Builds optimizers from their configuration.
pub struct OptimizerBuilder;

impl OptimizerBuilder {
    /// Builds a single shard's optimizer.
    ///
    /// # Arguments
    /// * `config` - The optimizer options.
    ///
    /// # Returns
    /// The optimizer or an `UnknownAlgorithm` error.
    pub fn build(config: &OptimizerConfig) -> Result<Optimizer> {
        let rule = UpdateRule::from_name(&config.optimizer, &config.optimizer_params)?;
        debug!(eta = config.learn_rate; "building {} optimizer", rule.name());

        let mut optimizer = Optimizer::new(rule, config.learn_rate)
            .with_ref_mb_words(config.mini_batch_words_ref)
            .with_cost_scale(config.cost_scaling);

        if config.clip_norm > 0. {
            optimizer = optimizer.with_clipper(Box::new(NormClipper::new(config.clip_norm)));
        }

        if config.exponential_smoothing > 0. {
            optimizer = optimizer.with_smoothing(ExponentialSmoothing::new(
                config.exponential_smoothing,
                config.exponential_smoothing_ref_words,
            ));
        }

        Ok(optimizer)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        backend::{Backend, CpuBackend},
        error::OptimErr,
        storage::AllocRegime,
        tensor::Tensor,
    };

    #[test]
    fn test_builds_configured_rule() {
        let config = OptimizerConfig {
            optimizer: "adam".to_string(),
            optimizer_params: vec![0.8, 0.9],
            learn_rate: 0.5,
            ..Default::default()
        };

        let optimizer = OptimizerBuilder::build(&config).unwrap();
        let UpdateRule::Adam(adam) = optimizer.rule() else {
            panic!("expected adam");
        };
        assert_eq!(adam.hyperparams(), (0.8, 0.9, 1e-8, 0.));
        assert_eq!(optimizer.eta(), 0.5);
    }

    #[test]
    fn test_unknown_optimizer() {
        let config = OptimizerConfig {
            optimizer: "lamb".to_string(),
            ..Default::default()
        };

        assert!(matches!(
            OptimizerBuilder::build(&config),
            Err(OptimErr::UnknownAlgorithm(name)) if name == "lamb"
        ));
    }

    #[test]
    fn test_smoothing_enables_average() {
        let config = OptimizerConfig {
            optimizer: "sgd".to_string(),
            clip_norm: 0.,
            exponential_smoothing: 1e-4,
            ..Default::default()
        };

        let backend: Arc<dyn Backend> = Arc::new(CpuBackend::default());
        let mut params = Tensor::from_f32(vec![1.0; 4], backend.clone());
        let mut grads = Tensor::from_f32(vec![0.1; 4], backend);

        let mut optimizer = OptimizerBuilder::build(&config).unwrap();
        optimizer.update(&mut params, &mut grads, None).unwrap();

        assert_eq!(optimizer.regime(), Some(AllocRegime::AverageOnly));
        assert!(optimizer.average().is_some());
    }
}
