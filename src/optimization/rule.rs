use super::{Adagrad, Adam, Sgd};
use crate::{
    error::{OptimErr, Result},
    tensor::{DType, Tensor},
};

/// How an update rule guards its epsilon against the numeric range of the parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpsPolicy {
    /// Never below twice the smallest positive normal value of the parameter type.
    Floored,
    /// Used exactly as configured.
    Fixed,
}

impl EpsPolicy {
    /// Resolves the epsilon used for an update over parameters of type `dtype`.
    pub fn resolve(self, eps: f32, dtype: DType) -> f32 {
        match self {
            EpsPolicy::Floored => eps.max((dtype.min_positive() * 2.) as f32),
            EpsPolicy::Fixed => eps,
        }
    }
}

/// The closed set of update rules.
#[derive(Debug)]
pub enum UpdateRule {
    Sgd(Sgd),
    Adagrad(Adagrad),
    Adam(Adam),
}

impl UpdateRule {
    /// Builds an update rule by name and forwards its positional hyperparameters.
    ///
    /// # Arguments
    /// * `name` - One of `sgd`, `adagrad` or `adam`.
    /// * `params` - The positional hyperparameters of the rule.
    ///
    /// # Returns
    /// The update rule or an `UnknownAlgorithm` error.
    pub fn from_name(name: &str, params: &[f32]) -> Result<Self> {
        let mut rule = match name {
            Sgd::NAME => UpdateRule::Sgd(Sgd::new()),
            Adagrad::NAME => UpdateRule::Adagrad(Adagrad::new()),
            Adam::NAME => UpdateRule::Adam(Adam::new()),
            other => return Err(OptimErr::UnknownAlgorithm(other.to_string())),
        };

        rule.set_params(params);
        Ok(rule)
    }

    pub fn name(&self) -> &'static str {
        match self {
            UpdateRule::Sgd(_) => Sgd::NAME,
            UpdateRule::Adagrad(_) => Adagrad::NAME,
            UpdateRule::Adam(_) => Adam::NAME,
        }
    }

    /// Whether the rule keeps running statistics that must be checkpointed.
    pub fn is_stateful(&self) -> bool {
        !matches!(self, UpdateRule::Sgd(_))
    }

    /// Forwards positional hyperparameters to the concrete rule.
    pub fn set_params(&mut self, params: &[f32]) {
        match self {
            UpdateRule::Sgd(_) => {}
            UpdateRule::Adagrad(adagrad) => adagrad.set_params(params),
            UpdateRule::Adam(adam) => adam.set_params(params),
        }
    }

    /// Applies one update step.
    ///
    /// # Arguments
    /// * `eta` - The learning rate.
    /// * `params` - The float32 parameters to update.
    /// * `grads` - The float32 gradients.
    /// * `actual_mb_size` - The size of the minibatch that produced `grads`.
    /// * `ref_mb_words` - The minibatch size the hyperparameters were tuned for.
    pub fn apply(
        &mut self,
        eta: f32,
        params: &mut Tensor,
        grads: &Tensor,
        actual_mb_size: usize,
        ref_mb_words: usize,
    ) -> Result<()> {
        match self {
            UpdateRule::Sgd(sgd) => sgd.update(eta, params, grads),
            UpdateRule::Adagrad(adagrad) => {
                adagrad.update(eta, params, grads, actual_mb_size, ref_mb_words)
            }
            UpdateRule::Adam(adam) => adam.update(eta, params, grads, actual_mb_size, ref_mb_words),
        }
    }

    /// Zeroes the running statistics, parameters are left untouched.
    pub fn reset_stats(&mut self) {
        match self {
            UpdateRule::Sgd(_) => {}
            UpdateRule::Adagrad(adagrad) => adagrad.reset_stats(),
            UpdateRule::Adam(adam) => adam.reset_stats(),
        }
    }
}

/// Checks that `params` and `grads` hold the same amount of elements.
pub(super) fn check_lengths(params: &Tensor, grads: &Tensor) -> Result<()> {
    if params.len() != grads.len() {
        return Err(OptimErr::SizeMismatch {
            a: "grads",
            b: "params",
            got: grads.len(),
            expected: params.len(),
        });
    }

    Ok(())
}

/// Checks that already allocated running statistics match the parameters they update.
pub(super) fn check_state(what: &'static str, state: &Tensor, params: &Tensor) -> Result<()> {
    if state.len() != params.len() {
        return Err(OptimErr::SizeMismatch {
            a: what,
            b: "params",
            got: state.len(),
            expected: params.len(),
        });
    }

    Ok(())
}
