use super::rule::check_lengths;
use crate::{error::Result, tensor::Tensor};

/// Plain stochastic gradient descent, `params -= eta * grads`.
///
/// The learning rate already assumes a summed gradient criterion, so the minibatch
/// sizes play no role.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sgd;

impl Sgd {
    pub const NAME: &'static str = "sgd";

    /// Creates a new `Sgd` update rule.
    pub fn new() -> Self {
        Self
    }

    /// Updates `params` in place.
    ///
    /// # Arguments
    /// * `eta` - The learning rate.
    /// * `params` - The float32 parameters to update.
    /// * `grads` - The float32 gradients, same length as `params`.
    ///
    /// # Returns
    /// An error if the tensors aren't float32 or their lengths differ.
    pub fn update(&mut self, eta: f32, params: &mut Tensor, grads: &Tensor) -> Result<()> {
        check_lengths(params, grads)?;

        let grads = grads.as_f32()?;

        for (p, g) in params.as_f32_mut()?.iter_mut().zip(grads) {
            *p -= eta * g;
        }

        Ok(())
    }
}
