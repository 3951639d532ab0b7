use std::sync::Arc;

use super::{
    EpsPolicy,
    rule::{check_lengths, check_state},
};
use crate::{
    backend::Backend,
    error::{OptimErr, Result},
    storage::Arena,
    tensor::{DType, Tensor},
};

/// Adam, <https://arxiv.org/pdf/1412.6980v8.pdf>, with automatic hyperparameter adjustment
/// to the minibatch size.
///
/// Gradients are expected to come from a summed criterion: the moments divide them by the
/// actual minibatch size to track the per-sample average, and the learning rate is scaled
/// by `actual / reference`.
#[derive(Debug)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    denom1: f64,
    denom2: f64,
    arena: Option<Arena>,
    mt: Option<Tensor>,
    vt: Option<Tensor>,
}

impl Default for Adam {
    fn default() -> Self {
        Self::new()
    }
}

impl Adam {
    pub const NAME: &'static str = "adam";
    pub const EPS_POLICY: EpsPolicy = EpsPolicy::Fixed;

    /// Creates a new `Adam` update rule.
    ///
    /// Defaults are `beta1 = 0.9`, `beta2 = 0.999`, `eps = 1e-8` and no weight decay.
    pub fn new() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.,
            denom1: 0.,
            denom2: 0.,
            arena: None,
            mt: None,
            vt: None,
        }
    }

    /// Sets the positional hyperparameters `[beta1, beta2, eps, weight_decay]`.
    ///
    /// Missing positions keep their current value.
    pub fn set_params(&mut self, params: &[f32]) {
        let slots = [
            &mut self.beta1,
            &mut self.beta2,
            &mut self.eps,
            &mut self.weight_decay,
        ];

        for (slot, &value) in slots.into_iter().zip(params) {
            *slot = value;
        }
    }

    /// Returns `(beta1, beta2, eps, weight_decay)`.
    pub fn hyperparams(&self) -> (f32, f32, f32, f32) {
        (self.beta1, self.beta2, self.eps, self.weight_decay)
    }

    /// Returns the bias correction denominators `(denom1, denom2)`.
    pub fn denominators(&self) -> (f64, f64) {
        (self.denom1, self.denom2)
    }

    pub(crate) fn set_denominators(&mut self, denom1: f64, denom2: f64) {
        self.denom1 = denom1;
        self.denom2 = denom2;
    }

    /// Returns the first moment, if it was allocated.
    pub fn first_moment(&self) -> Option<&Tensor> {
        self.mt.as_ref()
    }

    /// Returns the second moment, if it was allocated.
    pub fn second_moment(&self) -> Option<&Tensor> {
        self.vt.as_ref()
    }

    /// Updates `params` in place.
    ///
    /// # Arguments
    /// * `eta` - The base learning rate.
    /// * `params` - The float32 parameters to update.
    /// * `grads` - The float32 gradients of a summed criterion.
    /// * `actual_mb_size` - The size of the minibatch that produced `grads`.
    /// * `ref_mb_words` - The minibatch size the hyperparameters were tuned for.
    ///
    /// # Returns
    /// A size/type error if the tensors don't match the state.
    pub fn update(
        &mut self,
        eta: f32,
        params: &mut Tensor,
        grads: &Tensor,
        actual_mb_size: usize,
        ref_mb_words: usize,
    ) -> Result<()> {
        check_lengths(params, grads)?;

        if self.mt.is_none() || self.vt.is_none() {
            self.allocate(params.backend().clone(), params.len())?;
        }

        let t = actual_mb_size as f64;
        let t_ref = ref_mb_words as f64;

        let eta = eta as f64 * (t / t_ref);
        let beta1 = self.beta1 as f64;
        let beta2 = self.beta2 as f64;

        // Recursive form of the bias correction, converges to 1.
        let next_denom1 = beta1 * self.denom1 + (1. - beta1);
        let next_denom2 = beta2 * self.denom2 + (1. - beta2);

        let b1 = self.beta1;
        let b2 = self.beta2;
        let c1 = ((1. - beta1) / t) as f32;
        let c2 = ((1. - beta2) / t / t) as f32;
        let eta = eta as f32;
        let denom1 = next_denom1 as f32;
        let denom2 = next_denom2 as f32;
        let decay = self.weight_decay;
        let eps = Self::EPS_POLICY.resolve(self.eps, params.dtype());

        let (Some(mt), Some(vt)) = (self.mt.as_mut(), self.vt.as_mut()) else {
            return Err(OptimErr::StateNotAllocated {
                algorithm: Self::NAME,
                shard: 0,
            });
        };

        check_state("adam first moment", mt, params)?;
        check_state("adam second moment", vt, params)?;

        let grads = grads.as_f32()?;
        let mt = mt.as_f32_mut()?;
        let vt = vt.as_f32_mut()?;
        let params = params.as_f32_mut()?;

        // The counters only advance once the step is known to apply.
        self.denom1 = next_denom1;
        self.denom2 = next_denom2;

        params
            .iter_mut()
            .zip(grads)
            .zip(mt.iter_mut().zip(vt.iter_mut()))
            .for_each(|((p, g), (m, v))| {
                *m = b1 * *m + c1 * g;
                *v = b2 * *v + c2 * (g * g);
                *p -= eta * ((*m / denom1) / ((*v / denom2).sqrt() + eps) + decay * *p);
            });

        Ok(())
    }

    /// Zeroes both moments and the bias correction denominators.
    pub fn reset_stats(&mut self) {
        if let Some(mt) = self.mt.as_mut() {
            mt.fill(0.);
        }

        if let Some(vt) = self.vt.as_mut() {
            vt.fill(0.);
        }

        // NOTE: zero ignores a configured reference minibatch size, restarts rely on it.
        self.denom1 = 0.;
        self.denom2 = 0.;
    }

    /// Loads this shard's slice of the first moment, allocating both moments if needed.
    pub(crate) fn load_first_moment(
        &mut self,
        backend: &Arc<dyn Backend>,
        values: &[f32],
    ) -> Result<()> {
        if self.mt.is_none() || self.vt.is_none() {
            self.allocate(backend.clone(), values.len())?;
        }

        match self.mt.as_mut() {
            Some(mt) => mt.set_f32(values),
            None => Err(OptimErr::StateNotAllocated {
                algorithm: Self::NAME,
                shard: 0,
            }),
        }
    }

    /// Loads this shard's slice of the second moment, allocating both moments if needed.
    pub(crate) fn load_second_moment(
        &mut self,
        backend: &Arc<dyn Backend>,
        values: &[f32],
    ) -> Result<()> {
        if self.mt.is_none() || self.vt.is_none() {
            self.allocate(backend.clone(), values.len())?;
        }

        match self.vt.as_mut() {
            Some(vt) => vt.set_f32(values),
            None => Err(OptimErr::StateNotAllocated {
                algorithm: Self::NAME,
                shard: 0,
            }),
        }
    }

    fn allocate(&mut self, backend: Arc<dyn Backend>, elements: usize) -> Result<()> {
        let mut arena = Arena::reserve_exact(backend, 2 * elements * DType::Float32.size());
        self.mt = Some(arena.allocate(elements, DType::Float32)?);
        self.vt = Some(arena.allocate(elements, DType::Float32)?);
        self.arena = Some(arena);
        Ok(())
    }
}
