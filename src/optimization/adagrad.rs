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

/// Adagrad, <http://www.jmlr.org/papers/volume12/duchi11a/duchi11a.pdf>.
///
/// Keeps the running sum of squared gradients `gt` and scales every step by its root.
#[derive(Debug)]
pub struct Adagrad {
    eps: f32,
    arena: Option<Arena>,
    gt: Option<Tensor>,
}

impl Default for Adagrad {
    fn default() -> Self {
        Self::new()
    }
}

impl Adagrad {
    pub const NAME: &'static str = "adagrad";
    pub const EPS_POLICY: EpsPolicy = EpsPolicy::Floored;

    /// Creates a new `Adagrad` update rule with `eps = 1e-8`.
    pub fn new() -> Self {
        Self {
            eps: 1e-8,
            arena: None,
            gt: None,
        }
    }

    /// Sets the positional hyperparameters `[eps]`.
    pub fn set_params(&mut self, params: &[f32]) {
        if let Some(&eps) = params.first() {
            self.eps = eps;
        }
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }

    /// Returns the sum of squared gradients, if it was allocated.
    pub fn state(&self) -> Option<&Tensor> {
        self.gt.as_ref()
    }

    /// Updates `params` in place.
    ///
    /// # Arguments
    /// * `eta` - The learning rate.
    /// * `params` - The float32 parameters to update.
    /// * `grads` - The float32 gradients.
    /// * `actual_mb_size` - The size of the minibatch, must equal `ref_mb_words`.
    /// * `ref_mb_words` - The reference minibatch size.
    ///
    /// # Returns
    /// `RationalAdjustmentUnsupported` if the minibatch sizes differ, or a size/type error.
    pub fn update(
        &mut self,
        eta: f32,
        params: &mut Tensor,
        grads: &Tensor,
        actual_mb_size: usize,
        ref_mb_words: usize,
    ) -> Result<()> {
        if actual_mb_size != ref_mb_words {
            return Err(OptimErr::RationalAdjustmentUnsupported {
                actual: actual_mb_size,
                reference: ref_mb_words,
            });
        }

        check_lengths(params, grads)?;

        if self.gt.is_none() {
            self.allocate(params.backend().clone(), params.len())?;
        }

        let eps = Self::EPS_POLICY.resolve(self.eps, params.dtype());
        let Some(gt) = self.gt.as_mut() else {
            return Err(OptimErr::StateNotAllocated {
                algorithm: Self::NAME,
                shard: 0,
            });
        };

        check_state("adagrad state", gt, params)?;

        let grads = grads.as_f32()?;
        let gt = gt.as_f32_mut()?;

        params
            .as_f32_mut()?
            .iter_mut()
            .zip(grads)
            .zip(gt.iter_mut())
            .for_each(|((p, g), gt)| {
                *gt += g * g;
                *p -= (eta / (gt.sqrt() + eps)) * g;
            });

        Ok(())
    }

    /// Zeroes the sum of squared gradients.
    pub fn reset_stats(&mut self) {
        if let Some(gt) = self.gt.as_mut() {
            gt.fill(0.);
        }
    }

    /// Loads this shard's slice of a checkpointed state, allocating it if needed.
    pub(crate) fn load_state(&mut self, backend: &Arc<dyn Backend>, values: &[f32]) -> Result<()> {
        if self.gt.is_none() {
            self.allocate(backend.clone(), values.len())?;
        }

        match self.gt.as_mut() {
            Some(gt) => gt.set_f32(values),
            None => Err(OptimErr::StateNotAllocated {
                algorithm: Self::NAME,
                shard: 0,
            }),
        }
    }

    fn allocate(&mut self, backend: Arc<dyn Backend>, elements: usize) -> Result<()> {
        let mut arena = Arena::reserve_exact(backend, elements * DType::Float32.size());
        self.gt = Some(arena.allocate(elements, DType::Float32)?);
        self.arena = Some(arena);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;

    fn cpu() -> Arc<dyn Backend> {
        Arc::new(CpuBackend::default())
    }

    #[test]
    fn test_single_step() {
        let backend = cpu();
        let mut adagrad = Adagrad::new();
        let mut params = Tensor::from_f32(vec![1.0], backend.clone());
        let grads = Tensor::from_f32(vec![2.0], backend);

        adagrad.update(0.1, &mut params, &grads, 1, 1).unwrap();

        assert_eq!(adagrad.state().unwrap().as_f32().unwrap(), [4.0]);
        assert!((params.as_f32().unwrap()[0] - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_accumulates_squares_and_shrinks_steps() {
        let backend = cpu();
        let mut adagrad = Adagrad::new();
        let mut params = Tensor::from_f32(vec![0.0; 2], backend.clone());
        let grads = Tensor::from_f32(vec![0.5, -3.0], backend);

        let mut last_step = f32::INFINITY;
        for k in 1..=5 {
            let before = params.as_f32().unwrap()[1];
            adagrad.update(0.1, &mut params, &grads, 1, 1).unwrap();
            let step = (params.as_f32().unwrap()[1] - before).abs();

            let gt = adagrad.state().unwrap().as_f32().unwrap();
            assert!((gt[0] - k as f32 * 0.25).abs() < 1e-5);
            assert!((gt[1] - k as f32 * 9.0).abs() < 1e-4);
            assert!(step <= last_step);
            last_step = step;
        }
    }

    #[test]
    fn test_rejects_rational_adjustment() {
        let backend = cpu();
        let mut adagrad = Adagrad::new();
        let mut params = Tensor::from_f32(vec![1.0], backend.clone());
        let grads = Tensor::from_f32(vec![1.0], backend);

        let err = adagrad.update(0.1, &mut params, &grads, 3, 2).unwrap_err();
        assert!(matches!(
            err,
            OptimErr::RationalAdjustmentUnsupported {
                actual: 3,
                reference: 2
            }
        ));
        assert!(adagrad.state().is_none());
    }

    #[test]
    fn test_zero_eps_is_floored() {
        let backend = cpu();
        let mut adagrad = Adagrad::new();
        adagrad.set_params(&[0.0]);
        let mut params = Tensor::from_f32(vec![1.0], backend.clone());
        let grads = Tensor::from_f32(vec![0.0], backend);

        adagrad.update(0.1, &mut params, &grads, 1, 1).unwrap();
        assert_eq!(params.as_f32().unwrap(), [1.0]);
    }

    #[test]
    fn test_reset_keeps_allocation() {
        let backend = cpu();
        let mut adagrad = Adagrad::new();
        let mut params = Tensor::from_f32(vec![1.0; 3], backend.clone());
        let grads = Tensor::from_f32(vec![1.0; 3], backend);

        adagrad.update(0.1, &mut params, &grads, 1, 1).unwrap();
        adagrad.reset_stats();

        let gt = adagrad.state().unwrap();
        assert_eq!(gt.len(), 3);
        assert_eq!(gt.as_f32().unwrap(), [0.0; 3]);
    }

    #[test]
    fn test_loaded_state_must_match_params() {
        let backend = cpu();
        let mut adagrad = Adagrad::new();
        adagrad.load_state(&backend, &[1.0, 2.0]).unwrap();

        let mut params = Tensor::from_f32(vec![1.0; 3], backend.clone());
        let grads = Tensor::from_f32(vec![1.0; 3], backend);
        assert!(matches!(
            adagrad.update(0.1, &mut params, &grads, 1, 1),
            Err(OptimErr::SizeMismatch { got: 2, expected: 3, .. })
        ));
    }
}
