use crate::{error::Result, tensor::Tensor};

/// Exponential moving average of the parameters.
///
/// The per-update weight of the new parameters is `decay`, corrected for the ratio
/// between the actual and the reference minibatch size, and raised during the first
/// updates so the average doesn't stay anchored to its initial value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialSmoothing {
    decay: f32,
    ref_batch_words: usize,
}

impl ExponentialSmoothing {
    /// Creates a new `ExponentialSmoothing` schedule.
    ///
    /// # Arguments
    /// * `decay` - The weight of the new parameters on every update, e.g. `1e-4`.
    /// * `ref_batch_words` - The minibatch size `decay` was tuned for, `0` disables the correction.
    pub fn new(decay: f32, ref_batch_words: usize) -> Self {
        Self {
            decay,
            ref_batch_words,
        }
    }

    pub fn decay(&self) -> f32 {
        self.decay
    }

    /// Returns the weight kept by the average for an update.
    ///
    /// # Arguments
    /// * `batches` - The amount of batches seen so far.
    /// * `mb_size` - The size of the current minibatch.
    pub fn beta(&self, batches: usize, mb_size: usize) -> f64 {
        let mut beta = 1. - self.decay as f64;

        if self.ref_batch_words != 0 {
            beta = beta.powf(mb_size as f64 / self.ref_batch_words as f64);
        }

        let warmup = (batches as f64 + 1.) / (batches as f64 + 10.);
        beta.min(warmup)
    }

    /// Blends `params` into `avg`.
    ///
    /// # Arguments
    /// * `avg` - The float32 average accumulator.
    /// * `params` - The float32 parameters just updated.
    /// * `batches` - The amount of batches seen so far.
    /// * `mb_size` - The size of the current minibatch.
    pub fn update_avg(
        &self,
        avg: &mut Tensor,
        params: &Tensor,
        batches: usize,
        mb_size: usize,
    ) -> Result<()> {
        let beta = self.beta(batches, mb_size) as f32;
        let params = params.as_f32()?;

        for (a, p) in avg.as_f32_mut()?.iter_mut().zip(params) {
            *a = beta * *a + (1. - beta) * p;
        }

        Ok(())
    }
}
