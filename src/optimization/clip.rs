use std::fmt::Debug;

use crate::tensor::Tensor;

/// Rescales gradients before they reach the update rule.
pub trait Clipper: Debug + Send + Sync {
    /// Clips `grads` in place.
    ///
    /// # Arguments
    /// * `grads` - The gradients to clip.
    ///
    /// # Returns
    /// The norm of `grads` before clipping.
    fn clip(&self, grads: &mut Tensor) -> f64;
}

/// Clips gradients by their global L2 norm.
///
/// Whenever a non-zero norm reaches `max_norm` every element is scaled by `max_norm / norm`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormClipper {
    max_norm: f32,
}

impl NormClipper {
    /// Creates a new `NormClipper`.
    ///
    /// # Arguments
    /// * `max_norm` - The largest norm gradients are allowed to keep.
    pub fn new(max_norm: f32) -> Self {
        Self { max_norm }
    }

    pub fn max_norm(&self) -> f32 {
        self.max_norm
    }
}

impl Clipper for NormClipper {
    fn clip(&self, grads: &mut Tensor) -> f64 {
        let norm = grads.l2_norm();

        // Zero gradients have no direction to rescale.
        if norm > 0. && norm >= self.max_norm as f64 {
            let factor = (self.max_norm / norm as f32) as f64;
            grads.map_inplace(|g| g * factor);
        }

        norm
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{backend::CpuBackend, tensor::DType};

    #[test]
    fn test_large_norm_is_clipped() {
        let backend = Arc::new(CpuBackend::default());
        let mut grads = Tensor::from_f32(vec![3.0, 4.0], backend);

        let norm = NormClipper::new(1.0).clip(&mut grads);

        assert_eq!(norm, 5.0);
        let clipped = grads.as_f32().unwrap();
        assert!((clipped[0] - 0.6).abs() < 1e-6);
        assert!((clipped[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_small_norm_is_untouched() {
        let backend = Arc::new(CpuBackend::default());
        let mut grads = Tensor::from_f32(vec![0.3, 0.4], backend);

        NormClipper::new(1.0).clip(&mut grads);
        assert_eq!(grads.as_f32().unwrap(), [0.3, 0.4]);
    }

    #[test]
    fn test_zero_gradients_stay_zero() {
        let backend = Arc::new(CpuBackend::default());
        let mut grads = Tensor::from_f32(vec![0.0, 0.0], backend.clone());

        let norm = NormClipper::new(0.0).clip(&mut grads);

        assert_eq!(norm, 0.0);
        assert_eq!(grads.as_f32().unwrap(), [0.0, 0.0]);

        let mut grads = Tensor::from_f32(vec![1.0, -1.0], backend);
        NormClipper::new(0.0).clip(&mut grads);
        assert_eq!(grads.as_f32().unwrap(), [0.0, 0.0]);
    }

    #[test]
    fn test_clips_reduced_precision() {
        let backend = Arc::new(CpuBackend::default());
        let mut grads = Tensor::from_f32_as(&[6.0, 8.0], DType::Float16, backend);

        NormClipper::new(5.0).clip(&mut grads);
        assert_eq!(grads.to_f32_vec(), [3.0, 4.0]);
    }
}
