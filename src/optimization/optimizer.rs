use log::info;

use super::{Clipper, ExponentialSmoothing, UpdateRule};
use crate::{
    error::{OptimErr, Result},
    storage::{AllocRegime, ShadowAllocator},
    tensor::{DType, Tensor},
    training::{TrainingObserver, TrainingState},
};

/// The precision running statistics and master parameters are kept in.
pub const OPTIMIZER_DTYPE: DType = DType::Float32;

/// Master parameters and the gradient buffer used when the caller's tensors have a
/// different precision than the optimizer.
#[derive(Debug)]
struct CastBuffers {
    master: Tensor,
    grads: Tensor,
}

/// Converts gradients into parameter updates for a single shard.
///
/// Every update runs the same sequence: cast into the optimizer precision, reverse the
/// cost scaling, clip, apply the update rule, blend the moving average, cast back and
/// synchronize the backend.
#[derive(Debug)]
pub struct Optimizer {
    rule: UpdateRule,
    eta: f32,
    ref_mb_words: usize,
    cost_scale: f32,
    batches_seen: usize,
    clipper: Option<Box<dyn Clipper>>,
    smoothing: Option<ExponentialSmoothing>,
    shadow: ShadowAllocator,
    cast: Option<CastBuffers>,
    avg: Option<Tensor>,
    restored_avg: Option<Vec<f32>>,
}

impl Optimizer {
    /// Creates a new `Optimizer`.
    ///
    /// # Arguments
    /// * `rule` - The update rule.
    /// * `eta` - The learning rate.
    ///
    /// # Returns
    /// An optimizer without minibatch adjustment, cost scaling, clipping or averaging.
    pub fn new(rule: UpdateRule, eta: f32) -> Self {
        Self {
            rule,
            eta,
            ref_mb_words: 0,
            cost_scale: 1.,
            batches_seen: 0,
            clipper: None,
            smoothing: None,
            shadow: ShadowAllocator::new(),
            cast: None,
            avg: None,
            restored_avg: None,
        }
    }

    /// Enables the automatic adjustment of the hyperparameters to the minibatch size.
    ///
    /// # Arguments
    /// * `ref_mb_words` - The minibatch size the hyperparameters were tuned for, `0` disables it.
    pub fn with_ref_mb_words(mut self, ref_mb_words: usize) -> Self {
        if ref_mb_words != 0 {
            info!(
                "note: modified {} hyper-parameters assume a reference minibatch size of {ref_mb_words}",
                self.rule.name()
            );
        }

        self.ref_mb_words = ref_mb_words;
        self
    }

    /// Sets the factor the loss was multiplied by before computing the gradients.
    pub fn with_cost_scale(mut self, cost_scale: f32) -> Self {
        self.cost_scale = cost_scale;
        self
    }

    pub fn with_clipper(mut self, clipper: Box<dyn Clipper>) -> Self {
        self.clipper = Some(clipper);
        self
    }

    pub fn with_smoothing(mut self, smoothing: ExponentialSmoothing) -> Self {
        self.smoothing = Some(smoothing);
        self
    }

    pub fn rule(&self) -> &UpdateRule {
        &self.rule
    }

    pub(crate) fn rule_mut(&mut self) -> &mut UpdateRule {
        &mut self.rule
    }

    pub fn eta(&self) -> f32 {
        self.eta
    }

    pub fn batches_seen(&self) -> usize {
        self.batches_seen
    }

    /// Returns the regime the shadow buffers were reserved for, `None` before the first update.
    pub fn regime(&self) -> Option<AllocRegime> {
        self.shadow.regime()
    }

    /// Returns the float32 master parameters, only kept when the parameters need casting.
    pub fn master(&self) -> Option<&Tensor> {
        self.cast.as_ref().map(|cast| &cast.master)
    }

    /// Whether a moving average of the parameters is tracked.
    pub fn smooths(&self) -> bool {
        self.smoothing.is_some()
    }

    /// Returns the moving average of the parameters, only kept when smoothing is enabled.
    pub fn average(&self) -> Option<&Tensor> {
        self.avg.as_ref()
    }

    /// Restores this shard's slice of a checkpointed moving average.
    ///
    /// Before the first update the values are kept until the average is allocated.
    pub(crate) fn restore_average(&mut self, values: &[f32]) -> Result<()> {
        match self.avg.as_mut() {
            Some(avg) => avg.set_f32(values),
            None => {
                self.restored_avg = Some(values.to_vec());
                Ok(())
            }
        }
    }

    /// Forwards positional hyperparameters to the update rule.
    pub fn set_params(&mut self, params: &[f32]) {
        self.rule.set_params(params);
    }

    /// Zeroes the running statistics of the update rule.
    pub fn reset_stats(&mut self) {
        self.rule.reset_stats();
    }

    /// Updates `params` in place from `grads`.
    ///
    /// # Arguments
    /// * `params` - The parameters of this shard in the compute precision.
    /// * `grads` - The gradients of `params`, clipping rescales them in place.
    /// * `mb_size` - The size of the minibatch, required when minibatch adjustment is enabled.
    ///
    /// # Returns
    /// An error if the inputs don't match each other or the optimizer's state.
    pub fn update(
        &mut self,
        params: &mut Tensor,
        grads: &mut Tensor,
        mb_size: Option<usize>,
    ) -> Result<()> {
        let (actual, reference) = match (self.ref_mb_words, mb_size) {
            (0, _) => (1, 1),
            (_, Some(0)) => return Err(OptimErr::EmptyMiniBatch),
            (reference, Some(actual)) => (actual, reference),
            (_, None) => return Err(OptimErr::MissingMiniBatchSize),
        };

        if params.len() != grads.len() {
            return Err(OptimErr::SizeMismatch {
                a: "grads",
                b: "params",
                got: grads.len(),
                expected: params.len(),
            });
        }

        if params.dtype() != grads.dtype() {
            return Err(OptimErr::TypeMismatch {
                what: "grads",
                got: grads.dtype(),
                expected: params.dtype(),
            });
        }

        self.allocate(params)?;

        if let Some(CastBuffers {
            master,
            grads: cast_grads,
        }) = self.cast.as_mut()
        {
            cast_grads.copy_cast_from(grads)?;
            unscale(cast_grads, self.cost_scale);

            // Clips the caller's gradients, the cast buffer was already filled.
            if let Some(clipper) = &self.clipper {
                clipper.clip(grads);
            }

            self.rule.apply(self.eta, master, cast_grads, actual, reference)?;

            if let (Some(smoothing), Some(avg)) = (&self.smoothing, self.avg.as_mut()) {
                smoothing.update_avg(avg, master, self.batches_seen, actual)?;
            }

            params.copy_cast_from(master)?;
        } else {
            unscale(grads, self.cost_scale);

            if let Some(clipper) = &self.clipper {
                clipper.clip(grads);
            }

            self.rule.apply(self.eta, params, grads, actual, reference)?;

            if let (Some(smoothing), Some(avg)) = (&self.smoothing, self.avg.as_mut()) {
                smoothing.update_avg(avg, params, self.batches_seen, actual)?;
            }
        }

        params.backend().synchronize();
        Ok(())
    }

    /// Reserves the shadow arena and carves the buffers of the regime `params` require.
    fn allocate(&mut self, params: &Tensor) -> Result<()> {
        let cast = params.dtype() != OPTIMIZER_DTYPE;
        let regime = AllocRegime::new(cast, self.smoothing.is_some());
        let elements = params.len();

        self.shadow.ensure(regime, elements, OPTIMIZER_DTYPE, params.backend())?;

        if regime.casts() && self.cast.is_none() {
            let mut master = self.shadow.allocate(elements)?;
            master.copy_cast_from(params)?;
            let grads = self.shadow.allocate(elements)?;
            self.cast = Some(CastBuffers { master, grads });
        }

        if regime.averages() && self.avg.is_none() {
            let mut avg = self.shadow.allocate(elements)?;
            match self.restored_avg.take() {
                Some(values) => avg.set_f32(&values)?,
                None => avg.copy_cast_from(params)?,
            }
            self.avg = Some(avg);
        }

        Ok(())
    }
}

fn unscale(grads: &mut Tensor, cost_scale: f32) {
    if cost_scale != 1. {
        let cost_scale = cost_scale as f64;
        grads.map_inplace(|g| g / cost_scale);
    }
}

impl TrainingObserver for Optimizer {
    fn init(&mut self, state: &TrainingState) {
        self.eta = state.eta;
    }

    fn act_after_loaded(&mut self, state: &TrainingState) {
        self.eta = state.eta;
    }

    fn act_after_epoch(&mut self, state: &TrainingState) {
        self.eta = state.eta;
        if state.reset {
            self.reset_stats();
        }
    }

    fn act_after_batches(&mut self, state: &TrainingState) {
        self.eta = state.eta;
        self.batches_seen = state.batches;

        if state.reset {
            self.reset_stats();
        }
    }

    fn act_after_stalled(&mut self, state: &TrainingState) {
        self.eta = state.eta;
        if state.reset {
            self.reset_stats();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        backend::{Backend, CpuBackend},
        optimization::{Adagrad, Adam, NormClipper, Sgd},
    };

    fn sgd(eta: f32) -> Optimizer {
        Optimizer::new(UpdateRule::Sgd(Sgd::new()), eta)
    }

    fn tensors(
        backend: &Arc<CpuBackend>,
        params: &[f32],
        grads: &[f32],
        dtype: DType,
    ) -> (Tensor, Tensor) {
        let backend: Arc<dyn Backend> = backend.clone();
        (
            Tensor::from_f32_as(params, dtype, backend.clone()),
            Tensor::from_f32_as(grads, dtype, backend),
        )
    }

    #[test]
    fn test_sgd_is_deterministic() {
        let cpu = Arc::new(CpuBackend::default());
        let (mut p1, mut g1) = tensors(&cpu, &[1.0, -2.0], &[0.5, 0.25], DType::Float32);
        let (mut p2, mut g2) = tensors(&cpu, &[1.0, -2.0], &[0.5, 0.25], DType::Float32);

        sgd(0.1).update(&mut p1, &mut g1, None).unwrap();
        sgd(0.1).update(&mut p2, &mut g2, None).unwrap();

        assert_eq!(p1.as_f32().unwrap(), p2.as_f32().unwrap());
        assert_eq!(p1.as_f32().unwrap(), [1.0 - 0.1 * 0.5, -2.0 - 0.1 * 0.25]);
    }

    #[test]
    fn test_synchronizes_once_per_update() {
        let cpu = Arc::new(CpuBackend::default());
        let (mut params, mut grads) = tensors(&cpu, &[1.0; 4], &[1.0; 4], DType::Float16);
        let mut optimizer = sgd(0.1).with_smoothing(ExponentialSmoothing::new(1e-4, 0));

        optimizer.update(&mut params, &mut grads, None).unwrap();
        assert_eq!(cpu.sync_count(), 1);

        optimizer.update(&mut params, &mut grads, None).unwrap();
        assert_eq!(cpu.sync_count(), 2);
    }

    #[test]
    fn test_regime_reservations() {
        let cases = [
            (DType::Float32, false, AllocRegime::None, vec![]),
            (DType::Float16, false, AllocRegime::CastOnly, vec![2 * 8 * 4]),
            (DType::Float32, true, AllocRegime::AverageOnly, vec![8 * 4]),
            (DType::BFloat16, true, AllocRegime::CastAndAverage, vec![3 * 8 * 4]),
        ];

        for (dtype, smooth, regime, reservations) in cases {
            let cpu = Arc::new(CpuBackend::default());
            let (mut params, mut grads) = tensors(&cpu, &[1.0; 8], &[0.5; 8], dtype);
            let mut optimizer = sgd(0.1);
            if smooth {
                optimizer = optimizer.with_smoothing(ExponentialSmoothing::new(1e-4, 0));
            }

            optimizer.update(&mut params, &mut grads, None).unwrap();
            optimizer.update(&mut params, &mut grads, None).unwrap();

            assert_eq!(optimizer.regime(), Some(regime));
            assert_eq!(cpu.reservations(), reservations);
        }
    }

    #[test]
    fn test_regime_change_is_fatal() {
        let cpu = Arc::new(CpuBackend::default());
        let mut optimizer = sgd(0.1);

        let (mut params, mut grads) = tensors(&cpu, &[1.0; 2], &[1.0; 2], DType::Float32);
        optimizer.update(&mut params, &mut grads, None).unwrap();

        let (mut params, mut grads) = tensors(&cpu, &[1.0; 2], &[1.0; 2], DType::Float16);
        let err = optimizer.update(&mut params, &mut grads, None).unwrap_err();
        assert!(matches!(
            err,
            OptimErr::RegimeChanged {
                reserved: AllocRegime::None,
                requested: AllocRegime::CastOnly
            }
        ));
    }

    #[test]
    fn test_mixed_precision_round_trip() {
        let cpu = Arc::new(CpuBackend::default());
        let values = [0.5, -1.25, 2.0, 0.125];
        let gradients = [0.25, 0.5, -1.0, 0.75];

        let (mut reference, mut ref_grads) = tensors(&cpu, &values, &gradients, DType::Float32);
        sgd(0.01).update(&mut reference, &mut ref_grads, None).unwrap();

        for (dtype, tolerance) in [(DType::Float16, 2e-3), (DType::BFloat16, 2e-2)] {
            let (mut params, mut grads) = tensors(&cpu, &values, &gradients, dtype);
            let mut optimizer = sgd(0.01);
            optimizer.update(&mut params, &mut grads, None).unwrap();

            assert_eq!(params.dtype(), dtype);
            let master = optimizer.master().unwrap().as_f32().unwrap();
            for ((p, m), r) in params
                .to_f32_vec()
                .iter()
                .zip(master)
                .zip(reference.as_f32().unwrap())
            {
                assert!((m - r).abs() < 1e-6);
                assert!((p - r).abs() <= tolerance * r.abs().max(1.));
            }
        }
    }

    #[test]
    fn test_master_copy_is_authoritative() {
        let cpu = Arc::new(CpuBackend::default());
        let (mut params, mut grads) = tensors(&cpu, &[1.0], &[1.0], DType::Float16);
        let mut optimizer = sgd(1e-4);

        for _ in 0..10 {
            optimizer.update(&mut params, &mut grads, None).unwrap();
        }

        let master = optimizer.master().unwrap().as_f32().unwrap()[0];
        assert!((master - 0.999).abs() < 1e-6);
        assert!((params.to_f32_vec()[0] - 0.999).abs() < 1e-3);
    }

    #[test]
    fn test_missing_minibatch_size() {
        let cpu = Arc::new(CpuBackend::default());
        let (mut params, mut grads) = tensors(&cpu, &[1.0], &[1.0], DType::Float32);
        let mut optimizer =
            Optimizer::new(UpdateRule::Adam(Adam::new()), 0.01).with_ref_mb_words(100);

        let err = optimizer.update(&mut params, &mut grads, None).unwrap_err();
        assert!(matches!(err, OptimErr::MissingMiniBatchSize));
    }

    #[test]
    fn test_empty_minibatch_is_rejected() {
        let cpu = Arc::new(CpuBackend::default());
        let (mut params, mut grads) = tensors(&cpu, &[1.0], &[1.0], DType::Float32);
        let mut optimizer =
            Optimizer::new(UpdateRule::Adam(Adam::new()), 0.01).with_ref_mb_words(100);

        let err = optimizer.update(&mut params, &mut grads, Some(0)).unwrap_err();

        assert!(matches!(err, OptimErr::EmptyMiniBatch));
        assert_eq!(params.to_f32_vec(), vec![1.0]);
        assert_eq!(optimizer.batches_seen(), 0);
    }

    #[test]
    fn test_auto_adjustment_identity() {
        let cpu = Arc::new(CpuBackend::default());
        let values = [0.5, -0.25, 1.0];
        let gradients = [0.3, -0.7, 0.1];

        let (mut p1, mut g1) = tensors(&cpu, &values, &gradients, DType::Float32);
        let (mut p2, mut g2) = tensors(&cpu, &values, &gradients, DType::Float32);

        let mut disabled = Optimizer::new(UpdateRule::Adagrad(Adagrad::new()), 0.1);
        let mut adjusted =
            Optimizer::new(UpdateRule::Adagrad(Adagrad::new()), 0.1).with_ref_mb_words(64);

        for _ in 0..3 {
            disabled.update(&mut p1, &mut g1, None).unwrap();
            adjusted.update(&mut p2, &mut g2, Some(64)).unwrap();
        }

        assert_eq!(p1.as_f32().unwrap(), p2.as_f32().unwrap());
    }

    #[test]
    fn test_adam_auto_adjustment_with_summed_gradients() {
        let cpu = Arc::new(CpuBackend::default());
        let (mut p1, mut g1) = tensors(&cpu, &[0.5, -0.5], &[0.2, -0.4], DType::Float32);
        let (mut p2, mut g2) = tensors(&cpu, &[0.5, -0.5], &[0.8, -1.6], DType::Float32);

        let mut disabled = Optimizer::new(UpdateRule::Adam(Adam::new()), 0.01);
        let mut adjusted =
            Optimizer::new(UpdateRule::Adam(Adam::new()), 0.01).with_ref_mb_words(4);

        disabled.update(&mut p1, &mut g1, None).unwrap();
        adjusted.update(&mut p2, &mut g2, Some(4)).unwrap();

        for (a, b) in p1.as_f32().unwrap().iter().zip(p2.as_f32().unwrap()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_cost_scaling_is_reversed() {
        let cpu = Arc::new(CpuBackend::default());
        let (mut params, mut grads) = tensors(&cpu, &[1.0], &[4.0], DType::Float32);
        let mut optimizer = sgd(0.5).with_cost_scale(4.);

        optimizer.update(&mut params, &mut grads, None).unwrap();
        assert_eq!(params.as_f32().unwrap(), [0.5]);
    }

    #[test]
    fn test_clipping_before_update() {
        let cpu = Arc::new(CpuBackend::default());
        let (mut params, mut grads) = tensors(&cpu, &[0.0, 0.0], &[3.0, 4.0], DType::Float32);
        let mut optimizer = sgd(1.0).with_clipper(Box::new(NormClipper::new(1.0)));

        optimizer.update(&mut params, &mut grads, None).unwrap();

        let params = params.as_f32().unwrap();
        assert!((params[0] + 0.6).abs() < 1e-6);
        assert!((params[1] + 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_clipping_after_cast_touches_caller_gradients_only() {
        let cpu = Arc::new(CpuBackend::default());
        let (mut params, mut grads) = tensors(&cpu, &[0.0, 0.0], &[3.0, 4.0], DType::Float16);
        let mut optimizer = sgd(1.0).with_clipper(Box::new(NormClipper::new(1.0)));

        optimizer.update(&mut params, &mut grads, None).unwrap();

        assert_eq!(params.to_f32_vec(), [-3.0, -4.0]);
        let clipped = grads.to_f32_vec();
        assert!((clipped[0] - 0.6).abs() < 1e-3);
        assert!((clipped[1] - 0.8).abs() < 1e-3);
    }

    #[test]
    fn test_average_tracks_params() {
        let cpu = Arc::new(CpuBackend::default());
        let (mut params, mut grads) = tensors(&cpu, &[1.0], &[1.0], DType::Float32);
        let mut optimizer = sgd(0.5).with_smoothing(ExponentialSmoothing::new(0.5, 0));

        optimizer.update(&mut params, &mut grads, None).unwrap();

        // beta = min(0.5, 1/10)
        let avg = optimizer.average().unwrap().as_f32().unwrap()[0];
        assert!((avg - (0.1 * 1.0 + 0.9 * 0.5)).abs() < 1e-6);

        optimizer.reset_stats();
        assert_eq!(optimizer.average().unwrap().as_f32().unwrap()[0], avg);
    }

    #[test]
    fn test_restored_average_is_used_on_allocation() {
        let cpu = Arc::new(CpuBackend::default());
        let (mut params, mut grads) = tensors(&cpu, &[1.0, 1.0], &[0.0, 0.0], DType::Float16);
        let mut optimizer = sgd(0.5).with_smoothing(ExponentialSmoothing::new(0.5, 0));

        optimizer.restore_average(&[3.0, 5.0]).unwrap();
        optimizer.update(&mut params, &mut grads, None).unwrap();

        // beta = min(0.5, 1/10)
        let avg = optimizer.average().unwrap().as_f32().unwrap();
        assert!((avg[0] - (0.1 * 3.0 + 0.9)).abs() < 1e-6);
        assert!((avg[1] - (0.1 * 5.0 + 0.9)).abs() < 1e-6);
    }

    #[test]
    fn test_size_and_type_mismatch() {
        let cpu = Arc::new(CpuBackend::default());
        let backend: Arc<dyn Backend> = cpu.clone();
        let mut optimizer = sgd(0.1);

        let mut params = Tensor::from_f32(vec![1.0; 3], backend.clone());
        let mut grads = Tensor::from_f32(vec![1.0; 2], backend.clone());
        assert!(matches!(
            optimizer.update(&mut params, &mut grads, None),
            Err(OptimErr::SizeMismatch { got: 2, expected: 3, .. })
        ));

        let mut grads = Tensor::from_f32_as(&[1.0; 3], DType::Float16, backend);
        assert!(matches!(
            optimizer.update(&mut params, &mut grads, None),
            Err(OptimErr::TypeMismatch { got: DType::Float16, .. })
        ));
        assert!(cpu.reservations().is_empty());
    }

    #[test]
    fn test_lifecycle_hooks() {
        let cpu = Arc::new(CpuBackend::default());
        let (mut params, mut grads) = tensors(&cpu, &[1.0], &[2.0], DType::Float32);
        let mut optimizer = Optimizer::new(UpdateRule::Adagrad(Adagrad::new()), 0.1);
        optimizer.update(&mut params, &mut grads, None).unwrap();

        optimizer.act_after_batches(&TrainingState {
            eta: 0.05,
            batches: 12,
            reset: false,
        });
        assert_eq!(optimizer.eta(), 0.05);
        assert_eq!(optimizer.batches_seen(), 12);

        optimizer.act_after_stalled(&TrainingState {
            eta: 0.01,
            batches: 12,
            reset: true,
        });
        assert_eq!(optimizer.eta(), 0.01);

        let UpdateRule::Adagrad(adagrad) = optimizer.rule() else {
            panic!("expected adagrad");
        };
        assert_eq!(adagrad.state().unwrap().as_f32().unwrap(), [0.0]);
    }
}
