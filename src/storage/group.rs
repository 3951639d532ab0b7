use std::{num::NonZeroUsize, path::Path, sync::Arc};

use rayon::prelude::*;

use crate::{
    backend::Backend,
    checkpoint::{self, LocalCollective},
    error::{OptimErr, Result},
    optimization::Optimizer,
    tensor::Tensor,
    training::{TrainingObserver, TrainingState},
};

/// Owns one optimizer per device and updates them in parallel.
///
/// The model's parameters are partitioned in contiguous shards, shard `i` lives on
/// `backends[i]` and is updated by `shards[i]`.
#[derive(Debug)]
pub struct ShardGroup {
    shards: Vec<Optimizer>,
    backends: Vec<Arc<dyn Backend>>,
    collective: LocalCollective,
}

impl ShardGroup {
    /// Creates a new `ShardGroup`.
    ///
    /// # Arguments
    /// * `backends` - The device of every shard.
    /// * `optimizer_factory` - Builds the optimizer of the shard with the given index.
    ///
    /// # Returns
    /// A new `ShardGroup` or the first error of the factory.
    pub fn new<OF>(backends: Vec<Arc<dyn Backend>>, optimizer_factory: OF) -> Result<Self>
    where
        OF: FnMut(usize) -> Result<Optimizer>,
    {
        let nshards = NonZeroUsize::new(backends.len()).ok_or(OptimErr::EmptyShardGroup)?;
        let shards = (0..nshards.get())
            .map(optimizer_factory)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            shards,
            backends,
            collective: LocalCollective::new(nshards),
        })
    }

    /// Returns the amount of shards.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn shards(&self) -> &[Optimizer] {
        &self.shards
    }

    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    pub fn collective(&self) -> &LocalCollective {
        &self.collective
    }

    /// Updates every shard in parallel.
    ///
    /// # Arguments
    /// * `params` - The parameters of every shard.
    /// * `grads` - The gradients of every shard.
    /// * `mb_size` - The size of the minibatch.
    ///
    /// # Returns
    /// The first error of any shard.
    pub fn update(
        &mut self,
        params: &mut [Tensor],
        grads: &mut [Tensor],
        mb_size: Option<usize>,
    ) -> Result<()> {
        for (what, got) in [("params", params.len()), ("grads", grads.len())] {
            if got != self.shards.len() {
                return Err(OptimErr::SizeMismatch {
                    a: what,
                    b: "optimizer shards",
                    got,
                    expected: self.shards.len(),
                });
            }
        }

        self.shards
            .par_iter_mut()
            .zip(params.par_iter_mut())
            .zip(grads.par_iter_mut())
            .try_for_each(|((shard, params), grads)| shard.update(params, grads, mb_size))
    }

    /// Zeroes the running statistics of every shard.
    pub fn reset_stats(&mut self) {
        self.shards.iter_mut().for_each(Optimizer::reset_stats);
    }

    /// Saves the running statistics of the group into `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        checkpoint::save(path, &self.shards, &self.collective, true)
    }

    /// Restores the running statistics of the group from `path`, a missing file is a no-op.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        checkpoint::load(path, &mut self.shards, &self.backends, &self.collective)
    }
}

impl TrainingObserver for ShardGroup {
    fn init(&mut self, state: &TrainingState) {
        self.shards.iter_mut().for_each(|shard| shard.init(state));
    }

    fn act_after_loaded(&mut self, state: &TrainingState) {
        self.shards
            .iter_mut()
            .for_each(|shard| shard.act_after_loaded(state));
    }

    fn act_after_epoch(&mut self, state: &TrainingState) {
        self.shards
            .iter_mut()
            .for_each(|shard| shard.act_after_epoch(state));
    }

    fn act_after_batches(&mut self, state: &TrainingState) {
        self.shards
            .iter_mut()
            .for_each(|shard| shard.act_after_batches(state));
    }

    fn act_after_stalled(&mut self, state: &TrainingState) {
        self.shards
            .iter_mut()
            .for_each(|shard| shard.act_after_stalled(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::CpuBackend,
        optimization::{Sgd, UpdateRule},
    };

    fn backends(n: usize) -> Vec<Arc<dyn Backend>> {
        (0..n)
            .map(|i| Arc::new(CpuBackend::new(i)) as Arc<dyn Backend>)
            .collect()
    }

    fn sgd_group(n: usize) -> ShardGroup {
        ShardGroup::new(backends(n), |_| {
            Ok(Optimizer::new(UpdateRule::Sgd(Sgd::new()), 0.5))
        })
        .unwrap()
    }

    #[test]
    fn test_empty_group() {
        let result = ShardGroup::new(Vec::new(), |_| {
            Ok(Optimizer::new(UpdateRule::Sgd(Sgd::new()), 0.5))
        });
        assert!(matches!(result, Err(OptimErr::EmptyShardGroup)));
    }

    #[test]
    fn test_factory_error_is_propagated() {
        let result = ShardGroup::new(backends(2), |i| {
            UpdateRule::from_name(if i == 0 { "sgd" } else { "lion" }, &[])
                .map(|rule| Optimizer::new(rule, 0.1))
        });
        assert!(matches!(result, Err(OptimErr::UnknownAlgorithm(_))));
    }

    #[test]
    fn test_updates_every_shard() {
        let mut group = sgd_group(3);
        let backends = group.backends().to_vec();

        let mut params: Vec<Tensor> = backends
            .iter()
            .map(|b| Tensor::from_f32(vec![1.0; 4], b.clone()))
            .collect();
        let mut grads: Vec<Tensor> = backends
            .iter()
            .enumerate()
            .map(|(i, b)| Tensor::from_f32(vec![i as f32; 4], b.clone()))
            .collect();

        group.update(&mut params, &mut grads, None).unwrap();

        for (i, p) in params.iter().enumerate() {
            assert_eq!(p.as_f32().unwrap(), [1.0 - 0.5 * i as f32; 4]);
        }
    }

    #[test]
    fn test_update_checks_shard_count() {
        let mut group = sgd_group(2);
        let backend = group.backends()[0].clone();
        let mut params = vec![Tensor::from_f32(vec![1.0], backend.clone())];
        let mut grads = vec![Tensor::from_f32(vec![1.0], backend)];

        assert!(matches!(
            group.update(&mut params, &mut grads, None),
            Err(OptimErr::SizeMismatch { got: 1, expected: 2, .. })
        ));
    }

    #[test]
    fn test_hooks_reach_every_shard() {
        let mut group = sgd_group(2);
        group.act_after_batches(&TrainingState {
            eta: 0.25,
            batches: 7,
            reset: true,
        });

        for shard in group.shards() {
            assert_eq!(shard.eta(), 0.25);
            assert_eq!(shard.batches_seen(), 7);
        }
    }
}
