/// The slice of the trainer's progress the optimizer reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrainingState {
    /// The current learning rate.
    pub eta: f32,
    /// The amount of batches seen so far.
    pub batches: usize,
    /// Whether the running statistics must be cleared.
    pub reset: bool,
}

/// Lifecycle hooks fired by the training loop.
///
/// Every hook is a no-op by default.
pub trait TrainingObserver {
    /// Called once before training starts.
    fn init(&mut self, _state: &TrainingState) {}

    /// Called after a training checkpoint was restored.
    fn act_after_loaded(&mut self, _state: &TrainingState) {}

    /// Called after every epoch.
    fn act_after_epoch(&mut self, _state: &TrainingState) {}

    /// Called after every batch.
    fn act_after_batches(&mut self, _state: &TrainingState) {}

    /// Called after validation stalled.
    fn act_after_stalled(&mut self, _state: &TrainingState) {}
}
