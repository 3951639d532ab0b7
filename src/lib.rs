//! Sharded mixed-precision optimizer engine.
//!
//! Turns gradients into parameter updates under mixed precision, cost scaling, gradient
//! clipping, minibatch-size adaptive hyperparameters and exponential parameter averaging,
//! and checkpoints the optimizers' running statistics across the shards of a model.

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod optimization;
pub mod storage;
pub mod tensor;
pub mod training;

pub use backend::{Backend, CpuBackend};
pub use config::OptimizerConfig;
pub use error::{OptimErr, Result};
pub use optimization::{Optimizer, OptimizerBuilder, UpdateRule};
pub use storage::ShardGroup;
pub use tensor::{DType, Tensor};
pub use training::{TrainingObserver, TrainingState};
