mod adagrad;
mod adam;
mod builder;
mod clip;
mod optimizer;
mod rule;
mod sgd;
mod smoothing;

pub use adagrad::Adagrad;
pub use adam::Adam;
pub use builder::OptimizerBuilder;
pub use clip::{Clipper, NormClipper};
pub use optimizer::{OPTIMIZER_DTYPE, Optimizer};
pub use rule::{EpsPolicy, UpdateRule};
pub use sgd::Sgd;
pub use smoothing::ExponentialSmoothing;
