mod dtype;
mod tensor;

pub use dtype::DType;
pub use tensor::{Tensor, TensorData};
