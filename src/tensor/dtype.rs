use std::fmt::{self, Display};

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// The element type of a `Tensor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Float16,
    BFloat16,
    Float32,
    Float64,
}

impl DType {
    /// Returns the size in bytes of a single element.
    pub fn size(self) -> usize {
        match self {
            DType::Float16 | DType::BFloat16 => 2,
            DType::Float32 => 4,
            DType::Float64 => 8,
        }
    }

    /// Returns the smallest positive normal value representable by this type.
    pub fn min_positive(self) -> f64 {
        match self {
            DType::Float16 => f16::MIN_POSITIVE.to_f64(),
            DType::BFloat16 => bf16::MIN_POSITIVE.to_f64(),
            DType::Float32 => f32::MIN_POSITIVE as f64,
            DType::Float64 => f64::MIN_POSITIVE,
        }
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::Float16 => "float16",
            DType::BFloat16 => "bfloat16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        };

        f.write_str(s)
    }
}
