use std::{fmt, sync::Arc};

use half::{bf16, f16};

use super::DType;
use crate::{
    backend::Backend,
    error::{OptimErr, Result},
};

/// The typed memory block owned by a `Tensor`.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl TensorData {
    /// Creates a zeroed block of `len` elements of type `dtype`.
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::Float16 => TensorData::F16(vec![f16::ZERO; len]),
            DType::BFloat16 => TensorData::BF16(vec![bf16::ZERO; len]),
            DType::Float32 => TensorData::F32(vec![0.; len]),
            DType::Float64 => TensorData::F64(vec![0.; len]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F16(_) => DType::Float16,
            TensorData::BF16(_) => DType::BFloat16,
            TensorData::F32(_) => DType::Float32,
            TensorData::F64(_) => DType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F16(v) => v.len(),
            TensorData::BF16(v) => v.len(),
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates the elements widened to `f64`, which represents every supported type exactly.
    fn iter_f64(&self) -> Box<dyn Iterator<Item = f64> + '_> {
        match self {
            TensorData::F16(v) => Box::new(v.iter().map(|x| x.to_f64())),
            TensorData::BF16(v) => Box::new(v.iter().map(|x| x.to_f64())),
            TensorData::F32(v) => Box::new(v.iter().map(|&x| x as f64)),
            TensorData::F64(v) => Box::new(v.iter().copied()),
        }
    }

    /// Overwrites every element with the rounded result of `f` applied to its `f64` value.
    fn map_inplace<F>(&mut self, f: F)
    where
        F: Fn(f64) -> f64,
    {
        match self {
            TensorData::F16(v) => v.iter_mut().for_each(|x| *x = f16::from_f64(f(x.to_f64()))),
            TensorData::BF16(v) => v.iter_mut().for_each(|x| *x = bf16::from_f64(f(x.to_f64()))),
            TensorData::F32(v) => v.iter_mut().for_each(|x| *x = f(*x as f64) as f32),
            TensorData::F64(v) => v.iter_mut().for_each(|x| *x = f(*x)),
        }
    }

    /// Assigns the values produced by `src`, rounding them to this block's type.
    fn assign<I>(&mut self, src: I)
    where
        I: Iterator<Item = f64>,
    {
        match self {
            TensorData::F16(v) => v.iter_mut().zip(src).for_each(|(d, s)| *d = f16::from_f64(s)),
            TensorData::BF16(v) => v.iter_mut().zip(src).for_each(|(d, s)| *d = bf16::from_f64(s)),
            TensorData::F32(v) => v.iter_mut().zip(src).for_each(|(d, s)| *d = s as f32),
            TensorData::F64(v) => v.iter_mut().zip(src).for_each(|(d, s)| *d = s),
        }
    }
}

/// A shaped numeric buffer living on a `Backend`.
///
/// The element count always equals the product of the shape.
#[derive(Clone)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
    backend: Arc<dyn Backend>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype())
            .field("device", &self.backend.device_id())
            .finish()
    }
}

impl Tensor {
    /// Creates a new zero filled `Tensor`.
    ///
    /// # Arguments
    /// * `shape` - The dimensions of the tensor.
    /// * `dtype` - The element type.
    /// * `backend` - The device the tensor lives on.
    ///
    /// # Returns
    /// A new `Tensor` instance.
    pub fn zeros(shape: &[usize], dtype: DType, backend: Arc<dyn Backend>) -> Self {
        let len = shape.iter().product();

        Self {
            shape: shape.to_vec(),
            data: TensorData::zeros(dtype, len),
            backend,
        }
    }

    /// Creates a new `Tensor` over an existing memory block.
    ///
    /// # Arguments
    /// * `shape` - The dimensions of the tensor.
    /// * `data` - The memory block, its length must match the shape.
    /// * `backend` - The device the tensor lives on.
    ///
    /// # Returns
    /// A new `Tensor` or a `SizeMismatch` error.
    pub fn from_data(shape: &[usize], data: TensorData, backend: Arc<dyn Backend>) -> Result<Self> {
        let expected: usize = shape.iter().product();

        if data.len() != expected {
            return Err(OptimErr::SizeMismatch {
                a: "tensor data",
                b: "tensor shape",
                got: data.len(),
                expected,
            });
        }

        Ok(Self {
            shape: shape.to_vec(),
            data,
            backend,
        })
    }

    /// Creates a `[1, N]` float32 tensor holding `values`.
    pub fn from_f32(values: Vec<f32>, backend: Arc<dyn Backend>) -> Self {
        Self {
            shape: vec![1, values.len()],
            data: TensorData::F32(values),
            backend,
        }
    }

    /// Creates a `[1, N]` tensor of type `dtype`, rounding `values` into it.
    pub fn from_f32_as(values: &[f32], dtype: DType, backend: Arc<dyn Backend>) -> Self {
        let mut data = TensorData::zeros(dtype, values.len());
        data.assign(values.iter().map(|&x| x as f64));

        Self {
            shape: vec![1, values.len()],
            data,
            backend,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Returns the amount of elements in the tensor.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the size of the memory block in bytes.
    pub fn bytes(&self) -> usize {
        self.len() * self.dtype().size()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Borrows the elements as `f32`.
    ///
    /// # Returns
    /// The element slice or a `TypeMismatch` error if the tensor isn't float32.
    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Ok(v),
            other => Err(OptimErr::TypeMismatch {
                what: "tensor",
                got: other.dtype(),
                expected: DType::Float32,
            }),
        }
    }

    /// Mutably borrows the elements as `f32`.
    ///
    /// # Returns
    /// The element slice or a `TypeMismatch` error if the tensor isn't float32.
    pub fn as_f32_mut(&mut self) -> Result<&mut [f32]> {
        match &mut self.data {
            TensorData::F32(v) => Ok(v),
            other => Err(OptimErr::TypeMismatch {
                what: "tensor",
                got: other.dtype(),
                expected: DType::Float32,
            }),
        }
    }

    /// Copies the elements into a host vector, converting them to `f32`.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            TensorData::F32(v) => v.clone(),
            other => other.iter_f64().map(|x| x as f32).collect(),
        }
    }

    /// Overwrites the elements with `values`.
    ///
    /// # Arguments
    /// * `values` - The new contents, must have exactly `len()` elements.
    ///
    /// # Returns
    /// A `SizeMismatch` error if the lengths differ.
    pub fn set_f32(&mut self, values: &[f32]) -> Result<()> {
        if values.len() != self.len() {
            return Err(OptimErr::SizeMismatch {
                a: "values",
                b: "tensor",
                got: values.len(),
                expected: self.len(),
            });
        }

        match &mut self.data {
            TensorData::F32(v) => v.copy_from_slice(values),
            other => other.assign(values.iter().map(|&x| x as f64)),
        }

        Ok(())
    }

    /// Sets every element to `value`.
    pub fn fill(&mut self, value: f32) {
        self.data.map_inplace(|_| value as f64);
    }

    /// Copies `src` into this tensor converting between element types as needed.
    ///
    /// # Arguments
    /// * `src` - The tensor to copy from, must have the same amount of elements.
    ///
    /// # Returns
    /// A `SizeMismatch` error if the element counts differ.
    pub fn copy_cast_from(&mut self, src: &Tensor) -> Result<()> {
        if src.len() != self.len() {
            return Err(OptimErr::SizeMismatch {
                a: "cast source",
                b: "cast destination",
                got: src.len(),
                expected: self.len(),
            });
        }

        match (&mut self.data, &src.data) {
            (TensorData::F32(dst), TensorData::F32(s)) => dst.copy_from_slice(s),
            (dst, s) => dst.assign(s.iter_f64()),
        }

        Ok(())
    }

    /// Applies `f` to every element in place.
    ///
    /// The closure works on `f64`, results are rounded back to the tensor's type.
    pub fn map_inplace<F>(&mut self, f: F)
    where
        F: Fn(f64) -> f64,
    {
        self.data.map_inplace(f);
    }

    /// Returns the L2 norm over all elements.
    pub fn l2_norm(&self) -> f64 {
        self.data.iter_f64().map(|x| x * x).sum::<f64>().sqrt()
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
    fn test_from_data_checks_shape() {
        let data = TensorData::F32(vec![0.; 5]);
        let err = Tensor::from_data(&[2, 3], data, cpu()).unwrap_err();
        assert!(matches!(err, OptimErr::SizeMismatch { got: 5, expected: 6, .. }));
    }

    #[test]
    fn test_cast_round_trip_f16() {
        let backend = cpu();
        let src = Tensor::from_f32(vec![1.0, -0.5, 3.25], backend.clone());
        let mut half = Tensor::zeros(&[1, 3], DType::Float16, backend.clone());
        half.copy_cast_from(&src).unwrap();

        let mut back = Tensor::zeros(&[1, 3], DType::Float32, backend);
        back.copy_cast_from(&half).unwrap();
        assert_eq!(back.as_f32().unwrap(), [1.0, -0.5, 3.25]);
    }

    #[test]
    fn test_cast_rounds_to_target_precision() {
        let backend = cpu();
        let src = Tensor::from_f32(vec![1.0 + 1e-4], backend.clone());
        let mut bf = Tensor::zeros(&[1, 1], DType::BFloat16, backend);
        bf.copy_cast_from(&src).unwrap();
        assert_eq!(bf.to_f32_vec(), [1.0]);
    }

    #[test]
    fn test_cast_size_mismatch() {
        let backend = cpu();
        let src = Tensor::from_f32(vec![1.0; 4], backend.clone());
        let mut dst = Tensor::zeros(&[1, 3], DType::Float32, backend);
        assert!(dst.copy_cast_from(&src).is_err());
    }

    #[test]
    fn test_fill_map_and_norm() {
        let mut t = Tensor::zeros(&[2, 2], DType::Float64, cpu());
        t.fill(3.);
        t.map_inplace(|x| x / 3. * 2.);
        assert_eq!(t.to_f32_vec(), [2.; 4]);
        assert_eq!(t.l2_norm(), 4.);
    }

    #[test]
    fn test_as_f32_rejects_other_types() {
        let mut t = Tensor::zeros(&[1, 2], DType::Float16, cpu());
        assert!(matches!(
            t.as_f32_mut(),
            Err(OptimErr::TypeMismatch {
                got: DType::Float16,
                ..
            })
        ));
        t.set_f32(&[0.5, 0.25]).unwrap();
        assert_eq!(t.to_f32_vec(), [0.5, 0.25]);
    }
}
