use std::{collections::HashMap, fs, path::Path};

use safetensors::{Dtype, SafeTensors, serialize_to_file, tensor::TensorView};

use crate::error::{OptimErr, Result};

/// A named flat array stored in a checkpoint file.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: Dtype,
    pub bytes: Vec<u8>,
}

impl Item {
    /// Creates a `[1, N]` float32 item.
    pub fn from_f32(name: &str, values: &[f32]) -> Self {
        Self {
            name: name.to_string(),
            shape: vec![1, values.len()],
            dtype: Dtype::F32,
            bytes: bytemuck::cast_slice(values).to_vec(),
        }
    }

    /// Creates a `[1, N]` float64 item.
    pub fn from_f64(name: &str, values: &[f64]) -> Self {
        Self {
            name: name.to_string(),
            shape: vec![1, values.len()],
            dtype: Dtype::F64,
            bytes: bytemuck::cast_slice(values).to_vec(),
        }
    }

    /// Returns the amount of elements in the item.
    pub fn elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Reads the item as float32 values.
    ///
    /// # Returns
    /// The values or an `InvalidItem` error if the item has another type.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        self.expect_dtype(Dtype::F32, size_of::<f32>())?;
        Ok(bytemuck::pod_collect_to_vec(&self.bytes))
    }

    /// Reads the item as float64 values.
    ///
    /// # Returns
    /// The values or an `InvalidItem` error if the item has another type.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        self.expect_dtype(Dtype::F64, size_of::<f64>())?;
        Ok(bytemuck::pod_collect_to_vec(&self.bytes))
    }

    fn expect_dtype(&self, dtype: Dtype, size: usize) -> Result<()> {
        if self.dtype != dtype {
            return Err(OptimErr::InvalidItem {
                name: self.name.clone(),
                reason: format!("expected {dtype:?} elements, got {:?}", self.dtype),
            });
        }

        if self.bytes.len() != self.elements() * size {
            return Err(OptimErr::InvalidItem {
                name: self.name.clone(),
                reason: format!(
                    "{} bytes don't hold {} elements",
                    self.bytes.len(),
                    self.elements()
                ),
            });
        }

        Ok(())
    }
}

/// Writes `items` into a single file at `path`.
///
/// The file is first written next to `path` and then renamed over it, an interrupted
/// save leaves the previous checkpoint in place.
pub fn save_items(path: &Path, items: &[Item]) -> Result<()> {
    let mut views = Vec::with_capacity(items.len());
    for item in items {
        let view = TensorView::new(item.dtype, item.shape.clone(), &item.bytes)?;
        views.push((item.name.as_str(), view));
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);

    serialize_to_file(views, &None, tmp)?;
    fs::rename(tmp, path)?;
    Ok(())
}

/// Reads every item of the file at `path`, keyed by name.
pub fn load_items(path: &Path) -> Result<HashMap<String, Item>> {
    let buf = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buf)?;

    let items = tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| {
            let item = Item {
                name: name.clone(),
                shape: view.shape().to_vec(),
                dtype: view.dtype(),
                bytes: view.data().to_vec(),
            };

            (name, item)
        })
        .collect();

    Ok(items)
}
