use std::num::NonZeroUsize;

use crate::error::{OptimErr, Result};

/// Distributes flat state vectors over the shards of a group and collects them back.
///
/// Every participant must call `gather` and `scatter` the same amount of times and in the
/// same order, whether it writes the checkpoint or not.
pub trait Collective {
    /// Splits `data` into one contiguous slice per shard.
    ///
    /// # Arguments
    /// * `data` - The flat vector holding every shard's values.
    /// * `apply` - Called with the index of every shard and its slice.
    fn scatter(
        &self,
        data: &[f32],
        apply: &mut dyn FnMut(usize, &[f32]) -> Result<()>,
    ) -> Result<()>;

    /// Concatenates the values of every shard in shard order.
    ///
    /// # Arguments
    /// * `collect` - Returns the values of the shard with the given index.
    ///
    /// # Returns
    /// A size mismatch if the shards don't hold the partition `scatter` would produce.
    fn gather(&self, collect: &mut dyn FnMut(usize) -> Result<Vec<f32>>) -> Result<Vec<f32>>;
}

/// The collective of a single process owning every shard.
///
/// Shards own chunks of `ceil(N / shards)` elements, the last one may be shorter.
#[derive(Debug, Clone, Copy)]
pub struct LocalCollective {
    shards: NonZeroUsize,
}

impl LocalCollective {
    pub fn new(shards: NonZeroUsize) -> Self {
        Self { shards }
    }

    pub fn shards(&self) -> usize {
        self.shards.get()
    }

    /// Returns the `(begin, end)` range of every shard over a vector of `len` elements.
    pub fn ranges(&self, len: usize) -> Vec<(usize, usize)> {
        let chunk = len.div_ceil(self.shards.get());

        (0..self.shards.get())
            .map(|i| {
                let begin = (chunk * i).min(len);
                let end = (begin + chunk).min(len);
                (begin, end)
            })
            .collect()
    }
}

impl Collective for LocalCollective {
    fn scatter(
        &self,
        data: &[f32],
        apply: &mut dyn FnMut(usize, &[f32]) -> Result<()>,
    ) -> Result<()> {
        for (i, (begin, end)) in self.ranges(data.len()).into_iter().enumerate() {
            apply(i, &data[begin..end])?;
        }

        Ok(())
    }

    fn gather(&self, collect: &mut dyn FnMut(usize) -> Result<Vec<f32>>) -> Result<Vec<f32>> {
        let parts = (0..self.shards.get())
            .map(|i| collect(i))
            .collect::<Result<Vec<_>>>()?;

        let total = parts.iter().map(Vec::len).sum();
        for (part, (begin, end)) in parts.iter().zip(self.ranges(total)) {
            if part.len() != end - begin {
                return Err(OptimErr::SizeMismatch {
                    a: "shard state",
                    b: "shard partition",
                    got: part.len(),
                    expected: end - begin,
                });
            }
        }

        Ok(parts.concat())
    }
}
