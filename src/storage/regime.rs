use std::{
    fmt::{self, Display},
    sync::Arc,
};

use log::debug;

use super::Arena;
use crate::{
    backend::Backend,
    error::{OptimErr, Result},
    tensor::{DType, Tensor},
};

/// The combination of shadow buffers an optimizer needs next to the caller's tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocRegime {
    /// Parameters already use the optimizer precision and no average is tracked.
    None,
    /// Master parameter copy and cast gradient buffer.
    CastOnly,
    /// Moving average accumulator.
    AverageOnly,
    /// Moving average accumulator, master parameter copy and cast gradient buffer.
    CastAndAverage,
}

impl AllocRegime {
    /// Resolves the regime for an update.
    ///
    /// # Arguments
    /// * `cast` - Whether the parameters must be cast into the optimizer precision.
    /// * `average` - Whether a moving average is tracked.
    pub fn new(cast: bool, average: bool) -> Self {
        match (cast, average) {
            (false, false) => AllocRegime::None,
            (true, false) => AllocRegime::CastOnly,
            (false, true) => AllocRegime::AverageOnly,
            (true, true) => AllocRegime::CastAndAverage,
        }
    }

    /// Returns the amount of parameter sized buffers this regime reserves.
    pub fn shards(self) -> usize {
        match self {
            AllocRegime::None => 0,
            AllocRegime::CastOnly => 2,
            AllocRegime::AverageOnly => 1,
            AllocRegime::CastAndAverage => 3,
        }
    }

    pub fn casts(self) -> bool {
        matches!(self, AllocRegime::CastOnly | AllocRegime::CastAndAverage)
    }

    pub fn averages(self) -> bool {
        matches!(self, AllocRegime::AverageOnly | AllocRegime::CastAndAverage)
    }
}

impl Display for AllocRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AllocRegime::None => "none",
            AllocRegime::CastOnly => "cast-only",
            AllocRegime::AverageOnly => "average-only",
            AllocRegime::CastAndAverage => "cast-and-average",
        };

        f.write_str(s)
    }
}

/// Lazily reserves the arena holding the optimizer's shadow buffers.
///
/// It transitions exactly once from unreserved to a regime, any later request for a
/// different regime is reported instead of reallocating.
#[derive(Debug, Default)]
pub struct ShadowAllocator {
    regime: Option<AllocRegime>,
    dtype: Option<DType>,
    arena: Option<Arena>,
}

impl ShadowAllocator {
    /// Creates a new unreserved `ShadowAllocator`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes sure the arena is reserved for `regime`.
    ///
    /// # Arguments
    /// * `regime` - The regime the current update runs in.
    /// * `elements` - The amount of parameters.
    /// * `dtype` - The optimizer precision.
    /// * `backend` - The device holding the parameters.
    ///
    /// # Returns
    /// Whether this call made the reservation, or a `RegimeChanged` error if a different
    /// regime was reserved before.
    pub fn ensure(
        &mut self,
        regime: AllocRegime,
        elements: usize,
        dtype: DType,
        backend: &Arc<dyn Backend>,
    ) -> Result<bool> {
        if let Some(reserved) = self.regime {
            if reserved != regime {
                return Err(OptimErr::RegimeChanged {
                    reserved,
                    requested: regime,
                });
            }

            return Ok(false);
        }

        if regime.shards() > 0 {
            let bytes = regime.shards() * elements * dtype.size();
            self.arena = Some(Arena::reserve_exact(backend.clone(), bytes));
        }

        debug!(elements = elements; "shadow buffers use the {regime} regime");
        self.regime = Some(regime);
        self.dtype = Some(dtype);
        Ok(true)
    }

    /// Carves a parameter sized buffer out of the arena.
    ///
    /// # Arguments
    /// * `elements` - The amount of parameters.
    ///
    /// # Returns
    /// A zeroed tensor in the optimizer precision, or `ArenaExhausted` if the regime
    /// didn't account for it.
    pub fn allocate(&mut self, elements: usize) -> Result<Tensor> {
        let requested = elements * self.dtype.map_or(0, DType::size);

        match (self.arena.as_mut(), self.dtype) {
            (Some(arena), Some(dtype)) => arena.allocate(elements, dtype),
            _ => Err(OptimErr::ArenaExhausted {
                requested,
                available: 0,
            }),
        }
    }

    /// Returns the regime the arena was reserved for, if any.
    pub fn regime(&self) -> Option<AllocRegime> {
        self.regime
    }

    /// Returns the reservation size in bytes.
    pub fn capacity(&self) -> usize {
        self.arena.as_ref().map_or(0, Arena::capacity)
    }
}
