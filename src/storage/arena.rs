use std::sync::Arc;

use log::debug;

use crate::{
    backend::{Backend, Reservation},
    error::{OptimErr, Result},
    tensor::{DType, Tensor},
};

/// An exact-size memory reservation that typed sub-buffers are carved from.
///
/// The reservation is made once on creation and never grows, allocating past its
/// capacity is an error.
#[derive(Debug)]
pub struct Arena {
    backend: Arc<dyn Backend>,
    reservation: Reservation,
    used: usize,
}

impl Arena {
    /// Creates a new `Arena` reserving exactly `bytes` bytes on `backend`.
    ///
    /// # Arguments
    /// * `backend` - The device to reserve memory on.
    /// * `bytes` - The size of the reservation.
    ///
    /// # Returns
    /// A new `Arena` instance.
    pub fn reserve_exact(backend: Arc<dyn Backend>, bytes: usize) -> Self {
        let reservation = backend.reserve_exact(bytes);
        debug!(bytes = bytes; "reserved arena on {}", reservation.device);

        Self {
            backend,
            reservation,
            used: 0,
        }
    }

    /// Carves a zeroed `[1, elements]` tensor of type `dtype` out of the reservation.
    ///
    /// # Arguments
    /// * `elements` - The amount of elements of the tensor.
    /// * `dtype` - The element type.
    ///
    /// # Returns
    /// The new tensor or an `ArenaExhausted` error if it doesn't fit.
    pub fn allocate(&mut self, elements: usize, dtype: DType) -> Result<Tensor> {
        let requested = elements * dtype.size();
        let available = self.available();

        if requested > available {
            return Err(OptimErr::ArenaExhausted {
                requested,
                available,
            });
        }

        self.used += requested;
        Ok(Tensor::zeros(&[1, elements], dtype, self.backend.clone()))
    }

    /// Returns the size of the reservation in bytes.
    pub fn capacity(&self) -> usize {
        self.reservation.bytes
    }

    /// Returns the amount of bytes still available for allocation.
    pub fn available(&self) -> usize {
        self.reservation.bytes - self.used
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}
