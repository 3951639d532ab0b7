use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{Backend, DeviceId, DeviceKind, Reservation};

/// Host backend, every operation completes eagerly.
///
/// It keeps a ledger of the reservations and synchronizations it served, which is what
/// callers use to inspect the memory footprint of an optimizer.
#[derive(Debug)]
pub struct CpuBackend {
    index: usize,
    syncs: AtomicUsize,
    reservations: Mutex<Vec<usize>>,
}

impl CpuBackend {
    /// Creates a new `CpuBackend`.
    ///
    /// # Arguments
    /// * `index` - The index of the device inside its process.
    ///
    /// # Returns
    /// A new `CpuBackend` instance.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            syncs: AtomicUsize::new(0),
            reservations: Mutex::new(Vec::new()),
        }
    }

    /// Returns the amount of times `synchronize` was called.
    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::Acquire)
    }

    /// Returns the size in bytes of every reservation served so far, in order.
    pub fn reservations(&self) -> Vec<usize> {
        self.reservations.lock().clone()
    }

    /// Returns the total amount of reserved bytes.
    pub fn reserved_bytes(&self) -> usize {
        self.reservations.lock().iter().sum()
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Backend for CpuBackend {
    fn device_id(&self) -> DeviceId {
        DeviceId {
            kind: DeviceKind::Cpu,
            index: self.index,
        }
    }

    fn synchronize(&self) {
        self.syncs.fetch_add(1, Ordering::AcqRel);
    }

    fn reserve_exact(&self, bytes: usize) -> Reservation {
        self.reservations.lock().push(bytes);

        Reservation {
            device: self.device_id(),
            bytes,
        }
    }
}
