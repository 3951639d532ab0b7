mod cpu;

use std::fmt::{self, Debug, Display};

pub use cpu::CpuBackend;

/// The kind of device a backend executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

/// Identifies the device owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub kind: DeviceKind,
    pub index: usize,
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Cpu => write!(f, "cpu:{}", self.index),
            DeviceKind::Gpu => write!(f, "gpu:{}", self.index),
        }
    }
}

/// An exact-size memory reservation handed out by a `Backend`.
///
/// The reservation is the budget an arena carves its typed sub-buffers from, it never grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub device: DeviceId,
    pub bytes: usize,
}

/// The device a tensor lives on.
///
/// Elementwise work is issued in order on the device stream, `synchronize` is the
/// completion barrier after which the host may read the results.
pub trait Backend: Debug + Send + Sync {
    /// Returns the identity of the underlying device.
    fn device_id(&self) -> DeviceId;

    /// Blocks until every operation issued on this backend has completed.
    fn synchronize(&self);

    /// Reserves exactly `bytes` bytes of device memory.
    ///
    /// # Arguments
    /// * `bytes` - The size of the reservation.
    ///
    /// # Returns
    /// The reservation handle.
    fn reserve_exact(&self, bytes: usize) -> Reservation;
}
