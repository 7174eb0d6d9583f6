//! Error types for the execution engine.

use conduit_device::{DeviceKind, EventStatus};
use snafu::Snafu;

/// Result type for engine operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// No device could be determined for a task. Recoverable by mapping the task.
    #[snafu(display("cannot resolve a device for task '{task}'"))]
    UnresolvedDevice { task: String },

    /// The device cannot run kernels. The context is left unchanged.
    #[snafu(display("device '{device}' of kind {kind} cannot run kernels"))]
    UnsupportedDeviceKind { device: String, kind: DeviceKind },

    #[snafu(display("out of device memory on {device}: requested {requested} bytes, {available} available"))]
    OutOfDeviceMemory { device: String, requested: usize, available: usize },

    /// A transfer or kernel ended in `ERROR` or `UNKNOWN`. Never retried.
    #[snafu(display("'{operation}' failed with status {status}: {reason}"))]
    DeviceExecution { operation: String, status: EventStatus, reason: String },

    /// A buffer or event from before a device reset was used.
    #[snafu(display("stale {what}: created at generation {generation}, device is at generation {current}"))]
    StaleHandle { what: String, generation: u64, current: u64 },

    /// Any other driver failure.
    #[snafu(display("device error: {source}"))]
    Device { source: conduit_device::Error },
}

impl From<conduit_device::Error> for Error {
    fn from(source: conduit_device::Error) -> Self {
        use conduit_device::Error as DeviceError;

        match source {
            DeviceError::OutOfDeviceMemory { device, requested, available } => {
                Self::OutOfDeviceMemory { device, requested, available }
            }
            DeviceError::DeviceExecution { operation, status, reason } => {
                Self::DeviceExecution { operation, status, reason }
            }
            DeviceError::StaleHandle { what, generation, current } => Self::StaleHandle { what, generation, current },
            source => Self::Device { source },
        }
    }
}
