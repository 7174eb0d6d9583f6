use conduit_dtype::ElementKind;
use snafu::Snafu;

use crate::event::EventStatus;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The device cannot satisfy an allocation request.
    #[snafu(display("out of device memory on {device}: requested {requested} bytes, {available} available"))]
    OutOfDeviceMemory { device: String, requested: usize, available: usize },

    /// A buffer or event was used after its device was reset.
    #[snafu(display("stale {what}: created at generation {generation}, device is at generation {current}"))]
    StaleHandle { what: String, generation: u64, current: u64 },

    /// An asynchronous operation finished in `ERROR` or `UNKNOWN`.
    #[snafu(display("device operation '{operation}' failed with status {status}: {reason}"))]
    DeviceExecution { operation: String, status: EventStatus, reason: String },

    /// Byte range outside of a buffer or host array.
    #[snafu(display("invalid range: offset {offset} + length {len} exceeds size {size}"))]
    InvalidRange { offset: usize, len: usize, size: usize },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    #[snafu(display("element kind mismatch: expected {expected}, got {actual}"))]
    KindMismatch { expected: ElementKind, actual: ElementKind },

    /// A kernel asked for an argument slot that does not exist.
    #[snafu(display("kernel argument {index} out of range ({count} arguments)"))]
    ArgumentIndex { index: usize, count: usize },

    #[snafu(display("kernel argument {index} is not a {expected}"))]
    ArgumentType { index: usize, expected: &'static str },

    /// A kernel tried to borrow the same argument buffer twice.
    #[snafu(display("kernel argument {index} is already borrowed"))]
    ArgumentBusy { index: usize },

    /// A compiled kernel reported a failure.
    #[snafu(display("kernel '{kernel}' failed: {reason}"))]
    Kernel { kernel: String, reason: String },

    #[snafu(display("command queue '{queue}' is closed"))]
    QueueClosed { queue: String },

    #[snafu(display("timed out after {timeout_ms}ms waiting for '{operation}'"))]
    Timeout { operation: String, timeout_ms: u64 },

    /// Unknown device name or malformed selector.
    #[snafu(display("invalid device: {device}"))]
    InvalidDevice { device: String },

    #[snafu(display("failed to initialise device {device}: {reason}"))]
    DriverInit { device: String, reason: String },
}
