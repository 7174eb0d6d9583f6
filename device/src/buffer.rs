use std::fmt;
use std::sync::Arc;

use conduit_dtype::{Element, ElementKind};
use snafu::ensure;

use crate::allocator::RawBuffer;
use crate::error::{KindMismatchSnafu, Result, SizeMismatchSnafu};
use crate::event::Event;
use crate::host::{HostArray, ObjectId, check_range};
use crate::queue::CommandQueue;
use crate::sync::Generation;

struct BufferData {
    object: ObjectId,
    device: String,
    kind: ElementKind,
    raw: RawBuffer,
    generation: Generation,
}

/// Device-side copy of one host object.
///
/// Handles are cheap to clone. A handle outlives a device reset only as a stale
/// handle: every enqueue on it fails with `StaleHandle`.
#[derive(Clone)]
pub struct DeviceBuffer {
    inner: Arc<BufferData>,
}

impl DeviceBuffer {
    pub(crate) fn new(object: ObjectId, device: &str, kind: ElementKind, raw: RawBuffer, generation: Generation) -> Self {
        Self { inner: Arc::new(BufferData { object, device: device.to_string(), kind, raw, generation }) }
    }

    pub fn object(&self) -> ObjectId {
        self.inner.object
    }

    pub fn device_name(&self) -> &str {
        &self.inner.device
    }

    pub fn kind(&self) -> ElementKind {
        self.inner.kind
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.inner.raw.size()
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.value()
    }

    pub fn is_stale(&self) -> bool {
        self.inner.generation.is_stale()
    }

    pub fn ensure_current(&self) -> Result<()> {
        self.inner.generation.ensure_current(format!("buffer for {} on {}", self.inner.object, self.inner.device))
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn raw(&self) -> &RawBuffer {
        &self.inner.raw
    }

    pub fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        check_range(offset, len, self.size())
    }

    pub(crate) fn check_element<T: Element>(&self) -> Result<()> {
        ensure!(T::KIND == self.inner.kind, KindMismatchSnafu { expected: self.inner.kind, actual: T::KIND });
        let size = self.size();
        ensure!(
            size % size_of::<T>() == 0,
            SizeMismatchSnafu { expected: size.next_multiple_of(size_of::<T>()), actual: size }
        );
        Ok(())
    }

    /// Asynchronously copy `len` bytes at `offset` from `host` into this buffer.
    pub fn enqueue_write(
        &self,
        queue: &CommandQueue,
        host: &HostArray,
        offset: usize,
        len: usize,
        wait_list: &[Event],
    ) -> Result<Event> {
        queue.enqueue_write(self, host, offset, len, wait_list)
    }

    /// Asynchronously copy `len` bytes at `offset` from this buffer into `host`.
    pub fn enqueue_read(
        &self,
        queue: &CommandQueue,
        host: &HostArray,
        offset: usize,
        len: usize,
        wait_list: &[Event],
    ) -> Result<Event> {
        queue.enqueue_read(self, host, offset, len, wait_list)
    }

    /// Blocking write of the whole host array.
    pub fn write(&self, queue: &CommandQueue, host: &HostArray) -> Result<()> {
        self.enqueue_write(queue, host, 0, host.byte_len(), &[])?.wait_on()
    }

    /// Blocking read into the whole host array.
    pub fn read(&self, queue: &CommandQueue, host: &HostArray) -> Result<()> {
        self.enqueue_read(queue, host, 0, host.byte_len(), &[])?.wait_on()
    }

    /// Snapshot of the device bytes, bypassing the queues.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.raw.data().read().as_bytes().to_vec()
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("object", &self.inner.object)
            .field("device", &self.inner.device)
            .field("kind", &self.inner.kind)
            .field("size", &self.size())
            .field("generation", &self.inner.generation.value())
            .finish()
    }
}
