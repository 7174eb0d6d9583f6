use std::fmt;

use parking_lot::{Mutex, RwLock};
use snafu::ensure;

use crate::error::{OutOfDeviceMemorySnafu, Result};
use crate::host::AlignedBytes;

/// Opaque handle to device memory.
///
/// The CPU driver keeps device memory in ordinary host allocations guarded by a
/// lock; drivers with real device memory map transfers onto their own handles.
pub struct RawBuffer {
    size: usize,
    data: RwLock<AlignedBytes>,
}

impl RawBuffer {
    pub fn zeroed(size: usize) -> Self {
        Self { size, data: RwLock::new(AlignedBytes::zeroed(size)) }
    }

    /// Size of the buffer in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn data(&self) -> &RwLock<AlignedBytes> {
        &self.data
    }
}

impl fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBuffer").field("size", &self.size).finish()
    }
}

/// Device memory allocator with capacity accounting.
///
/// An allocation that does not fit must fail with `OutOfDeviceMemory` and leave the
/// accounting untouched.
pub trait Allocator: Send + Sync + fmt::Debug {
    fn alloc(&self, size: usize) -> Result<RawBuffer>;

    /// Return a buffer's bytes to the pool.
    fn free(&self, buffer: &RawBuffer);

    /// Total device memory in bytes.
    fn capacity(&self) -> usize;

    /// Bytes currently handed out.
    fn in_use(&self) -> usize;

    fn available(&self) -> usize {
        self.capacity().saturating_sub(self.in_use())
    }

    fn name(&self) -> &str;
}

/// CPU allocator using system memory, bounded by a configured capacity.
#[derive(Debug)]
pub struct CpuAllocator {
    name: String,
    capacity: usize,
    in_use: Mutex<usize>,
}

impl CpuAllocator {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self { name: name.into(), capacity, in_use: Mutex::new(0) }
    }
}

impl Allocator for CpuAllocator {
    fn alloc(&self, size: usize) -> Result<RawBuffer> {
        let mut in_use = self.in_use.lock();
        let available = self.capacity.saturating_sub(*in_use);
        ensure!(size <= available, OutOfDeviceMemorySnafu { device: self.name.clone(), requested: size, available });
        *in_use += size;
        Ok(RawBuffer::zeroed(size))
    }

    fn free(&self, buffer: &RawBuffer) {
        let mut in_use = self.in_use.lock();
        *in_use = in_use.saturating_sub(buffer.size());
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn in_use(&self) -> usize {
        *self.in_use.lock()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
