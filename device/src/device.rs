//! Device handles.
//!
//! A [`Device`] bundles what the engine needs from one accelerator: an allocator,
//! a compute queue, an optional transfer queue and the table of buffers it holds
//! for host objects. The buffer table and the generation counter change together
//! under one per-device lock.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use conduit_dtype::ElementKind;
use enumset::{EnumSet, EnumSetType};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::allocator::Allocator;
use crate::buffer::DeviceBuffer;
use crate::error::Result;
use crate::host::ObjectId;
use crate::queue::{CommandQueue, QueueFactory, QueueKind, QueueSettings};
use crate::sync::{Generation, GenerationCounter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumString, strum::EnumIter)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceKind {
    Gpu,
    Cpu,
    Fpga,
    /// The host itself; never a kernel target.
    Host,
}

#[derive(Debug, Hash, PartialOrd, Ord, EnumSetType, strum::Display)]
pub enum Capability {
    /// Can run kernels.
    Accelerator,
    /// Records event timestamps.
    Profiling,
    /// Has a dedicated transfer queue next to the compute queue.
    TransferQueue,
}

/// Static description of a device, supplied by its driver.
#[derive(Debug, Clone, bon::Builder)]
pub struct DeviceDescriptor {
    #[builder(into)]
    pub name: String,
    pub kind: DeviceKind,
    #[builder(default)]
    pub capabilities: EnumSet<Capability>,
    /// Pending commands per queue before an automatic flush.
    #[builder(default = 64)]
    pub queue_capacity: usize,
}

/// Process-unique identity of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl DeviceId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    buffers: HashMap<ObjectId, DeviceBuffer>,
}

#[derive(Debug)]
struct DeviceData {
    id: DeviceId,
    descriptor: DeviceDescriptor,
    allocator: Arc<dyn Allocator>,
    compute: CommandQueue,
    transfer: Option<CommandQueue>,
    generation: Arc<GenerationCounter>,
    state: Mutex<DeviceState>,
}

/// Shared handle to one device.
#[derive(Debug, Clone)]
pub struct Device {
    inner: Arc<DeviceData>,
}

impl Device {
    pub fn new(descriptor: DeviceDescriptor, allocator: Arc<dyn Allocator>, factory: &dyn QueueFactory) -> Result<Self> {
        let generation = Arc::new(GenerationCounter::new());
        let clock = Instant::now();
        let settings = QueueSettings {
            capacity: descriptor.queue_capacity.max(1),
            profiling: descriptor.capabilities.contains(Capability::Profiling),
        };
        let make_queue = |kind: QueueKind| -> Result<CommandQueue> {
            let backend = factory.create_queue(&descriptor.name, kind)?;
            Ok(CommandQueue::new(
                format!("{}/{kind}", descriptor.name),
                kind,
                backend,
                Arc::clone(&generation),
                clock,
                settings,
            ))
        };

        let compute = make_queue(QueueKind::Compute)?;
        let transfer = match descriptor.capabilities.contains(Capability::TransferQueue) {
            true => Some(make_queue(QueueKind::Transfer)?),
            false => None,
        };

        debug!(device = %descriptor.name, kind = %descriptor.kind, capacity = allocator.capacity(), "device created");
        Ok(Self {
            inner: Arc::new(DeviceData {
                id: DeviceId::next(),
                descriptor,
                allocator,
                compute,
                transfer,
                generation,
                state: Mutex::new(DeviceState::default()),
            }),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.descriptor.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.inner.descriptor.kind
    }

    pub fn capabilities(&self) -> EnumSet<Capability> {
        self.inner.descriptor.capabilities
    }

    pub fn is_accelerator(&self) -> bool {
        self.capabilities().contains(Capability::Accelerator)
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.current()
    }

    /// Queue of the given kind. Devices without a transfer queue serve transfers
    /// from the compute queue.
    pub fn queue(&self, kind: QueueKind) -> &CommandQueue {
        match kind {
            QueueKind::Compute => &self.inner.compute,
            QueueKind::Transfer => self.inner.transfer.as_ref().unwrap_or(&self.inner.compute),
        }
    }

    pub fn compute_queue(&self) -> &CommandQueue {
        &self.inner.compute
    }

    pub fn transfer_queue(&self) -> Option<&CommandQueue> {
        self.inner.transfer.as_ref()
    }

    fn queues(&self) -> impl Iterator<Item = &CommandQueue> {
        std::iter::once(&self.inner.compute).chain(self.inner.transfer.as_ref())
    }

    /// Buffer for `object`, reusing the current one when size and kind match.
    ///
    /// On failure the table is left as it was.
    pub fn allocate(&self, object: ObjectId, size: usize, kind: ElementKind) -> Result<DeviceBuffer> {
        let mut state = self.inner.state.lock();
        if let Some(existing) = state.buffers.get(&object)
            && existing.size() == size
            && existing.kind() == kind
        {
            return Ok(existing.clone());
        }

        let raw = self.inner.allocator.alloc(size)?;
        let buffer = DeviceBuffer::new(object, self.name(), kind, raw, Generation::capture(&self.inner.generation));
        if let Some(previous) = state.buffers.insert(object, buffer.clone()) {
            self.inner.allocator.free(previous.raw());
        }
        debug!(device = %self.name(), %object, size, %kind, generation = buffer.generation(), "allocated buffer");
        Ok(buffer)
    }

    pub fn buffer(&self, object: ObjectId) -> Option<DeviceBuffer> {
        self.inner.state.lock().buffers.get(&object).cloned()
    }

    /// Release the buffer held for `object`, if any.
    pub fn free(&self, object: ObjectId) -> bool {
        let removed = self.inner.state.lock().buffers.remove(&object);
        match removed {
            Some(buffer) => {
                self.inner.allocator.free(buffer.raw());
                true
            }
            None => false,
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.inner.state.lock().buffers.len()
    }

    pub fn memory_capacity(&self) -> usize {
        self.inner.allocator.capacity()
    }

    pub fn memory_in_use(&self) -> usize {
        self.inner.allocator.in_use()
    }

    /// Flush every queue of this device.
    pub fn flush(&self) -> Result<()> {
        self.queues().try_for_each(CommandQueue::flush)
    }

    /// Flush and wait for every queue of this device.
    pub fn finish(&self) -> Result<()> {
        let mut first_error = None;
        for queue in self.queues() {
            if let Err(err) = queue.finish() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drop all device state.
    ///
    /// Frees every buffer, abandons unfinished commands and advances the generation,
    /// which turns every outstanding buffer and event handle stale.
    pub fn reset(&self) -> u64 {
        let (generation, released) = {
            let mut state = self.inner.state.lock();
            let generation = self.inner.generation.advance();
            let released = state.buffers.len();
            for (_, buffer) in state.buffers.drain() {
                self.inner.allocator.free(buffer.raw());
            }
            (generation, released)
        };
        for queue in self.queues() {
            queue.abandon();
        }
        info!(device = %self.name(), generation, released, "device reset");
        generation
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.kind())
    }
}
