//! Command queues.
//!
//! A [`CommandQueue`] is the device-agnostic front half of a queue: it validates
//! enqueues, creates events, batches pending commands and hands each batch to the
//! driver's [`QueueBackend`] on flush. Commands on one queue start in enqueue order;
//! a command additionally waits for every event in its wait-list.
//!
//! ```ignore
//! let write = queue.enqueue_write(&buffer, &host, 0, host.byte_len(), &[])?;
//! let kernel = queue.enqueue_kernel(program, args, ExecParams::new_1d(n, 1), &[write])?;
//! queue.enqueue_read(&buffer, &host, 0, host.byte_len(), &[kernel])?.wait_on()?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use conduit_dtype::{Element, ScalarValue};
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLockReadGuard, RwLockWriteGuard};
use snafu::OptionExt;
use tracing::{debug, trace};

use crate::buffer::DeviceBuffer;
use crate::error::{ArgumentBusySnafu, ArgumentIndexSnafu, ArgumentTypeSnafu, Result};
use crate::event::{Event, Flush, WaitList};
use crate::host::HostArray;
use crate::sync::{Generation, GenerationCounter};

/// Kernel execution parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExecParams {
    /// Global work size (total number of work items per dimension).
    pub global_size: [usize; 3],
    /// Local work size (work group size per dimension).
    pub local_size: [usize; 3],
}

impl ExecParams {
    pub fn new_1d(global: usize, local: usize) -> Self {
        Self { global_size: [global, 1, 1], local_size: [local, 1, 1] }
    }

    pub fn new_2d(global: [usize; 2], local: [usize; 2]) -> Self {
        Self { global_size: [global[0], global[1], 1], local_size: [local[0], local[1], 1] }
    }

    pub fn new_3d(global: [usize; 3], local: [usize; 3]) -> Self {
        Self { global_size: global, local_size: local }
    }

    /// Total number of work items.
    pub fn work_items(&self) -> usize {
        self.global_size.iter().product()
    }
}

impl Default for ExecParams {
    fn default() -> Self {
        Self { global_size: [1, 1, 1], local_size: [1, 1, 1] }
    }
}

/// Compiled kernel. Produced outside the engine and treated as opaque.
pub trait Program: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Run the kernel over its bound arguments.
    fn execute(&self, args: &KernelArgs<'_>, params: &ExecParams) -> Result<()>;
}

/// One bound kernel argument.
#[derive(Debug, Clone)]
pub enum KernelArg {
    Buffer(DeviceBuffer),
    Scalar(ScalarValue),
}

/// Argument view handed to [`Program::execute`].
///
/// Buffer arguments are borrowed per call. Borrowing the same buffer mutably twice,
/// or mutably while it is read, fails with `ArgumentBusy` instead of blocking.
#[derive(Debug, Clone, Copy)]
pub struct KernelArgs<'a> {
    args: &'a [KernelArg],
}

impl<'a> KernelArgs<'a> {
    pub fn new(args: &'a [KernelArg]) -> Self {
        Self { args }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&'a KernelArg> {
        self.args.get(index).context(ArgumentIndexSnafu { index, count: self.args.len() })
    }

    pub fn scalar(&self, index: usize) -> Result<ScalarValue> {
        match self.get(index)? {
            KernelArg::Scalar(value) => Ok(*value),
            KernelArg::Buffer(_) => ArgumentTypeSnafu { index, expected: "scalar" }.fail(),
        }
    }

    pub fn buffer(&self, index: usize) -> Result<&'a DeviceBuffer> {
        match self.get(index)? {
            KernelArg::Buffer(buffer) => Ok(buffer),
            KernelArg::Scalar(_) => ArgumentTypeSnafu { index, expected: "buffer" }.fail(),
        }
    }

    pub fn read<T: Element>(&self, index: usize) -> Result<MappedRwLockReadGuard<'a, [T]>> {
        let buffer = self.buffer(index)?;
        buffer.check_element::<T>()?;
        let guard = buffer.raw().data().try_read().context(ArgumentBusySnafu { index })?;
        Ok(RwLockReadGuard::map(guard, |bytes| bytes.as_slice::<T>()))
    }

    pub fn write<T: Element>(&self, index: usize) -> Result<MappedRwLockWriteGuard<'a, [T]>> {
        let buffer = self.buffer(index)?;
        buffer.check_element::<T>()?;
        let guard = buffer.raw().data().try_write().context(ArgumentBusySnafu { index })?;
        Ok(RwLockWriteGuard::map(guard, |bytes| bytes.as_mut_slice::<T>()))
    }

    pub fn read_bytes(&self, index: usize) -> Result<MappedRwLockReadGuard<'a, [u8]>> {
        let guard = self.buffer(index)?.raw().data().try_read().context(ArgumentBusySnafu { index })?;
        Ok(RwLockReadGuard::map(guard, |bytes| bytes.as_bytes()))
    }

    pub fn write_bytes(&self, index: usize) -> Result<MappedRwLockWriteGuard<'a, [u8]>> {
        let guard = self.buffer(index)?.raw().data().try_write().context(ArgumentBusySnafu { index })?;
        Ok(RwLockWriteGuard::map(guard, |bytes| bytes.as_bytes_mut()))
    }
}

/// Work carried by a command.
#[derive(Debug)]
pub enum Operation {
    /// Host to device copy of `len` bytes at `offset` in both the host array and the buffer.
    Write { buffer: DeviceBuffer, host: HostArray, offset: usize, len: usize },
    /// Device to host copy of `len` bytes at `offset`.
    Read { buffer: DeviceBuffer, host: HostArray, offset: usize, len: usize },
    Kernel { program: Arc<dyn Program>, args: Vec<KernelArg>, params: ExecParams },
    /// Completes once its wait-list has completed.
    Marker,
}

impl Operation {
    pub fn describe(&self) -> String {
        match self {
            Self::Write { buffer, .. } => format!("write {}", buffer.object()),
            Self::Read { buffer, .. } => format!("read {}", buffer.object()),
            Self::Kernel { program, .. } => format!("kernel {}", program.name()),
            Self::Marker => "marker".to_string(),
        }
    }

    fn buffers(&self) -> impl Iterator<Item = &DeviceBuffer> {
        let (single, args) = match self {
            Self::Write { buffer, .. } | Self::Read { buffer, .. } => (Some(buffer), &[][..]),
            Self::Kernel { args, .. } => (None, args.as_slice()),
            Self::Marker => (None, &[][..]),
        };
        single.into_iter().chain(args.iter().filter_map(|arg| match arg {
            KernelArg::Buffer(buffer) => Some(buffer),
            KernelArg::Scalar(_) => None,
        }))
    }
}

/// A flushed unit of work as seen by a driver.
#[derive(Debug)]
pub struct Command {
    pub operation: Operation,
    pub wait_list: WaitList,
    pub event: Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumIter)]
#[strum(serialize_all = "lowercase")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QueueKind {
    Compute,
    Transfer,
}

/// Driver half of a command queue.
///
/// `submit` receives batches in flush order and must start the commands of one
/// queue in that order.
pub trait QueueBackend: Send + Sync + fmt::Debug {
    fn submit(&self, batch: Vec<Command>) -> Result<()>;
}

/// Creates the driver half of each queue a device owns.
pub trait QueueFactory: Send + Sync + fmt::Debug {
    fn create_queue(&self, device: &str, kind: QueueKind) -> Result<Box<dyn QueueBackend>>;
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueSettings {
    pub capacity: usize,
    pub profiling: bool,
}

#[derive(Debug)]
struct QueueShared {
    name: String,
    kind: QueueKind,
    backend: Box<dyn QueueBackend>,
    generation: Arc<GenerationCounter>,
    clock: Instant,
    settings: QueueSettings,
    next_tag: AtomicU64,
    pending: Mutex<Vec<Command>>,
    in_flight: Mutex<Vec<Event>>,
}

impl Flush for QueueShared {
    fn flush(&self) -> Result<()> {
        // Held across submit so concurrent flushes cannot reorder batches.
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut *pending);
        let events: Vec<Event> = batch.iter().map(|command| command.event.clone()).collect();
        {
            let mut in_flight = self.in_flight.lock();
            in_flight.retain(|event| !event.status().is_terminal());
            for event in &events {
                event.mark_submitted();
                in_flight.push(event.clone());
            }
        }

        debug!(queue = %self.name, commands = events.len(), "flush");
        if let Err(err) = self.backend.submit(batch) {
            for event in &events {
                event.mark_failed(err.to_string());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        for command in self.pending.get_mut().drain(..) {
            command.event.abandon("queue released before flush");
        }
    }
}

/// Ordered command queue of one device.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    shared: Arc<QueueShared>,
}

impl CommandQueue {
    pub(crate) fn new(
        name: String,
        kind: QueueKind,
        backend: Box<dyn QueueBackend>,
        generation: Arc<GenerationCounter>,
        clock: Instant,
        settings: QueueSettings,
    ) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                name,
                kind,
                backend,
                generation,
                clock,
                settings,
                next_tag: AtomicU64::new(0),
                pending: Mutex::new(Vec::new()),
                in_flight: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn kind(&self) -> QueueKind {
        self.shared.kind
    }

    /// Commands enqueued but not yet flushed.
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Enqueue an operation after every event in `wait_list`.
    ///
    /// The pending batch is flushed automatically once it reaches the queue capacity.
    pub fn enqueue(&self, operation: Operation, wait_list: &[Event]) -> Result<Event> {
        for event in wait_list {
            event.ensure_current()?;
        }
        for buffer in operation.buffers() {
            buffer.ensure_current()?;
        }

        let tag = self.shared.next_tag.fetch_add(1, Ordering::Relaxed);
        let queue: Weak<dyn Flush> = Arc::downgrade(&self.shared) as Weak<dyn Flush>;
        let event = Event::new(
            &operation.describe(),
            tag,
            Generation::capture(&self.shared.generation),
            self.shared.clock,
            self.shared.settings.profiling,
            queue,
        );
        trace!(queue = %self.shared.name, event = %event.name(), waits = wait_list.len(), "enqueue");

        let command = Command { operation, wait_list: wait_list.iter().cloned().collect(), event: event.clone() };
        let full = {
            let mut pending = self.shared.pending.lock();
            pending.push(command);
            pending.len() >= self.shared.settings.capacity
        };
        if full {
            self.flush()?;
        }
        Ok(event)
    }

    pub fn enqueue_write(
        &self,
        buffer: &DeviceBuffer,
        host: &HostArray,
        offset: usize,
        len: usize,
        wait_list: &[Event],
    ) -> Result<Event> {
        buffer.check_range(offset, len)?;
        host.check_range(offset, len)?;
        self.enqueue(Operation::Write { buffer: buffer.clone(), host: host.clone(), offset, len }, wait_list)
    }

    pub fn enqueue_read(
        &self,
        buffer: &DeviceBuffer,
        host: &HostArray,
        offset: usize,
        len: usize,
        wait_list: &[Event],
    ) -> Result<Event> {
        buffer.check_range(offset, len)?;
        host.check_range(offset, len)?;
        self.enqueue(Operation::Read { buffer: buffer.clone(), host: host.clone(), offset, len }, wait_list)
    }

    pub fn enqueue_kernel(
        &self,
        program: Arc<dyn Program>,
        args: Vec<KernelArg>,
        params: ExecParams,
        wait_list: &[Event],
    ) -> Result<Event> {
        self.enqueue(Operation::Kernel { program, args, params }, wait_list)
    }

    pub fn enqueue_marker(&self, wait_list: &[Event]) -> Result<Event> {
        self.enqueue(Operation::Marker, wait_list)
    }

    /// Hand pending commands to the device without waiting for them.
    pub fn flush(&self) -> Result<()> {
        self.shared.flush()
    }

    /// Flush and block until every submitted command has finished.
    ///
    /// Returns the first failure among them, after all of them have finished.
    pub fn finish(&self) -> Result<()> {
        self.flush()?;
        let events: Vec<Event> = self.shared.in_flight.lock().clone();
        let mut first_error = None;
        for event in events.iter().filter(|event| !event.is_stale()) {
            if let Err(err) = event.wait_on() {
                first_error.get_or_insert(err);
            }
        }
        self.shared.in_flight.lock().retain(|event| !event.status().is_terminal());
        first_error.map_or(Ok(()), Err)
    }

    /// Drop every command that has not finished. Used by device reset.
    pub(crate) fn abandon(&self) {
        let pending = std::mem::take(&mut *self.shared.pending.lock());
        for command in pending {
            command.event.abandon("device reset");
        }
        let in_flight = std::mem::take(&mut *self.shared.in_flight.lock());
        for event in in_flight {
            event.abandon("device reset");
        }
    }
}

#[cfg(test)]
impl CommandQueue {
    pub(crate) fn in_flight(&self) -> usize {
        self.shared.in_flight.lock().len()
    }
}
