//! CPU reference driver.
//!
//! Each queue owns a worker thread that receives flushed batches over a channel and
//! runs them in order. Before a command starts, the worker waits for its wait-list.
//! Kernels run inside a rayon pool with one thread per compute unit, so programs
//! can use `rayon` parallel iterators directly.

use std::sync::{Arc, mpsc};
use std::thread;

use enumset::EnumSet;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{error, trace, warn};

use crate::allocator::CpuAllocator;
use crate::device::{Capability, Device, DeviceDescriptor, DeviceKind};
use crate::error::{DriverInitSnafu, QueueClosedSnafu, Result};
use crate::queue::{Command, KernelArgs, Operation, QueueBackend, QueueFactory, QueueKind};

const DEFAULT_MEMORY: usize = 1 << 30;

fn default_compute_units() -> usize {
    thread::available_parallelism().map_or(1, usize::from)
}

/// Configuration of one CPU device.
#[derive(Debug, Clone, bon::Builder)]
pub struct CpuDeviceConfig {
    #[builder(into, default = String::from("cpu"))]
    pub name: String,
    /// Kind reported to the engine. Lets tests model GPUs and FPGAs on the CPU.
    #[builder(default = DeviceKind::Cpu)]
    pub kind: DeviceKind,
    /// Device memory in bytes.
    #[builder(default = DEFAULT_MEMORY)]
    pub memory_capacity: usize,
    #[builder(default = default_compute_units())]
    pub compute_units: usize,
    #[builder(default = 64)]
    pub queue_capacity: usize,
    #[builder(default = true)]
    pub profiling: bool,
    #[builder(default = false)]
    pub transfer_queue: bool,
    /// Whether the device accepts kernels.
    #[builder(default = true)]
    pub accelerator: bool,
}

impl Default for CpuDeviceConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CpuDeviceConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `CONDUIT_CPU_COMPUTE_UNITS` - Worker threads for kernels (default: available parallelism)
    /// * `CONDUIT_CPU_MEMORY` - Device memory in bytes (default: 1 GiB)
    /// * `CONDUIT_QUEUE_CAPACITY` - Pending commands before an automatic flush (default: 64)
    /// * `CONDUIT_PROFILING` - `0` disables event timestamps
    /// * `CONDUIT_TRANSFER_QUEUE` - `1` adds a dedicated transfer queue
    pub fn from_env() -> Self {
        let compute_units =
            std::env::var("CONDUIT_CPU_COMPUTE_UNITS").ok().and_then(|s| s.parse().ok()).unwrap_or_else(default_compute_units);
        let memory_capacity = std::env::var("CONDUIT_CPU_MEMORY").ok().and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_MEMORY);
        let queue_capacity = std::env::var("CONDUIT_QUEUE_CAPACITY").ok().and_then(|s| s.parse().ok()).unwrap_or(64);
        let profiling = std::env::var("CONDUIT_PROFILING").map_or(true, |v| v != "0");
        let transfer_queue = std::env::var("CONDUIT_TRANSFER_QUEUE").is_ok_and(|v| v == "1");

        Self::builder()
            .compute_units(compute_units)
            .memory_capacity(memory_capacity)
            .queue_capacity(queue_capacity)
            .profiling(profiling)
            .transfer_queue(transfer_queue)
            .build()
    }
}

/// Build a CPU device from `config`.
pub fn create_cpu_device(config: &CpuDeviceConfig) -> Result<Device> {
    let name = config.name.clone();
    let pool = ThreadPoolBuilder::new()
        .num_threads(config.compute_units.max(1))
        .thread_name(move |index| format!("{name}-cu{index}"))
        .build()
        .map_err(|err| DriverInitSnafu { device: config.name.clone(), reason: err.to_string() }.build())?;

    let mut capabilities = EnumSet::empty();
    if config.accelerator {
        capabilities |= Capability::Accelerator;
    }
    if config.profiling {
        capabilities |= Capability::Profiling;
    }
    if config.transfer_queue {
        capabilities |= Capability::TransferQueue;
    }

    let descriptor = DeviceDescriptor::builder()
        .name(config.name.clone())
        .kind(config.kind)
        .capabilities(capabilities)
        .queue_capacity(config.queue_capacity)
        .build();
    let allocator = Arc::new(CpuAllocator::new(config.name.clone(), config.memory_capacity));
    Device::new(descriptor, allocator, &CpuQueueFactory { pool: Arc::new(pool) })
}

#[derive(Debug)]
struct CpuQueueFactory {
    pool: Arc<ThreadPool>,
}

impl QueueFactory for CpuQueueFactory {
    fn create_queue(&self, device: &str, kind: QueueKind) -> Result<Box<dyn QueueBackend>> {
        let name = format!("{device}/{kind}");
        let (sender, receiver) = mpsc::channel();
        let pool = Arc::clone(&self.pool);
        let worker_name = name.clone();
        thread::Builder::new()
            .name(format!("conduit-{name}"))
            .spawn(move || run_worker(&worker_name, &pool, receiver))
            .map_err(|err| DriverInitSnafu { device: device.to_string(), reason: err.to_string() }.build())?;
        Ok(Box::new(CpuQueue { name, sender }))
    }
}

/// Worker exits once the queue is dropped and the channel closes.
#[derive(Debug)]
struct CpuQueue {
    name: String,
    sender: mpsc::Sender<Vec<Command>>,
}

impl QueueBackend for CpuQueue {
    fn submit(&self, batch: Vec<Command>) -> Result<()> {
        self.sender.send(batch).map_err(|_| QueueClosedSnafu { queue: self.name.clone() }.build())
    }
}

fn run_worker(queue: &str, pool: &ThreadPool, receiver: mpsc::Receiver<Vec<Command>>) {
    for batch in receiver {
        for command in batch {
            execute(queue, pool, command);
        }
    }
    trace!(queue, "worker stopped");
}

fn execute(queue: &str, pool: &ThreadPool, command: Command) {
    let Command { operation, wait_list, event } = command;
    if event.status().is_terminal() || event.is_stale() {
        trace!(queue, event = %event.name(), "skipping abandoned command");
        return;
    }

    for dependency in &wait_list {
        if let Err(err) = dependency.wait_on() {
            warn!(queue, event = %event.name(), dependency = %dependency.name(), %err, "dependency failed");
            event.mark_failed(format!("dependency '{}' did not complete: {err}", dependency.name()));
            return;
        }
    }

    event.mark_running();
    match run(pool, &operation) {
        Ok(()) => event.mark_complete(),
        Err(err) => {
            error!(queue, event = %event.name(), %err, "command failed");
            event.mark_failed(err.to_string());
        }
    }
}

fn run(pool: &ThreadPool, operation: &Operation) -> Result<()> {
    match operation {
        Operation::Write { buffer, host, offset, len } => {
            let source = host.data().read();
            let mut target = buffer.raw().data().write();
            target.range_mut(*offset, *len)?.copy_from_slice(source.range(*offset, *len)?);
            Ok(())
        }
        Operation::Read { buffer, host, offset, len } => {
            let source = buffer.raw().data().read();
            let mut target = host.data().write();
            target.range_mut(*offset, *len)?.copy_from_slice(source.range(*offset, *len)?);
            Ok(())
        }
        Operation::Kernel { program, args, params } => pool.install(|| program.execute(&KernelArgs::new(args), params)),
        Operation::Marker => Ok(()),
    }
}
