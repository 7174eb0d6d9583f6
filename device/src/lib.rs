//! Devices, command queues, events and device memory.
//!
//! This crate is the driver-binding layer of the engine. A [`Device`] owns an
//! [`Allocator`], a compute [`CommandQueue`] and optionally a transfer queue, plus a
//! table of [`DeviceBuffer`]s keyed by host object identity. Every asynchronous
//! operation returns an [`Event`]; operations on the same queue run in FIFO order,
//! and cross-queue ordering is expressed only through wait-lists.
//!
//! Drivers plug in through [`QueueFactory`] and [`QueueBackend`]. The bundled
//! [`cpu`] driver runs commands on a worker thread per queue and kernels on a rayon
//! pool sized to the device's compute units.

pub mod allocator;
pub mod buffer;
pub mod cpu;
pub mod device;
pub mod error;
pub mod event;
pub mod host;
pub mod queue;
pub mod registry;
pub mod sync;


pub use allocator::{Allocator, CpuAllocator, RawBuffer};
pub use buffer::DeviceBuffer;
pub use cpu::{CpuDeviceConfig, create_cpu_device};
pub use device::{Capability, Device, DeviceDescriptor, DeviceId, DeviceKind};
pub use error::{Error, Result};
pub use event::{Event, EventStatus, Timestamps, WaitList};
pub use host::{AlignedBytes, HostArray, ObjectId};
pub use queue::{
    Command, CommandQueue, ExecParams, KernelArg, KernelArgs, Operation, Program, QueueBackend, QueueFactory,
    QueueKind,
};
pub use registry::{DeviceFactory, DeviceRegistry, DeviceSelector};
pub use sync::{Generation, GenerationCounter};
