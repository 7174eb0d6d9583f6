//! Heterogeneous execution engine.
//!
//! Applications describe work as [`Task`]s: a compiled [`Program`] plus its
//! arguments, each tagged with an [`Access`] mode. Tasks are appended to an
//! [`ExecutionContext`] in program order. On [`ExecutionContext::execute`] every
//! task is bound to a device, the object copies it needs are transferred in, and
//! its kernel is enqueued behind the events it depends on. Results stay on the
//! devices until [`ExecutionContext::sync`] copies them back.
//!
//! Per-object residency is tracked by [`ObjectState`]; see the [`object`] module
//! for the state machine.
//!
//! [`Program`]: conduit_device::Program

pub mod config;
pub mod context;
pub mod error;
pub mod object;
pub mod profile;
pub mod task;


pub use config::{DefaultDevice, EngineConfig};
pub use context::{ExecutionContext, Frame, Slot};
pub use error::{Error, Result};
pub use object::{DeviceCopy, ObjectState, Residency};
pub use profile::TaskProfile;
pub use task::{Access, Argument, DeviceRequest, Task, TaskBuilder};
