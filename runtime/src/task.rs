//! Tasks: one compiled kernel plus the arguments it is launched with.

use std::fmt;
use std::sync::Arc;

use conduit_device::{Device, ExecParams, HostArray, Program};
use conduit_dtype::ScalarValue;
use parking_lot::RwLock;

/// How a task uses one of its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub const fn reads(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub const fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// A task argument: a tracked host object or a constant passed by value.
#[derive(Debug, Clone)]
pub enum Argument {
    Object(HostArray),
    Scalar(ScalarValue),
}

impl From<HostArray> for Argument {
    fn from(object: HostArray) -> Self {
        Self::Object(object)
    }
}

impl From<&HostArray> for Argument {
    fn from(object: &HostArray) -> Self {
        Self::Object(object.clone())
    }
}

impl From<ScalarValue> for Argument {
    fn from(value: ScalarValue) -> Self {
        Self::Scalar(value)
    }
}

/// Where a task wants to run.
#[derive(Debug, Clone)]
pub enum DeviceRequest {
    Device(Device),
    /// Resolved through the context's registry, e.g. `"gpu:1"`.
    Selector(String),
}

struct TaskData {
    id: String,
    program: Arc<dyn Program>,
    params: ExecParams,
    arguments: Vec<Argument>,
    accesses: Vec<Access>,
    device: RwLock<Option<DeviceRequest>>,
}

/// A unit of work. Clones share identity, so adding a clone to a context that
/// already holds the task is a no-op.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskData>,
}

impl Task {
    pub fn builder(id: impl Into<String>, program: Arc<dyn Program>) -> TaskBuilder {
        TaskBuilder {
            id: id.into(),
            program,
            params: ExecParams::default(),
            arguments: Vec::new(),
            accesses: Vec::new(),
            device: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn program(&self) -> &Arc<dyn Program> {
        &self.inner.program
    }

    pub fn params(&self) -> &ExecParams {
        &self.inner.params
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.inner.arguments
    }

    /// Access modes, parallel to [`Task::arguments`].
    pub fn accesses(&self) -> &[Access] {
        &self.inner.accesses
    }

    pub fn device_request(&self) -> Option<DeviceRequest> {
        self.inner.device.read().clone()
    }

    /// The device this task is bound to, if it has been resolved.
    pub fn device(&self) -> Option<Device> {
        match &*self.inner.device.read() {
            Some(DeviceRequest::Device(device)) => Some(device.clone()),
            _ => None,
        }
    }

    /// Bind the task to `device`. Contexts that already assigned it keep their
    /// assignment until re-mapped.
    pub fn map_to(&self, device: Device) {
        *self.inner.device.write() = Some(DeviceRequest::Device(device));
    }

    pub fn map_to_selector(&self, selector: impl Into<String>) {
        *self.inner.device.write() = Some(DeviceRequest::Selector(selector.into()));
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("program", &self.inner.program.name())
            .field("arguments", &self.inner.arguments.len())
            .finish()
    }
}

/// Collects a task's arguments in launch order.
#[derive(Debug)]
#[must_use]
pub struct TaskBuilder {
    id: String,
    program: Arc<dyn Program>,
    params: ExecParams,
    arguments: Vec<Argument>,
    accesses: Vec<Access>,
    device: Option<DeviceRequest>,
}

impl TaskBuilder {
    pub fn arg(mut self, argument: impl Into<Argument>, access: Access) -> Self {
        self.arguments.push(argument.into());
        self.accesses.push(access);
        self
    }

    pub fn read(self, object: &HostArray) -> Self {
        self.arg(object, Access::Read)
    }

    pub fn write(self, object: &HostArray) -> Self {
        self.arg(object, Access::Write)
    }

    pub fn read_write(self, object: &HostArray) -> Self {
        self.arg(object, Access::ReadWrite)
    }

    /// Constants are always read-only.
    pub fn scalar(self, value: impl Into<ScalarValue>) -> Self {
        self.arg(Argument::Scalar(value.into()), Access::Read)
    }

    pub fn params(mut self, params: ExecParams) -> Self {
        self.params = params;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(DeviceRequest::Device(device));
        self
    }

    pub fn device_selector(mut self, selector: impl Into<String>) -> Self {
        self.device = Some(DeviceRequest::Selector(selector.into()));
        self
    }

    pub fn build(self) -> Task {
        Task {
            inner: Arc::new(TaskData {
                id: self.id,
                program: self.program,
                params: self.params,
                arguments: self.arguments,
                accesses: self.accesses,
                device: RwLock::new(self.device),
            }),
        }
    }
}
