//! Execution contexts.
//!
//! An [`ExecutionContext`] is one task graph: the tasks in program order, the
//! devices they run on, and the object and constant tables their arguments are
//! drawn from. It decides which transfers each launch needs, enqueues them together
//! with the kernel, and copies device results back to the host only on
//! [`ExecutionContext::sync`].
//!
//! ```ignore
//! let mut context = ExecutionContext::new("s0", registry);
//! context.add_task(&Task::builder("t0", program).read_write(&a).build());
//! context.execute()?;
//! context.sync()?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use conduit_device::{CommandQueue, Device, DeviceRegistry, Event, HostArray, KernelArg, ObjectId, QueueKind, WaitList};
use conduit_dtype::ScalarValue;
use itertools::Itertools;
use smallvec::SmallVec;
use snafu::{OptionExt, ensure};
use tracing::{debug, error, trace, warn};

use crate::config::{DefaultDevice, EngineConfig};
use crate::error::{Error, Result, UnresolvedDeviceSnafu, UnsupportedDeviceKindSnafu};
use crate::object::{ObjectState, Residency};
use crate::profile::TaskProfile;
use crate::task::{Access, Argument, DeviceRequest, Task};

/// Where a task argument lives in the context's tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Object(usize),
    Constant(usize),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(index) => write!(f, "obj[{index}]"),
            Self::Constant(index) => write!(f, "const[{index}]"),
        }
    }
}

/// Argument layout of one task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    slots: SmallVec<[(Slot, Access); 8]>,
}

impl Frame {
    pub fn slots(&self) -> &[(Slot, Access)] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Object slots with their access modes.
    pub fn objects(&self) -> impl Iterator<Item = (usize, Access)> + '_ {
        self.slots.iter().filter_map(|&(slot, access)| match slot {
            Slot::Object(index) => Some((index, access)),
            Slot::Constant(_) => None,
        })
    }
}

fn transfer_queue(device: &Device, use_transfer_queue: bool) -> &CommandQueue {
    match use_transfer_queue {
        true => device.queue(QueueKind::Transfer),
        false => device.compute_queue(),
    }
}

fn push_unique(wait_list: &mut WaitList, event: Event) {
    if !wait_list.iter().any(|known| known.ptr_eq(&event)) {
        wait_list.push(event);
    }
}

fn strip_prefix_ignore_case<'a>(id: &'a str, prefix: &str) -> Option<&'a str> {
    let head = id.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) { id.get(prefix.len()..) } else { None }
}

/// Enqueue a device to host copy of the object's authoritative device copy.
///
/// The copy is ordered after the authority's last event and after every
/// transfer in that still reads the host array. Returns `None` when no device
/// copy is newer than the host.
fn transfer_out(state: &mut ObjectState, use_transfer_queue: bool) -> Result<Option<(Device, Event)>> {
    state.reconcile_generations();
    let Some(authority) = state.authority().cloned() else {
        return Ok(None);
    };

    let host = state.object().clone();
    let Some(buffer) = authority.device.buffer(host.id()) else {
        warn!(object = %host.id(), device = %authority.device.name(), "device copy was freed, falling back to host data");
        state.invalidate();
        return Ok(None);
    };

    let mut dependencies: WaitList = authority.last_event.iter().cloned().collect();
    for pending in state.pending_host_reads() {
        push_unique(&mut dependencies, pending.clone());
    }

    let queue = transfer_queue(&authority.device, use_transfer_queue);
    let read = queue.enqueue_read(&buffer, &host, 0, host.byte_len(), &dependencies)?;
    trace!(object = %host.id(), device = %authority.device.name(), event = %read.name(), "transfer out");
    Ok(Some((authority.device, read)))
}

/// A task graph bound to a device registry.
#[derive(Debug)]
pub struct ExecutionContext {
    name: String,
    registry: Arc<DeviceRegistry>,
    config: EngineConfig,

    tasks: Vec<Task>,
    frames: Vec<Frame>,
    task_to_device: Vec<Option<usize>>,
    devices: Vec<Device>,

    objects: Vec<HostArray>,
    object_index: HashMap<ObjectId, usize>,
    object_states: Vec<ObjectState>,

    constants: Vec<ScalarValue>,
    constant_index: HashMap<ScalarValue, usize>,

    completions: Vec<Option<Event>>,
    outstanding: Vec<usize>,
    last_devices: Vec<Device>,
    redeploy: bool,
}

impl ExecutionContext {
    pub fn new(name: impl Into<String>, registry: Arc<DeviceRegistry>) -> Self {
        Self::with_config(name, registry, EngineConfig::default())
    }

    pub fn with_config(name: impl Into<String>, registry: Arc<DeviceRegistry>, config: EngineConfig) -> Self {
        Self {
            name: name.into(),
            registry,
            config,
            tasks: Vec::new(),
            frames: Vec::new(),
            task_to_device: Vec::new(),
            devices: Vec::new(),
            objects: Vec::new(),
            object_index: HashMap::new(),
            object_states: Vec::new(),
            constants: Vec::new(),
            constant_index: HashMap::new(),
            completions: Vec::new(),
            outstanding: Vec::new(),
            last_devices: Vec::new(),
            redeploy: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Graph building
    // ------------------------------------------------------------------

    /// Track `object` and return its index. Objects are keyed by identity.
    pub fn insert_object(&mut self, object: &HostArray) -> usize {
        if let Some(&index) = self.object_index.get(&object.id()) {
            return index;
        }

        let index = self.objects.len();
        self.objects.push(object.clone());
        self.object_states.push(ObjectState::new(object.clone()));
        self.object_index.insert(object.id(), index);
        trace!(context = %self.name, object = %object.id(), index, "tracking object");
        index
    }

    /// Constants are keyed by value.
    pub fn insert_constant(&mut self, value: ScalarValue) -> usize {
        if let Some(&index) = self.constant_index.get(&value) {
            return index;
        }

        let index = self.constants.len();
        self.constants.push(value);
        self.constant_index.insert(value, index);
        index
    }

    pub fn insert_argument(&mut self, argument: &Argument) -> Slot {
        match argument {
            Argument::Object(object) => Slot::Object(self.insert_object(object)),
            Argument::Scalar(value) => Slot::Constant(self.insert_constant(*value)),
        }
    }

    /// Append `task` in program order and record its argument frame.
    ///
    /// Adding a task twice returns the index of the first insertion.
    pub fn add_task(&mut self, task: &Task) -> usize {
        if let Some(index) = self.tasks.iter().position(|known| known.ptr_eq(task)) {
            return index;
        }

        let slots = task
            .arguments()
            .iter()
            .zip(task.accesses())
            .map(|(argument, &access)| (self.insert_argument(argument), access))
            .collect();

        let index = self.tasks.len();
        self.tasks.push(task.clone());
        self.frames.push(Frame { slots });
        self.task_to_device.push(None);
        self.completions.push(None);
        debug!(context = %self.name, task.id = %task.id(), index, "added task");
        index
    }

    // ------------------------------------------------------------------
    // Device assignment
    // ------------------------------------------------------------------

    /// Bind every unassigned task to a device.
    ///
    /// Tasks keep earlier assignments. On failure no task is assigned.
    pub fn assign_devices(&mut self) -> Result<()> {
        let mut resolved = Vec::new();
        for (index, task) in self.tasks.iter().enumerate() {
            if self.task_to_device[index].is_some() {
                continue;
            }
            let device = self.resolve_device(task)?;
            ensure!(
                device.is_accelerator(),
                UnsupportedDeviceKindSnafu { device: device.name(), kind: device.kind() }
            );
            resolved.push((index, device));
        }

        for (index, device) in resolved {
            self.tasks[index].map_to(device.clone());
            let device_index = self.register_device(device);
            self.task_to_device[index] = Some(device_index);
            debug!(
                context = %self.name,
                task.id = %self.tasks[index].id(),
                device = %self.devices[device_index].name(),
                device_index,
                "assigned device"
            );
        }
        Ok(())
    }

    fn resolve_device(&self, task: &Task) -> Result<Device> {
        let unresolved = || UnresolvedDeviceSnafu { task: self.qualified_id(task) }.build();
        match task.device_request() {
            Some(DeviceRequest::Device(device)) => Ok(device),
            Some(DeviceRequest::Selector(selector)) => self.registry.resolve(&selector).map_err(|err| {
                debug!(task.id = %task.id(), selector = %selector, %err, "device selector did not resolve");
                unresolved()
            }),
            None => match self.config.default_device {
                DefaultDevice::First => {
                    let device = self.registry.default_device().ok_or_else(unresolved)?;
                    debug!(task.id = %task.id(), device = %device.name(), "no device mapping, using the default device");
                    Ok(device)
                }
                DefaultDevice::Strict => Err(unresolved()),
            },
        }
    }

    fn register_device(&mut self, device: Device) -> usize {
        match self.devices.iter().position(|known| *known == device) {
            Some(index) => index,
            None => {
                self.devices.push(device);
                self.devices.len() - 1
            }
        }
    }

    /// Re-map every task to `device`, replacing the device table.
    ///
    /// Fails with `UnsupportedDeviceKind`, leaving the context unchanged, when the
    /// device cannot run kernels.
    pub fn map_all_tasks_to(&mut self, device: &Device) -> Result<()> {
        ensure!(device.is_accelerator(), UnsupportedDeviceKindSnafu { device: device.name(), kind: device.kind() });

        self.devices.clear();
        self.devices.push(device.clone());
        for (task, assigned) in self.tasks.iter().zip(&mut self.task_to_device) {
            task.map_to(device.clone());
            *assigned = Some(0);
        }
        self.redeploy = true;
        debug!(context = %self.name, device = %device.name(), tasks = self.tasks.len(), "mapped all tasks");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Launch every task in program order.
    ///
    /// Device results stay on the devices until [`ExecutionContext::sync`].
    pub fn execute(&mut self) -> Result<()> {
        self.assign_devices()?;

        let mut used = Vec::new();
        let mut outcome = Ok(());
        for index in 0..self.tasks.len() {
            match self.dispatch(index) {
                Ok(event) => {
                    self.completions[index] = Some(event);
                    if !self.outstanding.contains(&index) {
                        self.outstanding.push(index);
                    }
                    if let Some(device_index) = self.task_to_device[index]
                        && !used.contains(&device_index)
                    {
                        used.push(device_index);
                    }
                }
                Err(err) => {
                    error!(context = %self.name, task.id = %self.tasks[index].id(), %err, "dispatch failed");
                    outcome = Err(err);
                    break;
                }
            }
        }

        for device in &self.devices {
            device.flush()?;
        }
        self.last_devices = used.into_iter().map(|index| self.devices[index].clone()).collect();
        self.redeploy = false;
        outcome
    }

    fn dispatch(&mut self, index: usize) -> Result<Event> {
        let task = self.tasks[index].clone();
        let device_index =
            self.task_to_device[index].context(UnresolvedDeviceSnafu { task: self.qualified_id(&task) })?;
        let device = self.devices[device_index].clone();
        let use_transfer_queue = self.config.use_transfer_queue;
        let frame = self.frames[index].clone();

        let mut wait_list = WaitList::new();
        let mut args = Vec::with_capacity(frame.len());
        for &(slot, access) in frame.slots() {
            let object_index = match slot {
                Slot::Constant(constant) => {
                    args.push(KernelArg::Scalar(self.constants[constant]));
                    continue;
                }
                Slot::Object(object_index) => object_index,
            };

            let state = &mut self.object_states[object_index];
            state.reconcile_generations();
            let host = state.object().clone();
            let buffer = device.allocate(host.id(), host.byte_len(), host.kind())?;

            if access.reads() && state.needs_transfer_in(&device) {
                let mut dependencies = WaitList::new();
                if state.pull_source(&device).is_some()
                    && let Some((source, read)) = transfer_out(state, use_transfer_queue)?
                {
                    debug!(object = %host.id(), from = %source.name(), to = %device.name(), "pulling device copy through host");
                    source.flush()?;
                    state.mark_synced(&source, read.clone());
                    dependencies.push(read);
                }
                dependencies.extend(state.last_event_on(&device).cloned());

                let queue = transfer_queue(&device, use_transfer_queue);
                let write = queue.enqueue_write(&buffer, &host, 0, host.byte_len(), &dependencies)?;
                trace!(task.id = %task.id(), object = %host.id(), event = %write.name(), "transfer in");
                state.mark_transferred_in(&device, write.clone());
                push_unique(&mut wait_list, write);
            } else if let Some(last) = state.last_event_on(&device) {
                push_unique(&mut wait_list, last.clone());
            }
            args.push(KernelArg::Buffer(buffer));
        }

        let event = device.compute_queue().enqueue_kernel(
            Arc::clone(task.program()),
            args,
            task.params().clone(),
            &wait_list,
        )?;
        debug!(
            context = %self.name,
            task.id = %task.id(),
            device = %device.name(),
            event = %event.name(),
            waits = wait_list.len(),
            "launched task"
        );

        for (object_index, access) in frame.objects() {
            let state = &mut self.object_states[object_index];
            match access.writes() {
                true => state.mark_written(&device, event.clone()),
                false => state.mark_accessed(&device, event.clone()),
            }
        }
        Ok(event)
    }

    /// Block until every task launched by the last [`ExecutionContext::execute`]
    /// has finished.
    ///
    /// Objects written by a failed task fall back to their host copy. The first
    /// failure is returned after all tasks were observed.
    pub fn wait(&mut self) -> Result<()> {
        let mut first_error = None;
        for index in std::mem::take(&mut self.outstanding) {
            let Some(event) = self.completions[index].clone() else {
                continue;
            };
            if let Err(err) = event.wait_on() {
                error!(context = %self.name, task.id = %self.tasks[index].id(), %err, "task failed");
                self.recover(index);
                first_error.get_or_insert(Error::from(err));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn recover(&mut self, index: usize) {
        for (object_index, access) in self.frames[index].objects() {
            if access.writes() {
                self.object_states[object_index].mark_failed();
            }
        }
    }

    /// Copy every object whose device copy is newer than the host copy back to the
    /// host and wait for the copies.
    ///
    /// Returns the number of transfer-outs issued; a second call without an
    /// intervening execution issues none.
    pub fn sync(&mut self) -> Result<usize> {
        self.wait()?;

        let use_transfer_queue = self.config.use_transfer_queue;
        let mut reads = Vec::new();
        for (index, state) in self.object_states.iter_mut().enumerate() {
            if let Some((device, read)) = transfer_out(state, use_transfer_queue)? {
                reads.push((index, device, read));
            }
        }
        for device in reads.iter().map(|(_, device, _)| device).unique() {
            device.flush()?;
        }

        let count = reads.len();
        let mut first_error = None;
        for (index, device, read) in reads {
            match read.wait_on() {
                Ok(()) => self.object_states[index].mark_synced(&device, read),
                Err(err) => {
                    error!(context = %self.name, object = %self.objects[index].id(), %err, "transfer out failed");
                    first_error.get_or_insert(Error::from(err));
                }
            }
        }
        debug!(context = %self.name, transfers = count, "synced");
        first_error.map_or(Ok(count), Err)
    }

    /// Copy one object back to the host if a device holds a newer copy.
    ///
    /// Returns whether a transfer was needed. Untracked objects are ignored.
    pub fn sync_object(&mut self, object: &HostArray) -> Result<bool> {
        let Some(index) = self.object_index(object) else {
            return Ok(false);
        };
        let state = &mut self.object_states[index];
        let Some((device, read)) = transfer_out(state, self.config.use_transfer_queue)? else {
            return Ok(false);
        };
        read.wait_on()?;
        state.mark_synced(&device, read);
        Ok(true)
    }

    /// Record that the application changed `object` on the host.
    ///
    /// Returns `false` for objects this context does not track.
    pub fn invalidate(&mut self, object: &HostArray) -> bool {
        match self.object_index(object) {
            Some(index) => {
                self.object_states[index].invalidate();
                trace!(context = %self.name, object = %object.id(), "invalidated");
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn objects(&self) -> &[HostArray] {
        &self.objects
    }

    pub fn constants(&self) -> &[ScalarValue] {
        &self.constants
    }

    pub fn task(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }

    /// Task index by id, ignoring ASCII case. Accepts both `"t0"` and the
    /// context-qualified `"s0.t0"`.
    pub fn task_index(&self, id: &str) -> Option<usize> {
        let prefix = format!("{}.", self.name);
        let local = strip_prefix_ignore_case(id, &prefix).unwrap_or(id);
        self.tasks.iter().position(|task| task.id().eq_ignore_ascii_case(local) || task.id().eq_ignore_ascii_case(id))
    }

    pub fn task_by_id(&self, id: &str) -> Option<&Task> {
        self.task_index(id).map(|index| &self.tasks[index])
    }

    /// `"<context>.<task>"`.
    pub fn qualified_id(&self, task: &Task) -> String {
        format!("{}.{}", self.name, task.id())
    }

    pub fn device(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    pub fn device_index_for_task(&self, index: usize) -> Option<usize> {
        self.task_to_device.get(index).copied().flatten()
    }

    pub fn device_for_task(&self, index: usize) -> Option<&Device> {
        self.device_index_for_task(index).and_then(|device_index| self.devices.get(device_index))
    }

    pub fn frame(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    /// Completion event of the task's last launch.
    pub fn completion(&self, index: usize) -> Option<&Event> {
        self.completions.get(index).and_then(Option::as_ref)
    }

    pub fn object_index(&self, object: &HostArray) -> Option<usize> {
        self.object_index.get(&object.id()).copied()
    }

    pub fn state(&self, index: usize) -> Option<&ObjectState> {
        self.object_states.get(index)
    }

    /// Residency of `object`; `UNTRACKED` if the context never saw it.
    pub fn object_state(&self, object: &HostArray) -> Residency {
        self.object_index(object).map_or(Residency::Untracked, |index| self.object_states[index].residency())
    }

    /// Devices used by the most recent [`ExecutionContext::execute`].
    pub fn last_devices(&self) -> &[Device] {
        &self.last_devices
    }

    /// Whether tasks were re-mapped since the last execution.
    pub fn redeploy_on_device(&self) -> bool {
        self.redeploy
    }

    pub fn set_redeploy(&mut self, redeploy: bool) {
        self.redeploy = redeploy;
    }

    pub fn profile(&self) -> Vec<TaskProfile> {
        self.tasks
            .iter()
            .enumerate()
            .map(|(index, task)| {
                let event = self.completion(index);
                TaskProfile {
                    task: self.qualified_id(task),
                    device: self.device_for_task(index).map(|device| device.name().to_string()),
                    status: event.map(Event::status),
                    timestamps: event.map(Event::timestamps).unwrap_or_default(),
                }
            })
            .collect()
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "context {}", self.name)?;
        writeln!(
            f,
            "devices: {}",
            self.devices.iter().enumerate().map(|(index, device)| format!("[{index}] {device}")).join(", ")
        )?;
        writeln!(
            f,
            "constants: {}",
            self.constants.iter().enumerate().map(|(index, value)| format!("[{index}] {value}")).join(", ")
        )?;

        writeln!(f, "objects:")?;
        for (index, state) in self.object_states.iter().enumerate() {
            let object = state.object();
            writeln!(
                f,
                "  [{index}] {} {}[{}] {}",
                object.id(),
                object.kind().c_style(),
                object.len(),
                state.residency()
            )?;
        }

        writeln!(f, "tasks:")?;
        for (index, task) in self.tasks.iter().enumerate() {
            let device = self.device_for_task(index).map_or("unassigned", Device::name);
            let slots = self.frames[index]
                .slots()
                .iter()
                .map(|(slot, access)| match slot {
                    Slot::Object(_) => format!("{slot}:{access}"),
                    Slot::Constant(_) => slot.to_string(),
                })
                .join(", ");
            writeln!(f, "  [{index}] {} -> {device} ({slots})", self.qualified_id(task))?;
        }
        Ok(())
    }
}

#[cfg(test)]
impl ExecutionContext {
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}
