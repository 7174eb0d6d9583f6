//! Residency tracking for host objects.
//!
//! ```text
//! HOST_ONLY --transfer-in--> DEVICE_ONLY --write--> SHARED_DIRTY_DEVICE
//!                                                     |         ^
//!                                               transfer-out  write
//!                                                     v         |
//! SHARED_DIRTY_HOST --transfer-in--------------> SHARED_CLEAN --+
//!        ^
//!        +-- invalidate (from any state)
//! ```
//!
//! Besides the summary state, every device that has held a copy gets a
//! [`DeviceCopy`] record: the generation the copy was made in, whether it is
//! current, the last event that touched it, and the last host to device copy
//! into it. Transitions are recorded when the command is enqueued; later
//! commands are ordered behind it through wait-lists.

use conduit_device::{Device, Event, HostArray};
use smallvec::SmallVec;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumIter, strum::EnumCount)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Residency {
    /// Reported for objects a context has never seen.
    Untracked,
    HostOnly,
    /// Transferred in and never written; the host copy is still current.
    DeviceOnly,
    SharedClean,
    /// The host copy changed; every device copy is out of date.
    SharedDirtyHost,
    /// A device copy is the only current one.
    SharedDirtyDevice,
}

impl Residency {
    pub const fn host_is_current(self) -> bool {
        !matches!(self, Self::SharedDirtyDevice | Self::Untracked)
    }
}

/// One device's copy of an object.
#[derive(Debug, Clone)]
pub struct DeviceCopy {
    pub device: Device,
    pub generation: u64,
    pub current: bool,
    pub last_event: Option<Event>,
    /// Last host to device copy; it reads the host array until it finishes.
    pub last_transfer_in: Option<Event>,
}

impl DeviceCopy {
    /// Current and not invalidated by a device reset.
    pub fn is_valid(&self) -> bool {
        self.current && self.generation == self.device.generation()
    }
}

/// Per-context state of one host object.
#[derive(Debug, Clone)]
pub struct ObjectState {
    object: HostArray,
    residency: Residency,
    copies: SmallVec<[DeviceCopy; 2]>,
}

impl ObjectState {
    pub fn new(object: HostArray) -> Self {
        Self { object, residency: Residency::HostOnly, copies: SmallVec::new() }
    }

    pub fn object(&self) -> &HostArray {
        &self.object
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn copies(&self) -> &[DeviceCopy] {
        &self.copies
    }

    pub fn copy_on(&self, device: &Device) -> Option<&DeviceCopy> {
        self.copies.iter().find(|copy| copy.device == *device)
    }

    fn copy_on_mut(&mut self, device: &Device, generation: u64) -> &mut DeviceCopy {
        let position = match self.copies.iter().position(|copy| copy.device == *device) {
            Some(position) => position,
            None => {
                self.copies.push(DeviceCopy {
                    device: device.clone(),
                    generation,
                    current: false,
                    last_event: None,
                    last_transfer_in: None,
                });
                self.copies.len() - 1
            }
        };
        &mut self.copies[position]
    }

    pub fn is_current_on(&self, device: &Device) -> bool {
        self.copy_on(device).is_some_and(DeviceCopy::is_valid)
    }

    /// Last event that touched the copy on `device`, if it is from the device's
    /// current generation.
    pub fn last_event_on(&self, device: &Device) -> Option<&Event> {
        self.copy_on(device)
            .filter(|copy| copy.generation == device.generation())
            .and_then(|copy| copy.last_event.as_ref())
    }

    /// Transfers in that may still be reading the host array.
    ///
    /// Anything that overwrites the host copy has to wait for these first.
    pub fn pending_host_reads(&self) -> impl Iterator<Item = &Event> {
        self.copies
            .iter()
            .filter(|copy| copy.generation == copy.device.generation())
            .filter_map(|copy| copy.last_transfer_in.as_ref())
            .filter(|event| !event.status().is_terminal())
    }

    /// The device copy that is the sole current one, if any.
    pub fn authority(&self) -> Option<&DeviceCopy> {
        match self.residency {
            Residency::SharedDirtyDevice => self.copies.iter().find(|copy| copy.is_valid()),
            _ => None,
        }
    }

    /// Copy that must be transferred out before `device` can read the object.
    pub fn pull_source(&self, device: &Device) -> Option<&DeviceCopy> {
        self.authority().filter(|copy| copy.device != *device)
    }

    /// Whether a read on `device` needs a host to device transfer first.
    pub fn needs_transfer_in(&self, device: &Device) -> bool {
        !self.is_current_on(device)
    }

    /// Forget copies from earlier device generations.
    ///
    /// Returns `true` when the only current copy was lost; the state then falls
    /// back to the host copy.
    pub fn reconcile_generations(&mut self) -> bool {
        let mut lost_authority = false;
        for copy in &mut self.copies {
            let generation = copy.device.generation();
            if copy.generation == generation {
                continue;
            }
            if copy.current && self.residency == Residency::SharedDirtyDevice {
                lost_authority = true;
            }
            copy.current = false;
            copy.last_event = None;
            copy.last_transfer_in = None;
            copy.generation = generation;
        }

        if lost_authority && !self.copies.iter().any(DeviceCopy::is_valid) {
            warn!(object = %self.object.id(), "device reset discarded the only current copy, falling back to host data");
            self.residency = Residency::SharedDirtyHost;
            return true;
        }
        false
    }

    pub fn mark_transferred_in(&mut self, device: &Device, event: Event) {
        let copy = self.copy_on_mut(device, event.generation());
        copy.generation = event.generation();
        copy.current = true;
        copy.last_event = Some(event.clone());
        copy.last_transfer_in = Some(event);
        self.residency = match self.residency {
            Residency::HostOnly | Residency::Untracked => Residency::DeviceOnly,
            Residency::SharedDirtyHost => Residency::SharedClean,
            other => other,
        };
    }

    /// A kernel on `device` read the object.
    pub fn mark_accessed(&mut self, device: &Device, event: Event) {
        let copy = self.copy_on_mut(device, event.generation());
        copy.last_event = Some(event);
    }

    /// A kernel on `device` wrote the object; every other copy is now stale.
    pub fn mark_written(&mut self, device: &Device, event: Event) {
        for copy in &mut self.copies {
            copy.current = false;
        }
        let copy = self.copy_on_mut(device, event.generation());
        copy.generation = event.generation();
        copy.current = true;
        copy.last_event = Some(event);
        self.residency = Residency::SharedDirtyDevice;
    }

    /// The host copy was refreshed from the authoritative device copy.
    pub fn mark_synced(&mut self, device: &Device, event: Event) {
        if let Some(copy) = self.copies.iter_mut().find(|copy| copy.device == *device) {
            copy.last_event = Some(event);
        }
        self.residency = Residency::SharedClean;
    }

    /// The host copy was changed by the application.
    pub fn invalidate(&mut self) {
        for copy in &mut self.copies {
            copy.current = false;
        }
        self.residency = Residency::SharedDirtyHost;
    }

    /// A task writing this object failed; its device data cannot be trusted.
    pub fn mark_failed(&mut self) {
        self.invalidate();
    }
}
