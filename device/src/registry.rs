use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use strum::IntoEnumIterator;
use tracing::debug;

use crate::cpu::{CpuDeviceConfig, create_cpu_device};
use crate::device::{Device, DeviceKind};
use crate::error::{Error, InvalidDeviceSnafu, Result};

/// Creates the `ordinal`-th device of a kind on demand.
pub type DeviceFactory = Arc<dyn Fn(usize) -> Result<Device> + Send + Sync>;

/// Device selection syntax.
///
/// Examples:
/// - `"2"` -> the device at registry index 2
/// - `"cpu"` -> the first CPU device
/// - `"GPU:1"` -> the second GPU device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceSelector {
    Index(usize),
    Kind { kind: DeviceKind, ordinal: usize },
}

impl FromStr for DeviceSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || InvalidDeviceSnafu { device: s.to_string() }.build();
        let trimmed = s.trim();
        if let Ok(index) = trimmed.parse::<usize>() {
            return Ok(Self::Index(index));
        }

        let (kind, ordinal) = match trimmed.split_once(':') {
            Some((kind, ordinal)) => (kind, ordinal.parse().map_err(|_| invalid())?),
            None => (trimmed, 0),
        };
        let kind = kind.parse::<DeviceKind>().map_err(|_| invalid())?;
        Ok(Self::Kind { kind, ordinal })
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index}"),
            Self::Kind { kind, ordinal } => write!(f, "{kind}:{ordinal}"),
        }
    }
}

/// Ordered set of devices known to an engine.
///
/// Index 0 is the default device. Kinds with a registered factory get devices
/// created on first selection.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<Vec<Device>>,
    factories: RwLock<HashMap<DeviceKind, DeviceFactory>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let registry = Self::new();
        for device in devices {
            registry.register(device);
        }
        registry
    }

    /// Registry whose CPU devices are created on demand from the environment.
    pub fn with_cpu_driver() -> Self {
        let registry = Self::new();
        registry.register_factory(
            DeviceKind::Cpu,
            Arc::new(|ordinal| {
                let config = CpuDeviceConfig { name: format!("cpu:{ordinal}"), ..CpuDeviceConfig::from_env() };
                create_cpu_device(&config)
            }),
        );
        registry
    }

    /// Add a device and return its index. Registering a device twice is a no-op.
    pub fn register(&self, device: Device) -> usize {
        let mut devices = self.devices.write();
        if let Some(index) = devices.iter().position(|known| *known == device) {
            return index;
        }
        debug!(device = %device, index = devices.len(), "registered device");
        devices.push(device);
        devices.len() - 1
    }

    pub fn register_factory(&self, kind: DeviceKind, factory: DeviceFactory) {
        self.factories.write().insert(kind, factory);
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    pub fn device(&self, index: usize) -> Option<Device> {
        self.devices.read().get(index).cloned()
    }

    /// The device at index 0.
    ///
    /// An empty registry asks its factories for the first device of a kind,
    /// trying kinds in declaration order.
    pub fn default_device(&self) -> Option<Device> {
        if let Some(device) = self.device(0) {
            return Some(device);
        }
        let kinds: Vec<DeviceKind> = {
            let factories = self.factories.read();
            DeviceKind::iter().filter(|kind| factories.contains_key(kind)).collect()
        };
        kinds.into_iter().find_map(|kind| self.select(DeviceSelector::Kind { kind, ordinal: 0 }).ok())
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.read().clone()
    }

    pub fn index_of(&self, device: &Device) -> Option<usize> {
        self.devices.read().iter().position(|known| known == device)
    }

    /// Device by name, ignoring ASCII case.
    pub fn find(&self, name: &str) -> Option<Device> {
        self.devices.read().iter().find(|device| device.name().eq_ignore_ascii_case(name)).cloned()
    }

    pub fn select(&self, selector: DeviceSelector) -> Result<Device> {
        let invalid = || InvalidDeviceSnafu { device: selector.to_string() }.build();
        match selector {
            DeviceSelector::Index(index) => self.device(index).ok_or_else(invalid),
            DeviceSelector::Kind { kind, ordinal } => {
                // Fast path: read lock
                if let Some(device) = self.devices.read().iter().filter(|device| device.kind() == kind).nth(ordinal) {
                    return Ok(device.clone());
                }

                let factory = self.factories.read().get(&kind).cloned().ok_or_else(invalid)?;
                let mut devices = self.devices.write();
                let existing = devices.iter().filter(|device| device.kind() == kind).count();
                if let Some(device) = devices.iter().filter(|device| device.kind() == kind).nth(ordinal) {
                    return Ok(device.clone());
                }
                if ordinal != existing {
                    return Err(invalid());
                }

                let device = factory(ordinal)?;
                debug!(device = %device, index = devices.len(), "created device on demand");
                devices.push(device.clone());
                Ok(device)
            }
        }
    }

    /// Resolve a device by exact name first, then by selector syntax.
    pub fn resolve(&self, spec: &str) -> Result<Device> {
        if let Some(device) = self.find(spec) {
            return Ok(device);
        }
        self.select(spec.parse()?)
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &*self.devices.read())
            .field("factories", &self.factories.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
