//! Engine configuration.
//!
//! Typed configuration built with `bon`, with environment variable fallbacks.

/// What to do with tasks that were never mapped to a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[derive(strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DefaultDevice {
    /// Bind to the registry's device 0.
    #[default]
    First,

    /// Fail assignment with `UnresolvedDevice`.
    Strict,
}

impl DefaultDevice {
    /// Read `CONDUIT_DEFAULT_DEVICE=first|strict`.
    pub fn from_env() -> Self {
        std::env::var("CONDUIT_DEFAULT_DEVICE").ok().and_then(|s| s.parse().ok()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, bon::Builder)]
pub struct EngineConfig {
    #[builder(default)]
    pub default_device: DefaultDevice,

    /// Route transfers through a device's transfer queue when it has one.
    #[builder(default = true)]
    pub use_transfer_queue: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EngineConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `CONDUIT_DEFAULT_DEVICE` - `first` (default) or `strict`
    /// * `CONDUIT_USE_TRANSFER_QUEUE` - `0` keeps transfers on the compute queue
    pub fn from_env() -> Self {
        let use_transfer_queue = std::env::var("CONDUIT_USE_TRANSFER_QUEUE").map_or(true, |v| v != "0");
        Self::builder().default_device(DefaultDevice::from_env()).use_transfer_queue(use_transfer_queue).build()
    }
}
