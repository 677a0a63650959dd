//! Collector configuration.
//!
//! The device list and collection knobs are loaded from a JSON file; the
//! binary owns loading and validation, the engine only consumes the
//! resulting values.
//!
//! ```json
//! {
//!   "devices": [
//!     { "address": "[fd00::1a2b]:5683", "resource": "dh/tmp" },
//!     { "address": "10.0.0.7:5683", "resource": "dh/tmp",
//!       "mode": "poll", "poll_interval_secs": 30 }
//!   ],
//!   "announce_path": "dh/lo"
//! }
//! ```

use std::{net::SocketAddr, path::Path, time::Duration};

use cairn_core::TransmissionParams;
use serde::Deserialize;
use thiserror::Error;

/// Default liveness window before an observation is considered silent.
const DEFAULT_LIVENESS_SECS: u64 = 120;

/// Default interval between polls for poll-mode devices.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Consecutive failures before a device surfaces a collection error.
const DEFAULT_FAILURE_BUDGET: u32 = 3;

/// Initial per-device backoff after a failed cycle.
const DEFAULT_BACKOFF_INITIAL_SECS: u64 = 5;

/// Ceiling for the per-device backoff.
const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;

/// Resource observed on devices that announce themselves.
const DEFAULT_ANNOUNCE_RESOURCE: &str = "dh/tmp";

/// How a device's resource is collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectMode {
    /// Register an observe relationship and consume notifications.
    #[default]
    Observe,
    /// Periodic confirmable GET for devices without observe support.
    Poll,
}

/// One configured device/resource pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceSpec {
    /// Stable device name for sink events. Defaults to `mote-<tail>`
    /// derived from the address.
    #[serde(default)]
    pub device_id: Option<String>,
    /// Device socket address.
    pub address: SocketAddr,
    /// Resource path to collect, e.g. `dh/tmp`.
    pub resource: String,
    /// Preferred collection mode.
    #[serde(default)]
    pub mode: CollectMode,
    /// Poll interval for poll mode; ignored in observe mode.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
}

impl DeviceSpec {
    /// The device identity used in sink events.
    pub fn device_id(&self) -> String {
        self.device_id.clone().unwrap_or_else(|| invariant_name(&self.address))
    }

    /// Poll interval with the default applied.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS))
    }
}

/// Short stable name for a device, derived from address parts that do not
/// change: the last segment of the IP address.
pub fn invariant_name(addr: &SocketAddr) -> String {
    let ip = addr.ip().to_string();
    let tail = ip.rsplit([':', '.']).find(|s| !s.is_empty()).unwrap_or("0");
    format!("mote-{tail}")
}

/// Collector-wide configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    /// Statically configured devices.
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,

    /// Liveness window in seconds before a silent observation is
    /// re-registered.
    #[serde(default = "default_liveness")]
    pub liveness_window_secs: u64,

    /// Consecutive cycle failures before an error event is surfaced.
    #[serde(default = "default_failure_budget")]
    pub failure_budget: u32,

    /// Initial per-device backoff in seconds.
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_secs: u64,

    /// Per-device backoff ceiling in seconds.
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// Hello path devices POST to announce themselves. Announce handling
    /// is disabled when unset.
    #[serde(default)]
    pub announce_path: Option<String>,

    /// Resource observed on announced devices.
    #[serde(default = "default_announce_resource")]
    pub announce_resource: String,

    /// Protocol transmission constants; not part of the file format.
    #[serde(skip)]
    pub params: TransmissionParams,
}

fn default_liveness() -> u64 {
    DEFAULT_LIVENESS_SECS
}

fn default_failure_budget() -> u32 {
    DEFAULT_FAILURE_BUDGET
}

fn default_backoff_initial() -> u64 {
    DEFAULT_BACKOFF_INITIAL_SECS
}

fn default_backoff_max() -> u64 {
    DEFAULT_BACKOFF_MAX_SECS
}

fn default_announce_resource() -> String {
    DEFAULT_ANNOUNCE_RESOURCE.to_owned()
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            liveness_window_secs: DEFAULT_LIVENESS_SECS,
            failure_budget: DEFAULT_FAILURE_BUDGET,
            backoff_initial_secs: DEFAULT_BACKOFF_INITIAL_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            announce_path: None,
            announce_resource: default_announce_resource(),
            params: TransmissionParams::default(),
        }
    }
}

impl CollectorConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Liveness window as a duration.
    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    /// Initial per-device backoff as a duration.
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_secs(self.backoff_initial_secs)
    }

    /// Per-device backoff ceiling as a duration.
    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}")]
    Io {
        /// File path attempted.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for the expected shape.
    #[error("failed to parse config file {path}")]
    Parse {
        /// File path attempted.
        path: String,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
}
