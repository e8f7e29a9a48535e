//! Session tunables.
//!
//! Every value has a default matching the behaviour HID devices are tuned
//! against; a JSON file may override any subset of them. Values are
//! validated before any device I/O happens.
//!
//! # Bounds
//!
//! | field                   | default | allowed         |
//! |-------------------------|---------|-----------------|
//! | `max_queued_reports`    | 30      | 1 – 4096        |
//! | `pump_timeout_ms`       | 5000    | 100 – 60000     |
//! | `control_timeout_ms`    | 1000    | 1 – 60000       |
//! | `descriptor_timeout_ms` | 5000    | 1 – 60000       |
//! | `init_timeout_ms`       | 100     | 1 – 60000       |

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const MAX_QUEUED_REPORTS: usize = 30;
pub const PUMP_TIMEOUT_MS: u32 = 5000;
pub const CONTROL_TIMEOUT_MS: u32 = 1000;
pub const DESCRIPTOR_TIMEOUT_MS: u32 = 5000;
pub const INIT_TIMEOUT_MS: u32 = 100;

const QUEUE_LIMIT: u64 = 4096;
const PUMP_TIMEOUT_MIN_MS: u64 = 100;
const TIMEOUT_MAX_MS: u64 = 60_000;

/// Tunables applied to every session opened through a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// High-water mark of the input report queue. Older reports are dropped
    /// once it is exceeded.
    pub max_queued_reports: usize,
    /// Per-attempt timeout of the read pump's interrupt transfers.
    pub pump_timeout_ms: u32,
    /// Timeout of output, feature and input report transfers.
    pub control_timeout_ms: u32,
    /// Timeout of report and string descriptor requests.
    pub descriptor_timeout_ms: u32,
    /// Timeout of vendor init sequences.
    pub init_timeout_ms: u32,
    /// Detach a kernel driver bound to the interface before claiming it.
    pub detach_kernel_driver: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_queued_reports: MAX_QUEUED_REPORTS,
            pump_timeout_ms: PUMP_TIMEOUT_MS,
            control_timeout_ms: CONTROL_TIMEOUT_MS,
            descriptor_timeout_ms: DESCRIPTOR_TIMEOUT_MS,
            init_timeout_ms: INIT_TIMEOUT_MS,
            detach_kernel_driver: true,
        }
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(Error::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

impl SessionConfig {
    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_range(
            "max_queued_reports",
            self.max_queued_reports as u64,
            1,
            QUEUE_LIMIT,
        )?;
        check_range(
            "pump_timeout_ms",
            self.pump_timeout_ms.into(),
            PUMP_TIMEOUT_MIN_MS,
            TIMEOUT_MAX_MS,
        )?;
        check_range(
            "control_timeout_ms",
            self.control_timeout_ms.into(),
            1,
            TIMEOUT_MAX_MS,
        )?;
        check_range(
            "descriptor_timeout_ms",
            self.descriptor_timeout_ms.into(),
            1,
            TIMEOUT_MAX_MS,
        )?;
        check_range(
            "init_timeout_ms",
            self.init_timeout_ms.into(),
            1,
            TIMEOUT_MAX_MS,
        )
    }

    pub fn pump_timeout(&self) -> Duration {
        Duration::from_millis(self.pump_timeout_ms.into())
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms.into())
    }

    pub fn descriptor_timeout(&self) -> Duration {
        Duration::from_millis(self.descriptor_timeout_ms.into())
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms.into())
    }
}
