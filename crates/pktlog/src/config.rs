//! Writer configuration: rotation policy and file placement.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Granularity of the background rotation check. Cycle times below this
/// cannot be honored and are rejected at construction.
pub const CYCLE_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Errors raised by configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// `cycle_time` is below the rotation check granularity.
    #[error("cycle_time must be at least {min:?}, got {got:?}")]
    CycleTimeTooSmall {
        /// The configured cycle time.
        got: Duration,
        /// The minimum allowed cycle time.
        min: Duration,
    },

    /// `cycle_hour` is not a valid hour of day.
    #[error("cycle_hour must be 0-23, got {got}")]
    CycleHourOutOfRange {
        /// The configured hour.
        got: u32,
    },

    /// `cycle_minute` is not a valid minute of hour.
    #[error("cycle_minute must be 0-59, got {got}")]
    CycleMinuteOutOfRange {
        /// The configured minute.
        got: u32,
    },

    /// `cycle_hour` was set without `cycle_minute`. A daily cutover needs
    /// both; hour alone never fires.
    #[error("cycle_hour requires cycle_minute to also be set")]
    CycleHourWithoutMinute,
}

/// When an open log file is closed and a new one started.
///
/// - `cycle_time`: elapsed wall-clock time since the file was opened.
/// - `cycle_size`: file size in bytes; checked against the exact encoded
///   entry length on every write so no entry is split across files.
/// - `cycle_hour` + `cycle_minute`: daily cutover at the given UTC time.
/// - `cycle_minute` alone: hourly cutover at the given minute.
///
/// Immutable after validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Elapsed-time rotation threshold.
    #[serde(default)]
    pub cycle_time: Option<Duration>,

    /// Size rotation threshold in bytes.
    #[serde(default = "default_cycle_size")]
    pub cycle_size: Option<u64>,

    /// Daily cutover hour (UTC, 0-23). Requires `cycle_minute`.
    #[serde(default)]
    pub cycle_hour: Option<u32>,

    /// Cutover minute (0-59). Daily with `cycle_hour`, hourly without.
    #[serde(default)]
    pub cycle_minute: Option<u32>,
}

fn default_cycle_size() -> Option<u64> {
    Some(1_000_000_000)
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            cycle_time: None,
            cycle_size: default_cycle_size(),
            cycle_hour: None,
            cycle_minute: None,
        }
    }
}

impl RotationConfig {
    /// Validates field ranges and combinations.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(cycle_time) = self.cycle_time {
            if cycle_time < CYCLE_CHECK_INTERVAL {
                return Err(ConfigError::CycleTimeTooSmall {
                    got: cycle_time,
                    min: CYCLE_CHECK_INTERVAL,
                });
            }
        }
        if let Some(hour) = self.cycle_hour {
            if hour > 23 {
                return Err(ConfigError::CycleHourOutOfRange { got: hour });
            }
            if self.cycle_minute.is_none() {
                return Err(ConfigError::CycleHourWithoutMinute);
            }
        }
        if let Some(minute) = self.cycle_minute {
            if minute > 59 {
                return Err(ConfigError::CycleMinuteOutOfRange { got: minute });
            }
        }
        Ok(())
    }

    /// Whether any wall-clock rule is configured, requiring the
    /// background rotation check task.
    #[must_use]
    pub const fn needs_cycle_task(&self) -> bool {
        self.cycle_time.is_some() || self.cycle_hour.is_some() || self.cycle_minute.is_some()
    }
}

/// Placement and behavior of one writer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterOptions {
    /// Label embedded in archive keys, e.g. the stream or microservice name.
    pub label: String,

    /// Local spool directory for in-progress log files.
    pub local_dir: PathBuf,

    /// Key prefix under which closed files are archived.
    pub remote_prefix: String,

    /// Whether logging starts enabled.
    #[serde(default = "default_true")]
    pub logging_enabled: bool,

    /// Upstream stream topic to trim as files are archived. Without a
    /// topic no trimming occurs.
    #[serde(default)]
    pub stream_topic: Option<String>,

    /// Rotation policy.
    #[serde(default)]
    pub rotation: RotationConfig,
}

fn default_true() -> bool {
    true
}

impl WriterOptions {
    /// Options with default rotation and logging enabled.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        local_dir: impl Into<PathBuf>,
        remote_prefix: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            local_dir: local_dir.into(),
            remote_prefix: remote_prefix.into(),
            logging_enabled: true,
            stream_topic: None,
            rotation: RotationConfig::default(),
        }
    }
}
