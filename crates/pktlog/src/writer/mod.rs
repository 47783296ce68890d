//! Log file rotation machinery shared by the packet and text writers.
//!
//! Each writer owns exactly one open [`LogSession`] at a time, guarded by
//! a single mutex together with every other piece of mutable writer
//! state. Rotation is decided in two places:
//!
//! - inline in `write`, for size thresholds, using the exact encoded
//!   entry length so no entry is ever split across two files;
//! - by one background cycle task per writer, on a fixed 2-second
//!   cadence, for elapsed-time and wall-clock cutover rules.
//!
//! Both paths acquire the writer mutex, so a rotation and an in-flight
//! write are always serialized. Opening a new file is critical: a failure
//! disables logging and is reported through the registered
//! [`CriticalErrorSink`](crate::critical::CriticalErrorSink). Closing,
//! archiving, and trimming are not: failures are logged and state is
//! still cleared so the next rotation proceeds cleanly.

mod packet;
mod text;

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Timelike as _, Utc};

pub use packet::PacketLogWriter;
pub use text::TextLogWriter;

use crate::config::{ConfigError, RotationConfig};
use crate::packet::format_timestamp;
use crate::store::{RemoteArchiver, StreamTrimmer};

/// Errors from the write path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// The writer configuration failed validation.
    #[error("invalid writer configuration: {0}")]
    Config(#[from] ConfigError),

    /// A new log file could not be opened. Critical: the writer disables
    /// itself until restarted.
    #[error("failed to open new log file: {reason}")]
    OpenFile {
        /// Description of the failure.
        reason: String,
    },

    /// I/O error while appending to an open file. The entry is lost; the
    /// writer keeps running.
    #[error("log file I/O error ({kind:?}): {reason}")]
    Io {
        /// The I/O error kind for programmatic matching.
        kind: std::io::ErrorKind,
        /// Description of the failure.
        reason: String,
    },

    /// More distinct targets were declared in one file than the format
    /// can index. Critical.
    #[error("target index overflow: more than {limit} distinct targets in one file")]
    TargetIndexOverflow {
        /// The highest representable target index.
        limit: u16,
    },

    /// More distinct packets were declared in one file than the format
    /// can index. Critical.
    #[error("packet index overflow: more than {limit} distinct packets in one file")]
    PacketIndexOverflow {
        /// The highest representable packet index.
        limit: u16,
    },

    /// The caller supplied an identity token of the wrong length. The
    /// single call is rejected with no state change.
    #[error("identity token must be {expected} bytes, got {got}")]
    InvalidIdentityToken {
        /// The supplied token length.
        got: usize,
        /// The required token length.
        expected: usize,
    },
}

impl From<std::io::Error> for WriteError {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            kind: error.kind(),
            reason: error.to_string(),
        }
    }
}

impl WriteError {
    /// Whether this error disables the writer ("fail safe by stopping").
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::OpenFile { .. }
                | Self::TargetIndexOverflow { .. }
                | Self::PacketIndexOverflow { .. }
        )
    }
}

// =============================================================================
// Sleeper and cycle task
// =============================================================================

/// A cancellable sleep primitive for the background rotation check.
pub(crate) struct Sleeper {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

impl Sleeper {
    pub(crate) fn new() -> Self {
        Self {
            cancelled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Sleeps for `timeout` unless cancelled. Returns true if cancelled,
    /// immediately or during the sleep.
    pub(crate) fn sleep(&self, timeout: Duration) -> bool {
        let cancelled = self.cancelled.lock().expect("sleeper lock poisoned");
        let (cancelled, _timeout) = self
            .condvar
            .wait_timeout_while(cancelled, timeout, |cancelled| !*cancelled)
            .expect("sleeper lock poisoned");
        *cancelled
    }

    /// Wakes any current sleep and makes all future sleeps return
    /// immediately.
    pub(crate) fn cancel(&self) {
        let mut cancelled = self.cancelled.lock().expect("sleeper lock poisoned");
        *cancelled = true;
        self.condvar.notify_all();
    }
}

/// Background task running a rotation check on a fixed interval for the
/// lifetime of a writer. Cancelled and joined on shutdown.
pub(crate) struct CycleTask {
    sleeper: Arc<Sleeper>,
    handle: Option<JoinHandle<()>>,
}

impl CycleTask {
    pub(crate) fn spawn<F>(name: &str, interval: Duration, check: F) -> Result<Self, WriteError>
    where
        F: Fn() + Send + 'static,
    {
        let sleeper = Arc::new(Sleeper::new());
        let task_sleeper = Arc::clone(&sleeper);
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || loop {
                check();
                if task_sleeper.sleep(interval) {
                    break;
                }
            })?;
        Ok(Self {
            sleeper,
            handle: Some(handle),
        })
    }

    /// Cancels the sleeper and joins the task. No rotation check runs
    /// after this returns.
    pub(crate) fn shutdown(&mut self) {
        self.sleeper.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("log cycle task panicked");
            }
        }
    }
}

impl Drop for CycleTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// LogSession
// =============================================================================

/// One open log file: its handle, running size, start wall-clock time,
/// and the span of packet timestamps observed so far.
pub(crate) struct LogSession {
    file: File,
    path: PathBuf,
    file_size: u64,
    start_time: DateTime<Utc>,
    first_time: Option<u64>,
    last_time: Option<u64>,
}

impl LogSession {
    /// Creates a fresh spool file under `dir` named from the current
    /// wall-clock time and `label`, de-collided with an attempt counter.
    fn create(dir: &Path, label: &str, extension: &str) -> Result<Self, WriteError> {
        std::fs::create_dir_all(dir)?;
        let start_time = Utc::now();
        let (file, path) = create_unique_file(dir, start_time, label, extension)?;
        Ok(Self {
            file,
            path,
            file_size: 0,
            start_time,
            first_time: None,
            last_time: None,
        })
    }

    /// Appends `bytes` and advances the size counter by exactly the
    /// bytes written.
    pub(crate) fn write_all(&mut self, bytes: &[u8]) -> Result<(), WriteError> {
        self.file.write_all(bytes)?;
        self.file_size += bytes.len() as u64;
        Ok(())
    }

    /// Folds a packet timestamp into the observed first/last span.
    pub(crate) fn observe_time(&mut self, time_nsec: u64) {
        if self.first_time.is_none_or(|first| time_nsec < first) {
            self.first_time = Some(time_nsec);
        }
        if self.last_time.is_none_or(|last| time_nsec > last) {
            self.last_time = Some(time_nsec);
        }
    }

    pub(crate) fn file_size(&self) -> u64 {
        self.file_size
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// Creates a file that does not already exist, appending an attempt
/// counter to the timestamped name on collision.
fn create_unique_file(
    dir: &Path,
    start_time: DateTime<Utc>,
    label: &str,
    extension: &str,
) -> Result<(File, PathBuf), WriteError> {
    let stamp = start_time.format("%Y%m%d%H%M%S%f");
    let mut attempt: u32 = 0;
    loop {
        let name = if attempt == 0 {
            format!("{stamp}__{label}{extension}")
        } else {
            format!("{stamp}__{label}_{attempt}{extension}")
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                attempt += 1;
            }
            Err(error) => return Err(error.into()),
        }
    }
}

// =============================================================================
// WriterCore
// =============================================================================

/// First/last packet timestamps of a closed file, rendered for archive
/// key construction. Falls back to the session start time for files that
/// never saw a packet.
pub(crate) struct ClosedSession {
    pub(crate) first_timestamp: String,
    pub(crate) last_timestamp: String,
}

/// Mutable rotation state shared by the packet and text writers. Always
/// accessed with the owning writer's mutex held.
pub(crate) struct WriterCore {
    label: String,
    local_dir: PathBuf,
    remote_prefix: String,
    extension: &'static str,
    rotation: RotationConfig,
    topic: Option<String>,
    enabled: bool,
    session: Option<LogSession>,
    last_offset: Option<String>,
    previous_file_offset: Option<String>,
    archiver: Arc<dyn RemoteArchiver>,
    trimmer: Option<Arc<dyn StreamTrimmer>>,
}

impl WriterCore {
    pub(crate) fn new(
        options: crate::config::WriterOptions,
        extension: &'static str,
        archiver: Arc<dyn RemoteArchiver>,
        trimmer: Option<Arc<dyn StreamTrimmer>>,
    ) -> Result<Self, WriteError> {
        options.rotation.validate()?;
        Ok(Self {
            label: options.label,
            local_dir: options.local_dir,
            remote_prefix: options.remote_prefix,
            extension,
            rotation: options.rotation,
            topic: options.stream_topic,
            enabled: options.logging_enabled,
            session: None,
            last_offset: None,
            previous_file_offset: None,
            archiver,
            trimmer,
        })
    }

    pub(crate) const fn enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn session(&self) -> Option<&LogSession> {
        self.session.as_ref()
    }

    pub(crate) fn session_mut(&mut self) -> Option<&mut LogSession> {
        self.session.as_mut()
    }

    pub(crate) fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    pub(crate) fn last_offset(&self) -> Option<&str> {
        self.last_offset.as_deref()
    }

    /// Records the upstream checkpoint of a packet about to be written.
    pub(crate) fn record_offset(&mut self, offset: Option<&str>) {
        if let Some(offset) = offset {
            self.last_offset = Some(offset.to_owned());
        }
    }

    /// Whether appending `entry_len` bytes would cross the size
    /// threshold of the open file.
    pub(crate) fn size_rotation_needed(&self, entry_len: u64) -> bool {
        match (&self.session, self.rotation.cycle_size) {
            (Some(session), Some(cycle_size)) => session.file_size + entry_len > cycle_size,
            _ => false,
        }
    }

    /// Whether a wall-clock rotation rule fires at `now` for the open
    /// file. Evaluated by the background cycle task with the writer
    /// mutex held.
    pub(crate) fn rotation_due(&self, now: DateTime<Utc>) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        if !self.enabled {
            return false;
        }
        let started = session.start_time;
        if let Some(cycle_time) = self.rotation.cycle_time {
            let elapsed = now.signed_duration_since(started);
            if elapsed.to_std().is_ok_and(|elapsed| elapsed > cycle_time) {
                return true;
            }
        }
        match (self.rotation.cycle_hour, self.rotation.cycle_minute) {
            // Daily cutover at hour:minute, unless the file already
            // started today.
            (Some(hour), Some(minute)) => {
                now.hour() == hour && now.minute() == minute && started.date_naive() != now.date_naive()
            }
            // Hourly cutover at the minute, unless the file already
            // started this hour.
            (None, Some(minute)) => now.minute() == minute && started.hour() != now.hour(),
            _ => false,
        }
    }

    /// Opens a new session. Critical path: the caller maps failures to
    /// [`WriteError::OpenFile`] and disables logging.
    pub(crate) fn open_session(&mut self) -> Result<&mut LogSession, WriteError> {
        let session = LogSession::create(&self.local_dir, &self.label, self.extension)?;
        tracing::info!(path = %session.path.display(), "log file opened");
        Ok(self.session.insert(session))
    }

    /// Closes and archives the current session, if any. Never fails:
    /// close and archive problems are logged and the session is cleared
    /// regardless so a later rotation can proceed.
    pub(crate) fn close_session(&mut self) -> Option<ClosedSession> {
        let session = self.session.take()?;
        let LogSession {
            file,
            path,
            file_size,
            start_time,
            first_time,
            last_time,
        } = session;

        if let Err(error) = file.sync_all() {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                "failed to sync log file before close"
            );
        }
        drop(file);
        tracing::info!(path = %path.display(), size = file_size, "log file closed");

        let fallback = start_time.format("%Y%m%d%H%M%S%f").to_string();
        let first_timestamp = first_time.map_or_else(|| fallback.clone(), format_timestamp);
        let last_timestamp = last_time.map_or_else(|| fallback.clone(), format_timestamp);
        let remote_key = self.remote_key(&first_timestamp, &last_timestamp, self.extension);
        self.archive(&path, &remote_key);

        Some(ClosedSession {
            first_timestamp,
            last_timestamp,
        })
    }

    /// Hands a closed file to the remote archiver. Archive failures are
    /// logged warnings, not errors: the local file remains in the spool
    /// directory for the operator.
    pub(crate) fn archive(&self, path: &Path, remote_key: &str) {
        match self.archiver.archive(path, remote_key) {
            Ok(()) => tracing::debug!(key = %remote_key, "log file archived"),
            Err(error) => {
                tracing::warn!(key = %remote_key, error = %error, "failed to archive log file");
            }
        }
    }

    /// Archive key for a closed file: `{prefix}/{date}/{first}__{last}__{label}{ext}`.
    pub(crate) fn remote_key(&self, first: &str, last: &str, extension: &str) -> String {
        let date = first.get(..8).unwrap_or(first);
        format!(
            "{}/{}/{}__{}__{}{}",
            self.remote_prefix, date, first, last, self.label, extension
        )
    }

    /// Finishes a close: trims the upstream stream at the checkpoint of
    /// the file closed before this one, then retires the just-closed
    /// file's checkpoint into that slot. The most recent checkpoint is
    /// never trimmed; the stream always retains at least one closed
    /// file's worth of data until the next close.
    pub(crate) fn finish_close(&mut self) {
        if let (Some(topic), Some(trimmer), Some(checkpoint)) =
            (&self.topic, &self.trimmer, &self.previous_file_offset)
        {
            match trimmer.trim(topic, checkpoint) {
                Ok(()) => tracing::debug!(topic = %topic, checkpoint = %checkpoint, "stream trimmed"),
                Err(error) => {
                    tracing::warn!(topic = %topic, error = %error, "failed to trim stream");
                }
            }
        }
        self.previous_file_offset = self.last_offset.clone();
    }
}
