//! Line-oriented text log writer for notifications and events.
//!
//! Shares the rotation machinery with the packet writer but writes
//! newline-delimited `timestamp<TAB>data` records with no index file.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use super::{CycleTask, WriteError, WriterCore};
use crate::config::{CYCLE_CHECK_INTERVAL, WriterOptions};
use crate::critical::CriticalErrorSink;
use crate::packet::format_timestamp;
use crate::store::{RemoteArchiver, StreamTrimmer};

/// Writes timestamped text records to rotated `.txt` log files.
pub struct TextLogWriter {
    inner: Arc<Mutex<TextWriterInner>>,
    cycle: Option<CycleTask>,
}

struct TextWriterInner {
    core: WriterCore,
    critical: Arc<dyn CriticalErrorSink>,
}

impl TextLogWriter {
    /// Creates a writer. The background rotation check task is spawned
    /// only when a wall-clock rotation rule is configured.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Config`] for an invalid rotation config and
    /// [`WriteError::Io`] if the rotation task cannot be spawned.
    pub fn new(
        options: WriterOptions,
        archiver: Arc<dyn RemoteArchiver>,
        trimmer: Option<Arc<dyn StreamTrimmer>>,
        critical: Arc<dyn CriticalErrorSink>,
    ) -> Result<Self, WriteError> {
        let needs_cycle_task = options.rotation.needs_cycle_task();
        let core = WriterCore::new(options, ".txt", archiver, trimmer)?;
        let inner = Arc::new(Mutex::new(TextWriterInner { core, critical }));

        let cycle = if needs_cycle_task {
            let weak = Arc::downgrade(&inner);
            Some(CycleTask::spawn(
                "pktlog-text-cycle",
                CYCLE_CHECK_INTERVAL,
                move || {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let mut inner = inner.lock().expect("text log writer lock poisoned");
                    if inner.core.rotation_due(Utc::now()) {
                        inner.close_file();
                    }
                },
            )?)
        } else {
            None
        };

        Ok(Self { inner, cycle })
    }

    /// Appends one `timestamp<TAB>data` line, rotating first if needed.
    ///
    /// # Errors
    ///
    /// Same policy as [`PacketLogWriter::write`](super::PacketLogWriter::write):
    /// errors are logged and forwarded to the critical sink, critical
    /// ones disable the writer, and the call never panics the producer.
    pub fn write(
        &self,
        time_nsec: u64,
        data: &str,
        stream_offset: Option<&str>,
    ) -> Result<(), WriteError> {
        let mut inner = self.inner.lock().expect("text log writer lock poisoned");
        if !inner.core.enabled() {
            return Ok(());
        }
        match inner.write_locked(time_nsec, data, stream_offset) {
            Ok(()) => Ok(()),
            Err(error) => {
                tracing::error!(error = %error, "error writing text log entry");
                if error.is_critical() {
                    inner.core.set_enabled(false);
                }
                inner.critical.critical(&error);
                Err(error)
            }
        }
    }

    /// Closes any open file and enables logging. Idempotent.
    pub fn start(&self) {
        let mut inner = self.inner.lock().expect("text log writer lock poisoned");
        inner.close_file();
        inner.core.set_enabled(true);
    }

    /// Disables logging and closes the current file. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().expect("text log writer lock poisoned");
        inner.core.set_enabled(false);
        inner.close_file();
    }

    /// Stops logging and terminates the background rotation task.
    pub fn shutdown(&mut self) {
        self.stop();
        if let Some(mut cycle) = self.cycle.take() {
            cycle.shutdown();
        }
    }

    /// Whether logging is currently enabled.
    #[must_use]
    pub fn logging_enabled(&self) -> bool {
        self.inner
            .lock()
            .expect("text log writer lock poisoned")
            .core
            .enabled()
    }

    /// Path of the in-progress log file, if one is open.
    #[must_use]
    pub fn filename(&self) -> Option<PathBuf> {
        self.inner
            .lock()
            .expect("text log writer lock poisoned")
            .core
            .session()
            .map(|session| session.path().to_path_buf())
    }
}

impl TextWriterInner {
    fn write_locked(
        &mut self,
        time_nsec: u64,
        data: &str,
        stream_offset: Option<&str>,
    ) -> Result<(), WriteError> {
        self.core.record_offset(stream_offset);
        let line = format!("{}\t{}\n", format_timestamp(time_nsec), data);
        if self.core.session().is_none() || self.core.size_rotation_needed(line.len() as u64) {
            self.start_new_file()?;
        }
        let Some(session) = self.core.session_mut() else {
            return Ok(());
        };
        session.write_all(line.as_bytes())?;
        session.observe_time(time_nsec);
        Ok(())
    }

    fn start_new_file(&mut self) -> Result<(), WriteError> {
        self.close_file();
        match self.core.open_session() {
            Ok(_session) => Ok(()),
            Err(WriteError::Io { reason, .. }) => Err(WriteError::OpenFile { reason }),
            Err(other) => Err(other),
        }
    }

    fn close_file(&mut self) {
        if self.core.close_session().is_some() {
            self.core.finish_close();
        }
    }
}
