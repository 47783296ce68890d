//! Binary packet log writer.
//!
//! Serializes five entry kinds into a primary log file and maintains a
//! companion index file:
//!
//! - target and packet declarations, interning names into compact
//!   indices assigned sequentially per file;
//! - raw and JSON packet entries referencing those indices;
//! - one trailing offset marker carrying the last upstream stream
//!   checkpoint seen before the file closed.
//!
//! Name tables reset at the start of every file, so each file is
//! self-describing: a target is declared exactly once per file before
//! any packet referencing it, and a packet declaration precedes its
//! first packet entry. The index file records
//! `(length, flags, packet index, time, byte offset)` per packet entry,
//! with the file's declarations repeated in a footer for tooling that
//! wants random access without scanning the primary file.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use super::{ClosedSession, CycleTask, WriteError, WriterCore};
use crate::config::{CYCLE_CHECK_INTERVAL, WriterOptions};
use crate::critical::CriticalErrorSink;
use crate::format::{
    CMD_FLAG_MASK, FILE_HEADER, ID_FIXED_SIZE, ID_FLAG_MASK, INDEX_HEADER, INDEX_RECORD_SIZE,
    JSON_PACKET_ENTRY_TYPE_MASK, MAX_PACKET_INDEX, MAX_TARGET_INDEX,
    OFFSET_MARKER_ENTRY_TYPE_MASK, OFFSET_MARKER_SECONDARY_FIXED_SIZE,
    PACKET_DECLARATION_ENTRY_TYPE_MASK, PACKET_DECLARATION_SECONDARY_FIXED_SIZE,
    PACKET_SECONDARY_FIXED_SIZE, PRIMARY_FIXED_SIZE, RAW_PACKET_ENTRY_TYPE_MASK,
    STORED_FLAG_MASK, TARGET_DECLARATION_ENTRY_TYPE_MASK,
    TARGET_DECLARATION_SECONDARY_FIXED_SIZE,
};
use crate::packet::{Direction, IdentityToken, PacketEntry, PacketKind};
use crate::store::{PacketCatalog, RemoteArchiver, StreamTrimmer};

/// Writes command/telemetry packet streams to rotated binary log files.
///
/// Safe to share across producer threads; every operation serializes on
/// one internal mutex, so entries land in the primary file in the exact
/// order `write` calls complete and the index file matches that order.
pub struct PacketLogWriter {
    inner: Arc<Mutex<PacketWriterInner>>,
    cycle: Option<CycleTask>,
}

struct IndexFile {
    file: File,
    path: PathBuf,
}

struct PacketWriterInner {
    core: WriterCore,
    critical: Arc<dyn CriticalErrorSink>,
    catalog: Option<Arc<dyn PacketCatalog>>,
    index: Option<IndexFile>,
    target_indexes: HashMap<String, u16>,
    cmd_packets: HashMap<String, HashMap<String, u16>>,
    tlm_packets: HashMap<String, HashMap<String, u16>>,
    next_target_index: u32,
    next_packet_index: u32,
    target_dec_entries: Vec<Vec<u8>>,
    packet_dec_entries: Vec<Vec<u8>>,
}

impl PacketLogWriter {
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
        catalog: Option<Arc<dyn PacketCatalog>>,
        critical: Arc<dyn CriticalErrorSink>,
    ) -> Result<Self, WriteError> {
        let needs_cycle_task = options.rotation.needs_cycle_task();
        let core = WriterCore::new(options, ".bin", archiver, trimmer)?;
        let inner = Arc::new(Mutex::new(PacketWriterInner {
            core,
            critical,
            catalog,
            index: None,
            target_indexes: HashMap::new(),
            cmd_packets: HashMap::new(),
            tlm_packets: HashMap::new(),
            next_target_index: 0,
            next_packet_index: 0,
            target_dec_entries: Vec::new(),
            packet_dec_entries: Vec::new(),
        }));

        let cycle = if needs_cycle_task {
            let weak = Arc::downgrade(&inner);
            Some(CycleTask::spawn(
                "pktlog-packet-cycle",
                CYCLE_CHECK_INTERVAL,
                move || {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let mut inner = inner.lock().expect("packet log writer lock poisoned");
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

    /// Writes one packet entry.
    ///
    /// A no-op while logging is disabled. Declarations for the packet's
    /// target and name are emitted automatically the first time the
    /// triple is seen in the current file. If no file is open, or this
    /// entry would cross the size threshold, the current file is closed
    /// and a new one started first.
    ///
    /// # Errors
    ///
    /// The entry is lost on error but the call never panics the
    /// producer. [`WriteError::InvalidIdentityToken`] rejects the single
    /// call with no state change; every other error is logged and
    /// forwarded to the critical sink, and critical errors additionally
    /// disable the writer until [`start`](Self::start) is called again.
    pub fn write(&self, entry: &PacketEntry<'_>) -> Result<(), WriteError> {
        let mut inner = self.inner.lock().expect("packet log writer lock poisoned");
        // Logging may have been disabled since the caller decided to
        // write, so re-check under the mutex.
        if !inner.core.enabled() {
            return Ok(());
        }
        match inner.write_locked(entry) {
            Ok(()) => Ok(()),
            Err(error @ WriteError::InvalidIdentityToken { .. }) => Err(error),
            Err(error) => {
                tracing::error!(error = %error, "error writing packet log entry");
                if error.is_critical() {
                    inner.core.set_enabled(false);
                }
                inner.critical.critical(&error);
                Err(error)
            }
        }
    }

    /// Closes any open file and enables logging. Idempotent. New files
    /// are only created once packets are written again.
    pub fn start(&self) {
        let mut inner = self.inner.lock().expect("packet log writer lock poisoned");
        inner.close_file();
        inner.core.set_enabled(true);
    }

    /// Disables logging and closes the current file. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().expect("packet log writer lock poisoned");
        inner.core.set_enabled(false);
        inner.close_file();
    }

    /// Stops logging and terminates the background rotation task. No
    /// rotation check runs after this returns.
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
            .expect("packet log writer lock poisoned")
            .core
            .enabled()
    }

    /// Path of the in-progress log file, if one is open.
    #[must_use]
    pub fn filename(&self) -> Option<PathBuf> {
        self.inner
            .lock()
            .expect("packet log writer lock poisoned")
            .core
            .session()
            .map(|session| session.path().to_path_buf())
    }
}

impl PacketWriterInner {
    fn write_locked(&mut self, entry: &PacketEntry<'_>) -> Result<(), WriteError> {
        if let Some(id) = entry.id {
            if id.len() != ID_FIXED_SIZE {
                return Err(WriteError::InvalidIdentityToken {
                    got: id.len(),
                    expected: ID_FIXED_SIZE,
                });
            }
        }
        self.core.record_offset(entry.stream_offset);

        let entry_len =
            u64::from(PRIMARY_FIXED_SIZE + PACKET_SECONDARY_FIXED_SIZE) + entry.data.len() as u64;
        if self.core.session().is_none() || self.core.size_rotation_needed(entry_len) {
            self.start_new_file()?;
        }
        if self.core.session().is_some() {
            self.write_packet_entry(entry)?;
        }
        Ok(())
    }

    /// Closes the current file pair and opens a new one. Any failure
    /// here is an open failure: the caller disables logging.
    fn start_new_file(&mut self) -> Result<(), WriteError> {
        self.close_file();
        self.open_files().map_err(|error| match error {
            WriteError::Io { reason, .. } => WriteError::OpenFile { reason },
            other => other,
        })
    }

    fn open_files(&mut self) -> Result<(), WriteError> {
        {
            let session = self.core.open_session()?;
            session.write_all(FILE_HEADER)?;
        }

        let (mut index_file, index_path) = super::create_unique_file(
            self.core.local_dir(),
            Utc::now(),
            self.core.label(),
            ".idx",
        )?;
        index_file.write_all(INDEX_HEADER)?;
        tracing::info!(path = %index_path.display(), "index log file opened");
        self.index = Some(IndexFile {
            file: index_file,
            path: index_path,
        });

        // Indices never carry across files: every file is
        // self-describing from its own declarations.
        self.target_indexes.clear();
        self.cmd_packets.clear();
        self.tlm_packets.clear();
        self.target_dec_entries.clear();
        self.packet_dec_entries.clear();
        self.next_target_index = 0;
        self.next_packet_index = 0;
        Ok(())
    }

    /// Closes the current file pair, archiving both and trimming the
    /// upstream stream at the checkpoint lagging one file behind.
    /// Failures here are logged and never stop the writer.
    fn close_file(&mut self) {
        if self.core.session().is_some() {
            if let Err(error) = self.write_offset_marker() {
                tracing::warn!(error = %error, "failed to write offset marker before close");
            }
        }
        let closed = self.core.close_session();
        if let Some(index) = self.index.take() {
            match &closed {
                Some(closed) => {
                    if let Err(error) = self.finalize_index(index, closed) {
                        tracing::warn!(error = %error, "error closing index log file");
                    }
                }
                None => {
                    tracing::warn!("index file open without a log session, discarding");
                }
            }
        }
        if closed.is_some() {
            self.core.finish_close();
        }
    }

    fn write_offset_marker(&mut self) -> Result<(), WriteError> {
        let Some(checkpoint) = self.core.last_offset().map(str::to_owned) else {
            return Ok(());
        };
        let Some(session) = self.core.session_mut() else {
            return Ok(());
        };
        let entry = encode_offset_marker(checkpoint.as_bytes());
        session.write_all(&entry)
    }

    fn finalize_index(
        &mut self,
        mut index: IndexFile,
        closed: &ClosedSession,
    ) -> Result<(), WriteError> {
        self.write_index_footer(&mut index.file)?;
        index.file.sync_all()?;
        let IndexFile { file, path } = index;
        drop(file);
        tracing::info!(path = %path.display(), "index log file closed");
        let remote_key =
            self.core
                .remote_key(&closed.first_timestamp, &closed.last_timestamp, ".idx");
        self.core.archive(&path, &remote_key);
        Ok(())
    }

    /// Footer: target declaration count and entries, packet declaration
    /// count and entries, then the total footer length including its own
    /// four bytes so the footer can be parsed backwards from end of file.
    fn write_index_footer(&self, file: &mut File) -> Result<(), WriteError> {
        let mut footer_length: u32 = 4;
        file.write_all(&(self.target_dec_entries.len() as u16).to_be_bytes())?;
        footer_length += 2;
        for entry in &self.target_dec_entries {
            file.write_all(entry)?;
            footer_length += entry.len() as u32;
        }
        file.write_all(&(self.packet_dec_entries.len() as u16).to_be_bytes())?;
        footer_length += 2;
        for entry in &self.packet_dec_entries {
            file.write_all(entry)?;
            footer_length += entry.len() as u32;
        }
        file.write_all(&footer_length.to_be_bytes())?;
        Ok(())
    }

    fn write_packet_entry(&mut self, entry: &PacketEntry<'_>) -> Result<(), WriteError> {
        let packet_index = self.intern_packet(entry)?;

        let mut flags = match entry.kind {
            PacketKind::Raw => RAW_PACKET_ENTRY_TYPE_MASK,
            PacketKind::Json => JSON_PACKET_ENTRY_TYPE_MASK,
        };
        if entry.direction == Direction::Cmd {
            flags |= CMD_FLAG_MASK;
        }
        if entry.stored {
            flags |= STORED_FLAG_MASK;
        }
        let length = PRIMARY_FIXED_SIZE + PACKET_SECONDARY_FIXED_SIZE + entry.data.len() as u32;

        let Some(session) = self.core.session_mut() else {
            return Ok(());
        };
        let file_offset = session.file_size();

        let mut prefix = [0u8; 16];
        prefix[0..4].copy_from_slice(&length.to_be_bytes());
        prefix[4..6].copy_from_slice(&flags.to_be_bytes());
        prefix[6..8].copy_from_slice(&packet_index.to_be_bytes());
        prefix[8..16].copy_from_slice(&entry.time_nsec.to_be_bytes());
        session.write_all(&prefix)?;
        session.write_all(entry.data)?;
        session.observe_time(entry.time_nsec);

        if let Some(index) = self.index.as_mut() {
            let mut record = [0u8; INDEX_RECORD_SIZE];
            record[0..16].copy_from_slice(&prefix);
            record[16..24].copy_from_slice(&file_offset.to_be_bytes());
            index.file.write_all(&record)?;
        }
        Ok(())
    }

    /// Looks up or assigns the index for a (direction, target, packet)
    /// triple, emitting declaration entries on first sight.
    fn intern_packet(&mut self, entry: &PacketEntry<'_>) -> Result<u16, WriteError> {
        let table = match entry.direction {
            Direction::Cmd => &self.cmd_packets,
            Direction::Tlm => &self.tlm_packets,
        };
        if let Some(index) = table
            .get(entry.target_name)
            .and_then(|packets| packets.get(entry.packet_name))
        {
            return Ok(*index);
        }

        // The target is declared once per file by name, shared by the
        // command and telemetry packets under it.
        let target_index = match self.target_indexes.get(entry.target_name) {
            Some(index) => *index,
            None => self.declare_target(entry.target_name)?,
        };

        if self.next_packet_index > u32::from(MAX_PACKET_INDEX) {
            return Err(WriteError::PacketIndexOverflow {
                limit: MAX_PACKET_INDEX,
            });
        }
        let packet_index = self.next_packet_index as u16;

        let token: Option<IdentityToken> = entry
            .id
            .and_then(|id| IdentityToken::try_from(id).ok())
            .or_else(|| {
                self.catalog.as_ref().and_then(|catalog| {
                    catalog.packet_id(entry.direction, entry.target_name, entry.packet_name)
                })
            });
        let declaration = encode_packet_declaration(
            target_index,
            entry.packet_name,
            entry.direction,
            token.as_ref(),
        );
        self.append_declaration(&declaration)?;
        self.packet_dec_entries.push(declaration);
        self.next_packet_index += 1;

        let table = match entry.direction {
            Direction::Cmd => &mut self.cmd_packets,
            Direction::Tlm => &mut self.tlm_packets,
        };
        table
            .entry(entry.target_name.to_owned())
            .or_default()
            .insert(entry.packet_name.to_owned(), packet_index);
        tracing::debug!(
            target = entry.target_name,
            packet = entry.packet_name,
            direction = %entry.direction,
            index = packet_index,
            "packet declared"
        );
        Ok(packet_index)
    }

    fn declare_target(&mut self, target_name: &str) -> Result<u16, WriteError> {
        if self.next_target_index > u32::from(MAX_TARGET_INDEX) {
            return Err(WriteError::TargetIndexOverflow {
                limit: MAX_TARGET_INDEX,
            });
        }
        let target_index = self.next_target_index as u16;

        // Identity lookup is best effort; an absent catalog or unknown
        // target simply omits the token.
        let token = self
            .catalog
            .as_ref()
            .and_then(|catalog| catalog.target_id(target_name));
        let declaration = encode_target_declaration(target_name, token.as_ref());
        self.append_declaration(&declaration)?;
        self.target_dec_entries.push(declaration);
        self.target_indexes
            .insert(target_name.to_owned(), target_index);
        self.next_target_index += 1;

        match token {
            Some(token) => tracing::debug!(
                target = target_name,
                id = %hex::encode(token),
                index = target_index,
                "target declared"
            ),
            None => tracing::debug!(target = target_name, index = target_index, "target declared"),
        }
        Ok(target_index)
    }

    fn append_declaration(&mut self, declaration: &[u8]) -> Result<(), WriteError> {
        let Some(session) = self.core.session_mut() else {
            return Ok(());
        };
        session.write_all(declaration)
    }
}

fn encode_target_declaration(target_name: &str, id: Option<&IdentityToken>) -> Vec<u8> {
    let mut length = PRIMARY_FIXED_SIZE
        + TARGET_DECLARATION_SECONDARY_FIXED_SIZE
        + target_name.len() as u32;
    let mut flags = TARGET_DECLARATION_ENTRY_TYPE_MASK;
    if id.is_some() {
        length += ID_FIXED_SIZE as u32;
        flags |= ID_FLAG_MASK;
    }
    let mut entry = Vec::with_capacity(length as usize);
    entry.extend_from_slice(&length.to_be_bytes());
    entry.extend_from_slice(&flags.to_be_bytes());
    entry.extend_from_slice(target_name.as_bytes());
    if let Some(id) = id {
        entry.extend_from_slice(id);
    }
    entry
}

fn encode_packet_declaration(
    target_index: u16,
    packet_name: &str,
    direction: Direction,
    id: Option<&IdentityToken>,
) -> Vec<u8> {
    let mut length = PRIMARY_FIXED_SIZE
        + PACKET_DECLARATION_SECONDARY_FIXED_SIZE
        + packet_name.len() as u32;
    let mut flags = PACKET_DECLARATION_ENTRY_TYPE_MASK;
    if direction == Direction::Cmd {
        flags |= CMD_FLAG_MASK;
    }
    if id.is_some() {
        length += ID_FIXED_SIZE as u32;
        flags |= ID_FLAG_MASK;
    }
    let mut entry = Vec::with_capacity(length as usize);
    entry.extend_from_slice(&length.to_be_bytes());
    entry.extend_from_slice(&flags.to_be_bytes());
    entry.extend_from_slice(&target_index.to_be_bytes());
    entry.extend_from_slice(packet_name.as_bytes());
    if let Some(id) = id {
        entry.extend_from_slice(id);
    }
    entry
}

fn encode_offset_marker(checkpoint: &[u8]) -> Vec<u8> {
    let length =
        PRIMARY_FIXED_SIZE + OFFSET_MARKER_SECONDARY_FIXED_SIZE + checkpoint.len() as u32;
    let flags = OFFSET_MARKER_ENTRY_TYPE_MASK;
    let mut entry = Vec::with_capacity(length as usize);
    entry.extend_from_slice(&length.to_be_bytes());
    entry.extend_from_slice(&flags.to_be_bytes());
    entry.extend_from_slice(checkpoint);
    entry
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;
    use crate::config::RotationConfig;
    use crate::format::{ENTRY_TYPE_MASK, HEADER_LENGTH};
    use crate::store::{ArchiveError, TrimError};

    #[derive(Default)]
    struct RecordingArchiver {
        calls: Mutex<Vec<(PathBuf, String)>>,
    }

    impl RemoteArchiver for RecordingArchiver {
        fn archive(&self, local_path: &Path, remote_key: &str) -> Result<(), ArchiveError> {
            self.calls
                .lock()
                .expect("archiver lock poisoned")
                .push((local_path.to_path_buf(), remote_key.to_owned()));
            Ok(())
        }
    }

    impl RecordingArchiver {
        fn keys(&self) -> Vec<String> {
            self.calls
                .lock()
                .expect("archiver lock poisoned")
                .iter()
                .map(|(_, key)| key.clone())
                .collect()
        }

        fn paths_with_extension(&self, extension: &str) -> Vec<PathBuf> {
            self.calls
                .lock()
                .expect("archiver lock poisoned")
                .iter()
                .filter(|(_, key)| key.ends_with(extension))
                .map(|(path, _)| path.clone())
                .collect()
        }
    }

    #[derive(Default)]
    struct RecordingTrimmer {
        calls: Mutex<Vec<(String, String)>>,
    }

    impl StreamTrimmer for RecordingTrimmer {
        fn trim(&self, topic: &str, checkpoint: &str) -> Result<(), TrimError> {
            self.calls
                .lock()
                .expect("trimmer lock poisoned")
                .push((topic.to_owned(), checkpoint.to_owned()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        errors: Mutex<Vec<WriteError>>,
    }

    impl CriticalErrorSink for RecordingSink {
        fn critical(&self, error: &WriteError) {
            self.errors
                .lock()
                .expect("sink lock poisoned")
                .push(error.clone());
        }
    }

    fn tlm_entry<'a>(
        target_name: &'a str,
        packet_name: &'a str,
        time_nsec: u64,
        data: &'a [u8],
    ) -> PacketEntry<'a> {
        PacketEntry {
            kind: PacketKind::Raw,
            direction: Direction::Tlm,
            target_name,
            packet_name,
            time_nsec,
            stored: false,
            data,
            id: None,
            stream_offset: None,
        }
    }

    struct Fixture {
        writer: PacketLogWriter,
        archiver: Arc<RecordingArchiver>,
        trimmer: Arc<RecordingTrimmer>,
        sink: Arc<RecordingSink>,
        _dir: TempDir,
    }

    fn fixture(rotation: RotationConfig, topic: Option<&str>) -> Fixture {
        let dir = TempDir::new().expect("failed to create temp dir");
        let archiver = Arc::new(RecordingArchiver::default());
        let trimmer = Arc::new(RecordingTrimmer::default());
        let sink = Arc::new(RecordingSink::default());
        let options = WriterOptions {
            stream_topic: topic.map(str::to_owned),
            rotation,
            ..WriterOptions::new("test", dir.path(), "logs/test")
        };
        let writer = PacketLogWriter::new(
            options,
            Arc::clone(&archiver) as Arc<dyn RemoteArchiver>,
            Some(Arc::clone(&trimmer) as Arc<dyn StreamTrimmer>),
            None,
            Arc::clone(&sink) as Arc<dyn CriticalErrorSink>,
        )
        .expect("failed to create writer");
        Fixture {
            writer,
            archiver,
            trimmer,
            sink,
            _dir: dir,
        }
    }

    /// Splits a log file into (flags, body) pairs, validating framing.
    fn parse_entries(bytes: &[u8]) -> Vec<(u16, Vec<u8>)> {
        assert_eq!(&bytes[..HEADER_LENGTH], FILE_HEADER, "bad file header");
        let mut entries = Vec::new();
        let mut pos = HEADER_LENGTH;
        while pos < bytes.len() {
            let length =
                u32::from_be_bytes(bytes[pos..pos + 4].try_into().expect("length slice")) as usize;
            assert!(length >= 6, "entry length below framing size");
            assert!(pos + length <= bytes.len(), "entry overruns file");
            let flags =
                u16::from_be_bytes(bytes[pos + 4..pos + 6].try_into().expect("flags slice"));
            entries.push((flags, bytes[pos + 6..pos + length].to_vec()));
            pos += length;
        }
        entries
    }

    #[test]
    fn test_single_packet_file_layout() {
        let mut fx = fixture(RotationConfig::default(), None);
        fx.writer
            .write(&tlm_entry("INST", "HEALTH_STATUS", 1_000, &[0xAA, 0xBB]))
            .expect("failed to write");
        let filename = fx.writer.filename().expect("file should be open");
        fx.writer.shutdown();

        let bytes = std::fs::read(&filename).expect("failed to read log file");
        let entries = parse_entries(&bytes);
        assert_eq!(entries.len(), 3);

        let (flags, body) = &entries[0];
        assert_eq!(flags & ENTRY_TYPE_MASK, TARGET_DECLARATION_ENTRY_TYPE_MASK);
        assert_eq!(body.as_slice(), b"INST");

        let (flags, body) = &entries[1];
        assert_eq!(flags & ENTRY_TYPE_MASK, PACKET_DECLARATION_ENTRY_TYPE_MASK);
        assert_eq!(flags & CMD_FLAG_MASK, 0);
        assert_eq!(u16::from_be_bytes([body[0], body[1]]), 0);
        assert_eq!(&body[2..], b"HEALTH_STATUS");

        let (flags, body) = &entries[2];
        assert_eq!(flags & ENTRY_TYPE_MASK, RAW_PACKET_ENTRY_TYPE_MASK);
        assert_eq!(u16::from_be_bytes([body[0], body[1]]), 0);
        let time = u64::from_be_bytes(body[2..10].try_into().expect("time slice"));
        assert_eq!(time, 1_000);
        assert_eq!(&body[10..], &[0xAA, 0xBB]);

        // Both files archived under the same first/last stamp.
        let keys = fx.archiver.keys();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].ends_with("__test.bin"), "unexpected key {}", keys[0]);
        assert!(keys[1].ends_with("__test.idx"), "unexpected key {}", keys[1]);
    }

    #[test]
    fn test_target_declared_once_across_directions() {
        let mut fx = fixture(RotationConfig::default(), None);
        fx.writer
            .write(&tlm_entry("INST", "HEALTH_STATUS", 1_000, &[0x01, 0x02]))
            .expect("failed to write");
        fx.writer
            .write(&PacketEntry {
                direction: Direction::Cmd,
                packet_name: "ABORT",
                time_nsec: 2_000,
                data: &[],
                ..tlm_entry("INST", "ABORT", 2_000, &[])
            })
            .expect("failed to write");
        let filename = fx.writer.filename().expect("file should be open");
        fx.writer.shutdown();

        let bytes = std::fs::read(&filename).expect("failed to read log file");
        let entries = parse_entries(&bytes);
        let target_decls: Vec<_> = entries
            .iter()
            .filter(|(flags, _)| flags & ENTRY_TYPE_MASK == TARGET_DECLARATION_ENTRY_TYPE_MASK)
            .collect();
        let packet_decls: Vec<_> = entries
            .iter()
            .filter(|(flags, _)| flags & ENTRY_TYPE_MASK == PACKET_DECLARATION_ENTRY_TYPE_MASK)
            .collect();
        assert_eq!(target_decls.len(), 1, "one declaration per target name");
        assert_eq!(packet_decls.len(), 2);
        // HEALTH_STATUS took index 0, ABORT index 1, both under target 0.
        assert_eq!(&packet_decls[0].1[2..], b"HEALTH_STATUS");
        assert_eq!(&packet_decls[1].1[2..], b"ABORT");
        assert_ne!(packet_decls[0].0 & CMD_FLAG_MASK, CMD_FLAG_MASK);
        assert_eq!(packet_decls[1].0 & CMD_FLAG_MASK, CMD_FLAG_MASK);
        assert_eq!(
            u16::from_be_bytes([packet_decls[1].1[0], packet_decls[1].1[1]]),
            0
        );
    }

    #[test]
    fn test_repeated_packets_reuse_declarations() {
        let mut fx = fixture(RotationConfig::default(), None);
        for time in [1_000, 2_000, 3_000] {
            fx.writer
                .write(&tlm_entry("INST", "HEALTH_STATUS", time, &[0x01]))
                .expect("failed to write");
        }
        let filename = fx.writer.filename().expect("file should be open");
        fx.writer.shutdown();

        let bytes = std::fs::read(&filename).expect("failed to read log file");
        let entries = parse_entries(&bytes);
        let packet_count = entries
            .iter()
            .filter(|(flags, _)| flags & ENTRY_TYPE_MASK == RAW_PACKET_ENTRY_TYPE_MASK)
            .count();
        let decl_count = entries
            .iter()
            .filter(|(flags, _)| flags & ENTRY_TYPE_MASK == PACKET_DECLARATION_ENTRY_TYPE_MASK)
            .count();
        assert_eq!(packet_count, 3);
        assert_eq!(decl_count, 1);
    }

    #[test]
    fn test_offset_marker_written_on_close() {
        let mut fx = fixture(RotationConfig::default(), None);
        fx.writer
            .write(&PacketEntry {
                stream_offset: Some("1234-5"),
                ..tlm_entry("INST", "HEALTH_STATUS", 1_000, &[0x01])
            })
            .expect("failed to write");
        let filename = fx.writer.filename().expect("file should be open");
        fx.writer.shutdown();

        let bytes = std::fs::read(&filename).expect("failed to read log file");
        let entries = parse_entries(&bytes);
        let (flags, body) = entries.last().expect("file has entries");
        assert_eq!(flags & ENTRY_TYPE_MASK, OFFSET_MARKER_ENTRY_TYPE_MASK);
        assert_eq!(body.as_slice(), b"1234-5");
    }

    #[test]
    fn test_disabled_writer_drops_writes() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let archiver = Arc::new(RecordingArchiver::default());
        let options = WriterOptions {
            logging_enabled: false,
            ..WriterOptions::new("test", dir.path(), "logs/test")
        };
        let mut writer = PacketLogWriter::new(
            options,
            Arc::clone(&archiver) as Arc<dyn RemoteArchiver>,
            None,
            None,
            Arc::new(RecordingSink::default()),
        )
        .expect("failed to create writer");

        writer
            .write(&tlm_entry("INST", "HEALTH_STATUS", 1_000, &[0x01]))
            .expect("disabled write must be a silent no-op");
        assert!(writer.filename().is_none());
        assert_eq!(
            std::fs::read_dir(dir.path())
                .expect("failed to read dir")
                .count(),
            0
        );
        writer.shutdown();
    }

    #[test]
    fn test_invalid_identity_token_rejects_call_without_state_change() {
        let mut fx = fixture(RotationConfig::default(), None);
        let result = fx.writer.write(&PacketEntry {
            id: Some(&[0x01, 0x02, 0x03]),
            ..tlm_entry("INST", "HEALTH_STATUS", 1_000, &[0x01])
        });
        assert_eq!(
            result,
            Err(WriteError::InvalidIdentityToken {
                got: 3,
                expected: ID_FIXED_SIZE,
            })
        );
        // No file was opened, logging stays enabled, nothing hit the
        // critical channel.
        assert!(fx.writer.filename().is_none());
        assert!(fx.writer.logging_enabled());
        assert!(fx.sink.errors.lock().expect("sink lock poisoned").is_empty());
        fx.writer.shutdown();
    }

    #[test]
    fn test_size_rotation_never_splits_an_entry() {
        // Header 8 + INST decl 10 + packet decl 21 + two 117-byte
        // entries = 273 bytes. A third entry would cross 300, so it must
        // land whole in a second file.
        let mut fx = fixture(
            RotationConfig {
                cycle_size: Some(300),
                ..RotationConfig::default()
            },
            None,
        );
        let payload = [0u8; 101];
        for time in [1_000, 2_000, 3_000] {
            fx.writer
                .write(&tlm_entry("INST", "HEALTH_STATUS", time, &payload))
                .expect("failed to write");
        }
        fx.writer.shutdown();

        let logs = fx.archiver.paths_with_extension(".bin");
        assert_eq!(logs.len(), 2, "exactly one rotation");
        let first = std::fs::read(&logs[0]).expect("failed to read first log");
        let second = std::fs::read(&logs[1]).expect("failed to read second log");
        let first_packets = parse_entries(&first)
            .iter()
            .filter(|(flags, _)| flags & ENTRY_TYPE_MASK == RAW_PACKET_ENTRY_TYPE_MASK)
            .count();
        let second_packets = parse_entries(&second)
            .iter()
            .filter(|(flags, _)| flags & ENTRY_TYPE_MASK == RAW_PACKET_ENTRY_TYPE_MASK)
            .count();
        assert_eq!(first_packets, 2);
        assert_eq!(second_packets, 1);
    }

    #[test]
    fn test_trim_lags_one_file_behind() {
        let fx = fixture(RotationConfig::default(), Some("TLM__PACKETS"));
        let mut writer = fx.writer;

        writer
            .write(&PacketEntry {
                stream_offset: Some("100-0"),
                ..tlm_entry("INST", "HEALTH_STATUS", 1_000, &[0x01])
            })
            .expect("failed to write");
        writer.start(); // close #1: no prior checkpoint, nothing trimmed

        writer
            .write(&PacketEntry {
                stream_offset: Some("200-0"),
                ..tlm_entry("INST", "HEALTH_STATUS", 2_000, &[0x02])
            })
            .expect("failed to write");
        writer.start(); // close #2: trims the checkpoint of file #1

        writer
            .write(&PacketEntry {
                stream_offset: Some("300-0"),
                ..tlm_entry("INST", "HEALTH_STATUS", 3_000, &[0x03])
            })
            .expect("failed to write");
        writer.shutdown(); // close #3: trims the checkpoint of file #2

        let calls = fx.trimmer.calls.lock().expect("trimmer lock poisoned");
        let checkpoints: Vec<&str> = calls.iter().map(|(_, c)| c.as_str()).collect();
        assert_eq!(checkpoints, ["100-0", "200-0"]);
        assert!(calls.iter().all(|(topic, _)| topic == "TLM__PACKETS"));
    }

    #[test]
    fn test_packet_index_overflow_disables_writer() {
        let mut fx = fixture(RotationConfig::default(), None);
        let limit = u32::from(MAX_PACKET_INDEX) + 1;
        for i in 0..limit {
            let name = format!("P{i}");
            fx.writer
                .write(&tlm_entry("INST", &name, 1_000, &[]))
                .expect("writes below the index limit must succeed");
        }
        let result = fx.writer.write(&tlm_entry("INST", "ONE_TOO_MANY", 1_000, &[]));
        assert_eq!(
            result,
            Err(WriteError::PacketIndexOverflow {
                limit: MAX_PACKET_INDEX,
            })
        );
        assert!(!fx.writer.logging_enabled(), "overflow disables the writer");
        let errors = fx.sink.errors.lock().expect("sink lock poisoned");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_critical());
        drop(errors);

        // Disabled writer silently drops further writes.
        fx.writer
            .write(&tlm_entry("INST", "AFTER", 1_000, &[]))
            .expect("disabled write must be a silent no-op");
        fx.writer.shutdown();
    }

    #[test]
    fn test_stop_and_start_are_idempotent() {
        let mut fx = fixture(RotationConfig::default(), None);
        fx.writer
            .write(&tlm_entry("INST", "HEALTH_STATUS", 1_000, &[0x01]))
            .expect("failed to write");

        fx.writer.stop();
        fx.writer.stop();
        assert!(!fx.writer.logging_enabled());
        assert!(fx.writer.filename().is_none());
        // One close, two archived files, no extras from the second stop.
        assert_eq!(fx.archiver.keys().len(), 2);

        fx.writer.start();
        fx.writer.start();
        assert!(fx.writer.logging_enabled());
        assert!(fx.writer.filename().is_none(), "start does not open a file");
        fx.writer.shutdown();
    }

    #[test]
    fn test_index_file_records_and_footer() {
        let mut fx = fixture(RotationConfig::default(), None);
        fx.writer
            .write(&tlm_entry("INST", "HEALTH_STATUS", 1_000, &[0x01, 0x02]))
            .expect("failed to write");
        fx.writer
            .write(&tlm_entry("INST", "HEALTH_STATUS", 2_000, &[0x03, 0x04]))
            .expect("failed to write");
        fx.writer.shutdown();

        let index_paths = fx.archiver.paths_with_extension(".idx");
        assert_eq!(index_paths.len(), 1);
        let bytes = std::fs::read(&index_paths[0]).expect("failed to read index file");
        assert_eq!(&bytes[..HEADER_LENGTH], INDEX_HEADER);

        // Two fixed-size records follow the header.
        let records = &bytes[HEADER_LENGTH..HEADER_LENGTH + 2 * INDEX_RECORD_SIZE];
        let first_offset =
            u64::from_be_bytes(records[16..24].try_into().expect("offset slice"));
        let second_offset =
            u64::from_be_bytes(records[40..48].try_into().expect("offset slice"));
        // First packet entry follows the header and both declarations:
        // 8 + 10 + 21 bytes into the file.
        assert_eq!(first_offset, 39);
        let first_length =
            u32::from_be_bytes(records[0..4].try_into().expect("length slice"));
        assert_eq!(u64::from(first_length), second_offset - first_offset);

        // Footer ends with its own length, parseable backwards.
        let footer_length = u32::from_be_bytes(
            bytes[bytes.len() - 4..].try_into().expect("footer length"),
        ) as usize;
        let footer = &bytes[bytes.len() - footer_length..];
        let target_count = u16::from_be_bytes([footer[0], footer[1]]);
        assert_eq!(target_count, 1);
    }

    #[test]
    fn test_catalog_tokens_attached_to_declarations() {
        struct TokenCatalog;

        impl PacketCatalog for TokenCatalog {
            fn identify(
                &self,
                _direction: Direction,
                _data: &[u8],
            ) -> Option<crate::store::PacketDefinition> {
                None
            }

            fn lookup(
                &self,
                direction: Direction,
                target_name: &str,
                packet_name: &str,
            ) -> Result<crate::store::PacketDefinition, crate::store::CatalogError> {
                Err(crate::store::CatalogError::NotFound {
                    direction,
                    target_name: target_name.to_owned(),
                    packet_name: packet_name.to_owned(),
                })
            }

            fn target_id(&self, _target_name: &str) -> Option<IdentityToken> {
                Some([0x11; ID_FIXED_SIZE])
            }
        }

        let dir = TempDir::new().expect("failed to create temp dir");
        let mut writer = PacketLogWriter::new(
            WriterOptions::new("test", dir.path(), "logs/test"),
            Arc::new(RecordingArchiver::default()),
            None,
            Some(Arc::new(TokenCatalog)),
            Arc::new(RecordingSink::default()),
        )
        .expect("failed to create writer");

        writer
            .write(&tlm_entry("INST", "HEALTH_STATUS", 1_000, &[0x01]))
            .expect("failed to write");
        let filename = writer.filename().expect("file should be open");
        writer.shutdown();

        let bytes = std::fs::read(&filename).expect("failed to read log file");
        let entries = parse_entries(&bytes);
        let (flags, body) = &entries[0];
        assert_eq!(flags & ENTRY_TYPE_MASK, TARGET_DECLARATION_ENTRY_TYPE_MASK);
        assert_eq!(flags & ID_FLAG_MASK, ID_FLAG_MASK);
        assert_eq!(&body[..4], b"INST");
        assert_eq!(&body[4..], &[0x11; ID_FIXED_SIZE]);
    }
}
