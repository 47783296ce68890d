//! Streaming decoder for binary packet log files.
//!
//! The reader validates the file header, then demultiplexes
//! length-framed entries in file order. Declaration entries rebuild the
//! per-file name tables and offset markers update the tracked upstream
//! checkpoint; both are consumed transparently, so callers of
//! [`PacketLogReader::read`] only ever see packet entries. The
//! companion index file is never consulted.
//!
//! A reader owns one file handle at a time and is not meant to be
//! shared across threads; use one reader per consuming thread.

use std::fs::File;
use std::io::{BufReader, Read as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::format::{
    CMD_FLAG_MASK, EntryType, FILE_HEADER, HEADER_LENGTH, ID_FIXED_SIZE, ID_FLAG_MASK,
    LEGACY_FILE_HEADER, PACKET_SECONDARY_FIXED_SIZE, PRIMARY_FIXED_SIZE, STORED_FLAG_MASK,
};
use crate::packet::{Direction, IdentityToken, LogPacket, PacketPayload, UNKNOWN_NAME};
use crate::store::PacketCatalog;

/// Upper bound on a single entry length. Lengths beyond this are treated
/// as corruption rather than allocated.
const MAX_ENTRY_LENGTH: u32 = 1_000_000_000;

/// Errors from the read path. Any error closes the reader's file handle
/// before propagating.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// I/O error reading the log file.
    #[error("log file I/O error ({kind:?}): {reason}")]
    Io {
        /// The I/O error kind for programmatic matching.
        kind: std::io::ErrorKind,
        /// Description of the failure.
        reason: String,
    },

    /// The file is shorter than the fixed header.
    #[error("failed to read the {HEADER_LENGTH}-byte packet log header")]
    TruncatedHeader,

    /// The file carries the retired version 1 header. There is no
    /// in-process migration path; convert the file offline.
    #[error("version 1 packet log files must be converted before reading")]
    LegacyHeader,

    /// The file does not start with a known packet log header.
    #[error("packet log header not found, got {found:?}")]
    ForeignHeader {
        /// The bytes found where the header was expected, lossily decoded.
        found: String,
    },

    /// An entry length smaller than its own framing.
    #[error("entry length {length} below the {PRIMARY_FIXED_SIZE}-byte framing size")]
    EntryTooShort {
        /// The decoded entry length.
        length: u32,
    },

    /// An entry length beyond the sanity bound, treated as corruption.
    #[error("entry length {length} exceeds the maximum of {max} bytes")]
    EntryTooLarge {
        /// The decoded entry length.
        length: u32,
        /// The maximum accepted entry length.
        max: u32,
    },

    /// The file ended inside an entry.
    #[error("entry truncated: expected {expected} more bytes")]
    TruncatedEntry {
        /// How many bytes the entry still required.
        expected: usize,
    },

    /// The entry-type bits do not name a known entry kind. Fatal:
    /// length framing alone cannot guarantee entry boundaries are still
    /// aligned after a corrupt type tag.
    #[error("invalid entry flags {flags:#06x}")]
    InvalidEntryFlags {
        /// The full flags word.
        flags: u16,
    },

    /// A packet declaration referenced an undeclared target index.
    #[error("packet declaration references unknown target index {index}")]
    UnknownTargetIndex {
        /// The referenced index.
        index: u16,
    },

    /// A packet entry referenced an undeclared packet index.
    #[error("packet entry references unknown packet index {index}")]
    UnknownPacketIndex {
        /// The referenced index.
        index: u16,
    },

    /// A packet entry's direction bit disagrees with its declaration.
    #[error("packet type mismatch: entry is {entry}, declaration is {declared}")]
    DirectionMismatch {
        /// Direction decoded from the packet entry.
        entry: Direction,
        /// Direction recorded by the declaration.
        declared: Direction,
    },

    /// A declared name is not valid UTF-8.
    #[error("declaration name is not valid UTF-8: {reason}")]
    InvalidName {
        /// Description of the decoding failure.
        reason: String,
    },

    /// A JSON packet payload is not valid UTF-8.
    #[error("JSON packet payload is not valid UTF-8: {reason}")]
    InvalidJsonText {
        /// Description of the decoding failure.
        reason: String,
    },
}

impl From<std::io::Error> for ReadError {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            kind: error.kind(),
            reason: error.to_string(),
        }
    }
}

/// A target declaration reconstructed from the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRecord {
    /// Declared target name.
    pub name: String,
    /// Identity token, when the declaration carried one.
    pub id: Option<IdentityToken>,
}

/// A packet declaration reconstructed from the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    /// Command or telemetry.
    pub direction: Direction,
    /// Target name resolved through the target table.
    pub target_name: String,
    /// Declared packet name.
    pub packet_name: String,
    /// Identity token, when the declaration carried one.
    pub id: Option<IdentityToken>,
}

/// Reads a packet log of commands or telemetry back into packets in
/// file order.
pub struct PacketLogReader {
    catalog: Option<Arc<dyn PacketCatalog>>,
    file: Option<BufReader<File>>,
    filename: Option<PathBuf>,
    bytes_read: u64,
    targets: Vec<TargetRecord>,
    packets: Vec<PacketRecord>,
    last_checkpoint: Option<Vec<u8>>,
}

impl Default for PacketLogReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketLogReader {
    /// A reader with no definition catalog: packets are returned with
    /// the names from the file's declarations, never identified.
    #[must_use]
    pub fn new() -> Self {
        Self {
            catalog: None,
            file: None,
            filename: None,
            bytes_read: 0,
            targets: Vec::new(),
            packets: Vec::new(),
            last_checkpoint: None,
        }
    }

    /// A reader that resolves packets against a definition catalog when
    /// identification is requested.
    #[must_use]
    pub fn with_catalog(catalog: Arc<dyn PacketCatalog>) -> Self {
        Self {
            catalog: Some(catalog),
            ..Self::new()
        }
    }

    /// Opens a log file, resetting all reader state and validating the
    /// fixed header.
    ///
    /// # Errors
    ///
    /// [`ReadError::LegacyHeader`] and [`ReadError::ForeignHeader`] are
    /// not recoverable; such files must be converted externally. No file
    /// handle is retained on any error.
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<(), ReadError> {
        self.close();
        self.reset();
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_LENGTH];
        reader.read_exact(&mut header).map_err(|error| {
            if error.kind() == std::io::ErrorKind::UnexpectedEof {
                ReadError::TruncatedHeader
            } else {
                error.into()
            }
        })?;
        if &header == LEGACY_FILE_HEADER {
            return Err(ReadError::LegacyHeader);
        }
        if &header != FILE_HEADER {
            return Err(ReadError::ForeignHeader {
                found: String::from_utf8_lossy(&header).into_owned(),
            });
        }

        self.bytes_read = HEADER_LENGTH as u64;
        self.file = Some(reader);
        self.filename = Some(path.to_path_buf());
        Ok(())
    }

    /// Closes the current log file, if open. Reader state other than the
    /// file handle is kept until the next [`open`](Self::open).
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Reads the next packet, transparently consuming declaration and
    /// offset-marker entries. Returns `None` at a clean end of file.
    ///
    /// With `identify` set and a catalog present, packets named
    /// [`UNKNOWN_NAME`] are identified from their raw bytes and named
    /// packets are checked against the catalog; lookup failures degrade
    /// to an unidentified packet with a logged warning.
    ///
    /// # Errors
    ///
    /// Any parse or I/O error closes the file before propagating.
    pub fn read(&mut self, identify: bool) -> Result<Option<LogPacket>, ReadError> {
        match self.read_next(identify) {
            Ok(packet) => Ok(packet),
            Err(error) => {
                self.close();
                Err(error)
            }
        }
    }

    /// Opens `path` and yields every packet to `f`, filtered by the
    /// optional packet-time window: packets before `start_time` are
    /// skipped, the iteration stops at the first packet after
    /// `end_time`. The file is closed on every exit path.
    ///
    /// # Errors
    ///
    /// Propagates open and read errors after closing the file.
    pub fn each<F>(
        &mut self,
        path: impl AsRef<Path>,
        identify: bool,
        start_time: Option<u64>,
        end_time: Option<u64>,
        f: F,
    ) -> Result<(), ReadError>
    where
        F: FnMut(LogPacket),
    {
        self.open(path)?;
        let result = self.each_open(identify, start_time, end_time, f);
        self.close();
        result
    }

    fn each_open<F>(
        &mut self,
        identify: bool,
        start_time: Option<u64>,
        end_time: Option<u64>,
        mut f: F,
    ) -> Result<(), ReadError>
    where
        F: FnMut(LogPacket),
    {
        while let Some(packet) = self.read(identify)? {
            if start_time.is_some_and(|start| packet.time_nsec < start) {
                continue;
            }
            if end_time.is_some_and(|end| packet.time_nsec > end) {
                break;
            }
            f(packet);
        }
        Ok(())
    }

    /// The most recent upstream checkpoint seen in an offset-marker
    /// entry.
    #[must_use]
    pub fn last_checkpoint(&self) -> Option<&[u8]> {
        self.last_checkpoint.as_deref()
    }

    /// Target declarations seen so far, in index order.
    #[must_use]
    pub fn declared_targets(&self) -> &[TargetRecord] {
        &self.targets
    }

    /// Packet declarations seen so far, in index order.
    #[must_use]
    pub fn declared_packets(&self) -> &[PacketRecord] {
        &self.packets
    }

    /// Bytes consumed from the current file, including the header.
    #[must_use]
    pub const fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Path of the currently opened file.
    #[must_use]
    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    fn reset(&mut self) {
        self.file = None;
        self.filename = None;
        self.bytes_read = 0;
        self.targets.clear();
        self.packets.clear();
        self.last_checkpoint = None;
    }

    fn read_next(&mut self, identify: bool) -> Result<Option<LogPacket>, ReadError> {
        // Declarations are skipped in a loop rather than recursively: a
        // file may legitimately hold tens of thousands of declarations
        // back to back.
        loop {
            let Some(file) = self.file.as_mut() else {
                return Ok(None);
            };
            let Some((flags, body, consumed)) = read_entry(file)? else {
                return Ok(None);
            };
            self.bytes_read += consumed;
            let Some(entry_type) = EntryType::from_flags(flags) else {
                return Err(ReadError::InvalidEntryFlags { flags });
            };
            match entry_type {
                EntryType::TargetDeclaration => self.read_target_declaration(flags, &body)?,
                EntryType::PacketDeclaration => self.read_packet_declaration(flags, &body)?,
                EntryType::OffsetMarker => self.last_checkpoint = Some(body),
                EntryType::RawPacket => {
                    return Ok(Some(self.read_packet(flags, &body, false, identify)?));
                }
                EntryType::JsonPacket => {
                    return Ok(Some(self.read_packet(flags, &body, true, identify)?));
                }
            }
        }
    }

    fn read_target_declaration(&mut self, flags: u16, body: &[u8]) -> Result<(), ReadError> {
        let (name_bytes, id) = split_identity(flags, body)?;
        let name = decode_name(name_bytes)?;
        tracing::debug!(target = %name, index = self.targets.len(), "target declared");
        self.targets.push(TargetRecord { name, id });
        Ok(())
    }

    fn read_packet_declaration(&mut self, flags: u16, body: &[u8]) -> Result<(), ReadError> {
        if body.len() < PACKET_DECLARATION_INDEX_SIZE {
            return Err(ReadError::TruncatedEntry {
                expected: PACKET_DECLARATION_INDEX_SIZE,
            });
        }
        let target_index = u16::from_be_bytes([body[0], body[1]]);
        let target_name = self
            .targets
            .get(target_index as usize)
            .map(|target| target.name.clone())
            .ok_or(ReadError::UnknownTargetIndex {
                index: target_index,
            })?;
        let (name_bytes, id) = split_identity(flags, &body[PACKET_DECLARATION_INDEX_SIZE..])?;
        let packet_name = decode_name(name_bytes)?;
        let direction = direction_from_flags(flags);
        tracing::debug!(
            target = %target_name,
            packet = %packet_name,
            direction = %direction,
            index = self.packets.len(),
            "packet declared"
        );
        self.packets.push(PacketRecord {
            direction,
            target_name,
            packet_name,
            id,
        });
        Ok(())
    }

    fn read_packet(
        &mut self,
        flags: u16,
        body: &[u8],
        json: bool,
        identify: bool,
    ) -> Result<LogPacket, ReadError> {
        let fixed = PACKET_SECONDARY_FIXED_SIZE as usize;
        if body.len() < fixed {
            return Err(ReadError::TruncatedEntry { expected: fixed });
        }
        let packet_index = u16::from_be_bytes([body[0], body[1]]);
        let mut time_bytes = [0u8; 8];
        time_bytes.copy_from_slice(&body[2..10]);
        let time_nsec = u64::from_be_bytes(time_bytes);

        let declaration = self
            .packets
            .get(packet_index as usize)
            .ok_or(ReadError::UnknownPacketIndex {
                index: packet_index,
            })?;
        let direction = direction_from_flags(flags);
        if direction != declaration.direction {
            return Err(ReadError::DirectionMismatch {
                entry: direction,
                declared: declaration.direction,
            });
        }

        let payload = if json {
            let text = String::from_utf8(body[fixed..].to_vec()).map_err(|error| {
                ReadError::InvalidJsonText {
                    reason: error.to_string(),
                }
            })?;
            PacketPayload::Json(text)
        } else {
            PacketPayload::Raw(body[fixed..].to_vec())
        };

        let mut packet = LogPacket {
            direction,
            target_name: declaration.target_name.clone(),
            packet_name: declaration.packet_name.clone(),
            time_nsec,
            stored: flags & STORED_FLAG_MASK != 0,
            payload,
            identity: declaration.id,
            identified: false,
        };
        if identify {
            self.identify_packet(&mut packet);
        }
        Ok(packet)
    }

    /// Best effort: failures leave the packet unidentified, they never
    /// abort the read loop.
    fn identify_packet(&self, packet: &mut LogPacket) {
        let Some(catalog) = &self.catalog else {
            return;
        };
        if packet.payload.kind() != crate::packet::PacketKind::Raw {
            return;
        }
        if packet.target_name == UNKNOWN_NAME || packet.packet_name == UNKNOWN_NAME {
            let definition = match &packet.payload {
                PacketPayload::Raw(data) => catalog.identify(packet.direction, data),
                PacketPayload::Json(_) => None,
            };
            if let Some(definition) = definition {
                packet.target_name = definition.target_name;
                packet.packet_name = definition.packet_name;
                packet.identified = true;
            }
            return;
        }
        match catalog.lookup(packet.direction, &packet.target_name, &packet.packet_name) {
            Ok(_definition) => packet.identified = true,
            Err(error) => {
                tracing::warn!(
                    error = %error,
                    target = %packet.target_name,
                    packet = %packet.packet_name,
                    "no packet definition, returning undefined packet"
                );
            }
        }
    }
}

/// Byte count of the target index prefixing a packet declaration body.
const PACKET_DECLARATION_INDEX_SIZE: usize = 2;

/// Reads one length-framed entry, returning its flags word, body (after
/// the flags), and total bytes consumed. Returns `None` at a clean end
/// of file.
fn read_entry(file: &mut BufReader<File>) -> Result<Option<(u16, Vec<u8>, u64)>, ReadError> {
    let mut length_bytes = [0u8; 4];
    if let Err(error) = file.read_exact(&mut length_bytes) {
        if error.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(error.into());
    }
    let length = u32::from_be_bytes(length_bytes);
    if length < PRIMARY_FIXED_SIZE {
        return Err(ReadError::EntryTooShort { length });
    }
    if length > MAX_ENTRY_LENGTH {
        return Err(ReadError::EntryTooLarge {
            length,
            max: MAX_ENTRY_LENGTH,
        });
    }

    let remaining = (length - 4) as usize;
    let mut body = vec![0u8; remaining];
    file.read_exact(&mut body).map_err(|error| {
        if error.kind() == std::io::ErrorKind::UnexpectedEof {
            ReadError::TruncatedEntry {
                expected: remaining,
            }
        } else {
            error.into()
        }
    })?;
    let flags = u16::from_be_bytes([body[0], body[1]]);
    let body = body.split_off(2);
    Ok(Some((flags, body, u64::from(length))))
}

fn split_identity(flags: u16, body: &[u8]) -> Result<(&[u8], Option<IdentityToken>), ReadError> {
    if flags & ID_FLAG_MASK == 0 {
        return Ok((body, None));
    }
    if body.len() < ID_FIXED_SIZE {
        return Err(ReadError::TruncatedEntry {
            expected: ID_FIXED_SIZE,
        });
    }
    let (name_bytes, id_bytes) = body.split_at(body.len() - ID_FIXED_SIZE);
    Ok((name_bytes, IdentityToken::try_from(id_bytes).ok()))
}

fn decode_name(bytes: &[u8]) -> Result<String, ReadError> {
    String::from_utf8(bytes.to_vec()).map_err(|error| ReadError::InvalidName {
        reason: error.to_string(),
    })
}

const fn direction_from_flags(flags: u16) -> Direction {
    if flags & CMD_FLAG_MASK != 0 {
        Direction::Cmd
    } else {
        Direction::Tlm
    }
}
