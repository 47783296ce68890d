//! Packet data model: write requests, read results, and timestamp
//! rendering shared by the writer and reader.

use serde::{Deserialize, Serialize};

use crate::format::ID_FIXED_SIZE;

/// A packed identity token attached to a target or packet declaration,
/// orthogonal to its name.
pub type IdentityToken = [u8; ID_FIXED_SIZE];

/// Placeholder name for packets whose target or packet could not be
/// identified at capture time. The reader attempts catalog
/// identification for packets carrying this name.
pub const UNKNOWN_NAME: &str = "UNKNOWN";

/// Command/telemetry discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// Command stream.
    Cmd,
    /// Telemetry stream.
    Tlm,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cmd => write!(f, "CMD"),
            Self::Tlm => write!(f, "TLM"),
        }
    }
}

/// Payload encoding of a packet entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    /// Raw binary packet buffer.
    Raw,
    /// UTF-8 JSON text.
    Json,
}

/// A borrowed packet write request.
///
/// `id`, when present, must be exactly [`ID_FIXED_SIZE`] bytes; it is
/// attached to this packet's declaration entry the first time the
/// (direction, target, packet) triple is seen in a file. A wrong-length
/// token rejects the single call without touching writer state.
///
/// `stream_offset` is the opaque upstream stream position of this packet,
/// retained as the file's trailing offset-marker checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct PacketEntry<'a> {
    /// Payload encoding.
    pub kind: PacketKind,
    /// Command or telemetry.
    pub direction: Direction,
    /// Target name, or [`UNKNOWN_NAME`] for unidentified streams.
    pub target_name: &'a str,
    /// Packet name, or [`UNKNOWN_NAME`].
    pub packet_name: &'a str,
    /// Packet time in nanoseconds since the Unix epoch.
    pub time_nsec: u64,
    /// Whether this is stored (as opposed to realtime) data.
    pub stored: bool,
    /// Payload bytes. Raw binary or UTF-8 JSON text per `kind`.
    pub data: &'a [u8],
    /// Optional identity token for this packet's declaration.
    pub id: Option<&'a [u8]>,
    /// Optional upstream stream checkpoint for this packet.
    pub stream_offset: Option<&'a str>,
}

/// Payload of a packet read back from a log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketPayload {
    /// Raw binary packet buffer.
    Raw(Vec<u8>),
    /// JSON text, as written.
    Json(String),
}

impl PacketPayload {
    /// The payload bytes regardless of encoding.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Raw(data) => data,
            Self::Json(text) => text.as_bytes(),
        }
    }

    /// The payload encoding.
    #[must_use]
    pub const fn kind(&self) -> PacketKind {
        match self {
            Self::Raw(_) => PacketKind::Raw,
            Self::Json(_) => PacketKind::Json,
        }
    }

    /// Parses a JSON payload into a value. Returns `None` for raw payloads.
    ///
    /// # Errors
    ///
    /// Returns the parse error for malformed JSON text.
    pub fn to_json(&self) -> Option<Result<serde_json::Value, serde_json::Error>> {
        match self {
            Self::Raw(_) => None,
            Self::Json(text) => Some(serde_json::from_str(text)),
        }
    }
}

/// A packet decoded from a log file, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPacket {
    /// Command or telemetry.
    pub direction: Direction,
    /// Target name from the file's declaration table.
    pub target_name: String,
    /// Packet name from the file's declaration table.
    pub packet_name: String,
    /// Packet time in nanoseconds since the Unix epoch.
    pub time_nsec: u64,
    /// Whether this was stored data.
    pub stored: bool,
    /// Decoded payload.
    pub payload: PacketPayload,
    /// Identity token from this packet's declaration, if one was written.
    pub identity: Option<IdentityToken>,
    /// Whether a catalog definition was resolved for this packet.
    pub identified: bool,
}

/// Renders a nanosecond epoch timestamp as `YYYYMMDDHHMMSSnnnnnnnnn`
/// in UTC, the form used in archive keys and text log lines.
#[must_use]
pub fn format_timestamp(time_nsec: u64) -> String {
    let secs = (time_nsec / 1_000_000_000) as i64;
    let nanos = (time_nsec % 1_000_000_000) as u32;
    let time = chrono::DateTime::from_timestamp(secs, nanos).unwrap_or_default();
    format!("{}{nanos:09}", time.format("%Y%m%d%H%M%S"))
}
