//! Binary packet logging for ground-station command/telemetry streams.
//!
//! This crate implements the storage side of a command/telemetry
//! pipeline: producers hand packets to a [`PacketLogWriter`], which
//! serializes them into a compact self-describing binary container with
//! name interning, rotates files by time, size, or wall-clock cutover,
//! maintains a companion index file per log, and hands every closed
//! file to a [`RemoteArchiver`] for durable storage. Once a file's data
//! is archived, the upstream message stream it was drained from can be
//! trimmed through a [`StreamTrimmer`], with the most recent file's
//! checkpoint always held back so one file's worth of data stays
//! available upstream as a safety buffer.
//!
//! [`PacketLogReader`] decodes the files back into packets in original
//! order, reconstructing the name tables purely from the inline
//! declaration entries. A [`TextLogWriter`] shares the rotation
//! machinery for newline-delimited event logs.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use pktlog::{
//!     Direction, PacketEntry, PacketKind, PacketLogWriter, TracingCriticalSink, WriterOptions,
//! };
//! # fn example(archiver: Arc<dyn pktlog::RemoteArchiver>) -> Result<(), pktlog::WriteError> {
//! let options = WriterOptions::new("tlm", "/var/spool/pktlog", "logs/tlm");
//! let writer = PacketLogWriter::new(
//!     options,
//!     archiver,
//!     None,
//!     None,
//!     Arc::new(TracingCriticalSink),
//! )?;
//! writer.write(&PacketEntry {
//!     kind: PacketKind::Raw,
//!     direction: Direction::Tlm,
//!     target_name: "INST",
//!     packet_name: "HEALTH_STATUS",
//!     time_nsec: 1_577_836_800_000_000_000,
//!     stored: false,
//!     data: &[0x01, 0x02],
//!     id: None,
//!     stream_offset: Some("1577836800000-0"),
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod critical;
pub mod format;
pub mod packet;
pub mod reader;
pub mod store;
pub mod writer;

pub use config::{CYCLE_CHECK_INTERVAL, ConfigError, RotationConfig, WriterOptions};
pub use critical::{CriticalErrorSink, TracingCriticalSink};
pub use packet::{
    Direction, IdentityToken, LogPacket, PacketEntry, PacketKind, PacketPayload, UNKNOWN_NAME,
};
pub use reader::{PacketLogReader, PacketRecord, ReadError, TargetRecord};
pub use store::{
    ArchiveError, CatalogError, PacketCatalog, PacketDefinition, RemoteArchiver, StreamTrimmer,
    TrimError,
};
pub use writer::{PacketLogWriter, TextLogWriter, WriteError};
