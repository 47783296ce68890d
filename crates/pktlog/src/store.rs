//! Collaborator interfaces implemented by the embedding application:
//! durable archival of closed files, upstream stream trimming, and the
//! packet definition catalog.
//!
//! The writer and reader only ever call through these traits. Archive and
//! trim failures are logged and never stop a writer; catalog failures
//! degrade a read to an unidentified packet.

use std::path::{Path, PathBuf};

use crate::packet::{Direction, IdentityToken};

/// Error from a [`RemoteArchiver`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArchiveError {
    /// Reading the local file failed.
    #[error("I/O error archiving {path}: {reason}")]
    Io {
        /// The local file being archived.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// The remote store refused the upload.
    #[error("remote store rejected {key}: {reason}")]
    Rejected {
        /// The remote key that was refused.
        key: String,
        /// Description of the failure.
        reason: String,
    },
}

/// Error from a [`StreamTrimmer`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to trim stream {topic} at {checkpoint}: {reason}")]
pub struct TrimError {
    /// The stream topic.
    pub topic: String,
    /// The checkpoint the trim was attempted at.
    pub checkpoint: String,
    /// Description of the failure.
    pub reason: String,
}

/// Error from a [`PacketCatalog`] lookup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// No definition exists for the requested packet.
    #[error("no {direction} packet definition for {target_name} {packet_name}")]
    NotFound {
        /// Command or telemetry.
        direction: Direction,
        /// The requested target name.
        target_name: String,
        /// The requested packet name.
        packet_name: String,
    },
}

/// A resolved packet definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketDefinition {
    /// Target the packet belongs to.
    pub target_name: String,
    /// Packet name within the target.
    pub packet_name: String,
}

/// Moves a finalized local log file to durable storage.
///
/// Called once per closed file, for both the primary log and its index
/// counterpart, after the local file is fully written and closed.
/// Implementations may delete the local file once the upload succeeds.
pub trait RemoteArchiver: Send + Sync {
    /// Uploads `local_path` under `remote_key`.
    ///
    /// # Errors
    ///
    /// Returns an [`ArchiveError`] if the upload fails. The writer logs
    /// the failure and keeps running.
    fn archive(&self, local_path: &Path, remote_key: &str) -> Result<(), ArchiveError>;
}

/// Trims an upstream message stream up to a checkpoint.
///
/// The writer calls this with the checkpoint of the second-most-recently
/// closed file, keeping one full file's worth of data in the stream as a
/// safety buffer until it is durably archived.
pub trait StreamTrimmer: Send + Sync {
    /// Discards stream entries up to and including `checkpoint`.
    ///
    /// # Errors
    ///
    /// Returns a [`TrimError`] if the trim fails. The writer logs the
    /// failure and keeps running.
    fn trim(&self, topic: &str, checkpoint: &str) -> Result<(), TrimError>;
}

/// The external packet definition catalog.
///
/// All methods are best effort from the log system's perspective: a
/// failed or absent lookup never aborts a read or write.
pub trait PacketCatalog: Send + Sync {
    /// Identifies a packet from its raw bytes when the target or packet
    /// name is unknown. Returns `None` when no definition matches.
    fn identify(&self, direction: Direction, data: &[u8]) -> Option<PacketDefinition>;

    /// Looks up the definition for a named packet.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::NotFound`] when no definition exists.
    fn lookup(
        &self,
        direction: Direction,
        target_name: &str,
        packet_name: &str,
    ) -> Result<PacketDefinition, CatalogError>;

    /// Identity token for a target, attached to its declaration entry
    /// when known.
    fn target_id(&self, _target_name: &str) -> Option<IdentityToken> {
        None
    }

    /// Identity token for a packet, attached to its declaration entry
    /// when known.
    fn packet_id(
        &self,
        _direction: Direction,
        _target_name: &str,
        _packet_name: &str,
    ) -> Option<IdentityToken> {
        None
    }
}
