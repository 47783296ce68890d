//! Critical error side channel.
//!
//! Write-path failures that disable a writer are reported through a
//! [`CriticalErrorSink`] registered by the embedding application, distinct
//! from routine structured logging. Monitoring can alert on this channel
//! specifically: once a writer is disabled, every subsequent write is a
//! silent no-op until an operator restarts it, which is a very different
//! condition from a transient archive warning.

use crate::writer::WriteError;

/// Receives write-path errors that were reported through the critical
/// channel. Implementations must be cheap and non-blocking; they are
/// invoked with the writer mutex held.
pub trait CriticalErrorSink: Send + Sync {
    /// Called once per critical write-path error.
    fn critical(&self, error: &WriteError);
}

/// Default sink that emits the error at `error!` level under the
/// `pktlog::critical` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCriticalSink;

impl CriticalErrorSink for TracingCriticalSink {
    fn critical(&self, error: &WriteError) {
        tracing::error!(
            target: "pktlog::critical",
            error = %error,
            disabling = error.is_critical(),
            "critical packet log failure"
        );
    }
}
