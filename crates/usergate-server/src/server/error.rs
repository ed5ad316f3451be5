//! Process-level errors.
//!
//! Request-level failures live in [`usergate_core::Error`] and never leave the
//! request that caused them. The variants here describe failures of the
//! process itself: bad configuration, an unreachable datastore, or a server
//! unit that could not start or stopped serving. Any of them ends the run.

/// Errors raised while starting, running or stopping the process.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum LifecycleError {
    /// Configuration was missing or malformed.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// The datastore could not be reached at startup.
    #[error("failed to connect to datastore: {reason}")]
    Connect { reason: String },

    /// The RPC server could not bind its listener.
    #[error("{server} failed to bind {addr}: {reason}")]
    Bind {
        server: &'static str,
        addr: String,
        reason: String,
    },

    /// The gateway could not bind its HTTP listener.
    #[error("{server} failed to listen on {addr}: {reason}")]
    Listen {
        server: &'static str,
        addr: String,
        reason: String,
    },

    /// The gateway never reached the RPC backend.
    #[error("{server} failed to dial {addr}: {reason}")]
    Dial {
        server: &'static str,
        addr: String,
        reason: String,
    },

    /// Service or translation-layer registration failed.
    #[error("{server} failed to register services: {reason}")]
    Register { server: &'static str, reason: String },

    /// The serve loop ended with an I/O error.
    #[error("{server} stopped serving: {reason}")]
    Serve { server: &'static str, reason: String },

    /// A server unit panicked or was aborted.
    #[error("{server} task failed: {reason}")]
    Join { server: &'static str, reason: String },

    /// `run` was called on a coordinator that already ran.
    #[error("coordinator has already run")]
    Reentered,
}

impl LifecycleError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}
