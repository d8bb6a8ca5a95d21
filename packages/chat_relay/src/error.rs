//! Error taxonomy for the relay.
//!
//! Only startup failures are represented here. Per-connection I/O failures
//! never leave the connection they happened on: they are logged and resolved
//! by removing that connection from the registry.

use std::io;
use std::net::{AddrParseError, SocketAddr};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid listen address {addr:?}: {source}")]
    InvalidAddress {
        addr: String,
        #[source]
        source: AddrParseError,
    },

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Preparing the worker for an accepted connection failed. The connection
    /// is rolled back out of the registry; this never stops the relay.
    #[error("failed to prepare connection worker: {0}")]
    WorkerSetup(String),
}

impl RelayError {
    /// Whether this error should stop the process.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::WorkerSetup(_))
    }
}

impl From<figment::Error> for RelayError {
    fn from(err: figment::Error) -> Self {
        RelayError::Config(err.to_string())
    }
}
