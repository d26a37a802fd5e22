//! Error types returned by the backend library

use crate::sync::Phase;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the container registry
#[derive(Error, Debug)]
pub enum RegistryError {
    /// no container is registered under this handle
    #[error("unknown handle: {0}")]
    UnknownHandle(String),

    /// writing or renaming a snapshot file failed
    #[error("failed to save snapshot: {0}")]
    FailedToSnapshot(#[source] anyhow::Error),

    /// snapshot directory could not be created or read
    #[error("snapshot directory {path:?}: {source}")]
    SnapshotDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// a snapshot file could not be opened for restore
    #[error("snapshot {path:?}: {source}")]
    SnapshotOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// error returned by the container pool or a container, passed through untouched
    #[error(transparent)]
    Pool(anyhow::Error),
}

/// Errors on the host/container setup pipes
#[derive(Error, Debug)]
pub enum SyncError {
    /// pipe read or write failed, including EOF from a dead peer
    #[error("sync pipe i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// peer wrote something other than the turn marker
    #[error("unexpected sync byte {0:#04x}")]
    UnexpectedSignal(u8),

    /// a handshake step was attempted in the wrong phase
    #[error("handshake out of order: expected phase {expected:?}, found {found:?}")]
    OutOfOrder { expected: Phase, found: Phase },
}

/// Errors parsing id mappings
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdMapError {
    /// mapping is not in `from:to:size` form
    #[error("invalid id mapping {0:?}, expected FROM:TO:SIZE")]
    InvalidFormat(String),

    /// a mapping field is not an unsigned integer
    #[error("invalid id {value:?} in mapping: {source}")]
    InvalidId {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Errors that end the i/o broker daemon
#[derive(Error, Debug)]
pub enum BrokerError {
    /// socket directory or socket could not be created
    #[error("failed to listen on {path:?}: {source}")]
    Listen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// accepting a connection failed
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// target executable not found on the search path
    #[error("executable {0:?} not found")]
    ExecutableNotFound(String),

    /// pipes or pseudo-terminal could not be allocated
    #[error("failed to allocate process stdio: {0}")]
    Stdio(#[source] std::io::Error),

    /// target process could not be started
    #[error("failed to start process: {0}")]
    Start(#[source] std::io::Error),
}

/// Errors on the attaching side of the broker socket
#[derive(Error, Debug)]
pub enum LinkError {
    /// socket or descriptor i/o error
    #[error("link i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// daemon handed over the wrong number of descriptors
    #[error("expected {expected} descriptors from daemon, got {found}")]
    MissingDescriptors { expected: usize, found: usize },

    /// input frame could not be encoded
    #[error("failed to encode input frame: {0}")]
    Encode(#[from] serde_json::Error),

    /// status stream ended or did not hold a number
    #[error("invalid exit status {0:?}")]
    InvalidStatus(String),
}
