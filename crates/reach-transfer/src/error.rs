use std::io;
use std::path::PathBuf;

use reach_protocol::EncodeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

/// Failures surfaced by a fetch, the dispatcher or the responder.
///
/// Packet loss and malformed datagrams never show up here; they are retried
/// or dropped locally. Only exhausted budgets and local I/O failures do.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no response from server after {attempts} attempts")]
    NoResponse { attempts: u32 },

    #[error("transfer stalled: {timeouts} chunk timeouts without a packet")]
    Stalled { timeouts: u32 },

    #[error("socket error")]
    Socket(#[source] io::Error),

    #[error("file error on {}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("transfer id {0} is already registered")]
    TransferIdInUse(u64),

    #[error("receive loop has stopped")]
    DispatcherClosed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl TransferError {
    pub(crate) fn file(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }
}

/// Invalid environment or programmatic configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is not valid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Constraint(String),
}
