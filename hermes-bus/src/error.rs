use std::{io, time::Duration};

use thiserror::Error;

/// Errors raised anywhere on the bus.
///
/// `InvalidEnvelope` and `UnknownCommand` never leave the reactor: they are
/// answered on the originating socket. `NotFound` and `Denied` are turned into
/// structured replies by the catalog handlers. `BindConflict` is consumed by the
/// port search loop.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("invalid message envelope: {0}")]
    InvalidEnvelope(&'static str),

    #[error("unrecognized command {0:?}")]
    UnknownCommand(String),

    #[error("No Registered Service With the Name {0}")]
    NotFound(String),

    #[error("registration denied: {0}")]
    Denied(String),

    #[error("port {port} already in use")]
    BindConflict { port: u16 },

    #[error("handler fault: {0}")]
    HandlerFault(String),

    #[error("invalid message body: {0}")]
    InvalidBody(String),

    #[error("no free port at or above {start}")]
    NoFreePort { start: u16 },

    #[error("socket '{0}' is already registered")]
    DuplicateSocket(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("peer {0} disconnected")]
    Disconnected(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidBody(err.to_string())
    }
}

pub type Result<T, E = BusError> = std::result::Result<T, E>;
