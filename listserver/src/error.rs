use crate::request::Command;
use std::io;

/// A request the daemon cannot act on. The client is counted as bad and
/// disconnected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("empty request")]
    Empty,
    #[error("request is not text")]
    NotText,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("malformed {0} request")]
    Malformed(Command),
    #[error("no request terminator within {0} bytes")]
    TooLong(usize),
}

/// A well-formed request the directory refuses. Answered with status 1.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("version {0:?} is not a game server version")]
    BadVersion(String),
    #[error("server {0} is not listed")]
    UnknownServer(String),
    #[error("server {0} is still being probed")]
    ProbeInProgress(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ListServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("bad request: {0}")]
    Request(#[from] RequestError),
    #[error("client timed out")]
    Timeout,
}
