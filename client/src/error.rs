use shared::{DecodeError, FrameError};
use std::io;
use std::net::SocketAddr;

/// Failure to get a list from one list server. Discovery logs these and
/// moves on to the next server.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("invalid list server url {0:?}")]
    InvalidUrl(String),
    #[error("cannot resolve {host}: {source}")]
    Lookup { host: String, source: io::Error },
    #[error("cannot connect to {peer}: {source}")]
    Connect { peer: SocketAddr, source: io::Error },
    #[error("I/O error with {peer}: {source}")]
    Io { peer: SocketAddr, source: io::Error },
    #[error("{peer} timed out")]
    Timeout { peer: SocketAddr },
    #[error("reply from {peer} exceeds {limit} bytes")]
    ReplyTooLarge { peer: SocketAddr, limit: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cache encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("cache format version {0} is not supported")]
    UnsupportedVersion(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("server speaks {0:?}, not a supported protocol version")]
    BadVersion(String),
    #[error("server is full")]
    ServerFull,
    #[error("entry rejected ({code}): {reason}")]
    Rejected { code: u16, reason: String },
    #[error("server closed the connection")]
    Closed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}
