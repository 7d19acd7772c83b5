//! # List Server Library
//!
//! The discovery daemon game servers advertise themselves to and players ask
//! for the current server list.
//!
//! ## Protocol
//!
//! Every connection carries exactly one text request terminated by a blank
//! line:
//! - `ADD <name> <version> <build> <gameinfo> <title>` lists or refreshes a
//!   server and is answered with one status byte (0 accepted, 1 refused)
//! - `REMOVE <name>` and `SETNUM <name> <5 counts>` likewise
//! - `LIST` streams `name version gameinfo address title` lines
//! - `GET <path> HTTP/x` sends the same lines behind an HTTP header
//!
//! ## Module Organization
//!
//! - `directory`: reference counted entries that expire when not refreshed
//! - `request`: request framing and argument splitting
//! - `daemon`: the accept loop and per-client tasks
//! - `http`, `stats`, `config`, `error`: supporting pieces

pub mod config;
pub mod daemon;
pub mod directory;
pub mod error;
pub mod http;
pub mod request;
pub mod stats;

pub use config::ListServerConfig;
pub use daemon::{ListServer, ListServerHandle};
pub use directory::{Directory, Entry};
pub use error::{DirectoryError, ListServerError, RequestError};
