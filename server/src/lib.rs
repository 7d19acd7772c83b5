//! # Game Server Library
//!
//! This library provides the session layer of the tank battle server: it
//! accepts player connections, frames and routes protocol messages over TCP
//! and UDP, and hands decoded traffic to a pluggable game rules layer.
//!
//! ## Core Responsibilities
//!
//! ### Connection Handling
//! Every network player owns one TCP stream plus a share of the server's
//! single UDP socket. The server handles:
//! - The unframed greeting that tells a client its player index
//! - Reassembly of length-prefixed frames from partial reads
//! - The UDP link handshake that moves bulk traffic onto datagrams
//! - A bounded outbound backlog that drops clients who stop reading
//!
//! ### Message Dispatch
//! Outbound messages are staged, queued and flushed at a fixed point in each
//! tick. A message reaches one player or every live session; a session that
//! fails during a broadcast is removed without disturbing the others.
//!
//! ### Session Lifecycle
//! Sessions close through a single guarded transition. Close listeners fire
//! exactly once whatever triggered the close: read errors, write errors,
//! kicks, idle timeouts, an exit message or server shutdown.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Event Loop
//! One task owns the session registry and processes accepts, readable
//! sockets, datagrams and ticks sequentially. Helper tasks only watch for
//! socket readiness and resolve hostnames; they report back over a channel
//! and never touch session state.
//!
//! ### Shared UDP Port
//! TCP and UDP listen on the same port. Datagrams are matched to sessions by
//! source address and port once a session's link is confirmed. Server pings
//! are answered for anyone.
//!
//! ## Module Organization
//!
//! ### Connection Module (`connection`)
//! Per-session socket state: inbound reassembly, the TCP backlog, UDP
//! coalescing and the closing transition.
//!
//! ### Registry and Dispatch (`registry`, `dispatch`, `message`, `context`)
//! The live session table, the fan-out router, buffered messages with the
//! per-pass send queue, and the context handed to game rules.
//!
//! ### Network Module (`network`)
//! The event loop itself, UDP demultiplexing (`udp`) and publicizing the
//! server to list servers (`publicize`).
//!
//! ### Rules Module (`rules`)
//! The [`rules::GameRules`] trait and [`rules::RelayRules`], which admits
//! players, routes chat and relays movement and combat between them.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         host: "127.0.0.1".to_string(),
//!         ..ServerConfig::default()
//!     };
//!
//!     // Binds TCP and UDP on port 5155 and runs until Ctrl+C or a
//!     // shutdown request through `server.handle()`.
//!     let mut server = Server::bind(config).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Security Considerations
//!
//! ### Spoofing
//! Datagrams are only accepted from confirmed sources, and only for message
//! types that may travel by UDP. Clients may only report events about
//! themselves.
//!
//! ### Flood Protection
//! Reads per wake-up are capped, frames over 1024 bytes close the session,
//! and a client whose unsent backlog outgrows 20 KiB is disconnected.

pub mod config;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod network;
pub mod publicize;
pub mod registry;
pub mod resolver;
pub mod rules;
pub mod stats;
pub mod transport;
pub mod udp;

pub use config::ServerConfig;
pub use error::{CloseReason, ServerError};
pub use network::{Server, ServerHandle};
