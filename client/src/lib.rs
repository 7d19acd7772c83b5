//! # Tank Client Library
//!
//! The client side of the session layer: finding game servers through list
//! servers and talking to one of them as a headless player.
//!
//! ## Server Discovery
//!
//! A [`ListServerClient`] asks every configured list server for its `LIST`
//! and merges the answers by `name:port`. List servers that cannot be
//! resolved, reached or understood are skipped, so one dead directory never
//! hides the others. The merged list is cached on disk; when no list server
//! answers at all, the cached servers younger than the configured age are
//! offered instead and the result says so.
//!
//! ## Game Connection
//!
//! A [`ServerLink`] performs the TCP greeting, enters the game and can then
//! move player updates onto UDP with the link request handshake. It decodes
//! everything the server sends into [`shared::GameEvent`] values, answering
//! lag pings on the way.
//!
//! ## Module Organization
//!
//! ### Discovery (`discovery`)
//! - `LIST` exchange and reply parsing
//! - Merging and the lookup/connect phases
//!
//! ### Cache (`cache`)
//! - bincode file with save times per server
//! - Age filtering for the fallback
//!
//! ### Link (`link`)
//! - Greeting, entry and the UDP handshake
//! - Chat and player updates
//!
//! ### Configuration and Errors (`config`, `error`)
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{DiscoveryConfig, ListServerClient, ServerLink};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut discovery = ListServerClient::new(DiscoveryConfig {
//!     list_servers: vec!["bzfs://list.example.org:5156/".into()],
//!     ..DiscoveryConfig::default()
//! });
//! let result = discovery.fetch().await;
//! if let Some(server) = result.servers.first() {
//!     let addr = tokio::net::lookup_host(server.connect_target())
//!         .await?
//!         .next()
//!         .ok_or("no address")?;
//!     let mut link = ServerLink::connect(addr).await?;
//!     link.enter("observer", 0, 0).await?;
//!     link.establish_udp().await?;
//!     while let Ok(event) = link.next_event().await {
//!         println!("{:?}", event);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod discovery;
pub mod error;
pub mod link;

pub use cache::ServerListCache;
pub use config::DiscoveryConfig;
pub use discovery::{DiscoveryPhase, DiscoveryResult, ListServerClient, ListServerEntry};
pub use error::{CacheError, DiscoveryError, LinkError};
pub use link::ServerLink;
