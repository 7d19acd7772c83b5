//! Asking list servers which game servers exist.
//!
//! A fetch walks `Idle -> LookupListServers -> ConnectListServers -> Idle`.
//! Every configured list server is resolved, then queried concurrently with
//! `LIST`; each query connects, sends the request and reads lines until a
//! blank line or the end of the stream. A list server that fails at any
//! step is logged and skipped, and whatever the others returned is merged.
//! When none answers, the cached list stands in.

use crate::cache::ServerListCache;
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use shared::protocol::{DEFAULT_SERVER_PORT, VERSION_PREFIX};
use shared::{GameInfo, ListServerUrl};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;

pub const LIST_REQUEST: &[u8] = b"LIST\n\n";

/// Replies beyond this are cut off as an error.
pub const MAX_REPLY_LEN: usize = 256 * 1024;

const SKIPPED_PREFIXES: [&str; 4] = ["TOKEN:", "NOTOK:", "ERROR:", "NOTICE:"];

/// One game server as reported by a list server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListServerEntry {
    /// Host name without the port.
    pub name: String,
    pub port: u16,
    pub version: String,
    /// Packed game info, kept as sent.
    pub game_info: String,
    pub address: Option<Ipv4Addr>,
    pub title: String,
}

impl ListServerEntry {
    /// `name:port`, unique per game server.
    pub fn key(&self) -> String {
        format!("{}:{}", self.name, self.port)
    }

    pub fn game_info(&self) -> Option<GameInfo> {
        GameInfo::from_hex(&self.game_info)
    }

    /// Host and title as a player would want to see them.
    pub fn description(&self) -> String {
        let mut text = self.name.clone();
        if self.port != DEFAULT_SERVER_PORT {
            text.push_str(&format!(":{}", self.port));
        }
        if !self.title.is_empty() {
            text.push_str("; ");
            text.push_str(&self.title);
        }
        text
    }

    /// Where to connect: the numeric address when known.
    pub fn connect_target(&self) -> String {
        match self.address {
            Some(ip) => format!("{}:{}", ip, self.port),
            None => self.key(),
        }
    }
}

/// Parses one `name version gameinfo address title` line.
pub fn parse_list_line(line: &str) -> Option<ListServerEntry> {
    let mut rest = line.trim_end_matches(&['\r', '\n'][..]);
    let mut fields = [""; 4];
    for field in fields.iter_mut() {
        rest = rest.trim_start();
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        *field = &rest[..end];
        rest = &rest[end..];
    }
    let [name, version, game_info, address] = fields;

    let (host, port) = match name.split_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().ok().filter(|&p| p != 0)?),
        None => (name, DEFAULT_SERVER_PORT),
    };
    if host.is_empty() || !version.starts_with(VERSION_PREFIX) {
        return None;
    }
    Some(ListServerEntry {
        name: host.to_string(),
        port,
        version: version.to_string(),
        game_info: game_info.to_string(),
        address: address.parse().ok(),
        title: rest.trim().to_string(),
    })
}

/// Parses a whole LIST reply, skipping status and malformed lines.
pub fn parse_list_reply(reply: &str) -> Vec<ListServerEntry> {
    let mut entries = Vec::new();
    for line in reply.lines() {
        if let Some(prefix) = SKIPPED_PREFIXES.iter().find(|p| line.starts_with(*p)) {
            if *prefix == "ERROR:" || *prefix == "NOTICE:" {
                warn!("List server says {}", line.trim_end());
            }
            continue;
        }
        match parse_list_line(line) {
            Some(entry) => entries.push(entry),
            None if line.trim().is_empty() => {}
            None => debug!("Skipping list line {:?}", line),
        }
    }
    entries
}

fn blank_line(buf: &[u8]) -> Option<usize> {
    let find = |needle: &[u8]| buf.windows(needle.len()).position(|w| w == needle);
    find(b"\r\n\r\n").or_else(|| find(b"\n\n"))
}

/// Runs one LIST exchange with a list server.
pub async fn query_list_server(
    peer: SocketAddr,
    limit: Duration,
) -> Result<Vec<ListServerEntry>, DiscoveryError> {
    let exchange = async {
        let mut stream = TcpStream::connect(peer)
            .await
            .map_err(|source| DiscoveryError::Connect { peer, source })?;
        let io = |source| DiscoveryError::Io { peer, source };
        stream.write_all(LIST_REQUEST).await.map_err(io)?;

        let mut reply = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.map_err(io)?;
            if n == 0 {
                break;
            }
            reply.extend_from_slice(&chunk[..n]);
            if let Some(end) = blank_line(&reply) {
                reply.truncate(end);
                break;
            }
            if reply.len() > MAX_REPLY_LEN {
                return Err(DiscoveryError::ReplyTooLarge {
                    peer,
                    limit: MAX_REPLY_LEN,
                });
            }
        }
        Ok::<_, DiscoveryError>(parse_list_reply(&String::from_utf8_lossy(&reply)))
    };
    timeout(limit, exchange)
        .await
        .map_err(|_| DiscoveryError::Timeout { peer })?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPhase {
    Idle,
    LookupListServers,
    ConnectListServers,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryResult {
    pub servers: Vec<ListServerEntry>,
    /// The list came from the cache because no list server answered.
    pub cached: bool,
    /// List servers that answered.
    pub reached: usize,
    /// List servers skipped because of an error.
    pub failed: usize,
}

pub struct ListServerClient {
    config: DiscoveryConfig,
    phase: DiscoveryPhase,
    cache: ServerListCache,
}

impl ListServerClient {
    /// Loads the cache if one is configured; an unreadable cache starts
    /// empty.
    pub fn new(config: DiscoveryConfig) -> Self {
        let cache = match &config.cache_path {
            Some(path) => ServerListCache::load(path, config.cache_max_age).unwrap_or_else(|e| {
                warn!("Ignoring server list cache {}: {}", path.display(), e);
                ServerListCache::new(config.cache_max_age)
            }),
            None => ServerListCache::new(config.cache_max_age),
        };
        Self {
            config,
            phase: DiscoveryPhase::Idle,
            cache,
        }
    }

    pub fn phase(&self) -> DiscoveryPhase {
        self.phase
    }

    pub fn cache(&self) -> &ServerListCache {
        &self.cache
    }

    /// Resolves every configured list server. Returns the reachable
    /// addresses and the number of entries that could not be used.
    async fn lookup(&mut self) -> (Vec<SocketAddr>, usize) {
        self.phase = DiscoveryPhase::LookupListServers;
        let mut peers = Vec::new();
        let mut failed = 0;
        for url in &self.config.list_servers {
            let Some(server) = ListServerUrl::parse(url) else {
                warn!("Skipping list server: {}", DiscoveryError::InvalidUrl(url.clone()));
                failed += 1;
                continue;
            };
            match lookup_host((server.host.as_str(), server.port)).await {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => peers.push(addr),
                    None => {
                        warn!("List server {} has no addresses", server);
                        failed += 1;
                    }
                },
                Err(source) => {
                    let e = DiscoveryError::Lookup {
                        host: server.host.clone(),
                        source,
                    };
                    warn!("Skipping list server: {}", e);
                    failed += 1;
                }
            };
        }
        (peers, failed)
    }

    /// Collects the server list from every list server, falling back to the
    /// cache when none answers.
    pub async fn fetch(&mut self) -> DiscoveryResult {
        let (peers, mut failed) = self.lookup().await;

        self.phase = DiscoveryPhase::ConnectListServers;
        let mut queries = JoinSet::new();
        for peer in peers {
            let limit = self.config.timeout;
            queries.spawn(async move { (peer, query_list_server(peer, limit).await) });
        }

        let mut merged = BTreeMap::new();
        let mut reached = 0;
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok((peer, Ok(entries))) => {
                    debug!("List server {} reported {} servers", peer, entries.len());
                    reached += 1;
                    for entry in entries {
                        merged.insert(entry.key(), entry);
                    }
                }
                Ok((_, Err(e))) => {
                    warn!("Skipping list server: {}", e);
                    failed += 1;
                }
                Err(e) => {
                    warn!("List server query failed: {}", e);
                    failed += 1;
                }
            }
        }
        self.phase = DiscoveryPhase::Idle;

        let now = SystemTime::now();
        if reached == 0 {
            let servers = self.cache.fresh_entries(now);
            info!("No list server answered, offering {} cached servers", servers.len());
            return DiscoveryResult {
                servers,
                cached: true,
                reached,
                failed,
            };
        }

        let servers: Vec<ListServerEntry> = merged.into_values().collect();
        self.cache.update(&servers, now);
        if let Some(path) = &self.config.cache_path {
            if let Err(e) = self.cache.save(path) {
                warn!("Cannot save server list cache: {}", e);
            }
        }
        DiscoveryResult {
            servers,
            cached: false,
            reached,
            failed,
        }
    }
}
