//! Addresses of list servers as they appear in configuration.

use crate::protocol::DEFAULT_LIST_SERVER_PORT;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListServerUrl {
    pub host: String,
    pub port: u16,
}

impl ListServerUrl {
    /// Accepts `host`, `host:port` and `bzfs://host[:port][/path]`. Other
    /// schemes, empty hosts and bad ports yield `None`.
    pub fn parse(url: &str) -> Option<Self> {
        let rest = url.trim();
        let rest = match rest.split_once("://") {
            Some(("bzfs", rest)) => rest,
            Some(_) => return None,
            None => rest,
        };
        let authority = rest.split('/').next().unwrap_or("");
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (authority, DEFAULT_LIST_SERVER_PORT),
        };
        if host.is_empty() || port == 0 {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ListServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
