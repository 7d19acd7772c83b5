//! Reverse lookup of player addresses.
//!
//! Lookups run off the event loop; results come back by message and are
//! applied only if the slot still holds the same peer.

use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;

pub trait HostnameResolver: Send + Sync {
    /// Blocking lookup; may return `None` at any time.
    fn resolve(&self, ip: IpAddr) -> Option<String>;
}

/// Looks addresses up in a hosts table.
pub struct HostsFileResolver {
    path: PathBuf,
}

impl HostsFileResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for HostsFileResolver {
    fn default() -> Self {
        Self::new("/etc/hosts")
    }
}

impl HostnameResolver for HostsFileResolver {
    fn resolve(&self, ip: IpAddr) -> Option<String> {
        let contents = fs::read_to_string(&self.path).ok()?;
        lookup_hosts(&contents, ip)
    }
}

/// Never resolves anything.
#[derive(Debug, Default)]
pub struct NullResolver;

impl HostnameResolver for NullResolver {
    fn resolve(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// First hostname listed for `ip` in hosts-file syntax.
pub fn lookup_hosts(contents: &str, ip: IpAddr) -> Option<String> {
    contents.lines().find_map(|line| {
        let line = line.split('#').next().unwrap_or("");
        let mut fields = line.split_whitespace();
        let addr: IpAddr = fields.next()?.parse().ok()?;
        if addr != ip {
            return None;
        }
        fields.next().map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOSTS: &str = "\
# local table
127.0.0.1   localhost loopback
10.1.2.3    tank-one.lan tank-one   # office
::1         ip6-localhost
";

    #[test]
    fn test_lookup_hosts() {
        assert_eq!(
            lookup_hosts(HOSTS, "10.1.2.3".parse().unwrap()),
            Some("tank-one.lan".into())
        );
        assert_eq!(
            lookup_hosts(HOSTS, "::1".parse().unwrap()),
            Some("ip6-localhost".into())
        );
        assert_eq!(lookup_hosts(HOSTS, "10.9.9.9".parse().unwrap()), None);
    }

    #[test]
    fn test_missing_hosts_file_resolves_nothing() {
        let resolver = HostsFileResolver::new("/nonexistent/hosts");
        assert_eq!(resolver.resolve("127.0.0.1".parse().unwrap()), None);
    }
}
