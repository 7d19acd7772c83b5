use shared::protocol::DEFAULT_LIST_SERVER_PORT;
use std::path::PathBuf;
use std::time::Duration;

/// List server configuration
#[derive(Debug, Clone)]
pub struct ListServerConfig {
    pub host: String,
    pub port: u16,
    /// Entries not refreshed within this window go stale.
    pub expiration: Duration,
    pub check_interval: Duration,
    /// Idle clients are dropped after this long.
    pub disconnect_timeout: Duration,
    pub max_clients: usize,
    /// Connect to newly added servers before listing them.
    pub probe: bool,
    pub probe_timeout: Duration,
    pub stats_interval: Option<Duration>,
    /// Files of `name version build gameinfo title` lines loaded at startup.
    pub bootstrap: Vec<PathBuf>,
}

impl Default for ListServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_LIST_SERVER_PORT,
            expiration: Duration::from_secs(45 * 60),
            check_interval: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(10),
            max_clients: 20,
            probe: true,
            probe_timeout: Duration::from_secs(10),
            stats_interval: Some(Duration::from_secs(60 * 60)),
            bootstrap: Vec::new(),
        }
    }
}

impl ListServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ListServerConfig::default();
        assert_eq!(config.port, 5156);
        assert_eq!(config.max_clients, 20);
        assert_eq!(config.expiration, Duration::from_secs(2700));
        assert_eq!(config.bind_address(), "0.0.0.0:5156");
    }
}
