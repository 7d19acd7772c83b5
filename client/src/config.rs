use std::path::PathBuf;
use std::time::Duration;

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// `bzfs://host:port/` style addresses of list servers to ask.
    pub list_servers: Vec<String>,
    /// Budget for each list server, from connect to the end of its reply.
    pub timeout: Duration,
    pub cache_path: Option<PathBuf>,
    /// Cached servers older than this are not offered. Zero disables the
    /// fallback.
    pub cache_max_age: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            list_servers: Vec::new(),
            timeout: Duration::from_secs(10),
            cache_path: None,
            cache_max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}
