//! Server configuration, independent of the command line.

use shared::protocol::DEFAULT_SERVER_PORT;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address both sockets bind to.
    pub host: String,
    /// TCP and UDP share this port; 0 picks a free one.
    pub port: u16,
    pub max_players: usize,
    /// Ticks per second.
    pub tick_rate: u32,
    /// Network sessions quiet for longer than this are dropped.
    pub disconnect_timeout: Duration,
    /// Kick players that keep sending position updates over TCP.
    pub require_udp: bool,
    /// `host[:port]` or `bzfs://host[:port]/` list servers to publicize to.
    pub list_servers: Vec<String>,
    /// Address advertised to list servers. Defaults to the bound address.
    pub public_address: Option<String>,
    pub public_title: String,
    /// Probability of dropping each outbound datagram, for link testing.
    pub udp_drop_rate: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_SERVER_PORT,
            max_players: 32,
            tick_rate: 30,
            disconnect_timeout: Duration::from_secs(30),
            require_udp: false,
            list_servers: Vec::new(),
            public_address: None,
            public_title: String::new(),
            udp_drop_rate: 0.0,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }

    pub fn publicizing(&self) -> bool {
        !self.list_servers.is_empty()
    }
}
