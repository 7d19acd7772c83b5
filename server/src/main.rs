use clap::Parser;
use log::info;
use server::{Server, ServerConfig};
use shared::protocol::DEFAULT_SERVER_PORT;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Port for both TCP and UDP
    #[clap(short, long, default_value_t = DEFAULT_SERVER_PORT)]
    port: u16,
    /// Maximum number of players
    #[clap(short, long, default_value = "32")]
    max_players: usize,
    /// Tick rate (flushes per second)
    #[clap(short, long, default_value = "30")]
    tick_rate: u32,
    /// Seconds of silence before a player is dropped
    #[clap(long, default_value = "30")]
    disconnect_timeout: u64,
    /// Kick players that send position updates over TCP
    #[clap(long)]
    require_udp: bool,
    /// List server to publicize to (repeatable)
    #[clap(short, long = "list-server")]
    list_servers: Vec<String>,
    /// Address advertised to list servers
    #[clap(long)]
    public_address: Option<String>,
    /// Title advertised to list servers
    #[clap(long, default_value = "")]
    title: String,
    /// Drop this fraction of outbound datagrams (link testing)
    #[clap(long, default_value = "0.0")]
    udp_drop_rate: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        max_players: args.max_players,
        tick_rate: args.tick_rate,
        disconnect_timeout: Duration::from_secs(args.disconnect_timeout),
        require_udp: args.require_udp,
        list_servers: args.list_servers,
        public_address: args.public_address,
        public_title: args.title,
        udp_drop_rate: args.udp_drop_rate,
    };

    info!(
        "Starting server on {} ({} players, {} Hz)",
        config.bind_address(),
        config.max_players,
        config.tick_rate
    );

    let mut server = Server::bind(config).await?;
    server.run().await?;

    Ok(())
}
