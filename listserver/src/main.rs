use clap::Parser;
use listserver::{ListServer, ListServerConfig};
use log::info;
use shared::protocol::DEFAULT_LIST_SERVER_PORT;
use std::path::PathBuf;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Port to listen on
    #[clap(short, long, default_value_t = DEFAULT_LIST_SERVER_PORT)]
    port: u16,
    /// Minutes before an unrefreshed server is dropped
    #[clap(long, default_value = "45")]
    expiration: u64,
    /// Seconds between expiry checks
    #[clap(long, default_value = "10")]
    check_interval: u64,
    /// Seconds before an idle client is dropped
    #[clap(long, default_value = "10")]
    disconnect_timeout: u64,
    /// Maximum simultaneous clients
    #[clap(long, default_value = "20")]
    max_clients: usize,
    /// List new servers without first connecting to them
    #[clap(long)]
    no_probe: bool,
    /// Minutes between request statistics in the log (0 disables)
    #[clap(long, default_value = "60")]
    stats_interval: u64,
    /// Files with `name version build gameinfo title` lines to preload
    bootstrap: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = ListServerConfig {
        host: args.host,
        port: args.port,
        expiration: Duration::from_secs(args.expiration * 60),
        check_interval: Duration::from_secs(args.check_interval.max(1)),
        disconnect_timeout: Duration::from_secs(args.disconnect_timeout),
        max_clients: args.max_clients,
        probe: !args.no_probe,
        stats_interval: (args.stats_interval > 0)
            .then(|| Duration::from_secs(args.stats_interval * 60)),
        bootstrap: args.bootstrap,
        ..ListServerConfig::default()
    };

    let mut server = ListServer::bind(config).await?;
    let listed = server.bootstrap().await;
    if listed > 0 {
        info!("Preloaded {} servers", listed);
    }
    server.run().await?;

    Ok(())
}
