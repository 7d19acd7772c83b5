use clap::Parser;
use client::{DiscoveryConfig, ListServerClient, ServerLink};
use shared::GameEvent;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// List server to ask; may be given more than once
    #[arg(short = 'l', long = "list-server")]
    list_servers: Vec<String>,

    /// Seconds allowed for each list server
    #[arg(short = 't', long, default_value = "10")]
    timeout: u64,

    /// File holding the last server list
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Hours a cached server stays usable, 0 to disable the fallback
    #[arg(long, default_value = "24")]
    cache_max_age: u64,

    /// Join this game server instead of listing servers
    #[arg(short = 'j', long)]
    join: Option<SocketAddr>,

    #[arg(short = 'c', long, default_value = "observer")]
    callsign: String,

    #[arg(long, default_value = "0")]
    team: u16,

    /// Stay on TCP only
    #[arg(long)]
    no_udp: bool,
}

async fn list(args: Args) {
    let mut discovery = ListServerClient::new(DiscoveryConfig {
        list_servers: args.list_servers,
        timeout: Duration::from_secs(args.timeout),
        cache_path: args.cache,
        cache_max_age: Duration::from_secs(args.cache_max_age * 60 * 60),
    });
    let result = discovery.fetch().await;
    if result.cached {
        warn!("No list server answered, showing cached servers");
    }
    info!(
        "{} servers from {} list servers ({} failed)",
        result.servers.len(),
        result.reached,
        result.failed
    );
    for server in &result.servers {
        let players = server
            .game_info()
            .map(|info| info.player_count().to_string())
            .unwrap_or_else(|| "?".into());
        println!("{:<40} {:>3} players  {}", server.connect_target(), players, server.description());
    }
}

fn log_event(event: &GameEvent) {
    match event {
        GameEvent::PlayerAdded { id, callsign, team, .. } => {
            info!("Player {} joined as {:?} on team {}", id, callsign, team)
        }
        GameEvent::PlayerRemoved { id } => info!("Player {} left", id),
        GameEvent::Chat { from, text, .. } => info!("<{}> {}", from, text),
        GameEvent::Killed { victim, killer, .. } => info!("Player {} killed by {}", victim, killer),
        GameEvent::SuperKill => warn!("Server ended the session"),
        other => debug!("{:?}", other),
    }
}

async fn join(addr: SocketAddr, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut link = ServerLink::connect(addr).await?;
    link.enter(&args.callsign, 0, args.team).await?;
    if !args.no_udp {
        if let Err(e) = link.establish_udp().await {
            warn!("Staying on TCP: {}", e);
        }
    }

    let mut received = 0u64;
    loop {
        tokio::select! {
            event = link.next_event() => {
                log_event(&event?);
                received += 1;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    info!("Leaving after {} events", received);
    link.exit().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let target = args.join;
    match target {
        Some(addr) => {
            info!("Joining {} as {:?}", addr, args.callsign);
            join(addr, &args).await?;
        }
        None => list(args).await,
    }
    Ok(())
}
