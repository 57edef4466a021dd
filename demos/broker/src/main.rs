use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use nano_mesh::{Broker, BrokerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(name = "broker")]
#[clap(about = "Pattern broker backed by redis")]
struct Args {
    /// Port to listen on
    #[clap(long, env = "NANO_PORT", default_value = "8080")]
    port: u16,

    /// Redis host:port
    #[clap(long, env = "NANO_REDIS", default_value = "127.0.0.1:6379")]
    redis: String,

    /// Redis password
    #[clap(long, env = "NANO_REDIS_PASSWORD")]
    redis_password: Option<String>,

    /// Redis logical database
    #[clap(long, env = "NANO_REDIS_DB", default_value = "0")]
    redis_db: i64,

    /// Per-hop forwarding deadline in milliseconds (unbounded if unset)
    #[clap(long)]
    forward_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut config = BrokerConfig::default()
        .bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port)))
        .redis_address(args.redis)
        .redis_db(args.redis_db);
    if let Some(password) = args.redis_password {
        config = config.redis_password(password);
    }
    if let Some(ms) = args.forward_timeout_ms {
        config = config.forward_timeout(Duration::from_millis(ms));
    }

    let broker = Broker::connect(&config).await?;
    let guard = broker.serve(config.bind).await?;
    info!("Broker listening on {}", guard.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    guard.shutdown().await?;
    Ok(())
}
