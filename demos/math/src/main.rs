use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Result;
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use nano_mesh::{ActClient, NodeConfig, ServiceNode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SUM: &str = "role:math,cmd:sum";
const SUM_ZERO: &str = "role:math,cmd:sum,return:zero";
const POSITIVE: &str = "role:math,cmd:positive";

#[derive(Parser)]
#[clap(name = "math")]
#[clap(about = "Example math services for the mesh")]
struct Args {
    /// Which service to run
    #[clap(value_enum, default_value = "sum")]
    service: Service,

    /// Host advertised to the broker
    #[clap(long, env = "NANO_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[clap(long, env = "NANO_PORT", default_value = "9090")]
    port: u16,

    /// Broker host:port
    #[clap(long, env = "NANO_BROKER", default_value = "127.0.0.1:8080")]
    broker: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum Service {
    /// `role:math,cmd:sum`: adds Left and Right
    Sum,
    /// `role:math,cmd:sum,return:zero`: a more specific sum that always answers 0
    SumZero,
    /// `role:math,cmd:positive`: whether Value is positive
    Positive,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SumRequest {
    left: i64,
    right: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PositiveRequest {
    value: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Answer<T> {
    result: T,
}

async fn sum(client: ActClient, body: Bytes) -> nano_mesh::Result<Bytes> {
    let request: SumRequest = serde_json::from_slice(&body)?;

    // Ask the positive-check service about the left operand on the way.
    let check = json!({ "Pattern": POSITIVE, "ServiceRequest": true, "Value": request.left });
    match client.act(serde_json::to_vec(&check)?, POSITIVE).await {
        Ok(answer) => info!("positive check: {}", String::from_utf8_lossy(&answer)),
        Err(err) => warn!("positive check failed: {err}"),
    }

    let answer = Answer {
        result: request.left + request.right,
    };
    Ok(serde_json::to_vec(&answer)?.into())
}

async fn sum_zero(body: Bytes) -> nano_mesh::Result<Bytes> {
    let _request: SumRequest = serde_json::from_slice(&body)?;
    Ok(serde_json::to_vec(&Answer { result: 0 })?.into())
}

async fn positive(body: Bytes) -> nano_mesh::Result<Bytes> {
    let request: PositiveRequest = serde_json::from_slice(&body)?;
    let answer = Answer {
        result: request.value > 0,
    };
    Ok(serde_json::to_vec(&answer)?.into())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let config = NodeConfig::new(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port)),
        args.broker,
    )
    .advertise(format!("{}:{}", args.host, args.port));
    let node = ServiceNode::new(config);
    let client = node.client();

    let guard = match args.service {
        Service::Sum => {
            node.add(SUM, move |body| sum(client.clone(), body))
                .await?
        }
        Service::SumZero => node.add(SUM_ZERO, sum_zero).await?,
        Service::Positive => node.add(POSITIVE, positive).await?,
    };
    info!(
        "Serving {} on {}",
        guard.record().pattern,
        guard.record().service_address
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    guard.shutdown().await?;
    Ok(())
}
