use std::net::SocketAddr;
use std::process;

use linerpc::error::Result;
use linerpc::RpcTransportConfig;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: rpc-call <host:port> <method> [json-param ...]";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(args).await {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

async fn run(args: Vec<String>) -> Result<()> {
    let (address, method, raw_params) = match args.as_slice() {
        [address, method, params @ ..] => (address, method, params),
        _ => return Err(USAGE.into()),
    };
    let target = resolve(address).await?;
    let params: Vec<Value> = raw_params.iter().map(|p| parse_param(p)).collect();

    let transport = RpcTransportConfig::default().build();
    transport
        .connect(&target.ip().to_string(), target.port())
        .await?;
    let outcome = transport.call(method, params).await;
    let closed = transport.close().await;

    println!("{}", serde_json::to_string_pretty(&outcome?)?);
    closed?;
    Ok(())
}

/// Resolve `host:port`, including bracketed IPv6 literals such as `[::1]:10000`.
async fn resolve(address: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(address)
        .await
        .map_err(|e| format!("expected <host:port>, got {:?}: {}", address, e))?
        .next()
        .ok_or_else(|| format!("{:?} did not resolve to any address", address).into())
}

/// Bare words are sent as strings so `rpc-call ... reverse hello` works unquoted.
fn parse_param(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
