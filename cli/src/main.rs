//! evmrpc CLI — call, probe and subscribe to JSON-RPC endpoints from the terminal.
//!
//! Usage:
//! ```bash
//! # Probe an endpoint
//! evmrpc test --url https://cloudflare-eth.com
//!
//! # Send a JSON-RPC call, failing over to a second node
//! evmrpc call --url https://rpc-a.example --fallback https://rpc-b.example \
//!     --method eth_getBalance --params '["0xabc…", "latest"]'
//!
//! # Print three new block headers
//! evmrpc subscribe --url wss://rpc.example --kind newHeads --count 3
//! ```
//!
//! Set `RUST_LOG=evmrpc_core=debug` to see retries, failover and reconnects.

use std::env;
use std::process;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use evmrpc_core::{
    FallbackConfig, FallbackTransport, JsonRpcRequest, RpcTransport, RpcTransportExt,
};
use evmrpc_http::HttpRpcClient;
use evmrpc_ws::{WsClientConfig, WsRpcClient};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "test" => cmd_test(&args[2..]).await,
        "call" => cmd_call(&args[2..]).await,
        "subscribe" => cmd_subscribe(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("evmrpc {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("evmrpc {}", env!("CARGO_PKG_VERSION"));
    println!("Call and inspect Ethereum JSON-RPC endpoints\n");
    println!("USAGE:");
    println!("    evmrpc <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    test       Probe an endpoint (latency, block number)");
    println!("    call       Send one JSON-RPC call");
    println!("    subscribe  Stream eth_subscribe pushes over WebSocket");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("FLAGS:");
    println!("    --url <URL>        Endpoint URL (http(s):// or ws(s)://)  [required]");
    println!("    --method <NAME>    Method for `call`                      [required]");
    println!("    --params <JSON>    JSON array of params for `call`        [default: []]");
    println!("    --fallback <URL>   Extra endpoint for `call`, repeatable");
    println!("    --kind <KIND>      Subscription kind for `subscribe`      [default: newHeads]");
    println!("    --count <N>        Pushes to print before exiting         [default: 1]");
}

async fn cmd_test(args: &[String]) -> Result<()> {
    let url = parse_flag(args, "--url").context("--url is required")?;
    let client = connect(&url).await?;

    println!("Testing {}...", client.url());

    let start = Instant::now();
    let block: String = client.call("eth_blockNumber", vec![]).await?;
    let latency = start.elapsed();
    let chain_id: String = client.call("eth_chainId", vec![]).await?;

    let block_num = u64::from_str_radix(block.trim_start_matches("0x"), 16).unwrap_or(0);

    println!("  Status:       OK");
    println!("  Chain id:     {chain_id}");
    println!("  Block number: {block_num} ({block})");
    println!("  Latency:      {}ms", latency.as_millis());
    println!("  Health:       {}", client.health());

    client.close().await?;
    Ok(())
}

async fn cmd_call(args: &[String]) -> Result<()> {
    let url = parse_flag(args, "--url").context("--url is required")?;
    let method = parse_flag(args, "--method").context("--method is required")?;
    let params = parse_params(parse_flag(args, "--params").as_deref())?;
    let fallbacks = parse_all(args, "--fallback");

    let client: Arc<dyn RpcTransport> = if fallbacks.is_empty() {
        connect(&url).await?
    } else {
        let mut children = vec![connect(&url).await?];
        for url in &fallbacks {
            children.push(connect(url).await?);
        }
        let fallback: Arc<dyn RpcTransport> =
            FallbackTransport::new(children, FallbackConfig::default())?;
        fallback
    };

    let resp = client.send(JsonRpcRequest::method(method.as_str(), params)).await?;
    let result = resp
        .into_result()
        .map_err(|e| anyhow!("{method} failed: {e}"))?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    client.close().await?;
    Ok(())
}

async fn cmd_subscribe(args: &[String]) -> Result<()> {
    let url = parse_flag(args, "--url").context("--url is required")?;
    let kind = parse_flag(args, "--kind").unwrap_or_else(|| "newHeads".to_string());
    let count: usize = match parse_flag(args, "--count") {
        Some(n) => n.parse().context("--count must be a number")?,
        None => 1,
    };
    if !is_ws(&url) {
        bail!("subscribe needs a ws:// or wss:// URL");
    }

    let client = WsRpcClient::connect(&url, WsClientConfig::default()).await?;
    let (sub, mut pushes) = client.subscribe_channel(vec![Value::String(kind.clone())]).await?;
    eprintln!(
        "Subscribed to {kind} on {} (id {})",
        client.url(),
        sub.id().map(|id| id.0).unwrap_or_default()
    );

    let mut printed = 0;
    while printed < count {
        match pushes.recv().await {
            Some(Ok(value)) => {
                println!("{}", serde_json::to_string(&value)?);
                printed += 1;
            }
            Some(Err(e)) => tracing::warn!(error = %e, "subscription interrupted"),
            None => bail!("connection closed"),
        }
    }

    sub.unsubscribe().await?;
    client.close().await?;
    Ok(())
}

async fn connect(url: &str) -> Result<Arc<dyn RpcTransport>> {
    let client: Arc<dyn RpcTransport> = if is_ws(url) {
        Arc::new(WsRpcClient::connect(url, WsClientConfig::default()).await?)
    } else {
        Arc::new(HttpRpcClient::default_for(url)?)
    };
    Ok(client)
}

fn is_ws(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://")
}

fn parse_params(raw: Option<&str>) -> Result<Vec<Value>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    match serde_json::from_str::<Value>(raw).context("--params must be JSON")? {
        Value::Array(items) => Ok(items),
        other => bail!("--params must be a JSON array, got {other}"),
    }
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn parse_all(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|pair| pair[0] == flag)
        .map(|pair| pair[1].clone())
        .collect()
}
