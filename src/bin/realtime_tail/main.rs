//! Tail one realtime topic and log every frame
//!
//! Usage: `realtime-tail [--testnet] <symbol> [table]`
//!
//! A missing table (or `*`) subscribes to every table the connection may
//! use. `BITMEX_API_KEY_ID` and `BITMEX_API_KEY_SECRET` enable private
//! tables.

use bitmex_realtime::{CallbackResult, ClientConfig, ClientEvent, RealtimeClient};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: realtime-tail [--testnet] <symbol> [table]";

#[tokio::main]
async fn main() -> bitmex_realtime::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realtime_tail=info,bitmex_realtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut testnet = false;
    let mut positional = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--testnet" => testnet = true,
            "-h" | "--help" => {
                println!("{USAGE}");
                return Ok(());
            }
            _ => positional.push(arg),
        }
    }
    let Some(symbol) = positional.first().cloned() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };
    let table = positional.get(1).cloned();

    let mut config = if testnet {
        ClientConfig::testnet()
    } else {
        ClientConfig::mainnet()
    };
    config.api_key_id = std::env::var("BITMEX_API_KEY_ID").ok();
    config.api_key_secret = std::env::var("BITMEX_API_KEY_SECRET").ok();

    let client = RealtimeClient::spawn(config).await?;
    let mut events = client.events().await;
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::Error(e) => tracing::error!(error = %e, "Client error"),
                other => tracing::info!(event = ?other, "Client event"),
            }
        }
    });

    let status = client
        .add_stream(&symbol, table.as_deref(), |data: &Value, symbol: &str, table: &str| -> CallbackResult {
            let rows = data.as_array().map_or(1, Vec::len);
            tracing::info!(table, symbol, rows, "{data}");
            Ok(())
        })
        .await?;
    tracing::info!(?status, "Stream requested");

    tokio::select! {
        result = client.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, closing");
            client.close().await;
            client.wait().await
        }
    }
}
