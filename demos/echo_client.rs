//! A minimal juggler client: sends one request, logs every inbound
//! notification for a while, then exits.
//!
//! ```text
//! cargo run --example echo_client -- --address ws://127.0.0.1:8080/ws --message hello
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing::info;

use juggler::config::ClientConfig;
use juggler::session::NotifyHandler;

#[derive(Parser)]
#[command(about = "Echo client for the juggler protocol")]
struct Args {
    /// Server address to dial.
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
    address: String,

    /// Payload to echo through the `request` round trip.
    #[arg(long, default_value = "hello")]
    message: String,

    /// How long to keep listening for notifications before exiting, in
    /// seconds.
    #[arg(long, default_value_t = 5)]
    listen_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let notify_handler: NotifyHandler = Arc::new(|name, data| {
        info!("notify {name:?}: {data}");
    });

    let config = ClientConfig::new(args.address);
    let connection = juggler::connect(config, Some(notify_handler)).await?;

    let echoed = connection.request("", json!(args.message)).await?;
    info!("echoed back: {echoed}");

    tokio::time::sleep(Duration::from_secs(args.listen_secs)).await;
    connection.close().await;
    Ok(())
}
