//! A minimal juggler server: echoes every request back to its caller,
//! notifies each new connection with a greeting, and logs inbound notifies.
//!
//! ```text
//! cargo run --example echo_server -- --port 8080
//! ```

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing::info;

use juggler::config::ServerConfig;
use juggler::connection::ConnectionHandler;
use juggler::session::{NotifyHandler, RequestHandler};

#[derive(Parser)]
#[command(about = "Echo server for the juggler protocol")]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to bind (0 picks an ephemeral port).
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Path under which static files are served, if any.
    #[arg(long)]
    static_dir: Option<std::path::PathBuf>,

    /// htpasswd file required to accept connections, if any.
    #[arg(long)]
    htpasswd_file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = ServerConfig::new(args.host, args.port).autoflush_delay(Some(Duration::from_millis(50)));
    if let Some(dir) = args.static_dir {
        config = config.static_dir(dir);
    }
    if let Some(htpasswd) = args.htpasswd_file {
        config = config.htpasswd_file(htpasswd);
    }

    let request_handler: RequestHandler = Arc::new(|name, data| {
        Box::pin(async move {
            info!("request {name:?}: {data}");
            Ok(data)
        })
    });

    let notify_handler: NotifyHandler = Arc::new(|name, data| {
        info!("notify {name:?}: {data}");
    });

    let connection_handler: ConnectionHandler = Arc::new(|conn| {
        tokio::spawn(async move {
            let _ = conn.notify("welcome", json!({"message": "connected"})).await;
        });
    });

    let server = juggler::server::listen(
        config,
        Some(connection_handler),
        Some(request_handler),
        Some(notify_handler),
    )
    .await?;

    info!("listening on {}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.close().await;
    Ok(())
}
