//! Room coordinator binary.
//!
//! ```bash
//! # listen on the default 0.0.0.0:8000
//! cargo run --bin callroom-coordinator
//!
//! RUST_LOG=debug cargo run --bin callroom-coordinator -- --listen 127.0.0.1:9000
//! ```

use callroom::server::{ServerConfig, SignalingServer, DEFAULT_LISTEN_ADDR};
use clap::Parser;
use std::net::SocketAddr;

/// Pairs participants of two-party calls and relays their session descriptions.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to accept WebSocket connections on
    #[arg(short, long, default_value = DEFAULT_LISTEN_ADDR, env = "CALLROOM_LISTEN")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let server = SignalingServer::new(ServerConfig {
        listen: args.listen,
    });
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupted");
        }
        shutdown.cancel();
    });

    if let Err(e) = server.run().await {
        log::error!("coordinator stopped: {}", e);
        std::process::exit(1);
    }
}
