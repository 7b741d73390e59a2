//! Crash Game Server
//!
//! Usage: `crash-server <v4|v6> <port>`
//!
//! Binds the unspecified address of the chosen family and serves the game
//! over WebSocket until Ctrl-C. Round timing and limits come from `CRASH_*`
//! environment variables; log filtering from `RUST_LOG`.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crash_game::{GameConfig, GameServer, ServerConfig, VERSION};

/// Address family selected on the command line.
#[derive(Debug, Clone, Copy)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn unspecified(self, port: u16) -> SocketAddr {
        match self {
            Family::V4 => SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            Family::V6 => SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
        }
    }
}

/// Validate arguments or exit with status 1 before any networking.
fn parse_args() -> (Family, u16) {
    let args: Vec<String> = std::env::args().collect();
    let prog = args.first().map(String::as_str).unwrap_or("crash-server");

    if args.len() != 3 {
        eprintln!("Usage: {} <v4|v6> <port>", prog);
        std::process::exit(1);
    }

    let family = match args[1].as_str() {
        "v4" => Family::V4,
        "v6" => Family::V6,
        other => {
            eprintln!("Invalid protocol family {:?}: expected v4 or v6", other);
            eprintln!("Usage: {} <v4|v6> <port>", prog);
            std::process::exit(1);
        }
    };

    let port = match args[2].parse::<u16>() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("Invalid port {:?}", args[2]);
            eprintln!("Usage: {} <v4|v6> <port>", prog);
            std::process::exit(1);
        }
    };

    (family, port)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (family, port) = parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let game_config = GameConfig::from_env().context("invalid game configuration")?;
    let server_config = ServerConfig {
        bind_addr: family.unspecified(port),
        ..ServerConfig::from_env().context("invalid server configuration")?
    };

    info!(
        "Crash server v{} ({:?}), up to {} sessions",
        VERSION, family, server_config.max_sessions
    );

    let server = Arc::new(GameServer::new(server_config, game_config));

    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => signal_server.shutdown(),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server
        .run()
        .await
        .with_context(|| format!("server on port {} failed", port))?;

    info!("Server stopped");
    Ok(())
}
