// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! QLM Gateway - IoT measurement store over WebSocket and HTTP.
//!
//! Nodes report values with Write envelopes; clients subscribe (optionally
//! with a delivery interval), poll and cancel over one WebSocket connection.
//!
//! # Usage
//!
//! ```bash
//! # Start on 127.0.0.1:8000
//! qlm-ws
//!
//! # Custom address
//! qlm-ws --bind 0.0.0.0 --port 8080
//!
//! # Using a config file
//! qlm-ws --config gateway.json
//! qlm-ws gen-config -o gateway.json
//! ```
//!
//! # Endpoints
//!
//! - `GET /qlmws`: WebSocket, one envelope per frame
//! - `POST /qlm`: one-shot envelope request
//! - `GET /qlm/Objects/`: known nodes
//! - `GET /qlm/Objects/{node}/`: measurements of a node
//! - `GET /health`

mod config;
mod handlers;
mod transport;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use config::{ConfigError, ServerConfig};
use qlm_core::{InMemoryStore, JsonCodec, MessageDispatcher};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// QLM Gateway
#[derive(Parser, Debug, Clone)]
#[command(name = "qlm-ws")]
#[command(about = "QLM Gateway - IoT measurement store over WebSocket")]
#[command(version)]
struct Args {
    /// Configuration file path (JSON); takes precedence over other flags
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Maximum concurrent WebSocket connections
    #[arg(long)]
    max_clients: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Write a default configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "qlm-ws.json")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

impl Args {
    fn build_config(&self) -> Result<ServerConfig, ConfigError> {
        let config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => {
                let mut config = ServerConfig::default();
                if let Some(port) = self.port {
                    config.port = port;
                }
                if let Some(bind) = self.bind {
                    config.bind_address = bind;
                }
                if let Some(max_clients) = self.max_clients {
                    config.max_clients = max_clients;
                }
                config
            }
        };
        config.validate()?;
        Ok(config)
    }
}

/// Shared application state
pub struct AppState {
    dispatcher: Arc<MessageDispatcher>,
    config: ServerConfig,
    client_count: AtomicUsize,
}

impl AppState {
    fn new(config: ServerConfig) -> Self {
        let store = InMemoryStore::with_config(config.store_config());
        let dispatcher = MessageDispatcher::new(Arc::new(store), Arc::new(JsonCodec));

        Self {
            dispatcher: Arc::new(dispatcher),
            config,
            client_count: AtomicUsize::new(0),
        }
    }

    /// Reserve a connection slot; `None` once `max_clients` are connected.
    ///
    /// Check and increment are one atomic step, so concurrent upgrades never
    /// overshoot the limit.
    fn try_acquire_client(self: &Arc<Self>) -> Option<ClientSlot> {
        let max = self.config.max_clients;
        let previous = self
            .client_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < max).then_some(count + 1)
            })
            .ok()?;
        info!("Client connected. Total: {}", previous + 1);
        Some(ClientSlot {
            state: Arc::clone(self),
        })
    }

    fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Acquire)
    }
}

/// A reserved connection slot, released on drop.
pub struct ClientSlot {
    state: Arc<AppState>,
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        let previous = self.state.client_count.fetch_sub(1, Ordering::AcqRel);
        info!("Client disconnected. Total: {}", previous.saturating_sub(1));
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(cmd) = &args.command {
        return match cmd {
            Commands::GenConfig { output } => {
                ServerConfig::default().to_file(output)?;
                println!("Configuration written to {}", output.display());
                Ok(())
            }
            Commands::Validate { config } => {
                ServerConfig::from_file(config)?.validate()?;
                println!("Configuration is valid: {}", config.display());
                Ok(())
            }
        };
    }

    let config = args.build_config()?;
    let addr = config.socket_addr();

    info!("QLM Gateway v{}", env!("CARGO_PKG_VERSION"));

    let state = Arc::new(AppState::new(config));
    let app = build_router(state.clone());

    info!("WebSocket endpoint: ws://{}/qlmws", addr);
    info!("Objects: http://{}/qlm/Objects/", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    state.dispatcher.shutdown();
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/qlmws", get(handlers::ws_handler))
        .route("/qlm", post(handlers::request_handler))
        .route("/qlm/Objects/", get(handlers::node_list))
        .route("/qlm/Objects/:node/", get(handlers::source_list))
        .route("/qlm/Objects/:node", get(handlers::source_list))
        .route("/health", get(handlers::health_handler))
        .layer(DefaultBodyLimit::max(state.config.max_frame_size))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from(["qlm-ws", "--port", "9001", "--max-clients", "3"]);
        let config = args.build_config().unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.max_clients, 3);
        assert_eq!(config.bind_address.to_string(), "127.0.0.1");
    }

    #[test]
    fn test_config_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gw.json");
        std::fs::write(&path, r#"{"port": 8500}"#).unwrap();

        let args = Args::parse_from([
            "qlm-ws",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "9001",
        ]);
        assert_eq!(args.build_config().unwrap().port, 8500);
    }

    #[test]
    fn test_client_slots_respect_limit() {
        let state = Arc::new(AppState::new(ServerConfig {
            max_clients: 2,
            ..Default::default()
        }));

        let first = state.try_acquire_client().unwrap();
        let _second = state.try_acquire_client().unwrap();
        assert!(state.try_acquire_client().is_none());
        assert_eq!(state.client_count(), 2);

        drop(first);
        assert_eq!(state.client_count(), 1);
        assert!(state.try_acquire_client().is_some());
    }

    #[test]
    fn test_concurrent_acquires_never_exceed_limit() {
        let state = Arc::new(AppState::new(ServerConfig {
            max_clients: 5,
            ..Default::default()
        }));

        let granted: Vec<ClientSlot> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..32)
                .map(|_| scope.spawn(|| state.try_acquire_client()))
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect()
        });

        assert_eq!(granted.len(), 5);
        assert_eq!(state.client_count(), 5);
        drop(granted);
        assert_eq!(state.client_count(), 0);
    }

    #[test]
    fn test_invalid_flags_rejected() {
        let args = Args::parse_from(["qlm-ws", "--max-clients", "0"]);
        assert!(matches!(args.build_config(), Err(ConfigError::Invalid(_))));
    }
}
