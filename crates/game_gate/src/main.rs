//! Main application entry point for the game gate.
//!
//! Loads configuration, sets up logging, wires the account routes onto the
//! runtime and serves until a shutdown signal arrives.

mod cli;
mod config;
mod logging;
mod routes;
mod signals;

use std::sync::Arc;

use anyhow::Context;
use game_runtime::{ConnectionInfo, GameServer, MemoryDatabase, OnlineHook, WriteBehindStore};
use tracing::{debug, error, info};

use crate::cli::CliArgs;
use crate::config::AppConfig;
use crate::routes::AccountDirectory;

/// First id handed to newly registered accounts.
const FIRST_ACCOUNT_ID: i64 = 10_000;

pub struct Application {
    config: AppConfig,
    server: Arc<GameServer>,
}

impl Application {
    pub async fn new(args: CliArgs) -> anyhow::Result<Self> {
        // Load configuration first (before logging setup)
        let mut config = AppConfig::load_from_file(&args.config_path).await?;
        config.apply_overrides(&args);

        if let Err(e) = config.validate() {
            anyhow::bail!("Configuration validation failed: {}", e);
        }

        logging::setup_logging(&config.logging)?;
        display_banner();

        let runtime = config.to_runtime_config()?;
        let store = Arc::new(WriteBehindStore::start(
            runtime.store.clone(),
            Arc::new(MemoryDatabase::new()),
        ));
        let accounts = Arc::new(AccountDirectory::new(FIRST_ACCOUNT_ID));
        let routes = routes::registry(accounts, store.clone());
        info!("🧭 Registered commands: {:?}", routes.commands());

        let online: OnlineHook = Arc::new(|info: &Arc<ConnectionInfo>| {
            debug!("Session {} online from {}", info.id(), info.remote_addr());
            info.on_close(|info| {
                debug!(
                    "Session {} offline after {:?} (key id {})",
                    info.id(),
                    info.age(),
                    info.key_id()
                );
            });
        });
        let server = GameServer::new(runtime, routes, store).with_online_hook(online);

        info!(
            "📂 Config: {} | HTTP: {} | Socket: {}",
            args.config_path.display(),
            config.http.bind_address,
            config.socket.bind_address
        );

        Ok(Self {
            config,
            server: Arc::new(server),
        })
    }

    /// Serves until a shutdown signal arrives or the server stops on its own.
    pub async fn run(self) -> anyhow::Result<()> {
        info!("🌟 Starting game gate");
        info!("📋 Configuration Summary:");
        info!("  🌐 HTTP address: {}", self.config.http.bind_address);
        info!("  🔌 Socket address: {}", self.config.socket.bind_address);
        info!("  ⏱️ Session idle timeout: {}s", self.config.socket.idle_timeout_secs);
        info!("  💾 Store flush interval: {}ms", self.config.store.flush_interval_ms);

        let mut server_handle = {
            let server = self.server.clone();
            tokio::spawn(async move { server.start().await })
        };

        info!("🛑 Press Ctrl+C to gracefully shutdown");
        let stopped = tokio::select! {
            signal = signals::wait_for_shutdown() => {
                signal?;
                false
            }
            finished = &mut server_handle => {
                finished.context("server task failed")??;
                true
            }
        };
        if !stopped {
            info!("🛑 Shutdown signal received, initiating graceful shutdown...");
            self.server.shutdown();
            server_handle.await.context("server task failed")??;
        }

        info!("📊 Final status: {}", self.server.status_line());
        info!("✅ Game gate shutdown complete");
        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start application: {:?}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn display_banner() {
    let version = env!("CARGO_PKG_VERSION");
    info!("╔══════════════════════════════════════════╗");
    info!("║               🎮 GAME GATE               ║");
    info!("║  HTTP + WebSocket request/reply service  ║");
    info!("╚══════════════════════════════════════════╝");
    info!("Version {}", version);
}
