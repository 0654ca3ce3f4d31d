//! Serve command implementation.

use evlog_server::{RemoteController, SegmentServer, ServerConfig, ServerState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Command-line settings that take precedence over the config file.
#[derive(Debug, Default)]
pub struct Overrides {
    /// Listen and advertise address.
    pub ip: Option<String>,
    /// Listen port.
    pub port: Option<u16>,
    /// Volume directory.
    pub volume_dir: Option<PathBuf>,
    /// Volume id.
    pub volume_id: Option<u64>,
    /// Controller addresses; empty keeps the configured ones.
    pub controllers: Vec<String>,
    /// Forces debug mode on.
    pub debug_mode: bool,
}

impl Overrides {
    fn apply(self, mut config: ServerConfig) -> ServerConfig {
        if let Some(ip) = self.ip {
            config.ip = ip;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(dir) = self.volume_dir {
            config.volume.dir = dir;
        }
        if let Some(id) = self.volume_id {
            config.volume.id = id;
        }
        if !self.controllers.is_empty() {
            config.controller_addresses = self.controllers;
        }
        if self.debug_mode {
            config.debug_mode = true;
        }
        config
    }
}

/// Runs the serve command until interrupted.
pub fn run(config_path: Option<&Path>, overrides: Overrides) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config_path {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    let config = overrides.apply(config).with_env();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind((config.ip.as_str(), config.port)).await?;
    let controller = Arc::new(RemoteController::new(config.controller_addresses.clone()));
    let server = Arc::new(SegmentServer::new(config, controller)?);

    server.initialize().await?;
    if server.status() != ServerState::Running {
        server.start().await?;
    }

    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    server.stop().await?;
    serving.await??;
    Ok(())
}
