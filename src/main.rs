//! Syncore Server
//!
//! Runs the sync listener until Ctrl-C. `SYNC_MODE=host` runs host mode
//! instead (listener plus a local client agent); `SYNC_CONFIG` points at a
//! JSON configuration file, `SYNC_*` variables override it.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use syncore::{ModeCoordinator, NetworkMode, SyncConfig, SyncContext, TransportListener, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Syncore Server v{}", VERSION);

    let mut config = match std::env::var("SYNC_CONFIG") {
        Ok(path) => SyncConfig::from_json_file(&path)
            .with_context(|| format!("loading config from {}", path))?,
        Err(_) => SyncConfig::default(),
    };
    config.apply_env().context("applying SYNC_* overrides")?;

    info!("Tick Rate: {} Hz", config.tick_rate);
    info!("Max Players: {}", config.max_players);
    info!(
        "Movement validation: {} (max speed {}, tolerance {})",
        config.validate_movement, config.max_speed, config.teleport_tolerance
    );
    info!("Encryption: {}, compression: {}", config.encryption, config.compression);

    let port = config.port;
    let host_mode = std::env::var("SYNC_MODE").map(|m| m == "host").unwrap_or(false);
    let ctx = SyncContext::new(config).context("building sync context")?;

    if host_mode {
        let mut mode = ModeCoordinator::new(ctx);
        let addr = mode.start_host(port).await.context("starting host mode")?;
        info!("Host mode on {}", addr);

        let mut frame = tokio::time::interval(std::time::Duration::from_millis(16));
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = frame.tick() => {
                    if let Err(e) = mode.update(0.016).await {
                        tracing::warn!("Local agent update failed: {}", e);
                    }
                    if mode.mode() == NetworkMode::Offline {
                        break;
                    }
                }
                _ = &mut shutdown => break,
            }
        }
        mode.disconnect().await;
    } else {
        let mut listener = TransportListener::new(ctx);
        listener.start(port).await.context("starting listener")?;
        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        listener.stop().await;
    }

    info!("Shutdown complete");
    Ok(())
}
