use anyhow::{Context, Result};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

use open_lava::{
    client::LavaClient,
    config::Config,
    events::{Event, EventHandler},
};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(15);

/// Registra eventos de nodos y de la cola
struct Monitor;

#[async_trait]
impl EventHandler for Monitor {
    async fn on_event(&self, event: Event) {
        match event {
            Event::NodeReady { node, session_id, resumed } => {
                info!("🎉 {} ready, session {} (resumed: {})", node, session_id, resumed)
            }
            Event::NodeStats { node, stats } => info!(
                "📊 {}: {} players ({} playing), {:.1}% node load, up {}",
                node,
                stats.players,
                stats.playing_players,
                stats.cpu.lavalink_load * 100.0,
                humantime::format_duration(Duration::from_secs(stats.uptime / 1000))
            ),
            Event::NodeDisconnect { node } => warn!("🔌 {} disconnected", node),
            Event::NodeError { node, error } => error!("❌ {}: {}", node, error),
            Event::TrackStart { guild_id, track } => info!("▶️ [{}] {}", guild_id, track),
            Event::TrackError { guild_id, error, .. } => warn!("⚠️ [{}] {}", guild_id, error),
            Event::QueueEnd { guild_id } => info!("📭 [{}] queue ended", guild_id),
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_lava=debug".parse()?)
                .add_directive("reqwest=info".parse()?)
                .add_directive("tungstenite=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando open-lava v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(config).await;
    }

    info!("{}", config.summary());

    let client = LavaClient::new(config)?;
    client.events().on(Arc::new(Monitor));

    client.start().await.context("No audio node could be reached")?;

    if client.config().state_file.is_some() {
        let restored = client.restore_players(false).await;
        info!("♻️ {} player(s) restored", restored);
    }

    info!("🚀 Monitor running, Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("⚠️ Señal de shutdown recibida, cerrando...");

    client.stop().await;

    Ok(())
}

/// Imprime `OK` si un nodo entrega sesión y versión
async fn health_check(config: Config) -> Result<()> {
    let client = LavaClient::new(config)?;

    let outcome = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, client.start()).await;
    let healthy = matches!(outcome, Ok(Ok(())))
        && client
            .nodes()
            .iter()
            .any(|node| node.is_ready() && node.info().is_some());

    client.stop().await;

    if healthy {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("No node reported a session and version");
    }
}
