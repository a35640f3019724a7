use anyhow::{Context, Result};
use std::{path::PathBuf, time::Duration};
use url::Url;

use crate::node::protocol::WS_PATH;

pub const DEFAULT_CLIENT_NAME: &str = concat!("open-lava/", env!("CARGO_PKG_VERSION"));

/// Configuración de conexión de un nodo de audio
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Nombre para logs y eventos; `host:port` si no se define
    pub name: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub secure: bool,

    // Tiempos de espera
    pub session_wait: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_reconnect_attempts: u32,
}

impl NodeConfig {
    /// Crea la configuración de un nodo con valores por defecto
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            name: format!("{host}:{port}"),
            host,
            port,
            password: password.into(),
            ..Default::default()
        }
    }

    /// URL del WebSocket v4
    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/{}", scheme, self.host, self.port, WS_PATH)
    }

    /// URL base para REST
    pub fn http_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "127.0.0.1:2333".to_string(),
            host: "127.0.0.1".to_string(),
            port: 2333,
            password: "youshallnotpass".to_string(),
            secure: false,
            session_wait: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub nodes: Vec<NodeConfig>,

    // Cliente
    pub user_id: u64,
    pub client_name: String,

    // Players
    pub default_volume: u16,
    pub voice_debounce: Duration,
    pub advance_delay: Duration,

    // Persistencia
    pub state_file: Option<PathBuf>,
    pub state_save_interval: Duration,
}

impl Config {
    /// Carga la configuración desde variables de entorno y `.env`
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let password = env_or("LAVALINK_PASSWORD", "youshallnotpass");
        let secure = env_or("LAVALINK_SECURE", "false")
            .parse()
            .context("LAVALINK_SECURE must be true or false")?;
        let template = NodeConfig {
            password: password.clone(),
            secure,
            session_wait: env_duration("SESSION_WAIT", "5s")?,
            connect_timeout: env_duration("CONNECT_TIMEOUT", "10s")?,
            request_timeout: env_duration("REQUEST_TIMEOUT", "10s")?,
            max_reconnect_attempts: env_or("MAX_RECONNECT_ATTEMPTS", "5")
                .parse()
                .context("MAX_RECONNECT_ATTEMPTS must be a number")?,
            ..Default::default()
        };

        let nodes = match std::env::var("LAVALINK_NODES") {
            Ok(list) if !list.trim().is_empty() => list
                .split(',')
                .map(|entry| parse_node(entry.trim(), &template))
                .collect::<Result<Vec<_>>>()?,
            _ => {
                let host = env_or("LAVALINK_HOST", "127.0.0.1");
                let port = env_or("LAVALINK_PORT", "2333")
                    .parse()
                    .context("LAVALINK_PORT must be a port number")?;
                let name = std::env::var("LAVALINK_NAME").unwrap_or_else(|_| format!("{host}:{port}"));
                vec![NodeConfig {
                    name,
                    host,
                    port,
                    ..template.clone()
                }]
            }
        };

        let state_file = std::env::var("STATE_FILE")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        let config = Self {
            nodes,
            user_id: std::env::var("CLIENT_USER_ID")
                .context("CLIENT_USER_ID is required")?
                .parse()
                .context("CLIENT_USER_ID must be a numeric id")?,
            client_name: env_or("CLIENT_NAME", DEFAULT_CLIENT_NAME),
            default_volume: env_or("DEFAULT_VOLUME", "100")
                .parse()
                .context("DEFAULT_VOLUME must be a number")?,
            voice_debounce: env_duration("VOICE_DEBOUNCE", "50ms")?,
            advance_delay: env_duration("ADVANCE_DELAY", "100ms")?,
            state_file,
            state_save_interval: env_duration("STATE_SAVE_INTERVAL", "5s")?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Valida la configuración.
    ///
    /// - Al menos un nodo, cada uno con puerto distinto de cero y URL válida
    /// - Volumen por defecto dentro de 0-1000
    /// - Espera de sesión mayor a cero, debounce de voz de hasta 5 segundos
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            anyhow::bail!("At least one node must be configured");
        }

        for node in &self.nodes {
            if node.port == 0 {
                anyhow::bail!("Node {} has port 0", node.name);
            }
            Url::parse(&node.ws_url()).with_context(|| format!("Node {} has an invalid address", node.name))?;
            if node.session_wait.is_zero() {
                anyhow::bail!("Node {} must wait for a session id longer than 0s", node.name);
            }
        }

        if self.default_volume > 1000 {
            anyhow::bail!("Default volume must be between 0 and 1000, got: {}", self.default_volume);
        }

        if self.voice_debounce > Duration::from_secs(5) {
            anyhow::bail!(
                "Voice debounce must not exceed 5s, got: {}",
                humantime::format_duration(self.voice_debounce)
            );
        }

        Ok(())
    }

    /// Resumen para logs, sin contraseñas
    pub fn summary(&self) -> String {
        let nodes: Vec<String> = self
            .nodes
            .iter()
            .map(|node| format!("{} ({})", node.name, node.ws_url()))
            .collect();

        format!(
            "Config Summary:\n  \
            Client: {} (user {})\n  \
            Nodes: {}\n  \
            Players: {} vol, {} debounce, {} advance delay\n  \
            State: {}",
            self.client_name,
            self.user_id,
            nodes.join(", "),
            self.default_volume,
            humantime::format_duration(self.voice_debounce),
            humantime::format_duration(self.advance_delay),
            self.state_file
                .as_ref()
                .map_or("disabled".to_string(), |path| path.display().to_string()),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodes: vec![NodeConfig::default()],
            user_id: 0,
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            default_volume: 100,
            voice_debounce: Duration::from_millis(50),
            advance_delay: Duration::from_millis(100),
            state_file: None,
            state_save_interval: Duration::from_secs(5),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_duration(key: &str, default: &str) -> Result<Duration> {
    let raw = env_or(key, default);
    humantime::parse_duration(&raw).with_context(|| format!("{key} is not a duration: {raw}"))
}

fn parse_node(entry: &str, template: &NodeConfig) -> Result<NodeConfig> {
    let (host, port) = entry
        .rsplit_once(':')
        .with_context(|| format!("Node entry must be host:port, got: {entry}"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("Invalid port in node entry: {entry}"))?;

    Ok(NodeConfig {
        name: entry.to_string(),
        host: host.to_string(),
        port,
        ..template.clone()
    })
}
