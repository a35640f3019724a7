use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::audio::{queue::LoopMode, track::Track};

/// Estado de un player guardado para restaurarlo tras un reinicio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub guild_id: u64,
    pub node: String,
    pub voice_channel: Option<u64>,
    pub text_channel: Option<u64>,
    pub deaf: bool,
    pub mute: bool,
    pub volume: u16,
    #[serde(default)]
    pub loop_mode: LoopMode,
    #[serde(default)]
    pub position: u64,
    pub current: Option<Track>,
    #[serde(default)]
    pub queue: Vec<Track>,
    pub saved_at: DateTime<Utc>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reemplaza los estados guardados. Devuelve cuántos se escribieron
    async fn save(&self, snapshots: &[PlayerSnapshot]) -> Result<usize>;
    async fn load(&self) -> Result<Vec<PlayerSnapshot>>;
    async fn clear(&self) -> Result<()>;
}

/// Un objeto JSON por línea
pub struct JsonLinesStore {
    path: PathBuf,
}

impl JsonLinesStore {
    /// Crea un store sobre `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for JsonLinesStore {
    async fn save(&self, snapshots: &[PlayerSnapshot]) -> Result<usize> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let mut content = String::new();
        for snapshot in snapshots {
            content.push_str(&serde_json::to_string(snapshot)?);
            content.push('\n');
        }

        // Escritura atómica: archivo temporal y rename
        let temp = self.temp_path();
        fs::write(&temp, content)
            .await
            .with_context(|| format!("Failed to write {}", temp.display()))?;
        fs::rename(&temp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        debug!("💾 Saved {} player states to {}", snapshots.len(), self.path.display());
        Ok(snapshots.len())
    }

    async fn load(&self) -> Result<Vec<PlayerSnapshot>> {
        if !fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;

        let mut snapshots = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PlayerSnapshot>(line) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!("Skipping line {} of {}: {}", index + 1, self.path.display(), e),
            }
        }

        info!("📁 Loaded {} player states from {}", snapshots.len(), self.path.display());
        Ok(snapshots)
    }

    async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}
