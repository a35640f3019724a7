//! # open-lava
//!
//! Client-side control plane for Lavalink v4 audio nodes: node connections,
//! per-guild players with queues, an event bus and player state persistence.
//!
//! ```no_run
//! use open_lava::{client::LavaClient, config::Config};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let client = LavaClient::new(Config::load()?)?;
//! client.start().await?;
//!
//! let player = client.create_connection(client.player_options(1234).voice_channel(42)).await?;
//! let result = client.resolve("never gonna give you up", "ytsearch", None).await?;
//! if let Some(track) = result.tracks.first() {
//!     player.add(track.clone());
//!     player.play().await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod node;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use audio::{
    player::{Player, PlayerOptions, PlayerState, VoiceServerUpdate, VoiceStateUpdate},
    queue::{LoopMode, Queue},
    track::{LoadResult, LoadType, Track, TrackInfo},
};
pub use client::LavaClient;
pub use config::{Config, NodeConfig};
pub use events::{Event, EventBus, EventHandler};
pub use node::Node;
