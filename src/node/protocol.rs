//! Wire types of the node's v4 protocol.
//!
//! Incoming WebSocket frames are tagged by `op`, and `event` frames are
//! further tagged by `type`. Guild ids arrive as strings and are coerced to
//! integers here so the rest of the crate only deals with `u64`.

use serde::{de, Deserialize, Deserializer, Serialize};
use std::sync::Arc;

use crate::audio::track::Track;

pub const WS_PATH: &str = "v4/websocket";

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    #[serde(rename_all = "camelCase")]
    Ready {
        session_id: String,
        #[serde(default)]
        resumed: bool,
    },
    Stats(NodeStats),
    #[serde(rename_all = "camelCase")]
    PlayerUpdate {
        #[serde(deserialize_with = "guild_id")]
        guild_id: u64,
        state: PlayerUpdateState,
    },
    Event(NodeEvent),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerUpdateState {
    pub time: i64,
    pub position: u64,
    pub connected: bool,
    pub ping: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum NodeEvent {
    #[serde(rename_all = "camelCase")]
    TrackStartEvent {
        #[serde(deserialize_with = "guild_id")]
        guild_id: u64,
        track: Option<Arc<Track>>,
    },
    #[serde(rename_all = "camelCase")]
    TrackEndEvent {
        #[serde(deserialize_with = "guild_id")]
        guild_id: u64,
        track: Option<Arc<Track>>,
        reason: TrackEndReason,
    },
    #[serde(rename_all = "camelCase")]
    TrackExceptionEvent {
        #[serde(deserialize_with = "guild_id")]
        guild_id: u64,
        track: Option<Arc<Track>>,
        exception: TrackException,
    },
    #[serde(rename_all = "camelCase")]
    TrackStuckEvent {
        #[serde(deserialize_with = "guild_id")]
        guild_id: u64,
        track: Option<Arc<Track>>,
        #[serde(default)]
        threshold_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    WebSocketClosedEvent {
        #[serde(deserialize_with = "guild_id")]
        guild_id: u64,
        code: u16,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        by_remote: bool,
    },
}

impl NodeEvent {
    /// Guild al que pertenece el evento
    pub fn guild_id(&self) -> u64 {
        match self {
            Self::TrackStartEvent { guild_id, .. }
            | Self::TrackEndEvent { guild_id, .. }
            | Self::TrackExceptionEvent { guild_id, .. }
            | Self::TrackStuckEvent { guild_id, .. }
            | Self::WebSocketClosedEvent { guild_id, .. } => *guild_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
    #[serde(other)]
    Unknown,
}

impl TrackEndReason {
    /// Indica si el nodo espera que el cliente inicie el siguiente track
    pub fn may_start_next(self) -> bool {
        matches!(self, Self::Finished | Self::LoadFailed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackException {
    pub message: Option<String>,
    pub severity: String,
    pub cause: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeInfo {
    pub version: VersionInfo,
    pub build_time: i64,
    pub source_managers: Vec<String>,
    pub filters: Vec<String>,
    pub plugins: Vec<PluginInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VersionInfo {
    pub semver: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
}

/// Credenciales de voz que se envían al nodo
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceState {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

/// Cuerpo de `PATCH /v4/sessions/{session}/players/{guild}`.
///
/// Los campos ausentes no se tocan en el nodo. `encoded_track` es doblemente
/// opcional: `Some(None)` se serializa como `null` y detiene la reproducción.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded_track: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceState>,
}

impl UpdatePlayer {
    /// Reproduce un track con el volumen dado
    pub fn play(encoded: impl Into<String>, volume: u16) -> Self {
        Self {
            encoded_track: Some(Some(encoded.into())),
            position: Some(0),
            volume: Some(volume),
            paused: Some(false),
            ..Default::default()
        }
    }

    /// Detiene la reproducción (`encodedTrack: null`)
    pub fn stop() -> Self {
        Self {
            encoded_track: Some(None),
            ..Default::default()
        }
    }

    /// Envía credenciales de voz
    pub fn voice(voice: VoiceState, volume: u16) -> Self {
        Self {
            voice: Some(voice),
            volume: Some(volume),
            ..Default::default()
        }
    }

    /// Pausa o reanuda
    pub fn paused(paused: bool) -> Self {
        Self {
            paused: Some(paused),
            ..Default::default()
        }
    }

    /// Cambia el volumen
    pub fn volume(volume: u16) -> Self {
        Self {
            volume: Some(volume),
            ..Default::default()
        }
    }

    /// Salta a una posición en milisegundos
    pub fn seek(position: u64) -> Self {
        Self {
            position: Some(position),
            ..Default::default()
        }
    }
}

fn guild_id<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u64),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(id) => Ok(id),
        RawId::Text(text) => text
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid guild id: {text}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_ready() {
        let message: IncomingMessage =
            serde_json::from_str(r#"{"op":"ready","resumed":false,"sessionId":"la3kfsdf5eafe848"}"#).unwrap();

        match message {
            IncomingMessage::Ready { session_id, resumed } => {
                assert_eq!(session_id, "la3kfsdf5eafe848");
                assert!(!resumed);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_player_update_with_string_guild() {
        let message: IncomingMessage = serde_json::from_value(json!({
            "op": "playerUpdate",
            "guildId": "817327181659111454",
            "state": { "time": 1500467109, "position": 60000, "connected": true, "ping": 50 }
        }))
        .unwrap();

        match message {
            IncomingMessage::PlayerUpdate { guild_id, state } => {
                assert_eq!(guild_id, 817327181659111454);
                assert_eq!(state.position, 60000);
                assert_eq!(state.ping, 50);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_track_end_event() {
        let message: IncomingMessage = serde_json::from_value(json!({
            "op": "event",
            "type": "TrackEndEvent",
            "guildId": "42",
            "track": { "encoded": "QAAA", "info": { "title": "song" } },
            "reason": "loadFailed"
        }))
        .unwrap();

        let IncomingMessage::Event(event) = message else {
            panic!("expected an event");
        };
        assert_eq!(event.guild_id(), 42);
        match event {
            NodeEvent::TrackEndEvent { reason, track, .. } => {
                assert_eq!(reason, TrackEndReason::LoadFailed);
                assert_eq!(track.unwrap().title(), "song");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_stats() {
        let message: IncomingMessage = serde_json::from_value(json!({
            "op": "stats",
            "players": 3,
            "playingPlayers": 2,
            "uptime": 123456789,
            "memory": { "free": 1, "used": 2, "allocated": 3, "reservable": 4 },
            "cpu": { "cores": 4, "systemLoad": 0.5, "lavalinkLoad": 0.25 },
            "frameStats": { "sent": 6000, "nulled": 10, "deficit": -3010 }
        }))
        .unwrap();

        let IncomingMessage::Stats(stats) = message else {
            panic!("expected stats");
        };
        assert_eq!(stats.playing_players, 2);
        assert_eq!(stats.cpu.cores, 4);
        assert_eq!(stats.frame_stats.unwrap().deficit, -3010);
    }

    #[test]
    fn test_unknown_op_and_bad_guild_are_rejected() {
        assert!(serde_json::from_str::<IncomingMessage>(r#"{"op":"mystery"}"#).is_err());
        assert!(serde_json::from_value::<IncomingMessage>(json!({
            "op": "event",
            "type": "TrackStartEvent",
            "guildId": "not-a-number",
            "track": null
        }))
        .is_err());
    }

    #[test]
    fn test_unknown_end_reason_is_tolerated() {
        let reason: TrackEndReason = serde_json::from_value(json!("somethingNew")).unwrap();
        assert_eq!(reason, TrackEndReason::Unknown);
        assert!(!reason.may_start_next());
    }

    #[test]
    fn test_update_player_bodies() {
        assert_eq!(
            serde_json::to_value(UpdatePlayer::play("QAAA", 100)).unwrap(),
            json!({ "encodedTrack": "QAAA", "position": 0, "volume": 100, "paused": false })
        );
        assert_eq!(
            serde_json::to_value(UpdatePlayer::stop()).unwrap(),
            json!({ "encodedTrack": null })
        );
        let voice = VoiceState {
            token: "tok".into(),
            endpoint: "us-east1.discord.media".into(),
            session_id: "sess".into(),
        };
        assert_eq!(
            serde_json::to_value(UpdatePlayer::voice(voice, 80)).unwrap(),
            json!({
                "voice": { "token": "tok", "endpoint": "us-east1.discord.media", "sessionId": "sess" },
                "volume": 80
            })
        );
    }
}
