//! Shared fixtures for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::Value;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::broadcast;

use crate::{
    audio::{
        player::{Player, PlayerOptions, VoiceServerUpdate, VoiceStateUpdate},
        track::{Track, TrackInfo},
    },
    config::NodeConfig,
    error::RestError,
    events::{Event, EventBus},
    node::{rest::RestTransport, Node},
};

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

/// Transporte que registra cada request y responde `204`
#[derive(Default)]
pub(crate) struct RecordingRest {
    calls: Mutex<Vec<Call>>,
    latency: Duration,
    failing_plays: AtomicUsize,
    fail_all: AtomicBool,
}

impl RecordingRest {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Default::default()
        })
    }

    /// Los próximos `count` requests de play responden `400`
    pub fn fail_next_plays(&self, count: usize) {
        self.failing_plays.store(count, Ordering::SeqCst);
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, method: Method) -> usize {
        self.calls.lock().iter().filter(|call| call.method == method).count()
    }

    /// Payloads de cada request de play, en orden
    pub fn play_requests(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| play_payload(call.body.as_ref()))
            .collect()
    }

    pub fn voice_requests(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.body.as_ref().is_some_and(|body| body.get("voice").is_some()))
            .count()
    }
}

fn play_payload(body: Option<&Value>) -> Option<String> {
    body?.get("encodedTrack")?.as_str().map(str::to_string)
}

#[async_trait]
impl RestTransport for RecordingRest {
    async fn request(
        &self,
        method: Method,
        path: String,
        body: Option<Value>,
    ) -> Result<Option<Value>, RestError> {
        let is_play = play_payload(body.as_ref()).is_some();
        self.calls.lock().push(Call { method, path, body });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.fail_all.load(Ordering::SeqCst) {
            return Err(RestError::Status(500));
        }
        if is_play
            && self
                .failing_plays
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
        {
            return Err(RestError::Status(400));
        }

        Ok(None)
    }
}

/// Nodo con sesión sobre `rest`
pub(crate) fn test_node(rest: Arc<RecordingRest>) -> (Arc<Node>, Arc<EventBus>) {
    let events = Arc::new(EventBus::new());
    let node = Node::with_transport(NodeConfig::default(), 1, "tests", rest, events.clone());
    node.set_session_id("session");
    (node, events)
}

pub(crate) fn test_options(guild_id: u64) -> PlayerOptions {
    PlayerOptions {
        voice_debounce: Duration::from_millis(20),
        advance_delay: Duration::from_millis(10),
        ..PlayerOptions::new(guild_id)
    }
}

/// Player cuyas credenciales de voz ya llegaron al nodo
pub(crate) async fn ready_player(node: &Arc<Node>, events: &Arc<EventBus>, guild_id: u64) -> Arc<Player> {
    let player = Player::new(node.clone(), events.clone(), test_options(guild_id).voice_channel(1), None);
    player.connect(None);
    player.handle_voice_state_update(VoiceStateUpdate {
        channel_id: Some(1),
        session_id: Some("voice-session".into()),
    });
    player.handle_voice_server_update(VoiceServerUpdate {
        token: "token".into(),
        endpoint: Some("voice.example.com".into()),
    });
    player.dispatch_voice_update().await;
    assert!(player.is_connected());
    player
}

pub(crate) fn track(title: &str) -> Arc<Track> {
    Arc::new(Track::new(
        format!("enc-{title}"),
        TrackInfo {
            identifier: title.to_string(),
            title: title.to_string(),
            author: "tester".to_string(),
            length: 180_000,
            is_seekable: true,
            ..Default::default()
        },
    ))
}

pub(crate) fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub(crate) fn names(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(Event::name).collect()
}
