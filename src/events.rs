//! # Events
//!
//! Everything observable about nodes and players is published as an
//! [`Event`] on the shared [`EventBus`].
//!
//! Listeners come in three flavours:
//!
//! - **Async handlers** ([`EventHandler`]): each delivery is spawned as its
//!   own task, the emitter never waits for it.
//! - **Sync listeners** ([`EventBus::on_sync`]): called inline, must be cheap.
//! - **Subscribers** ([`EventBus::subscribe`]): a broadcast receiver, useful
//!   for pumping events into a host's own loop.
//!
//! A panicking listener is caught and logged. It never unwinds into the
//! node receive loop or a player operation.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use std::{panic::AssertUnwindSafe, sync::Arc};
use tokio::sync::broadcast;
use tracing::{error, trace};

use crate::{
    audio::{queue::LoopMode, track::Track},
    node::protocol::{NodeStats, TrackEndReason},
};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum Event {
    Ready,
    Shutdown,

    NodeConnect { node: String },
    NodeReady { node: String, session_id: String, resumed: bool },
    NodeStats { node: String, stats: NodeStats },
    NodeDisconnect { node: String },
    NodeError { node: String, error: String },

    PlayerCreate { guild_id: u64 },
    PlayerConnect { guild_id: u64, channel_id: Option<u64> },
    PlayerVoiceStateUpdate { guild_id: u64, channel_id: Option<u64> },
    PlayerVoiceServerUpdate { guild_id: u64, endpoint: Option<String> },
    PlayerVoiceUpdate { guild_id: u64 },
    PlayerVoiceError { guild_id: u64, error: String },
    PlayerPositionUpdate { guild_id: u64, position: u64, timestamp: i64 },
    PlayerWebSocketClosed { guild_id: u64, code: u16, reason: String, by_remote: bool },
    PlayerReconnect { guild_id: u64 },

    TrackAdd { guild_id: u64, track: Arc<Track> },
    TrackStart { guild_id: u64, track: Arc<Track> },
    TrackEnd { guild_id: u64, track: Option<Arc<Track>>, reason: TrackEndReason },
    TrackError { guild_id: u64, track: Option<Arc<Track>>, error: String },
    TrackSkip { guild_id: u64, track: Option<Arc<Track>> },
    QueueEnd { guild_id: u64 },

    PlayerPause { guild_id: u64 },
    PlayerResume { guild_id: u64 },
    PlayerVolumeChange { guild_id: u64, old: u16, new: u16 },
    PlayerSeek { guild_id: u64, position: u64 },
    PlayerLoopChange { guild_id: u64, mode: LoopMode },
    PlayerStop { guild_id: u64 },
    PlayerDestroy { guild_id: u64 },
}

impl Event {
    /// Nombre del evento en camelCase
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Shutdown => "shutdown",
            Self::NodeConnect { .. } => "nodeConnect",
            Self::NodeReady { .. } => "nodeReady",
            Self::NodeStats { .. } => "nodeStats",
            Self::NodeDisconnect { .. } => "nodeDisconnect",
            Self::NodeError { .. } => "nodeError",
            Self::PlayerCreate { .. } => "playerCreate",
            Self::PlayerConnect { .. } => "playerConnect",
            Self::PlayerVoiceStateUpdate { .. } => "playerVoiceStateUpdate",
            Self::PlayerVoiceServerUpdate { .. } => "playerVoiceServerUpdate",
            Self::PlayerVoiceUpdate { .. } => "playerVoiceUpdate",
            Self::PlayerVoiceError { .. } => "playerVoiceError",
            Self::PlayerPositionUpdate { .. } => "playerPositionUpdate",
            Self::PlayerWebSocketClosed { .. } => "playerWebSocketClosed",
            Self::PlayerReconnect { .. } => "playerReconnect",
            Self::TrackAdd { .. } => "trackAdd",
            Self::TrackStart { .. } => "trackStart",
            Self::TrackEnd { .. } => "trackEnd",
            Self::TrackError { .. } => "trackError",
            Self::TrackSkip { .. } => "trackSkip",
            Self::QueueEnd { .. } => "queueEnd",
            Self::PlayerPause { .. } => "playerPause",
            Self::PlayerResume { .. } => "playerResume",
            Self::PlayerVolumeChange { .. } => "playerVolumeChange",
            Self::PlayerSeek { .. } => "playerSeek",
            Self::PlayerLoopChange { .. } => "playerLoopChange",
            Self::PlayerStop { .. } => "playerStop",
            Self::PlayerDestroy { .. } => "playerDestroy",
        }
    }

    /// Guild del evento de player; `None` para eventos de nodo y cliente
    pub fn guild_id(&self) -> Option<u64> {
        match self {
            Self::Ready
            | Self::Shutdown
            | Self::NodeConnect { .. }
            | Self::NodeReady { .. }
            | Self::NodeStats { .. }
            | Self::NodeDisconnect { .. }
            | Self::NodeError { .. } => None,
            Self::PlayerCreate { guild_id }
            | Self::PlayerConnect { guild_id, .. }
            | Self::PlayerVoiceStateUpdate { guild_id, .. }
            | Self::PlayerVoiceServerUpdate { guild_id, .. }
            | Self::PlayerVoiceUpdate { guild_id }
            | Self::PlayerVoiceError { guild_id, .. }
            | Self::PlayerPositionUpdate { guild_id, .. }
            | Self::PlayerWebSocketClosed { guild_id, .. }
            | Self::PlayerReconnect { guild_id }
            | Self::TrackAdd { guild_id, .. }
            | Self::TrackStart { guild_id, .. }
            | Self::TrackEnd { guild_id, .. }
            | Self::TrackError { guild_id, .. }
            | Self::TrackSkip { guild_id, .. }
            | Self::QueueEnd { guild_id }
            | Self::PlayerPause { guild_id }
            | Self::PlayerResume { guild_id }
            | Self::PlayerVolumeChange { guild_id, .. }
            | Self::PlayerSeek { guild_id, .. }
            | Self::PlayerLoopChange { guild_id, .. }
            | Self::PlayerStop { guild_id }
            | Self::PlayerDestroy { guild_id } => Some(*guild_id),
        }
    }
}

/// Handler para eventos del nodo y de los players
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: Event);
}

type SyncListener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Bus de eventos del cliente.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    listeners: RwLock<Vec<SyncListener>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            handlers: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Registra un handler async
    pub fn on(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().push(handler);
    }

    /// Registra un listener síncrono
    pub fn on_sync<F>(&self, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Suscribe un receptor de broadcast
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Quita todos los handlers y listeners
    pub fn remove_all_listeners(&self) {
        self.handlers.write().clear();
        self.listeners.write().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.handlers.read().len() + self.listeners.read().len() + self.sender.receiver_count()
    }

    /// Publica un evento. Requiere runtime de tokio si hay handlers async
    pub fn emit(&self, event: Event) {
        trace!(event = event.name(), "emit");

        // Copia para que un listener pueda registrar otros
        let listeners: Vec<SyncListener> = self.listeners.read().clone();
        for listener in listeners {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!("Listener for '{}' panicked", event.name());
            }
        }

        let handlers: Vec<Arc<dyn EventHandler>> = self.handlers.read().clone();
        for handler in handlers {
            let event = event.clone();
            tokio::spawn(async move {
                let name = event.name();
                if AssertUnwindSafe(handler.on_event(event)).catch_unwind().await.is_err() {
                    error!("Async handler for '{}' panicked", name);
                }
            });
        }

        // Sin receptores no es un error
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl EventHandler for Counter {
        async fn on_event(&self, event: Event) {
            if matches!(event, Event::QueueEnd { .. }) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventHandler for Panicking {
        async fn on_event(&self, _event: Event) {
            panic!("listener bug");
        }
    }

    #[tokio::test]
    async fn test_all_listener_kinds_receive_events() {
        let bus = EventBus::new();
        let async_hits = Arc::new(AtomicUsize::new(0));
        let sync_hits = Arc::new(AtomicUsize::new(0));

        bus.on(Arc::new(Counter(async_hits.clone())));
        let hits = sync_hits.clone();
        bus.on_sync(move |event| {
            if event.name() == "queueEnd" {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        });
        let mut rx = bus.subscribe();

        bus.emit(Event::QueueEnd { guild_id: 7 });

        assert_eq!(sync_hits.load(Ordering::SeqCst), 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.guild_id(), Some(7));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(async_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_listeners_do_not_propagate() {
        let bus = EventBus::new();
        bus.on(Arc::new(Panicking));
        bus.on_sync(|_| panic!("sync listener bug"));
        let mut rx = bus.subscribe();

        bus.emit(Event::Ready);
        bus.emit(Event::Shutdown);

        assert_eq!(rx.recv().await.unwrap().name(), "ready");
        assert_eq!(rx.recv().await.unwrap().name(), "shutdown");
    }
}
