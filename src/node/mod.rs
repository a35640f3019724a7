//! # Node Module
//!
//! One [`Node`] per configured audio node. It owns the long-lived WebSocket
//! the node pushes events over, and the REST transport used to drive the
//! node's players.
//!
//! ## Receive loop
//!
//! Frames are consumed one at a time and parsed inline. Handling of every
//! parsed message is spawned as its own task, so a slow handler can never
//! stall the socket: a stalled socket misses heartbeats and produces audible
//! gaps for every session hosted on that node.
//!
//! ## Reconnection
//!
//! When the socket drops, the node schedules a reconnect after
//! `min(30, 2^attempt)` seconds, up to `max_reconnect_attempts` times. A
//! successful connect resets the counter. An exhausted budget is silent; the
//! node just stays disconnected.

pub mod protocol;
pub mod rest;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use serde_json::Value;
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{net::TcpStream, task::JoinHandle, time::Instant};
use tokio_tungstenite::{
    tungstenite::{client::IntoClientRequest, handshake::client::Request, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    audio::{player::Player, track::LoadResult},
    config::NodeConfig,
    error::NodeError,
    events::{Event, EventBus},
};
use protocol::{IncomingMessage, NodeEvent, NodeInfo, NodeStats, UpdatePlayer};
use rest::{header_value, Rest, RestTransport};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SESSION_POLL: Duration = Duration::from_millis(100);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_BACKOFF_SECS: u64 = 30;

/// Espera antes del intento de reconexión número `attempt` (desde 1)
pub fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS))
}

#[derive(Debug, Default)]
struct ConnectionState {
    connected: bool,
    session_id: Option<String>,
    stats: Option<NodeStats>,
    info: Option<NodeInfo>,
    reconnect_attempts: u32,
}

struct Listener {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Conexión a un nodo de audio y su índice de players.
pub struct Node {
    config: NodeConfig,
    user_id: u64,
    client_name: String,
    rest: Arc<dyn RestTransport>,
    events: Arc<EventBus>,
    state: RwLock<ConnectionState>,
    /// Índice sin ownership; los players pertenecen al cliente
    players: DashMap<u64, Weak<Player>>,
    listener: Mutex<Option<Listener>>,
    shutdown: Mutex<CancellationToken>,
}

impl Node {
    /// Crea un nodo con transporte HTTP propio
    pub fn new(
        config: NodeConfig,
        user_id: u64,
        client_name: &str,
        events: Arc<EventBus>,
    ) -> Result<Arc<Self>, NodeError> {
        let rest = Rest::new(&config, user_id, client_name)?;
        Ok(Self::with_transport(config, user_id, client_name, Arc::new(rest), events))
    }

    /// Crea un nodo sobre un transporte REST dado
    pub fn with_transport(
        config: NodeConfig,
        user_id: u64,
        client_name: &str,
        rest: Arc<dyn RestTransport>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            user_id,
            client_name: client_name.to_string(),
            rest,
            events,
            state: RwLock::new(ConnectionState::default()),
            players: DashMap::new(),
            listener: Mutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    /// Session id entregado por el nodo en `ready`
    pub fn session_id(&self) -> Option<String> {
        self.state.read().session_id.clone()
    }

    /// Conectado y con session id, listo para llamadas de players
    pub fn is_ready(&self) -> bool {
        let state = self.state.read();
        state.connected && state.session_id.is_some()
    }

    /// Últimas estadísticas recibidas
    pub fn stats(&self) -> Option<NodeStats> {
        self.state.read().stats.clone()
    }

    /// Información de `/v4/info`, si ya se obtuvo
    pub fn info(&self) -> Option<NodeInfo> {
        self.state.read().info.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.state.read().reconnect_attempts
    }

    /// Abre el WebSocket y espera hasta `session_wait` el session id del nodo.
    ///
    /// Los fallos no llegan al llamador: se limpia el estado local y se
    /// emite [`Event::NodeError`].
    pub async fn connect(self: &Arc<Self>) {
        {
            let mut shutdown = self.shutdown.lock();
            if shutdown.is_cancelled() {
                *shutdown = CancellationToken::new();
            }
        }

        self.connect_once().await;
    }

    async fn connect_once(self: &Arc<Self>) -> bool {
        info!("🎼 Connecting to node {} at {}", self.name(), self.config.ws_url());

        match self.try_connect().await {
            Ok(()) => {
                info!(
                    "✅ Node {} connected (session: {})",
                    self.name(),
                    self.session_id().as_deref().unwrap_or("pending")
                );
                self.events.emit(Event::NodeConnect {
                    node: self.name().to_string(),
                });
                true
            }
            Err(e) => {
                error!("❌ Node {} failed to connect: {}", self.name(), e);
                self.teardown().await;
                self.events.emit(Event::NodeError {
                    node: self.name().to_string(),
                    error: e.to_string(),
                });
                false
            }
        }
    }

    async fn try_connect(self: &Arc<Self>) -> Result<(), NodeError> {
        let request = self.handshake_request()?;
        let timeout = self.config.connect_timeout;

        let (socket, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| NodeError::Timeout(timeout))??;

        {
            let mut state = self.state.write();
            state.connected = true;
            state.reconnect_attempts = 0;
        }

        let cancel = self.shutdown.lock().child_token();
        let handle = tokio::spawn(Arc::clone(self).listen(socket, cancel.clone()));
        if let Some(previous) = self.listener.lock().replace(Listener { handle, cancel }) {
            previous.cancel.cancel();
        }

        self.wait_for_session().await;

        match self.fetch_info().await {
            Ok(Some(info)) => debug!("Node {} runs version {}", self.name(), info.version.semver),
            Ok(None) => debug!("Node {} returned no info", self.name()),
            Err(e) => warn!("Could not fetch info from node {}: {}", self.name(), e),
        }

        Ok(())
    }

    fn handshake_request(&self) -> Result<Request, NodeError> {
        let mut request = self.config.ws_url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("Authorization", header_value(&self.config.password)?);
        headers.insert("User-Id", header_value(&self.user_id.to_string())?);
        headers.insert("Client-Name", header_value(&self.client_name)?);
        Ok(request)
    }

    async fn wait_for_session(&self) {
        let deadline = Instant::now() + self.config.session_wait;
        while self.session_id().is_none() && Instant::now() < deadline {
            tokio::time::sleep(SESSION_POLL).await;
        }

        if self.session_id().is_none() {
            warn!(
                "⏳ Node {} sent no session id within {}",
                self.name(),
                humantime::format_duration(self.config.session_wait)
            );
        }
    }

    async fn listen(self: Arc<Self>, mut socket: Socket, cancel: CancellationToken) {
        let closed_by_client = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if let Err(e) = socket.close(None).await {
                        debug!("Closing socket of node {} failed: {}", self.name(), e);
                    }
                    break true;
                }
                frame = socket.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch_frame(&text),
                    Some(Ok(Message::Close(frame))) => {
                        info!("Node {} closed the socket: {:?}", self.name(), frame);
                        break false;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Socket error on node {}: {}", self.name(), e);
                        break false;
                    }
                    None => break false,
                },
            }
        };

        let was_connected = {
            let mut state = self.state.write();
            let was_connected = state.connected;
            state.connected = false;
            state.session_id = None;
            was_connected
        };

        if was_connected {
            warn!("🔌 Node {} disconnected", self.name());
            self.events.emit(Event::NodeDisconnect {
                node: self.name().to_string(),
            });
        }

        if !closed_by_client {
            self.schedule_reconnect();
        }
    }

    /// Parsea en línea y procesa en otra tarea
    fn dispatch_frame(self: &Arc<Self>, text: &str) {
        match serde_json::from_str::<IncomingMessage>(text) {
            Ok(message) => {
                let node = Arc::clone(self);
                tokio::spawn(async move { node.handle_message(message) });
            }
            Err(e) => trace!("Dropping frame from node {}: {}", self.name(), e),
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let attempt = {
            let mut state = self.state.write();
            if state.reconnect_attempts >= self.config.max_reconnect_attempts {
                debug!("Node {} exhausted its reconnect attempts", self.name());
                return;
            }
            state.reconnect_attempts += 1;
            state.reconnect_attempts
        };

        let delay = reconnect_delay(attempt);
        info!(
            "🔄 Reconnecting to node {} in {} (attempt {}/{})",
            self.name(),
            humantime::format_duration(delay),
            attempt,
            self.config.max_reconnect_attempts
        );

        let node = Arc::clone(self);
        let shutdown = self.shutdown.lock().clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => node.reconnect().await,
            }
        });
    }

    async fn reconnect(self: Arc<Self>) {
        if self.is_connected() {
            return;
        }

        if !self.connect_once().await {
            self.schedule_reconnect();
        }
    }

    /// Enruta un mensaje del nodo según su `op`
    pub(crate) fn handle_message(&self, message: IncomingMessage) {
        match message {
            IncomingMessage::Ready { session_id, resumed } => {
                info!("🎉 Node {} ready (session {}, resumed: {})", self.name(), session_id, resumed);
                self.state.write().session_id = Some(session_id.clone());
                self.events.emit(Event::NodeReady {
                    node: self.name().to_string(),
                    session_id,
                    resumed,
                });
            }
            IncomingMessage::Stats(stats) => {
                trace!("Stats from node {}: {} playing", self.name(), stats.playing_players);
                self.state.write().stats = Some(stats.clone());
                self.events.emit(Event::NodeStats {
                    node: self.name().to_string(),
                    stats,
                });
            }
            IncomingMessage::PlayerUpdate { guild_id, state } => {
                if let Some(player) = self.player(guild_id) {
                    player.handle_player_update(state);
                }
            }
            IncomingMessage::Event(event) => self.handle_event(event),
        }
    }

    fn handle_event(&self, event: NodeEvent) {
        let guild_id = event.guild_id();
        let Some(player) = self.player(guild_id) else {
            debug!("Dropping event for untracked guild {}", guild_id);
            return;
        };

        match event {
            NodeEvent::TrackStartEvent { track, .. } => player.handle_track_start(track),
            NodeEvent::TrackEndEvent { reason, .. } => player.handle_track_end(reason),
            NodeEvent::TrackExceptionEvent { exception, .. } => {
                let message = exception
                    .message
                    .unwrap_or_else(|| format!("track exception ({})", exception.severity));
                player.handle_track_exception(message);
            }
            NodeEvent::TrackStuckEvent { threshold_ms, .. } => {
                player.handle_track_exception(format!("track stuck for {threshold_ms}ms"));
            }
            NodeEvent::WebSocketClosedEvent {
                code,
                reason,
                by_remote,
                ..
            } => player.handle_socket_closed(code, reason, by_remote),
        }
    }

    /// `PATCH /v4/sessions/{session}/players/{guild}?noReplace={!replace}`
    ///
    /// Devuelve el cuerpo decodificado con 200/201 y `None` con 204.
    pub async fn update_player(
        &self,
        guild_id: u64,
        patch: &UpdatePlayer,
        replace: bool,
    ) -> Result<Option<Value>, NodeError> {
        let session_id = self.session_id().ok_or(NodeError::NoSession)?;
        let path = format!(
            "/v4/sessions/{}/players/{}?noReplace={}",
            session_id, guild_id, !replace
        );
        let body = serde_json::to_value(patch).map_err(NodeError::Encode)?;

        Ok(self.rest.request(Method::PATCH, path, Some(body)).await?)
    }

    /// `DELETE /v4/sessions/{session}/players/{guild}`
    pub async fn destroy_player(&self, guild_id: u64) -> Result<(), NodeError> {
        let session_id = self.session_id().ok_or(NodeError::NoSession)?;
        let path = format!("/v4/sessions/{}/players/{}", session_id, guild_id);
        self.rest.request(Method::DELETE, path, None).await?;
        Ok(())
    }

    /// Obtiene y guarda la información del nodo
    pub async fn fetch_info(&self) -> Result<Option<NodeInfo>, NodeError> {
        let Some(body) = self.rest.request(Method::GET, "/v4/info".to_string(), None).await? else {
            return Ok(None);
        };

        let info: NodeInfo = serde_json::from_value(body)
            .map_err(|e| NodeError::Rest(e.into()))?;
        self.state.write().info = Some(info.clone());
        Ok(Some(info))
    }

    /// Resuelve un identificador con `/v4/loadtracks`
    pub async fn load_tracks(&self, identifier: &str, requester: Option<u64>) -> Result<LoadResult, NodeError> {
        let path = format!("/v4/loadtracks?identifier={}", urlencoding::encode(identifier));

        match self.rest.request(Method::GET, path, None).await? {
            Some(body) => Ok(LoadResult::from_response(body, requester)),
            None => Ok(LoadResult::empty()),
        }
    }

    /// Registra un player en el índice
    pub(crate) fn track_player(&self, player: &Arc<Player>) {
        self.players.insert(player.guild_id(), Arc::downgrade(player));
    }

    /// Quita la entrada solo si todavía apunta a `player`
    pub(crate) fn untrack_player(&self, player: &Player) {
        self.players
            .remove_if(&player.guild_id(), |_, weak| std::ptr::eq(weak.as_ptr(), player));
    }

    /// Obtiene el player vivo de un guild
    pub fn player(&self, guild_id: u64) -> Option<Arc<Player>> {
        let player = self.players.get(&guild_id).and_then(|weak| weak.upgrade());
        if player.is_none() {
            self.players.remove_if(&guild_id, |_, weak| weak.strong_count() == 0);
        }
        player
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Cierra el socket y limpia el estado de conexión, incluidas las
    /// reconexiones pendientes. Idempotente.
    pub async fn cleanup(&self) {
        self.shutdown.lock().cancel();
        self.teardown().await;
        debug!("Node {} cleaned up", self.name());
    }

    async fn teardown(&self) {
        let listener = self.listener.lock().take();
        if let Some(Listener { handle, cancel }) = listener {
            cancel.cancel();
            let abort = handle.abort_handle();
            if tokio::time::timeout(CLOSE_TIMEOUT, handle).await.is_err() {
                debug!("Listener of node {} did not stop in time", self.name());
                abort.abort();
            }
        }

        let mut state = self.state.write();
        state.connected = false;
        state.session_id = None;
    }

    #[cfg(test)]
    pub(crate) fn set_session_id(&self, session_id: &str) {
        let mut state = self.state.write();
        state.connected = true;
        state.session_id = Some(session_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::player::PlayerState,
        error::RestError,
        node::rest::MockRestTransport,
        test_support::{drain, names, ready_player, test_node, track, RecordingRest},
    };
    use pretty_assertions::assert_eq;
    use super::protocol::PlayerUpdateState;
    use tokio::{net::TcpListener, sync::oneshot};

    const SETTLE: Duration = Duration::from_millis(150);

    fn mocked_node(mock: MockRestTransport) -> Arc<Node> {
        let node = Node::with_transport(
            NodeConfig::default(),
            1,
            "tests",
            Arc::new(mock),
            Arc::new(EventBus::new()),
        );
        node.set_session_id("s1");
        node
    }

    #[tokio::test]
    async fn test_update_player_builds_no_replace_path() {
        let mut mock = MockRestTransport::new();
        mock.expect_request()
            .withf(|method, path, body| {
                *method == Method::PATCH
                    && path == "/v4/sessions/s1/players/42?noReplace=true"
                    && body.as_ref().and_then(|b| b.get("paused")) == Some(&Value::Bool(true))
            })
            .times(1)
            .returning(|_, _, _| Ok(None));
        mock.expect_request()
            .withf(|_, path, _| path == "/v4/sessions/s1/players/42?noReplace=false")
            .times(1)
            .returning(|_, _, _| Ok(Some(serde_json::json!({ "guildId": "42" }))));

        let node = mocked_node(mock);

        assert!(node.update_player(42, &UpdatePlayer::paused(true), false).await.unwrap().is_none());
        let body = node.update_player(42, &UpdatePlayer::volume(10), true).await.unwrap();
        assert_eq!(body.unwrap()["guildId"], "42");
    }

    #[tokio::test]
    async fn test_update_player_surfaces_failures() {
        let mut mock = MockRestTransport::new();
        mock.expect_request()
            .times(1)
            .returning(|_, _, _| Err(RestError::Status(400)));

        let node = mocked_node(mock);
        let result = node.update_player(1, &UpdatePlayer::stop(), false).await;

        assert!(matches!(result, Err(NodeError::Rest(RestError::Status(400)))));
    }

    #[tokio::test]
    async fn test_calls_without_session_never_reach_the_transport() {
        let mut mock = MockRestTransport::new();
        mock.expect_request().never();

        let node = Node::with_transport(
            NodeConfig::default(),
            1,
            "tests",
            Arc::new(mock),
            Arc::new(EventBus::new()),
        );

        assert!(matches!(
            node.update_player(1, &UpdatePlayer::stop(), false).await,
            Err(NodeError::NoSession)
        ));
        assert!(matches!(node.destroy_player(1).await, Err(NodeError::NoSession)));
    }

    #[test]
    fn test_reconnect_delay_is_capped_exponential() {
        let delays: Vec<u64> = (1..=6).map(|n| reconnect_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
        assert_eq!(reconnect_delay(40).as_secs(), 30);
    }

    #[tokio::test]
    async fn test_reconnect_budget_is_bounded() {
        let config = NodeConfig {
            max_reconnect_attempts: 2,
            ..Default::default()
        };
        let node = Node::with_transport(
            config,
            1,
            "tests",
            RecordingRest::new(),
            Arc::new(EventBus::new()),
        );

        for _ in 0..5 {
            node.schedule_reconnect();
        }
        assert_eq!(node.reconnect_attempts(), 2);

        node.cleanup().await;
    }

    #[tokio::test]
    async fn test_ready_and_stats_update_state() {
        let (node, events) = test_node(RecordingRest::new());
        let mut rx = events.subscribe();

        node.handle_message(serde_json::from_str(r#"{"op":"ready","resumed":true,"sessionId":"fresh"}"#).unwrap());
        node.handle_message(
            serde_json::from_str(r#"{"op":"stats","players":2,"playingPlayers":1,"uptime":10}"#).unwrap(),
        );

        assert_eq!(node.session_id().as_deref(), Some("fresh"));
        assert_eq!(node.stats().unwrap().playing_players, 1);
        let names: Vec<_> = drain(&mut rx).iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["nodeReady", "nodeStats"]);
    }

    #[tokio::test]
    async fn test_player_updates_route_by_guild() {
        let rest = RecordingRest::new();
        let (node, events) = test_node(rest);
        let player = ready_player(&node, &events, 55).await;
        let mut rx = events.subscribe();

        node.handle_message(IncomingMessage::PlayerUpdate {
            guild_id: 55,
            state: PlayerUpdateState {
                time: 1_700_000_000,
                position: 4200,
                connected: true,
                ping: 12,
            },
        });
        // Guilds desconocidos se ignoran
        node.handle_message(IncomingMessage::PlayerUpdate {
            guild_id: 99,
            state: PlayerUpdateState::default(),
        });
        node.handle_message(
            serde_json::from_str(r#"{"op":"event","type":"TrackEndEvent","guildId":"99","track":null,"reason":"finished"}"#)
                .unwrap(),
        );

        assert_eq!(player.position(), 4200);
        assert_eq!(player.state(), PlayerState::VoiceReady);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "playerPositionUpdate");
    }

    #[tokio::test]
    async fn test_stuck_tracks_are_dropped_and_the_queue_moves_on() {
        let rest = RecordingRest::new();
        let (node, events) = test_node(rest.clone());
        let player = ready_player(&node, &events, 55).await;
        player.add(track("a"));
        player.add(track("b"));
        player.play().await;
        let mut rx = events.subscribe();

        node.handle_message(
            serde_json::from_str(
                r#"{"op":"event","type":"TrackStuckEvent","guildId":"55","track":null,"thresholdMs":10000}"#,
            )
            .unwrap(),
        );
        // El nodo igual reporta el fin después
        node.handle_message(
            serde_json::from_str(r#"{"op":"event","type":"TrackEndEvent","guildId":"55","track":null,"reason":"loadFailed"}"#)
                .unwrap(),
        );
        tokio::time::sleep(SETTLE).await;

        let events = drain(&mut rx);
        assert_eq!(names(&events)[0], "trackError");
        match &events[0] {
            Event::TrackError { error, .. } => assert_eq!(error, "track stuck for 10000ms"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!names(&events).contains(&"trackEnd"));
        assert_eq!(rest.play_requests(), vec!["enc-a".to_string(), "enc-b".to_string()]);
        assert_eq!(player.state(), PlayerState::Playing);
    }

    #[tokio::test]
    async fn test_event_frames_are_routed_from_the_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (release, released) = oneshot::channel::<()>();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                r#"{"op":"ready","resumed":false,"sessionId":"live"}"#.to_string(),
            ))
            .await
            .unwrap();
            released.await.unwrap();
            ws.send(Message::Text(
                r#"{"op":"event","type":"TrackEndEvent","guildId":"77","track":null,"reason":"finished"}"#.to_string(),
            ))
            .await
            .unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                if frame.is_close() {
                    break;
                }
            }
        });

        let rest = RecordingRest::new();
        let events = Arc::new(EventBus::new());
        let node = Node::with_transport(
            NodeConfig::new("127.0.0.1", port, "youshallnotpass"),
            1,
            "tests",
            rest.clone(),
            events.clone(),
        );
        node.connect().await;
        assert!(node.is_ready());

        let player = ready_player(&node, &events, 77).await;
        player.add(track("a"));
        player.play().await;
        assert!(player.is_playing());
        let mut rx = events.subscribe();

        release.send(()).unwrap();
        tokio::time::sleep(SETTLE).await;

        assert_eq!(names(&drain(&mut rx)), vec!["trackEnd", "queueEnd"]);
        assert_eq!(player.state(), PlayerState::VoiceReady);
        assert_eq!(player.queue_len(), 0);

        node.cleanup().await;
        let _ = tokio::time::timeout(Duration::from_secs(2), server).await;
    }

    #[tokio::test]
    async fn test_connect_waits_for_session_and_cleans_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                r#"{"op":"ready","resumed":false,"sessionId":"abc123"}"#.to_string(),
            ))
            .await
            .unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                if frame.is_close() {
                    break;
                }
            }
        });

        let rest = RecordingRest::new();
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let node = Node::with_transport(
            NodeConfig::new("127.0.0.1", port, "youshallnotpass"),
            1,
            "tests",
            rest.clone(),
            events.clone(),
        );

        node.connect().await;

        assert!(node.is_ready());
        assert_eq!(node.session_id().as_deref(), Some("abc123"));
        assert_eq!(rest.count(Method::GET), 1);
        assert_eq!(rest.calls()[0].path, "/v4/info");

        node.cleanup().await;
        node.cleanup().await;
        assert!(!node.is_connected());
        assert_eq!(node.session_id(), None);
        assert_eq!(node.reconnect_attempts(), 0);

        let names: Vec<_> = drain(&mut rx).iter().map(|e| e.name()).collect();
        assert!(names.contains(&"nodeReady"));
        assert!(names.contains(&"nodeConnect"));
        assert!(names.contains(&"nodeDisconnect"));

        let _ = tokio::time::timeout(Duration::from_secs(2), server).await;
    }

    #[tokio::test]
    async fn test_connect_failure_emits_error() {
        // Nadie escucha en este puerto
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let node = Node::with_transport(
            NodeConfig::new("127.0.0.1", port, "pw"),
            1,
            "tests",
            RecordingRest::new(),
            events.clone(),
        );

        node.connect().await;

        assert!(!node.is_connected());
        let names: Vec<_> = drain(&mut rx).iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["nodeError"]);
    }
}
