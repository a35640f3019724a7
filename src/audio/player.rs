use chrono::Utc;
use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    queue::{LoopMode, Queue},
    track::Track,
};
use crate::{
    error::PlayerError,
    events::{Event, EventBus},
    node::{
        protocol::{PlayerUpdateState, TrackEndReason, UpdatePlayer, VoiceState},
        Node,
    },
    storage::PlayerSnapshot,
};

/// Pide al host salir del canal de voz de un guild
pub type VoiceCleanup = Arc<dyn Fn(u64) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Envuelve un closure async como [`VoiceCleanup`]
pub fn voice_cleanup<F, Fut>(cleanup: F) -> VoiceCleanup
where
    F: Fn(u64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |guild_id| cleanup(guild_id).boxed())
}

/// Dueño de un conjunto de players, sincronizado con su ciclo de vida
pub trait PlayerRegistry: Send + Sync {
    /// Se llama cuando un player llega a `Destroyed`
    fn release(&self, guild_id: u64);
    /// Se llama cuando un player destruido vuelve a conectarse
    fn adopt(&self, player: &Arc<Player>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Uninitialized,
    Connecting,
    VoiceReady,
    Playing,
    Paused,
    Destroying,
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct PlayerOptions {
    pub guild_id: u64,
    pub voice_channel: Option<u64>,
    pub text_channel: Option<u64>,
    pub deaf: bool,
    pub mute: bool,
    pub volume: u16,
    /// Espera antes de enviar las credenciales de voz al nodo
    pub voice_debounce: Duration,
    /// Espera antes de enviar el siguiente track
    pub advance_delay: Duration,
}

impl PlayerOptions {
    /// Opciones por defecto para un guild
    pub fn new(guild_id: u64) -> Self {
        Self {
            guild_id,
            voice_channel: None,
            text_channel: None,
            deaf: true,
            mute: false,
            volume: 100,
            voice_debounce: Duration::from_millis(50),
            advance_delay: Duration::from_millis(100),
        }
    }

    pub fn voice_channel(mut self, channel_id: u64) -> Self {
        self.voice_channel = Some(channel_id);
        self
    }

    pub fn text_channel(mut self, channel_id: u64) -> Self {
        self.text_channel = Some(channel_id);
        self
    }
}

/// Voice state update que reenvía el host desde su gateway
#[derive(Debug, Clone, Default)]
pub struct VoiceStateUpdate {
    pub channel_id: Option<u64>,
    pub session_id: Option<String>,
}

/// Voice server update que reenvía el host desde su gateway
#[derive(Debug, Clone, Default)]
pub struct VoiceServerUpdate {
    pub token: String,
    pub endpoint: Option<String>,
}

#[derive(Debug, Default)]
struct VoiceDescriptor {
    session_id: Option<String>,
    token: Option<String>,
    endpoint: Option<String>,
}

impl VoiceDescriptor {
    fn complete(&self) -> Option<VoiceState> {
        Some(VoiceState {
            token: self.token.clone()?,
            endpoint: self.endpoint.clone()?,
            session_id: self.session_id.clone()?,
        })
    }
}

struct PlayerInner {
    state: PlayerState,
    connected: bool,
    voice_channel: Option<u64>,
    text_channel: Option<u64>,
    current: Option<Arc<Track>>,
    position: u64,
    timestamp: i64,
    ping: i64,
    volume: u16,
    voice: VoiceDescriptor,
    last_voice: Option<VoiceState>,
    queue: Queue,
    track_end_handled: bool,
    tasks: CancellationToken,
    voice_task: Option<JoinHandle<()>>,
    voice_cleanup: Option<VoiceCleanup>,
}

impl PlayerInner {
    fn new(options: &PlayerOptions) -> Self {
        Self {
            state: PlayerState::Uninitialized,
            connected: false,
            voice_channel: options.voice_channel,
            text_channel: options.text_channel,
            current: None,
            position: 0,
            timestamp: 0,
            ping: -1,
            volume: options.volume,
            voice: VoiceDescriptor::default(),
            last_voice: None,
            queue: Queue::new(),
            track_end_handled: false,
            tasks: CancellationToken::new(),
            voice_task: None,
            voice_cleanup: None,
        }
    }

    fn is_closing(&self) -> bool {
        matches!(self.state, PlayerState::Destroying | PlayerState::Destroyed)
    }

    fn is_active(&self) -> bool {
        self.current.is_some() && matches!(self.state, PlayerState::Playing | PlayerState::Paused)
    }

    fn idle_state(&self) -> PlayerState {
        if self.connected && self.voice.complete().is_some() {
            PlayerState::VoiceReady
        } else if self.state == PlayerState::Uninitialized {
            PlayerState::Uninitialized
        } else {
            PlayerState::Connecting
        }
    }

    /// Suelta el track actual y vuelve a un estado inactivo
    fn reset_playback(&mut self) {
        self.current = None;
        self.position = 0;
        if !self.is_closing() {
            self.state = self.idle_state();
        }
    }

    fn reset_voice(&mut self) {
        self.voice = VoiceDescriptor::default();
        self.last_voice = None;
        self.connected = false;
        if self.state == PlayerState::VoiceReady {
            self.state = PlayerState::Connecting;
        }
    }
}

enum Submission {
    Busy,
    VoiceNotReady,
    QueueEnd,
    Unplayable(Arc<Track>),
    Play(Arc<Track>, String, u16),
}

/// Controlador de reproducción por guild.
///
/// Todo el estado mutable vive tras un lock corto que nunca cruza un await.
/// El envío de tracks además se serializa con `play_lock`.
pub struct Player {
    guild_id: u64,
    options: PlayerOptions,
    node: Arc<Node>,
    events: Arc<EventBus>,
    registry: Option<Weak<dyn PlayerRegistry>>,
    inner: Mutex<PlayerInner>,
    play_lock: tokio::sync::Mutex<()>,
}

impl Player {
    /// Crea un player y lo registra en el índice del nodo
    pub fn new(
        node: Arc<Node>,
        events: Arc<EventBus>,
        options: PlayerOptions,
        registry: Option<Weak<dyn PlayerRegistry>>,
    ) -> Arc<Self> {
        let player = Arc::new(Self {
            guild_id: options.guild_id,
            inner: Mutex::new(PlayerInner::new(&options)),
            options,
            node,
            events,
            registry,
            play_lock: tokio::sync::Mutex::new(()),
        });

        player.node.track_player(&player);
        player
    }

    fn emit(&self, event: Event) {
        self.events.emit(event);
    }

    /// Registra el canal de voz destino. Un player destruido vuelve primero a
    /// su estado inicial y se devuelve a su registro.
    pub fn connect(self: &Arc<Self>, voice_channel: Option<u64>) {
        let (channel, resurrected) = {
            let mut inner = self.inner.lock();
            if inner.state == PlayerState::Destroying {
                return;
            }

            let Some(channel) = voice_channel.or(inner.voice_channel) else {
                warn!("Player {} has no voice channel to connect to", self.guild_id);
                return;
            };

            let resurrected = inner.state == PlayerState::Destroyed;
            if resurrected {
                debug!("♻️ Resurrecting player for guild {}", self.guild_id);
                *inner = PlayerInner::new(&self.options);
            }

            inner.voice_channel = Some(channel);
            if inner.state == PlayerState::Uninitialized {
                inner.state = PlayerState::Connecting;
            }
            (channel, resurrected)
        };

        if resurrected {
            self.node.track_player(self);
            if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
                registry.adopt(self);
            }
        }

        info!("🔗 Player {} connecting to channel {}", self.guild_id, channel);
        self.emit(Event::PlayerConnect {
            guild_id: self.guild_id,
            channel_id: Some(channel),
        });
    }

    /// Guarda el session id de voz y el canal actual
    pub fn handle_voice_state_update(self: &Arc<Self>, update: VoiceStateUpdate) {
        {
            let mut inner = self.inner.lock();
            if inner.is_closing() {
                return;
            }
            if let Some(session_id) = update.session_id {
                inner.voice.session_id = Some(session_id);
            }
            inner.voice_channel = update.channel_id;
            if update.channel_id.is_none() {
                inner.connected = false;
                if inner.state == PlayerState::VoiceReady {
                    inner.state = PlayerState::Connecting;
                }
            }
        }

        self.schedule_voice_update();
        self.emit(Event::PlayerVoiceStateUpdate {
            guild_id: self.guild_id,
            channel_id: update.channel_id,
        });
    }

    /// Guarda token y endpoint del servidor de voz
    pub fn handle_voice_server_update(self: &Arc<Self>, update: VoiceServerUpdate) {
        {
            let mut inner = self.inner.lock();
            if inner.is_closing() {
                return;
            }
            inner.voice.token = Some(update.token);
            inner.voice.endpoint = update.endpoint.clone();
        }

        self.schedule_voice_update();
        self.emit(Event::PlayerVoiceServerUpdate {
            guild_id: self.guild_id,
            endpoint: update.endpoint,
        });
    }

    /// Reinicia la ventana de debounce; solo se envía el último update
    fn schedule_voice_update(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.is_closing() {
            return;
        }
        if let Some(pending) = inner.voice_task.take() {
            pending.abort();
        }

        let player = Arc::clone(self);
        let delay = self.options.voice_debounce;
        inner.voice_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            player.dispatch_voice_update().await;
        }));
    }

    /// Envía las credenciales de voz cuando están completas y difieren del
    /// último envío exitoso.
    pub async fn dispatch_voice_update(&self) {
        let (voice, volume) = {
            let inner = self.inner.lock();
            if inner.is_closing() {
                return;
            }
            let Some(voice) = inner.voice.complete() else {
                trace!("Voice descriptor for guild {} incomplete", self.guild_id);
                return;
            };
            if inner.last_voice.as_ref() == Some(&voice) {
                trace!("Voice descriptor for guild {} unchanged", self.guild_id);
                return;
            }
            (voice, inner.volume)
        };

        if self.node.session_id().is_none() {
            debug!("Node {} has no session, voice update for {} deferred", self.node.name(), self.guild_id);
            return;
        }

        match self
            .node
            .update_player(self.guild_id, &UpdatePlayer::voice(voice.clone(), volume), false)
            .await
        {
            Ok(_) => {
                {
                    let mut inner = self.inner.lock();
                    if inner.is_closing() {
                        return;
                    }
                    inner.connected = true;
                    inner.last_voice = Some(voice);
                    if matches!(inner.state, PlayerState::Uninitialized | PlayerState::Connecting) {
                        inner.state = PlayerState::VoiceReady;
                    }
                }
                info!("🎙️ Voice forwarded for guild {}", self.guild_id);
                self.emit(Event::PlayerVoiceUpdate { guild_id: self.guild_id });
            }
            Err(e) => {
                {
                    let mut inner = self.inner.lock();
                    inner.connected = false;
                    if inner.state == PlayerState::VoiceReady {
                        inner.state = PlayerState::Connecting;
                    }
                }
                warn!("Voice update for guild {} failed: {}", self.guild_id, e);
                self.emit(Event::PlayerVoiceError {
                    guild_id: self.guild_id,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Reproduce el siguiente track de la cola. No-op si ya hay uno activo
    pub async fn play(self: &Arc<Self>) {
        let _guard = self.play_lock.lock().await;

        let submission = {
            let mut inner = self.inner.lock();
            inner.track_end_handled = false;

            if inner.is_closing() || inner.is_active() {
                Submission::Busy
            } else if !inner.connected || inner.voice.complete().is_none() {
                Submission::VoiceNotReady
            } else {
                match inner.queue.next_track(inner.current.as_ref()) {
                    None => {
                        inner.reset_playback();
                        Submission::QueueEnd
                    }
                    Some(track) => match track.payload().map(str::to_string) {
                        None => Submission::Unplayable(track),
                        Some(encoded) => {
                            inner.current = Some(Arc::clone(&track));
                            inner.position = 0;
                            Submission::Play(track, encoded, inner.volume)
                        }
                    },
                }
            }
        };

        match submission {
            Submission::Busy => {}
            Submission::VoiceNotReady => {
                debug!("Player {} cannot play yet: {}", self.guild_id, PlayerError::VoiceNotReady);
                self.emit(Event::PlayerVoiceError {
                    guild_id: self.guild_id,
                    error: PlayerError::VoiceNotReady.to_string(),
                });
            }
            Submission::QueueEnd => {
                info!("📭 Queue ended for guild {}", self.guild_id);
                self.emit(Event::QueueEnd { guild_id: self.guild_id });
            }
            Submission::Unplayable(track) => self.fail_submission(track, PlayerError::MissingPayload),
            Submission::Play(track, encoded, volume) => {
                match self
                    .node
                    .update_player(self.guild_id, &UpdatePlayer::play(encoded, volume), false)
                    .await
                {
                    Ok(_) => {
                        {
                            let mut inner = self.inner.lock();
                            if inner.is_closing() {
                                return;
                            }
                            inner.state = PlayerState::Playing;
                        }
                        info!("▶️ Now playing {} in guild {}", track, self.guild_id);
                        self.emit(Event::TrackStart {
                            guild_id: self.guild_id,
                            track,
                        });
                    }
                    Err(e) => self.fail_submission(track, e.into()),
                }
            }
        }
    }

    fn fail_submission(self: &Arc<Self>, track: Arc<Track>, error: PlayerError) {
        let remaining = {
            let mut inner = self.inner.lock();
            if inner.is_closing() {
                return;
            }
            inner.reset_playback();
            inner.queue.consume_next();
            !inner.queue.is_empty()
        };

        warn!("❌ Could not start {} in guild {}: {}", track, self.guild_id, error);
        self.emit(Event::TrackError {
            guild_id: self.guild_id,
            track: Some(track),
            error: error.to_string(),
        });

        if remaining {
            self.schedule_advance();
        }
    }

    /// Reproduce el siguiente track tras `advance_delay`, salvo que se destruya antes
    fn schedule_advance(self: &Arc<Self>) {
        let token = {
            let inner = self.inner.lock();
            if inner.is_closing() {
                return;
            }
            inner.tasks.clone()
        };

        let player = Arc::clone(self);
        let delay = self.options.advance_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => player.play().await,
            }
        });
    }

    /// Confirmación de inicio desde el nodo
    pub fn handle_track_start(&self, track: Option<Arc<Track>>) {
        let mut inner = self.inner.lock();
        if inner.is_closing() {
            return;
        }
        if inner.current.is_none() {
            inner.current = track;
        }
        inner.state = PlayerState::Playing;
        trace!("Node confirmed playback in guild {}", self.guild_id);
    }

    /// Procesa el fin de track del nodo, como mucho una vez por track
    pub fn handle_track_end(self: &Arc<Self>, reason: TrackEndReason) {
        let mut events = Vec::new();
        let mut advance = false;

        {
            let mut inner = self.inner.lock();
            if inner.is_closing() || inner.track_end_handled {
                return;
            }
            inner.track_end_handled = true;

            let ended = inner.current.take();
            inner.reset_playback();
            events.push(Event::TrackEnd {
                guild_id: self.guild_id,
                track: ended.clone(),
                reason,
            });

            match reason {
                TrackEndReason::Finished => {
                    match inner.queue.loop_mode() {
                        LoopMode::Track => {
                            if let Some(track) = &ended {
                                let at_head = inner.queue.peek(0).is_some_and(|head| Arc::ptr_eq(&head, track));
                                if !at_head {
                                    inner.queue.insert(Arc::clone(track), 0);
                                }
                            }
                        }
                        LoopMode::Queue => {
                            if let Some(finished) = inner.queue.consume_next() {
                                inner.queue.add(finished);
                            }
                        }
                        LoopMode::Off => {
                            inner.queue.consume_next();
                        }
                    }
                }
                TrackEndReason::LoadFailed => {
                    inner.queue.consume_next();
                    events.push(Event::TrackError {
                        guild_id: self.guild_id,
                        track: ended,
                        error: PlayerError::LoadFailed.to_string(),
                    });
                }
                // stopped, replaced, cleanup: el host decide
                _ => {}
            }

            if reason.may_start_next() {
                if inner.queue.is_empty() {
                    events.push(Event::QueueEnd { guild_id: self.guild_id });
                } else {
                    advance = true;
                }
            }
        }

        debug!("⏹️ Track ended in guild {} ({:?})", self.guild_id, reason);
        for event in events {
            self.emit(event);
        }
        if advance {
            self.schedule_advance();
        }
    }

    /// Excepciones y tracks atascados: se descarta el track y la cola avanza
    pub fn handle_track_exception(self: &Arc<Self>, message: String) {
        let (failed, remaining) = {
            let mut inner = self.inner.lock();
            if inner.is_closing() || inner.track_end_handled {
                return;
            }
            inner.track_end_handled = true;
            let failed = inner.current.take();
            inner.reset_playback();
            inner.queue.consume_next();
            (failed, !inner.queue.is_empty())
        };

        warn!("⚠️ Track error in guild {}: {}", self.guild_id, message);
        self.emit(Event::TrackError {
            guild_id: self.guild_id,
            track: failed,
            error: message,
        });

        if remaining {
            self.schedule_advance();
        } else {
            self.emit(Event::QueueEnd { guild_id: self.guild_id });
        }
    }

    /// Actualiza posición, timestamp y ping
    pub fn handle_player_update(&self, state: PlayerUpdateState) {
        {
            let mut inner = self.inner.lock();
            if inner.is_closing() {
                return;
            }
            inner.position = state.position;
            inner.timestamp = state.time;
            inner.ping = state.ping;
        }

        self.emit(Event::PlayerPositionUpdate {
            guild_id: self.guild_id,
            position: state.position,
            timestamp: state.time,
        });
    }

    pub fn handle_socket_closed(&self, code: u16, reason: String, by_remote: bool) {
        warn!(
            "🔇 Voice socket closed for guild {} (code {}, remote: {}): {}",
            self.guild_id, code, by_remote, reason
        );
        self.emit(Event::PlayerWebSocketClosed {
            guild_id: self.guild_id,
            code,
            reason,
            by_remote,
        });
    }

    /// Salta el track actual
    pub async fn skip(self: &Arc<Self>) {
        if self.is_closing() {
            return;
        }

        if let Err(e) = self.node.update_player(self.guild_id, &UpdatePlayer::stop(), false).await {
            debug!("Stop before skip failed for guild {}: {}", self.guild_id, e);
        }

        let (skipped, remaining) = {
            let mut inner = self.inner.lock();
            if inner.is_closing() {
                return;
            }
            // El evento de fin que llegue después ya no cuenta
            inner.track_end_handled = true;
            let skipped = inner.current.take();
            inner.queue.consume_next();
            inner.reset_playback();
            (skipped, !inner.queue.is_empty())
        };

        info!("⏭️ Skipped track in guild {}", self.guild_id);
        self.emit(Event::TrackSkip {
            guild_id: self.guild_id,
            track: skipped,
        });

        if remaining {
            self.schedule_advance();
        } else {
            self.emit(Event::QueueEnd { guild_id: self.guild_id });
        }
    }

    /// Detiene la reproducción y limpia la cola
    pub async fn stop(&self) {
        if self.is_closing() {
            return;
        }

        if let Err(e) = self.node.update_player(self.guild_id, &UpdatePlayer::stop(), false).await {
            debug!("Stop request failed for guild {}: {}", self.guild_id, e);
        }

        {
            let mut inner = self.inner.lock();
            inner.track_end_handled = true;
            inner.queue.clear();
            inner.reset_playback();
        }

        info!("⏹️ Playback stopped in guild {}", self.guild_id);
        self.emit(Event::PlayerStop { guild_id: self.guild_id });
    }

    /// Pausa la reproducción
    pub async fn pause(&self) {
        if self.state() != PlayerState::Playing {
            return;
        }

        match self.node.update_player(self.guild_id, &UpdatePlayer::paused(true), false).await {
            Ok(_) => {
                {
                    let mut inner = self.inner.lock();
                    if inner.state == PlayerState::Playing {
                        inner.state = PlayerState::Paused;
                    }
                }
                info!("⏸️ Paused guild {}", self.guild_id);
                self.emit(Event::PlayerPause { guild_id: self.guild_id });
            }
            Err(e) => warn!("Pause failed for guild {}: {}", self.guild_id, e),
        }
    }

    /// Reanuda la reproducción
    pub async fn resume(&self) {
        if self.state() != PlayerState::Paused {
            return;
        }

        match self.node.update_player(self.guild_id, &UpdatePlayer::paused(false), false).await {
            Ok(_) => {
                {
                    let mut inner = self.inner.lock();
                    if inner.state == PlayerState::Paused {
                        inner.state = PlayerState::Playing;
                    }
                }
                info!("▶️ Resumed guild {}", self.guild_id);
                self.emit(Event::PlayerResume { guild_id: self.guild_id });
            }
            Err(e) => warn!("Resume failed for guild {}: {}", self.guild_id, e),
        }
    }

    /// Cambia el volumen (0-1000), aplicado localmente antes de que el nodo confirme
    pub async fn set_volume(&self, volume: i32) {
        let new = volume.clamp(0, 1000) as u16;
        let old = {
            let mut inner = self.inner.lock();
            if inner.is_closing() {
                return;
            }
            std::mem::replace(&mut inner.volume, new)
        };

        if let Err(e) = self.node.update_player(self.guild_id, &UpdatePlayer::volume(new), false).await {
            warn!("Volume change for guild {} not applied remotely: {}", self.guild_id, e);
        }

        debug!("🔊 Volume {} -> {} in guild {}", old, new, self.guild_id);
        self.emit(Event::PlayerVolumeChange {
            guild_id: self.guild_id,
            old,
            new,
        });
    }

    /// Salta a `position` (ms). Solo mientras reproduce
    pub async fn seek(&self, position: u64) {
        if self.state() != PlayerState::Playing {
            return;
        }

        match self.node.update_player(self.guild_id, &UpdatePlayer::seek(position), false).await {
            Ok(_) => {
                self.inner.lock().position = position;
                self.emit(Event::PlayerSeek {
                    guild_id: self.guild_id,
                    position,
                });
            }
            Err(e) => warn!("Seek failed for guild {}: {}", self.guild_id, e),
        }
    }

    /// Cambia el modo de loop
    pub fn set_loop(&self, mode: LoopMode) {
        {
            let mut inner = self.inner.lock();
            if inner.is_closing() {
                return;
            }
            inner.queue.set_loop_mode(mode);
        }
        self.emit(Event::PlayerLoopChange {
            guild_id: self.guild_id,
            mode,
        });
    }

    /// Agrega un track a la cola. `false` si el player fue destruido
    pub fn add(&self, track: Arc<Track>) -> bool {
        let added = {
            let mut inner = self.inner.lock();
            !inner.is_closing() && inner.queue.add(Arc::clone(&track))
        };
        if added {
            self.emit(Event::TrackAdd {
                guild_id: self.guild_id,
                track,
            });
        }
        added
    }

    /// Inserta un track en una posición de la cola
    pub fn insert(&self, track: Arc<Track>, position: usize) -> bool {
        let added = {
            let mut inner = self.inner.lock();
            !inner.is_closing() && inner.queue.insert(Arc::clone(&track), position)
        };
        if added {
            self.emit(Event::TrackAdd {
                guild_id: self.guild_id,
                track,
            });
        }
        added
    }

    /// Ejecuta `f` sobre la cola bajo el lock del player
    pub fn with_queue<R>(&self, f: impl FnOnce(&mut Queue) -> R) -> R {
        f(&mut self.inner.lock().queue)
    }

    /// Configura cómo salir del canal de voz
    pub fn set_voice_cleanup(&self, cleanup: VoiceCleanup) {
        self.inner.lock().voice_cleanup = Some(cleanup);
    }

    /// Descarta el estado de voz y pide al host volver a unirse
    pub async fn reconnect(&self) -> bool {
        let cleanup = {
            let mut inner = self.inner.lock();
            if inner.is_closing() {
                return false;
            }
            inner.reset_voice();
            inner.voice_cleanup.clone()
        };

        if let Some(cleanup) = cleanup {
            if let Err(error) = run_voice_cleanup(cleanup, self.guild_id).await {
                warn!("Voice cleanup for guild {} failed: {}", self.guild_id, error);
                self.emit(Event::PlayerVoiceError {
                    guild_id: self.guild_id,
                    error,
                });
                return false;
            }
        }

        info!("🔄 Player {} reconnecting", self.guild_id);
        self.emit(Event::PlayerReconnect { guild_id: self.guild_id });
        true
    }

    /// Destruye el player. Solo la primera llamada hace trabajo; las demás
    /// retornan de inmediato.
    pub async fn destroy(self: &Arc<Self>, cleanup_voice: bool) {
        let cleanup = {
            let mut inner = self.inner.lock();
            if inner.is_closing() {
                return;
            }
            inner.state = PlayerState::Destroying;
            inner.voice_cleanup.take()
        };

        info!("💥 Destroying player for guild {}", self.guild_id);

        if let (true, Some(cleanup)) = (cleanup_voice, cleanup) {
            if let Err(error) = run_voice_cleanup(cleanup, self.guild_id).await {
                warn!("Voice cleanup for guild {} failed: {}", self.guild_id, error);
                self.emit(Event::PlayerVoiceError {
                    guild_id: self.guild_id,
                    error,
                });
            }
        }

        {
            let mut inner = self.inner.lock();
            if let Some(pending) = inner.voice_task.take() {
                pending.abort();
            }
            inner.tasks.cancel();
            inner.connected = false;
        }

        if let Err(e) = self.node.destroy_player(self.guild_id).await {
            debug!("Remote destroy for guild {} failed: {}", self.guild_id, e);
        }

        // Solo local: nada se envía al nodo después del DELETE
        {
            let mut inner = self.inner.lock();
            inner.queue.clear();
            inner.reset_playback();
            inner.queue.close();
            inner.reset_voice();
            inner.current = None;
            inner.position = 0;
            inner.timestamp = 0;
            inner.volume = self.options.volume;
            inner.voice_channel = None;
            inner.text_channel = None;
            inner.track_end_handled = false;
            inner.state = PlayerState::Destroyed;
        }

        self.node.untrack_player(self);
        if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
            registry.release(self.guild_id);
        }

        self.emit(Event::PlayerDestroy { guild_id: self.guild_id });
    }

    /// Captura el estado para persistirlo
    pub fn snapshot(&self) -> PlayerSnapshot {
        let inner = self.inner.lock();
        PlayerSnapshot {
            guild_id: self.guild_id,
            node: self.node.name().to_string(),
            voice_channel: inner.voice_channel,
            text_channel: inner.text_channel,
            deaf: self.options.deaf,
            mute: self.options.mute,
            volume: inner.volume,
            loop_mode: inner.queue.loop_mode(),
            position: inner.position,
            current: inner.current.as_deref().cloned(),
            queue: inner.queue.tracks().iter().map(|track| Track::clone(track)).collect(),
            saved_at: Utc::now(),
        }
    }

    /// Aplica un snapshot guardado. Devuelve cuántos tracks se encolaron
    pub fn restore(&self, snapshot: &PlayerSnapshot) -> usize {
        let restored = {
            let mut inner = self.inner.lock();
            if inner.is_closing() {
                return 0;
            }
            inner.volume = snapshot.volume.min(1000);
            inner.text_channel = snapshot.text_channel.or(inner.text_channel);
            inner.queue.set_loop_mode(snapshot.loop_mode);
            snapshot
                .queue
                .iter()
                .filter(|track| inner.queue.add(Arc::new(Track::clone(track))))
                .count()
        };

        debug!("Restored {} tracks for guild {}", restored, self.guild_id);
        restored
    }

    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Obtiene el estado actual
    pub fn state(&self) -> PlayerState {
        self.inner.lock().state
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlayerState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state() == PlayerState::Paused
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == PlayerState::Destroyed
    }

    fn is_closing(&self) -> bool {
        self.inner.lock().is_closing()
    }

    pub fn is_voice_ready(&self) -> bool {
        self.inner.lock().voice.complete().is_some()
    }

    /// Obtiene el track actual
    pub fn current(&self) -> Option<Arc<Track>> {
        self.inner.lock().current.clone()
    }

    pub fn position(&self) -> u64 {
        self.inner.lock().position
    }

    pub fn ping(&self) -> i64 {
        self.inner.lock().ping
    }

    pub fn volume(&self) -> u16 {
        self.inner.lock().volume
    }

    pub fn voice_channel(&self) -> Option<u64> {
        self.inner.lock().voice_channel
    }

    pub fn text_channel(&self) -> Option<u64> {
        self.inner.lock().text_channel
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.inner.lock().queue.loop_mode()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

async fn run_voice_cleanup(cleanup: VoiceCleanup, guild_id: u64) -> Result<(), String> {
    match AssertUnwindSafe(cleanup(guild_id)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("voice cleanup panicked".to_string()),
    }
}
