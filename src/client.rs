//! # Client
//!
//! [`LavaClient`] is the entry point for hosts. It owns the node connections
//! and the player table, routes voice updates coming from the host's gateway,
//! resolves tracks and persists player state across restarts.

use dashmap::{mapref::entry::Entry, DashMap};
use futures::{future::{join_all, BoxFuture}, FutureExt};
use parking_lot::{Mutex, RwLock};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    audio::{
        player::{Player, PlayerOptions, PlayerRegistry, VoiceServerUpdate, VoiceStateUpdate},
        track::LoadResult,
    },
    config::Config,
    error::ClientError,
    events::{Event, EventBus},
    node::Node,
    storage::{JsonLinesStore, PlayerSnapshot, StateStore},
};

/// Pide al host unirse a `(guild, channel, deaf, mute)`. Devuelve si se envió
pub type VoiceReconnect = Arc<dyn Fn(u64, u64, bool, bool) -> BoxFuture<'static, bool> + Send + Sync>;

const SEARCH_SOURCES: [&str; 3] = ["ytsearch", "ytmsearch", "scsearch"];
const MIN_SAVE_INTERVAL: Duration = Duration::from_secs(1);

/// Agrega el prefijo de búsqueda a las consultas; los links pasan tal cual
pub fn format_query(query: &str, source: &str) -> String {
    let is_link = Url::parse(query)
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false);

    if !is_link && SEARCH_SOURCES.contains(&source) {
        format!("{source}:{query}")
    } else {
        query.to_string()
    }
}

/// Fachada sobre los nodos y los players de cada guild.
pub struct LavaClient {
    config: Config,
    events: Arc<EventBus>,
    nodes: Vec<Arc<Node>>,
    players: DashMap<u64, Arc<Player>>,
    store: Option<Arc<dyn StateStore>>,
    started: AtomicBool,
    autosave: Mutex<Option<CancellationToken>>,
    voice_reconnect: RwLock<Option<VoiceReconnect>>,
    this: Weak<LavaClient>,
}

impl LavaClient {
    /// Crea un nodo por dirección configurada. Nada conecta hasta [`LavaClient::start`]
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let events = Arc::new(EventBus::new());
        let nodes = config
            .nodes
            .iter()
            .map(|node| Node::new(node.clone(), config.user_id, &config.client_name, events.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        let store = config
            .state_file
            .clone()
            .map(|path| Arc::new(JsonLinesStore::new(path)) as Arc<dyn StateStore>);

        Ok(Self::with_nodes(config, events, nodes, store))
    }

    /// Crea el cliente con nodos y store ya construidos
    pub fn with_nodes(
        config: Config,
        events: Arc<EventBus>,
        nodes: Vec<Arc<Node>>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            events,
            nodes,
            players: DashMap::new(),
            store,
            started: AtomicBool::new(false),
            autosave: Mutex::new(None),
            voice_reconnect: RwLock::new(None),
            this: this.clone(),
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Busca un nodo por nombre
    pub fn node(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|node| node.name() == name)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Conecta todos los nodos en paralelo. Basta con que uno obtenga sesión
    pub async fn start(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.is_started() {
            return Ok(());
        }

        info!("🚀 Connecting to {} node(s)...", self.nodes.len());
        join_all(self.nodes.iter().map(|node| node.connect())).await;

        let ready = self.nodes.iter().filter(|node| node.is_ready()).count();
        if ready == 0 {
            error!("❌ No node produced a session");
            return Err(ClientError::NoNodeAvailable);
        }

        self.started.store(true, Ordering::SeqCst);
        info!("✅ Client ready with {}/{} node(s)", ready, self.nodes.len());
        self.events.emit(Event::Ready);

        if let Some(store) = &self.store {
            self.start_autosave(store.clone());
        }

        Ok(())
    }

    fn start_autosave(self: &Arc<Self>, store: Arc<dyn StateStore>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.autosave.lock().replace(token.clone()) {
            previous.cancel();
        }

        let client = Arc::downgrade(self);
        let period = self.config.state_save_interval.max(MIN_SAVE_INTERVAL);
        debug!("Autosaving player states every {}", humantime::format_duration(period));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(client) = client.upgrade() else { break };
                        // Sin players no se sobrescribe el estado guardado
                        if client.players().is_empty() {
                            continue;
                        }
                        let snapshots = client.snapshots();
                        if let Err(e) = store.save(&snapshots).await {
                            warn!("Autosave failed: {:#}", e);
                        }
                    }
                }
            }
        });
    }

    /// Opciones por defecto para `guild_id` según la configuración
    pub fn player_options(&self, guild_id: u64) -> PlayerOptions {
        PlayerOptions {
            volume: self.config.default_volume,
            voice_debounce: self.config.voice_debounce,
            advance_delay: self.config.advance_delay,
            ..PlayerOptions::new(guild_id)
        }
    }

    /// Devuelve el player vivo del guild o crea uno en el primer nodo con sesión
    pub async fn create_connection(&self, options: PlayerOptions) -> Result<Arc<Player>, ClientError> {
        if !self.is_started() {
            return Err(ClientError::NotStarted);
        }
        if options.guild_id == 0 {
            return Err(ClientError::InvalidGuild);
        }
        if let Some(existing) = self.get_player(options.guild_id) {
            return Ok(existing);
        }

        let node = self.ready_node().ok_or(ClientError::NoNodeAvailable)?;
        self.create_player(node, options)
    }

    /// Crea el player en `node`, o devuelve el que siga vivo
    pub fn create_player(&self, node: Arc<Node>, options: PlayerOptions) -> Result<Arc<Player>, ClientError> {
        let guild_id = options.guild_id;
        if guild_id == 0 {
            return Err(ClientError::InvalidGuild);
        }

        let player = match self.players.entry(guild_id) {
            Entry::Occupied(entry) if !entry.get().is_destroyed() => return Ok(entry.get().clone()),
            Entry::Occupied(mut entry) => {
                let player = self.build_player(node, options);
                entry.insert(player.clone());
                player
            }
            Entry::Vacant(entry) => {
                let player = self.build_player(node, options);
                entry.insert(player.clone());
                player
            }
        };

        player.connect(None);
        info!("🎵 Player created for guild {} on node {}", guild_id, player.node().name());
        self.events.emit(Event::PlayerCreate { guild_id });

        Ok(player)
    }

    fn build_player(&self, node: Arc<Node>, options: PlayerOptions) -> Arc<Player> {
        let registry: Weak<dyn PlayerRegistry> = self.this.clone();
        Player::new(node, self.events.clone(), options, Some(registry))
    }

    fn ready_node(&self) -> Option<Arc<Node>> {
        self.nodes.iter().find(|node| node.is_ready()).cloned()
    }

    /// Obtiene el player vivo de un guild
    pub fn get_player(&self, guild_id: u64) -> Option<Arc<Player>> {
        self.players
            .get(&guild_id)
            .map(|entry| entry.value().clone())
            .filter(|player| !player.is_destroyed())
    }

    /// Destruye el player del guild, sale del canal de voz y lo quita de la tabla
    pub async fn destroy_player(&self, guild_id: u64) {
        if let Some(player) = self.get_player(guild_id) {
            player.destroy(true).await;
        }
        self.players.remove(&guild_id);
    }

    /// Obtiene todos los players vivos
    pub fn players(&self) -> Vec<Arc<Player>> {
        self.players
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|player| !player.is_destroyed())
            .collect()
    }

    /// Reenvía un voice state update. Devuelve si algún player lo recibió
    pub fn update_voice_state(&self, guild_id: u64, update: VoiceStateUpdate) -> bool {
        match self.get_player(guild_id) {
            Some(player) => {
                player.handle_voice_state_update(update);
                true
            }
            None => false,
        }
    }

    /// Reenvía un voice server update. Devuelve si algún player lo recibió
    pub fn update_voice_server(&self, guild_id: u64, update: VoiceServerUpdate) -> bool {
        match self.get_player(guild_id) {
            Some(player) => {
                player.handle_voice_server_update(update);
                true
            }
            None => false,
        }
    }

    /// Resuelve una consulta o link en el primer nodo disponible
    pub async fn resolve(
        &self,
        query: &str,
        source: &str,
        requester: Option<u64>,
    ) -> Result<LoadResult, ClientError> {
        if !self.is_started() {
            return Err(ClientError::NotStarted);
        }
        let node = self.ready_node().ok_or(ClientError::NoNodeAvailable)?;

        let identifier = format_query(query, source);
        debug!("🔍 Resolving '{}' on node {}", identifier, node.name());
        Ok(node.load_tracks(&identifier, requester).await?)
    }

    /// Configura cómo volver a unirse a un canal al restaurar
    pub fn set_voice_reconnect<F, Fut>(&self, reconnect: F)
    where
        F: Fn(u64, u64, bool, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let reconnect: VoiceReconnect =
            Arc::new(move |guild, channel, deaf, mute| reconnect(guild, channel, deaf, mute).boxed());
        *self.voice_reconnect.write() = Some(reconnect);
    }

    fn snapshots(&self) -> Vec<PlayerSnapshot> {
        self.players()
            .iter()
            .filter(|player| player.voice_channel().is_some())
            .map(|player| player.snapshot())
            .collect()
    }

    /// Guarda todos los players vivos. Devuelve cuántos se guardaron
    pub async fn save_player_states(&self) -> usize {
        let Some(store) = self.store.as_ref().filter(|_| self.is_started()) else {
            return 0;
        };

        match store.save(&self.snapshots()).await {
            Ok(saved) => {
                info!("💾 Saved {} player state(s)", saved);
                saved
            }
            Err(e) => {
                warn!("Saving player states failed: {:#}", e);
                0
            }
        }
    }

    /// Recrea los players guardados y vuelve a encolar sus tracks. Con
    /// `reconnect` se pide al host volver a cada canal de voz.
    pub async fn restore_players(&self, reconnect: bool) -> usize {
        let Some(store) = self.store.as_ref().filter(|_| self.is_started()) else {
            return 0;
        };

        let snapshots = match store.load().await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!("Loading player states failed: {:#}", e);
                return 0;
            }
        };

        let rejoin = self.voice_reconnect.read().clone();
        let mut restored = 0;

        for snapshot in snapshots {
            let Some(channel) = snapshot.voice_channel else {
                continue;
            };
            let node = self
                .node(&snapshot.node)
                .filter(|node| node.is_ready())
                .cloned()
                .or_else(|| self.ready_node());
            let Some(node) = node else {
                warn!("No node available to restore guild {}", snapshot.guild_id);
                break;
            };

            let mut options = self.player_options(snapshot.guild_id).voice_channel(channel);
            options.text_channel = snapshot.text_channel;
            options.deaf = snapshot.deaf;
            options.mute = snapshot.mute;

            let player = match self.create_player(node, options) {
                Ok(player) => player,
                Err(e) => {
                    warn!("Could not restore guild {}: {}", snapshot.guild_id, e);
                    continue;
                }
            };
            player.restore(&snapshot);

            if reconnect {
                if let Some(rejoin) = &rejoin {
                    if !rejoin(snapshot.guild_id, channel, snapshot.deaf, snapshot.mute).await {
                        warn!("Host did not rejoin voice for guild {}", snapshot.guild_id);
                    }
                }
            }

            restored += 1;
        }

        info!("♻️ Restored {} player(s)", restored);
        restored
    }

    /// Borra los estados guardados
    pub async fn clear_saved_states(&self) {
        let Some(store) = self.store.as_ref().filter(|_| self.is_started()) else {
            return;
        };
        if let Err(e) = store.clear().await {
            warn!("Clearing player states failed: {:#}", e);
        }
    }

    /// Guarda el estado y apaga players y nodos
    pub async fn stop(&self) {
        info!("🛑 Stopping client...");

        if let Some(token) = self.autosave.lock().take() {
            token.cancel();
        }

        if self.store.is_some() && !self.players().is_empty() {
            self.save_player_states().await;
        }

        join_all(self.players().iter().map(|player| player.destroy(true))).await;

        for node in &self.nodes {
            node.cleanup().await;
        }

        self.players.clear();
        self.started.store(false, Ordering::SeqCst);
        self.events.emit(Event::Shutdown);
        info!("👋 Client stopped");
    }

    #[cfg(test)]
    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }
}

impl PlayerRegistry for LavaClient {
    fn release(&self, guild_id: u64) {
        self.players.remove_if(&guild_id, |_, player| player.is_destroyed());
    }

    fn adopt(&self, player: &Arc<Player>) {
        match self.players.entry(player.guild_id()) {
            Entry::Occupied(entry) if !entry.get().is_destroyed() => {
                if !Arc::ptr_eq(entry.get(), player) {
                    debug!("Guild {} already has a live player, not adopting", player.guild_id());
                }
            }
            Entry::Occupied(mut entry) => {
                entry.insert(player.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(player.clone());
            }
        }
    }
}
