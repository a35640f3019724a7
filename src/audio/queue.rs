use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tracing::{debug, info};

use crate::audio::track::Track;

/// Tracks consumidos que se guardan para el loop de cola
pub const MAX_HISTORY: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Live,
    /// Se activa al destruir el player; toda operación pasa a ser no-op
    Closed,
}

/// Cola de tracks de un player.
///
/// La cabeza de la secuencia es el track enviado al nodo. Al reproducir solo
/// se consulta; [`Queue::consume_next`] la retira cuando el nodo reporta el
/// fin del track.
#[derive(Debug)]
pub struct Queue {
    tracks: VecDeque<Arc<Track>>,
    history: VecDeque<Arc<Track>>,
    loop_mode: LoopMode,
    state: QueueState,
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue {
    /// Crea una cola vacía
    pub fn new() -> Self {
        Self {
            tracks: VecDeque::new(),
            history: VecDeque::with_capacity(MAX_HISTORY),
            loop_mode: LoopMode::Off,
            state: QueueState::Live,
        }
    }

    /// Agrega un track al final de la cola
    pub fn add(&mut self, track: Arc<Track>) -> bool {
        if self.is_closed() {
            return false;
        }

        debug!("➕ Queued: {}", track.title());
        self.tracks.push_back(track);
        true
    }

    /// Inserta en `position`, acotada a `[0, len]`
    pub fn insert(&mut self, track: Arc<Track>, position: usize) -> bool {
        if self.is_closed() {
            return false;
        }

        let position = position.min(self.tracks.len());
        self.tracks.insert(position, track);
        true
    }

    /// Elimina un track específico
    pub fn remove(&mut self, index: usize) -> Option<Arc<Track>> {
        if self.is_closed() {
            return None;
        }

        let removed = self.tracks.remove(index);
        if removed.is_some() {
            debug!("❌ Track removed at position {}", index);
        }
        removed
    }

    /// Mezcla la cola
    pub fn shuffle(&mut self) {
        if self.is_closed() {
            return;
        }

        let mut rng = rand::thread_rng();
        self.tracks.make_contiguous().shuffle(&mut rng);
        info!("🔀 Queue shuffled");
    }

    /// Obtiene el track en `index` sin quitarlo
    pub fn peek(&self, index: usize) -> Option<Arc<Track>> {
        if self.is_closed() {
            return None;
        }
        self.tracks.get(index).cloned()
    }

    /// Limpia la cola y el historial
    pub fn clear(&mut self) {
        self.tracks.clear();
        self.history.clear();
    }

    /// Obtiene el siguiente track sin modificar la cola.
    ///
    /// Con loop de track y un track actual, devuelve ese mismo track. Si no, la
    /// cabeza de la secuencia; con loop de cola y secuencia vacía, la entrada
    /// más antigua del historial, desde donde rellena [`Queue::consume_next`].
    pub fn next_track(&self, current: Option<&Arc<Track>>) -> Option<Arc<Track>> {
        if self.is_closed() {
            return None;
        }

        if self.loop_mode == LoopMode::Track {
            if let Some(current) = current {
                return Some(Arc::clone(current));
            }
        }

        if let Some(head) = self.tracks.front() {
            return Some(Arc::clone(head));
        }

        if self.loop_mode == LoopMode::Queue {
            return self.history.front().cloned();
        }

        None
    }

    /// Pasa la cabeza al historial.
    ///
    /// Con loop de cola, una secuencia vacía se rellena antes desde el
    /// historial en su orden original.
    pub fn consume_next(&mut self) -> Option<Arc<Track>> {
        if self.is_closed() {
            return None;
        }

        if self.tracks.is_empty() && self.loop_mode == LoopMode::Queue && !self.history.is_empty() {
            info!("🔁 Replaying {} tracks from history", self.history.len());
            self.tracks = std::mem::take(&mut self.history);
        }

        let consumed = self.tracks.pop_front()?;
        self.push_history(Arc::clone(&consumed));
        Some(consumed)
    }

    /// Obtiene el modo de loop
    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    /// Cambia el modo de loop
    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        if self.is_closed() {
            return;
        }

        self.loop_mode = mode;
        match mode {
            LoopMode::Off => info!("➡️ Loop disabled"),
            LoopMode::Track => info!("🔂 Looping current track"),
            LoopMode::Queue => info!("🔁 Looping queue"),
        }
    }

    /// Obtiene el tamaño de la cola
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Verifica si la cola está vacía
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Obtiene todos los tracks pendientes
    pub fn tracks(&self) -> Vec<Arc<Track>> {
        self.tracks.iter().cloned().collect()
    }

    /// Obtiene el historial, del más antiguo al más reciente
    pub fn history(&self) -> Vec<Arc<Track>> {
        self.history.iter().cloned().collect()
    }

    /// Duración total de la cola
    pub fn total_duration(&self) -> Duration {
        self.tracks.iter().map(|track| track.duration()).sum()
    }

    /// Limpia la cola y la deja inerte
    pub fn close(&mut self) {
        self.clear();
        self.loop_mode = LoopMode::Off;
        self.state = QueueState::Closed;
    }

    /// Vuelve a aceptar operaciones
    pub fn reopen(&mut self) {
        self.clear();
        self.state = QueueState::Live;
    }

    pub fn is_closed(&self) -> bool {
        self.state == QueueState::Closed
    }

    fn push_history(&mut self, track: Arc<Track>) {
        self.history.push_back(track);

        // Mantener solo los últimos N items
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::track::TrackInfo;
    use pretty_assertions::assert_eq;

    fn track(title: &str) -> Arc<Track> {
        Arc::new(Track::new(
            format!("enc-{title}"),
            TrackInfo {
                title: title.to_string(),
                author: "tester".to_string(),
                length: 1000,
                ..Default::default()
            },
        ))
    }

    fn titles(tracks: &[Arc<Track>]) -> Vec<String> {
        tracks.iter().map(|t| t.title().to_string()).collect()
    }

    #[test]
    fn test_consume_order_matches_insertion() {
        let mut queue = Queue::new();
        for name in ["a", "b", "c"] {
            assert!(queue.add(track(name)));
        }

        let consumed: Vec<_> = std::iter::from_fn(|| queue.consume_next()).collect();

        assert_eq!(titles(&consumed), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
        assert_eq!(queue.consume_next(), None);
    }

    #[test]
    fn test_next_track_does_not_mutate() {
        let mut queue = Queue::new();
        queue.add(track("a"));
        queue.add(track("b"));

        let first = queue.next_track(None).unwrap();
        let second = queue.next_track(None).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(queue.len(), 2);
        assert!(queue.history().is_empty());
    }

    #[test]
    fn test_history_is_capped() {
        let mut queue = Queue::new();
        for i in 0..=MAX_HISTORY {
            queue.add(track(&format!("t{i}")));
        }
        while queue.consume_next().is_some() {}

        let history = queue.history();
        assert_eq!(history.len(), MAX_HISTORY);
        assert_eq!(history.first().unwrap().title(), "t1");
        assert_eq!(history.last().unwrap().title(), "t10");
    }

    #[test]
    fn test_loop_queue_refills_from_history_in_order() {
        let mut queue = Queue::new();
        queue.set_loop_mode(LoopMode::Queue);
        queue.add(track("a"));
        queue.add(track("b"));
        queue.consume_next();
        queue.consume_next();
        assert!(queue.is_empty());

        // Consultar no modifica la cola
        assert_eq!(queue.next_track(None).unwrap().title(), "a");
        assert!(queue.is_empty());

        let replayed = queue.consume_next().unwrap();
        assert_eq!(replayed.title(), "a");
        assert_eq!(titles(&queue.tracks()), vec!["b"]);
        assert_eq!(titles(&queue.history()), vec!["a"]);
    }

    #[test]
    fn test_loop_track_returns_current() {
        let mut queue = Queue::new();
        queue.set_loop_mode(LoopMode::Track);
        queue.add(track("next"));
        let current = track("current");

        let next = queue.next_track(Some(&current)).unwrap();
        assert!(Arc::ptr_eq(&next, &current));

        // Sin track actual se usa la cabeza
        assert_eq!(queue.next_track(None).unwrap().title(), "next");
    }

    #[test]
    fn test_insert_clamps_position() {
        let mut queue = Queue::new();
        queue.add(track("a"));
        queue.insert(track("z"), 99);
        queue.insert(track("first"), 0);

        assert_eq!(titles(&queue.tracks()), vec!["first", "a", "z"]);
        assert_eq!(queue.peek(1).unwrap().title(), "a");
        assert_eq!(queue.peek(3), None);
        assert_eq!(queue.remove(0).unwrap().title(), "first");
        assert_eq!(queue.remove(10), None);
    }

    #[test]
    fn test_shuffle_keeps_tracks() {
        let mut queue = Queue::new();
        for i in 0..20 {
            queue.add(track(&i.to_string()));
        }

        queue.shuffle();

        let mut shuffled = titles(&queue.tracks());
        shuffled.sort();
        let mut expected: Vec<_> = (0..20).map(|i| i.to_string()).collect();
        expected.sort();
        assert_eq!(shuffled, expected);
    }

    #[test]
    fn test_closed_queue_absorbs_operations() {
        let mut queue = Queue::new();
        queue.add(track("a"));
        queue.close();

        assert!(!queue.add(track("b")));
        assert!(!queue.insert(track("c"), 0));
        assert_eq!(queue.next_track(None), None);
        assert_eq!(queue.consume_next(), None);
        assert!(queue.is_empty());

        queue.reopen();
        assert!(queue.add(track("d")));
        assert_eq!(queue.len(), 1);
    }
}
