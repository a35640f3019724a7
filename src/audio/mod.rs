//! # Audio Module
//!
//! Per-guild playback control. The audio itself is decoded and
//! streamed by the remote node; this module only decides what the node
//! should be doing.
//!
//! ## Architecture
//!
//! ### [`player`] - Player
//! - State machine from `Uninitialized` to `Destroyed`
//! - Assembles voice credentials and forwards them after a quiet period
//! - Submits tracks, reacts to track lifecycle events, advances the queue
//!
//! ### [`queue`] - Queue Management
//! - Ordered tracks with loop modes (off, track, queue)
//! - Bounded history used to replay the queue in loop-queue mode
//! - Closed state once the owning player is destroyed
//!
//! ### [`track`] - Tracks
//! - Immutable track metadata shared through `Arc`
//! - Decoding of `loadtracks` responses into a [`track::LoadResult`]
//!
//! ## Concurrency
//!
//! - Player state sits behind a `parking_lot::Mutex` that is never held
//!   across an `.await`
//! - `play()` is serialized per player by an async mutex
//! - Debounce and auto-advance tasks are cancelled on destroy

pub mod player;
pub mod queue;
pub mod track;
