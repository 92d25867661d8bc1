//! Connection registry and message relay
//!
//! The relay glues the player store, the session guard and the phase
//! scheduler together. It is transport-agnostic: every admitted connection is
//! represented by a bounded queue of `ServerEvent`s that the network layer
//! drains onto its socket, and by a `PlayerHandle` through which the network
//! layer reports that connection's movement.
//!
//! All shared state lives behind one mutex in the `Hub`. Fan-out never waits
//! on a client: a peer whose queue is full or closed is dropped from the
//! registry, which ends its writer and in turn triggers its own cleanup.

use crate::config::{ServerConfig, SpritePool};
use crate::phase::{Clock, PhaseListener, PhaseScheduler, SystemClock};
use crate::session::SessionGuard;
use crate::store::{PlayerStore, StoreError};
use log::{debug, error, info, warn};
use shared::{Movement, PlayerId, RoundPhase, ServerEvent};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Why a connection was not admitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Another live connection already holds this origin's slot
    AlreadyPlaying,
    /// The player store refused the id; see `StoreError::DuplicateId`
    Store(StoreError),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::AlreadyPlaying => write!(f, "origin already has a live session"),
            ConnectError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConnectError {}

impl From<StoreError> for ConnectError {
    fn from(e: StoreError) -> Self {
        ConnectError::Store(e)
    }
}

struct HubState {
    players: PlayerStore,
    sessions: SessionGuard,
    peers: HashMap<PlayerId, mpsc::Sender<ServerEvent>>,
}

impl HubState {
    /// Queues `event` for every peer except `exclude`, evicting peers that
    /// cannot take it right now.
    fn broadcast(&mut self, event: &ServerEvent, exclude: Option<PlayerId>) {
        let mut evicted = Vec::new();

        for (id, outbound) in &self.peers {
            if Some(*id) == exclude {
                continue;
            }
            if let Err(e) = outbound.try_send(event.clone()) {
                log_send_failure(*id, &e);
                evicted.push(*id);
            }
        }

        for id in evicted {
            self.peers.remove(&id);
        }
    }

    fn send_to(&mut self, id: PlayerId, event: ServerEvent) {
        let Some(outbound) = self.peers.get(&id) else {
            return;
        };
        if let Err(e) = outbound.try_send(event) {
            log_send_failure(id, &e);
            self.peers.remove(&id);
        }
    }
}

fn log_send_failure(id: PlayerId, error: &TrySendError<ServerEvent>) {
    match error {
        TrySendError::Full(_) => warn!("Client {} is not keeping up, dropping it", id),
        TrySendError::Closed(_) => debug!("Client {} outbound queue already closed", id),
    }
}

/// Shared state of every live connection
pub struct Hub {
    state: Mutex<HubState>,
}

impl Hub {
    fn new(sessions: SessionGuard) -> Self {
        Self {
            state: Mutex::new(HubState {
                players: PlayerStore::new(),
                sessions,
                peers: HashMap::new(),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admission check, record creation, snapshot and announcement, all
    /// under one lock so no other event can interleave.
    fn admit(
        &self,
        id: PlayerId,
        origin: &str,
        sprite: &str,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Result<(), ConnectError> {
        let mut state = self.lock_state();

        if !state.sessions.try_admit(origin) {
            return Err(ConnectError::AlreadyPlaying);
        }

        let player = match state.players.create(id, sprite) {
            Ok(player) => player,
            Err(e) => {
                state.sessions.release(origin);
                return Err(e.into());
            }
        };

        let snapshot = state.players.snapshot();
        state.peers.insert(id, outbound);
        state.send_to(id, ServerEvent::Connected(id));
        state.send_to(id, ServerEvent::CurrentPlayers(snapshot));
        state.broadcast(&ServerEvent::NewPlayer(player), Some(id));
        Ok(())
    }

    fn relay_movement(&self, id: PlayerId, movement: Movement) {
        let mut state = self.lock_state();
        if let Some(player) = state.players.update(id, movement) {
            state.broadcast(&ServerEvent::PlayerMoved(player), Some(id));
        }
    }

    fn disconnect(&self, id: PlayerId, origin: &str) {
        let mut state = self.lock_state();
        state.peers.remove(&id);
        state.sessions.release(origin);
        if state.players.remove(id) {
            state.broadcast(&ServerEvent::PlayerRemoved(id), None);
        }
    }

    fn send_to(&self, id: PlayerId, event: ServerEvent) {
        self.lock_state().send_to(id, event);
    }

    fn close_all(&self) {
        let mut state = self.lock_state();
        let count = state.peers.len();
        state.peers.clear();
        if count > 0 {
            info!("Closed {} client queues", count);
        }
    }
}

impl PhaseListener for Hub {
    fn on_phase_change(&self, phase: RoundPhase) {
        self.lock_state()
            .broadcast(&ServerEvent::PhaseChange(phase), None);
    }
}

/// An admitted connection
///
/// Movement can only be reported through the handle of the connection that
/// owns the player. Dropping the handle runs the disconnect sequence exactly
/// once: the record is removed, the origin slot released and the removal
/// broadcast to the remaining clients. This holds on every exit path of the
/// connection task, including errors and panics.
pub struct PlayerHandle {
    hub: Arc<Hub>,
    id: PlayerId,
    origin: String,
}

impl PlayerHandle {
    pub fn id(&self) -> PlayerId {
        self.id
    }

    /// Updates this player and relays the new state to everyone else
    pub fn relay_movement(&self, movement: Movement) {
        self.hub.relay_movement(self.id, movement);
    }
}

impl Drop for PlayerHandle {
    fn drop(&mut self) {
        info!("Client {} from {} disconnected", self.id, self.origin);
        self.hub.disconnect(self.id, &self.origin);
    }
}

impl fmt::Debug for PlayerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlayerHandle")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Composition root for player state, admission and round phases
pub struct Relay {
    hub: Arc<Hub>,
    scheduler: PhaseScheduler,
    sprites: SpritePool,
    queue_capacity: usize,
}

impl Relay {
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &ServerConfig, clock: Arc<dyn Clock>) -> Self {
        let sessions = if config.block_duplicate_origins {
            SessionGuard::new()
        } else {
            SessionGuard::permissive()
        };
        let hub = Arc::new(Hub::new(sessions));
        let scheduler = PhaseScheduler::new(config.durations, clock, hub.clone());

        Self {
            hub,
            scheduler,
            sprites: config.sprites.clone(),
            queue_capacity: config.outbound_queue,
        }
    }

    /// Starts the round cycle. Requires a tokio runtime.
    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Stops the round cycle before dropping every client queue
    pub fn shutdown(&self) {
        self.scheduler.stop();
        self.hub.close_all();
    }

    /// Admits connection `id` from `origin`
    ///
    /// On success the returned receiver already holds `connected`, the
    /// `currentPlayers` snapshot and the current `phaseChange`, in that
    /// order, and every other client has been sent `newPlayer`.
    pub fn connect(
        &self,
        id: PlayerId,
        origin: impl Into<String>,
    ) -> Result<(PlayerHandle, mpsc::Receiver<ServerEvent>), ConnectError> {
        let origin = origin.into();
        let sprite = self.sprites.pick(&mut rand::thread_rng());
        let (outbound, inbound) = mpsc::channel(self.queue_capacity);

        if let Err(e) = self.hub.admit(id, &origin, sprite, outbound) {
            match &e {
                ConnectError::AlreadyPlaying => {
                    info!("Rejected client {}: origin {} is already playing", id, origin)
                }
                ConnectError::Store(inner) => error!("Rejected client {}: {}", id, inner),
            }
            return Err(e);
        }
        info!("Client {} connected from {} as {}", id, origin, sprite);

        // Read after registration: a transition racing this join is either
        // already in the queue or reported here, never lost.
        let phase = self.scheduler.current_phase();
        self.hub.send_to(id, ServerEvent::PhaseChange(phase));

        let handle = PlayerHandle {
            hub: Arc::clone(&self.hub),
            id,
            origin,
        };
        Ok((handle, inbound))
    }

    pub fn current_phase(&self) -> RoundPhase {
        self.scheduler.current_phase()
    }

    pub fn snapshot(&self) -> HashMap<PlayerId, shared::PlayerState> {
        self.hub.lock_state().players.snapshot()
    }

    pub fn player_count(&self) -> usize {
        self.hub.lock_state().players.len()
    }

    pub fn is_origin_held(&self, origin: &str) -> bool {
        self.hub.lock_state().sessions.is_held(origin)
    }
}
