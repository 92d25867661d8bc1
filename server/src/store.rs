//! Authoritative in-memory player state
//!
//! The store is the single source of truth for where every connected player
//! is and what they look like. It holds exactly one record per live
//! connection, keyed by the connection id the transport assigned:
//! - Records are created on admission and removed on disconnect
//! - Updates for ids that are already gone are silently ignored
//! - Snapshots are detached copies that can be serialized without a lock
//!
//! The store itself does no locking; the relay owns it behind its own mutex.

use log::{debug, info};
use shared::{Movement, PlayerId, PlayerState};
use std::collections::HashMap;
use std::fmt;

/// Errors raised by the player store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A record already exists for this id. The transport hands out unique
    /// ids, so this indicates a bug upstream rather than a client problem.
    DuplicateId(PlayerId),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::DuplicateId(id) => write!(f, "player {} already exists", id),
        }
    }
}

impl std::error::Error for StoreError {}

/// Connection id → player state
#[derive(Debug, Default)]
pub struct PlayerStore {
    players: HashMap<PlayerId, PlayerState>,
}

impl PlayerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the record for a freshly admitted connection
    ///
    /// New players start at the origin with the idle animation. The sprite
    /// is fixed for the lifetime of the record.
    pub fn create(&mut self, id: PlayerId, sprite: &str) -> Result<PlayerState, StoreError> {
        if self.players.contains_key(&id) {
            return Err(StoreError::DuplicateId(id));
        }

        let player = PlayerState::new(id, sprite);
        info!("Added player {} with sprite {}", id, player.sprite);
        self.players.insert(id, player.clone());
        Ok(player)
    }

    /// Applies a movement report from the owning connection
    ///
    /// Returns the updated record, or None when the player is no longer
    /// present (an update racing the disconnect cleanup). A report without
    /// an animation tag keeps the previous one.
    pub fn update(&mut self, id: PlayerId, movement: Movement) -> Option<PlayerState> {
        let Some(player) = self.players.get_mut(&id) else {
            debug!("Ignoring movement for departed player {}", id);
            return None;
        };

        player.x = movement.x;
        player.y = movement.y;
        if let Some(animation) = movement.animation_state {
            player.animation_state = animation;
        }
        Some(player.clone())
    }

    /// Removes a player record. Returns true if it was present.
    pub fn remove(&mut self, id: PlayerId) -> bool {
        if self.players.remove(&id).is_some() {
            info!("Removed player {}", id);
            true
        } else {
            false
        }
    }

    /// Point-in-time copy of every record
    pub fn snapshot(&self) -> HashMap<PlayerId, PlayerState> {
        self.players.clone()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

#[cfg(test)]
impl PlayerStore {
    pub fn get(&self, id: PlayerId) -> Option<&PlayerState> {
        self.players.get(&id)
    }

    pub fn contains(&self, id: PlayerId) -> bool {
        self.players.contains_key(&id)
    }
}
