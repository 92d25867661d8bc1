//! Wire protocol shared between the relay server and its clients.
//!
//! Every frame on the socket is a JSON text message of the form
//! `{"event": "<name>", "data": <payload>}`. Field names follow the browser
//! client that consumes them (`playerId`, `playerSprite`, `phaseEndTime`, ...).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Connection identifier assigned by the transport layer.
pub type PlayerId = u32;

/// Animation tag every player starts with.
pub const DEFAULT_ANIMATION: &str = "idle";

/// Authoritative state of one connected player.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    #[serde(rename = "playerId")]
    pub id: PlayerId,
    pub x: f64,
    pub y: f64,
    #[serde(rename = "playerSprite")]
    pub sprite: String,
    pub animation_state: String,
}

impl PlayerState {
    pub fn new(id: PlayerId, sprite: impl Into<String>) -> Self {
        Self {
            id,
            x: 0.0,
            y: 0.0,
            sprite: sprite.into(),
            animation_state: DEFAULT_ANIMATION.to_string(),
        }
    }
}

/// Movement report sent by a client about its own player.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Movement {
    pub x: f64,
    pub y: f64,
    /// Omitted by clients that only move; the previous tag is kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation_state: Option<String>,
}

/// Named period of the round cycle.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseName {
    PreGame,
    Game,
    GameBreak,
}

impl PhaseName {
    /// Phase entered once this one expires. The cycle has no terminal state.
    pub fn next(self) -> Self {
        match self {
            PhaseName::PreGame => PhaseName::Game,
            PhaseName::Game => PhaseName::GameBreak,
            PhaseName::GameBreak => PhaseName::PreGame,
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PhaseName::PreGame => "PRE_GAME",
            PhaseName::Game => "GAME",
            PhaseName::GameBreak => "GAME_BREAK",
        };
        f.write_str(name)
    }
}

/// The live phase and the absolute time (ms since the Unix epoch) it ends.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RoundPhase {
    #[serde(rename = "phase")]
    pub name: PhaseName,
    #[serde(rename = "phaseEndTime")]
    pub ends_at: u64,
}

impl RoundPhase {
    /// Milliseconds left in this phase as seen at `now`, saturating at zero.
    pub fn remaining_at(&self, now: u64) -> u64 {
        self.ends_at.saturating_sub(now)
    }
}

/// Events pushed from the server to a client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// First event on an admitted connection: the id the server assigned it
    Connected(PlayerId),
    CurrentPlayers(HashMap<PlayerId, PlayerState>),
    NewPlayer(PlayerState),
    PlayerMoved(PlayerState),
    PlayerRemoved(PlayerId),
    PhaseChange(RoundPhase),
    AlreadyPlaying(bool),
}

/// Events sent by a client to the server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    PlayerMovement(Movement),
}

/// Failure to decode or encode a protocol frame.
#[derive(Debug)]
pub struct ProtocolError(serde_json::Error);

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed protocol frame: {}", self.0)
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError(e)
    }
}

pub fn encode<T: Serialize>(event: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

pub fn decode<'a, T: Deserialize<'a>>(text: &'a str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn timestamp_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    millis.min(u64::MAX as u128) as u64
}
