//! Server configuration
//!
//! Every setting can be given on the command line or through an environment
//! variable, so the binary runs unchanged on hosts that only provide `PORT`.

use crate::phase::PhaseDurations;
use clap::{ArgAction, Parser};
use rand::Rng;
use std::fmt;
use std::time::Duration;

const DEFAULT_SPRITES: [&str; 4] = ["adam", "alex", "amelia", "bob"];

/// Invalid configuration detected before the server starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    NoSprites,
    ZeroDuration(&'static str),
    QueueTooSmall,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoSprites => write!(f, "at least one sprite variant is required"),
            ConfigError::ZeroDuration(phase) => write!(f, "{} duration must be non-zero", phase),
            ConfigError::QueueTooSmall => write!(f, "outbound queue must hold at least two messages"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Non-empty set of avatar variants new players are drawn from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpritePool(Vec<String>);

impl SpritePool {
    pub fn new(sprites: Vec<String>) -> Result<Self, ConfigError> {
        let sprites: Vec<String> = sprites
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if sprites.is_empty() {
            return Err(ConfigError::NoSprites);
        }
        Ok(Self(sprites))
    }

    /// Uniformly random variant
    pub fn pick<R: Rng>(&self, rng: &mut R) -> &str {
        &self.0[rng.gen_range(0..self.0.len())]
    }

    pub fn contains(&self, sprite: &str) -> bool {
        self.0.iter().any(|s| s == sprite)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for SpritePool {
    fn default() -> Self {
        Self(DEFAULT_SPRITES.iter().map(|s| s.to_string()).collect())
    }
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub durations: PhaseDurations,
    pub sprites: SpritePool,
    pub block_duplicate_origins: bool,
    /// Per-client outbound queue length before the client is dropped
    pub outbound_queue: usize,
    /// Interval between keepalive pings sent to each client
    pub ping_interval: Duration,
    /// A client that sends nothing (not even a pong) for this long is dropped
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            durations: PhaseDurations::default(),
            sprites: SpritePool::default(),
            block_duplicate_origins: true,
            outbound_queue: 256,
            ping_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Command line arguments
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Round-based multiplayer relay server", long_about = None)]
pub struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "3000")]
    pub port: u16,

    /// Length of the pre-game lobby in seconds
    #[arg(long, env = "PRE_GAME_SECS", default_value = "10")]
    pub pre_game_secs: u64,

    /// Length of an active round in seconds
    #[arg(long, env = "GAME_SECS", default_value = "150")]
    pub game_secs: u64,

    /// Length of the break after a round in seconds
    #[arg(long, env = "GAME_BREAK_SECS", default_value = "2")]
    pub game_break_secs: u64,

    /// Comma separated avatar variants
    #[arg(long, env = "SPRITES", value_delimiter = ',', default_value = "adam,alex,amelia,bob")]
    pub sprites: Vec<String>,

    /// Reject a second connection from an origin that is already playing
    #[arg(long, env = "BLOCK_DUPLICATE_ORIGINS", default_value_t = true, action = ArgAction::Set)]
    pub block_duplicate_origins: bool,

    /// Messages buffered per client before it is considered too slow
    #[arg(long, env = "OUTBOUND_QUEUE", default_value = "256")]
    pub outbound_queue: usize,

    /// Seconds between keepalive pings
    #[arg(long, env = "PING_INTERVAL_SECS", default_value = "20")]
    pub ping_interval_secs: u64,

    /// Seconds of client silence before the connection is dropped
    #[arg(long, env = "IDLE_TIMEOUT_SECS", default_value = "60")]
    pub idle_timeout_secs: u64,
}

impl Args {
    pub fn into_config(self) -> Result<ServerConfig, ConfigError> {
        let durations = PhaseDurations {
            pre_game: non_zero_secs(self.pre_game_secs, "pre-game")?,
            game: non_zero_secs(self.game_secs, "game")?,
            game_break: non_zero_secs(self.game_break_secs, "game break")?,
        };
        if self.outbound_queue < 2 {
            return Err(ConfigError::QueueTooSmall);
        }

        Ok(ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            durations,
            sprites: SpritePool::new(self.sprites)?,
            block_duplicate_origins: self.block_duplicate_origins,
            outbound_queue: self.outbound_queue,
            ping_interval: non_zero_secs(self.ping_interval_secs, "ping interval")?,
            idle_timeout: non_zero_secs(self.idle_timeout_secs, "idle timeout")?,
        })
    }
}

fn non_zero_secs(secs: u64, what: &'static str) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::ZeroDuration(what));
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["server"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_explicit_arguments() {
        let config = parse(&[
            "--host",
            "127.0.0.1",
            "--port",
            "8080",
            "--pre-game-secs",
            "5",
            "--game-secs",
            "60",
            "--game-break-secs",
            "3",
            "--sprites",
            "knight,mage",
            "--block-duplicate-origins",
            "false",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.durations.pre_game, Duration::from_secs(5));
        assert_eq!(config.durations.game, Duration::from_secs(60));
        assert_eq!(config.durations.game_break, Duration::from_secs(3));
        assert_eq!(config.sprites.len(), 2);
        assert!(config.sprites.contains("mage"));
        assert!(!config.block_duplicate_origins);
    }

    #[test]
    fn test_rejects_zero_duration() {
        let result = parse(&["--game-secs", "0"]).into_config();
        assert_eq!(result.unwrap_err(), ConfigError::ZeroDuration("game"));
    }

    #[test]
    fn test_rejects_tiny_queue() {
        let result = parse(&["--outbound-queue", "1"]).into_config();
        assert_eq!(result.unwrap_err(), ConfigError::QueueTooSmall);
    }

    #[test]
    fn test_sprite_pool_rejects_blank_entries() {
        assert_eq!(
            SpritePool::new(vec![" ".to_string(), String::new()]),
            Err(ConfigError::NoSprites)
        );
        let pool = SpritePool::new(vec![" adam ".to_string(), "".to_string()]).unwrap();
        assert_eq!(pool.len(), 1);
        assert!(pool.contains("adam"));
    }

    #[test]
    fn test_sprite_pick_covers_pool() {
        let pool = SpritePool::default();
        let mut rng = rand::thread_rng();
        let picked: HashSet<String> = (0..500)
            .map(|_| pool.pick(&mut rng).to_string())
            .collect();

        assert_eq!(picked.len(), 4);
        assert!(picked.iter().all(|s| pool.contains(s)));
    }

    #[test]
    fn test_default_config_matches_cli_defaults() {
        let defaults = ServerConfig::default();
        assert_eq!(defaults.durations, PhaseDurations::default());
        assert_eq!(defaults.sprites, SpritePool::default());
        assert!(defaults.block_duplicate_origins);
        assert_eq!(defaults.outbound_queue, 256);
    }
}
