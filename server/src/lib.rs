//! # Round Relay Server Library
//!
//! Authoritative server for a browser-based multiplayer game. It keeps track
//! of who is connected, relays every player's position and animation to all
//! other players, and runs the round schedule that every client follows.
//!
//! ## Core Responsibilities
//!
//! ### Player State
//! One record per live connection: position, avatar sprite and animation tag.
//! Clients report their own movement; the server stores the last report and
//! forwards it to everybody else. No physics or collision is simulated here.
//!
//! ### Session Admission
//! Each connection is attributed to an origin (the client address, or the
//! forwarded address behind a reverse proxy). Only one live session per origin
//! is admitted; a second attempt is told `alreadyPlaying` and closed.
//!
//! ### Round Phases
//! A self-driving timer cycles `PRE_GAME → GAME → GAME_BREAK` forever with
//! fixed durations. Every transition is broadcast with the absolute time the
//! new phase ends, so clients show the correct countdown regardless of
//! latency. Late joiners receive the live phase on admission.
//!
//! ## Architecture Design
//!
//! ### Task Per Connection
//! Every WebSocket connection runs in its own tokio task with a reader half
//! and a writer half. The writer drains a bounded per-client queue, so a slow
//! client never holds up delivery to anyone else; a client whose queue
//! overflows is disconnected instead.
//!
//! ### Single Shared Lock
//! The player store, the session guard and the registry of client queues sit
//! behind one mutex. Operations are tiny and never await while holding it,
//! which keeps admission atomic and relay order per sender intact.
//!
//! ### Cleanup By Ownership
//! Admission hands the connection task a `PlayerHandle`. Dropping it removes
//! the player, releases the origin slot and broadcasts the removal, on every
//! exit path.
//!
//! ## Module Organization
//!
//! - `store`: the player state map
//! - `session`: origin derivation and the one-session-per-origin guard
//! - `phase`: round phase state machine, clock and listener traits
//! - `relay`: composition of the above plus fan-out to client queues
//! - `network`: WebSocket accept loop and per-connection tasks
//! - `config`: command line and environment configuration
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         bind_addr: "127.0.0.1:3000".to_string(),
//!         ..ServerConfig::default()
//!     };
//!
//!     let server = Server::bind(config).await?;
//!     server
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod network;
pub mod phase;
pub mod relay;
pub mod session;
pub mod store;
