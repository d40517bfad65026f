//! # Arena Server Library
//!
//! Authoritative server for a tick-based arena where bots steer blobs, eat
//! food, dodge toxins and consume each other. Bots, observers and operators
//! connect over TCP; the tick loop owns the world and is the only writer.
//!
//! ## Architecture
//!
//! ### Tick loop (`engine`)
//! Runs every tick interval while at least one relevant session is attached:
//! - Applies queued operator commands
//! - Drains registrations, disconnects and bot commands
//! - Runs the game phases (`game`), then emits one frame per session
//!
//! ### Sessions (`session`, `outbox`)
//! One reader and one writer task per connection. The tick loop never waits
//! on a socket: it pushes into a bounded per-session outbox that replaces the
//! oldest droppable frame when full. A consumer that keeps its outbox deep
//! for too long is disconnected.
//!
//! ### Standby (`standby`)
//! With no observers and no real bots connected the tick loop parks and
//! inactivity timers are paused.
//!
//! ### World and index (`world`, `quadtree`, `physics`)
//! Plain entity tables keyed by ids from `ids`, plus a pool-backed quadtree
//! over food used for pickups and bot views.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::external::{AllowAll, MemoryStatisticsSink, ProceduralDistributions};
//! use server::network::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(
//!         ServerConfig::default(),
//!         Arc::new(AllowAll),
//!         Arc::new(ProceduralDistributions),
//!         Arc::new(MemoryStatisticsSink::default()),
//!     )
//!     .await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod context;
pub mod delta;
pub mod engine;
pub mod error;
pub mod external;
pub mod game;
pub mod ids;
pub mod network;
pub mod outbox;
pub mod physics;
pub mod quadtree;
pub mod session;
pub mod standby;
pub mod world;

/// Bot name reserved for a local keep-alive client. It never wakes the
/// simulation from standby.
pub const PLACEHOLDER_NAME: &str = "dummy";
