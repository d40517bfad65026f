//! # Arena Client Library
//!
//! Reference clients for the arena server. All of them speak the framed TCP
//! protocol from the `shared` crate and differ only in the role they announce
//! in the handshake.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! Connection handling for every role:
//! - Handshake and length prefixed framing
//! - Bot registration, state reception and command sending
//! - Observer delta decompression
//! - Operator command and reply exchange
//!
//! ### Strategy Module (`strategy`)
//! Turns a bot's view of the world into one steering command per tick.
//!
//! ### Game Module (`game`)
//! Observer-side mirror of the arena rebuilt from deltas, with a leaderboard.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::BotClient;
//! use client::strategy::Strategy;
//! use shared::{Color, Registration, FIELD_SIZE};
//!
//! # async fn play() -> Result<(), client::network::ClientError> {
//! let registration = Registration {
//!     name: "rustbot".to_string(),
//!     color: Color::new(40, 160, 220),
//!     image: String::new(),
//! };
//! let bot = BotClient::register("127.0.0.1:5000", registration, Strategy::new(FIELD_SIZE)).await?;
//! let summary = bot.run(Some(1000)).await?;
//! println!("peak mass {}", summary.peak_mass);
//! # Ok(())
//! # }
//! ```

pub mod game;
pub mod network;
pub mod strategy;
