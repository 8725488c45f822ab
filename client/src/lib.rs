//! # Voxel World Client Library
//!
//! Client side of the multiplayer voxel world. It connects to a server, keeps
//! a local mirror of the players and terrain the server reports, and sends
//! the player's input and voxel edits back.
//!
//! ## Architecture Overview
//!
//! ### Mirrored State
//! The server is authoritative for positions, terrain and who is connected.
//! The client keeps an entity table sized from the connect reply and a chunk
//! manager filled by the chunks it asks for. Snapshots overwrite the entities
//! they mention; everything else keeps its last known state.
//!
//! ### Optimistic Edits
//! A voxel edit shows up locally as soon as it is made. The server's
//! `VoxelUpdate` for the same position settles it, and an edit the server
//! never confirms is reverted after a timeout.
//!
//! ### Chunk Streaming
//! Every tick the client asks for the nearest missing chunks around the
//! player, a bounded number at a time, and never asks for the same chunk
//! twice in one session.
//!
//! ## Module Organization
//!
//! - `game`: the client mirror and edit predictions
//! - `input`: keys and look direction turned into input packets
//! - `network`: command handlers, connection state and the tick loop
//! - `config`: command line options
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::config::ClientConfig;
//! use client::network::Client;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::default();
//!     let mut client = Client::new(&config).await?;
//!     client.connect(config.connect_timeout()).await?;
//!
//!     client
//!         .run_until(tokio::time::sleep(Duration::from_secs(10)), |_, _, _| {})
//!         .await?;
//!     client.disconnect().await;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod game;
pub mod input;
pub mod network;

pub use error::ClientError;
