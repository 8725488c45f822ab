//! # Voxel World Server Library
//!
//! Authoritative server for the multiplayer voxel world. It owns the canonical
//! player entities, the voxel terrain and the connection lifecycle, and keeps
//! every connected client in sync through the shared command protocol.
//!
//! ## Core Responsibilities
//!
//! ### Session Slots
//! A fixed table of connection slots, each permanently paired with one
//! entity. Connects take the first free slot, duplicate connects are ignored,
//! disconnects and timeouts release the slot for the next player.
//!
//! ### Authoritative Simulation
//! Player positions are simulated here from the movement keys clients report.
//! Look direction is taken from the client as reported.
//!
//! ### World Synchronization
//! Chunks are generated on demand from a seed and sent in full when a client
//! asks for them. Voxel edits are validated, applied and broadcast to everyone
//! on the reliable channel.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Tick
//! Socket I/O runs in background tasks that only move datagrams. Each tick
//! drains a bounded number of them, dispatches the commands they carry,
//! advances the simulation and queues the outgoing updates, all within one
//! synchronous call on the server state.
//!
//! ## Module Organization
//!
//! - `client_manager`: the session slot table
//! - `game`: entity arena and tick counter
//! - `world`: terrain generation, world bounds and edit validation
//! - `host`: command handlers and transport event reactions
//! - `network`: socket setup and the tick loop
//! - `config`: command line options
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
//!         port: 8080,
//!         max_connections: 32,
//!         ..ServerConfig::default()
//!     };
//!
//!     // Runs the tick loop until Ctrl+C.
//!     let mut server = Server::new(&config).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod error;
pub mod game;
pub mod host;
pub mod network;
pub mod world;

pub use error::ServerError;
