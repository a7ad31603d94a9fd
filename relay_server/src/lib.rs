//! `relay_server`
//!
//! Server-side systems:
//! - WebSocket accept loop
//! - Connection registry with the last known state of every entity
//! - Fan-out of deltas and roster snapshots
//! - Pluggable chat generation for linked identities
//!
//! Networking model:
//! - Text frames: full roster snapshots (server to client only)
//! - Binary frames: deltas in both directions

pub mod connection;
pub mod generate;
pub mod registry;
pub mod server;

pub use connection::{ConnectionState, RelayConnection};
pub use generate::{PhraseBook, Silent, TextGenerator};
pub use registry::{ConnectionId, ConnectionRegistry, IdentityClaim, IdentityId, Outbound};
pub use server::RelayServer;
