//! `relay_client`
//!
//! Client-side systems:
//! - WebSocket connection to the relay (reader and writer tasks)
//! - Roster mirror fed by snapshots and deltas
//! - Interpolation of remote and local entities between tiles
//! - Local movement intent checked against the scene map
//! - Scene travel through Channel links and Exit tiles

pub mod client;
pub mod input;
pub mod interp;
pub mod sync;

pub use client::GameClient;
pub use sync::{ClientSyncModel, DisplayEntity, SyncEvent};
