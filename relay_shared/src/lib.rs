//! `relay_shared`
//!
//! Shared libraries used by both the relay server and its clients.
//!
//! Design goals:
//! - One codec for both directions of the wire protocol.
//! - Explicit field-present patches instead of loosely shaped updates.
//! - Map data is decoded once and immutable afterwards.
//! - No `unsafe`.

pub mod chat;
pub mod config;
pub mod entity;
pub mod map;
pub mod math;
pub mod net;
pub mod scene;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::chat::*;
    pub use crate::config::*;
    pub use crate::entity::*;
    pub use crate::map::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::scene::*;
}
