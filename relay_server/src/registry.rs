//! Connection registry.
//!
//! The live roster of connections and their entities. Every mutation and the
//! broadcast it causes happen under a single lock acquisition, so peers never
//! see a snapshot taken halfway through a change. Sends never wait on a peer:
//! each connection owns a bounded queue, and a queue that is full or closed
//! simply misses the message. The entity's next update supersedes it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use relay_shared::{
    entity::{EntityId, RemoteEntity, Rgb},
    net::{Frame, WireCodec},
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, trace, warn};

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies one socket for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    pub fn new_unique() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// External identity linked to a connection, used to attribute chat.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdentityId(pub String);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the identity bridge supplies when a player proves who they are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityClaim {
    pub identity: IdentityId,
    pub display_name: String,
    pub color: Rgb,
}

/// A message queued for one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Full roster snapshot, sent as a text frame.
    Roster(String),
    /// Encoded delta, sent as a binary frame.
    Delta(Bytes),
}

struct ConnectionRecord {
    outbound: mpsc::Sender<Outbound>,
    entity: Option<RemoteEntity>,
    identity: Option<IdentityId>,
}

#[derive(Default)]
struct Roster {
    records: BTreeMap<ConnectionId, ConnectionRecord>,
}

impl Roster {
    fn entities(&self) -> Vec<RemoteEntity> {
        self.records
            .values()
            .filter_map(|r| r.entity.clone())
            .collect()
    }

    fn holder_of(&self, id: EntityId) -> Option<ConnectionId> {
        self.records
            .iter()
            .find(|(_, r)| r.entity.as_ref().is_some_and(|e| e.id == id))
            .map(|(conn, _)| *conn)
    }

    /// Queues `msg` on every connection except `skip`. Returns how many
    /// queues accepted it.
    fn fan_out(&self, msg: &Outbound, skip: Option<ConnectionId>) -> usize {
        let mut delivered = 0;
        for (conn, record) in &self.records {
            if Some(*conn) == skip {
                continue;
            }
            match record.outbound.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => trace!(conn = ?conn, error = %e, "Skipping unsendable connection"),
            }
        }
        delivered
    }

    fn broadcast_roster(&self, codec: &WireCodec) -> usize {
        match codec.encode_roster(&self.entities()) {
            Ok(json) => self.fan_out(&Outbound::Roster(json), None),
            Err(e) => {
                error!(error = %e, "Failed to serialize roster");
                0
            }
        }
    }
}

/// Shared registry of live connections. Construct one per server and hand
/// it to every connection handler.
pub struct ConnectionRegistry {
    codec: WireCodec,
    roster: Mutex<Roster>,
}

impl ConnectionRegistry {
    pub fn new(codec: WireCodec) -> Self {
        Self {
            codec,
            roster: Mutex::new(Roster::default()),
        }
    }

    pub fn codec(&self) -> WireCodec {
        self.codec
    }

    /// Adds a connection that has not identified yet. It receives roster
    /// snapshots from now on.
    pub async fn register(&self, conn: ConnectionId, outbound: mpsc::Sender<Outbound>) {
        let mut roster = self.roster.lock().await;
        roster.records.insert(
            conn,
            ConnectionRecord {
                outbound,
                entity: None,
                identity: None,
            },
        );
        debug!(conn = ?conn, "Connection registered");
    }

    /// Creates the entity for `conn` and sends the full roster to everyone.
    ///
    /// Refused when the connection is unknown, already identified, or `id`
    /// belongs to another live connection.
    pub async fn identify(&self, conn: ConnectionId, id: EntityId) -> bool {
        let mut roster = self.roster.lock().await;
        if let Some(holder) = roster.holder_of(id) {
            warn!(conn = ?conn, holder = ?holder, entity = %id, "Entity id already in use");
            return false;
        }
        let Some(record) = roster.records.get_mut(&conn) else {
            return false;
        };
        if record.entity.is_some() {
            return false;
        }
        record.entity = Some(RemoteEntity::spawned(id));

        let delivered = roster.broadcast_roster(&self.codec);
        info!(conn = ?conn, entity = %id, delivered, "Entity joined");
        true
    }

    /// Applies `frame` to the entity of `conn` and relays it to every other
    /// connection. Chat text is relayed but not stored. The frame is attributed to the connection's own entity
    /// whatever id it carries.
    pub async fn apply(&self, conn: ConnectionId, frame: &Frame) -> bool {
        let patch = frame.patch();
        if patch.is_empty() {
            return false;
        }

        let mut roster = self.roster.lock().await;
        let Some(entity) = roster
            .records
            .get_mut(&conn)
            .and_then(|r| r.entity.as_mut())
        else {
            return false;
        };

        let delta = match self.codec.encode(&frame.clone().with_id(entity.id)) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(conn = ?conn, error = %e, "Dropping unencodable update");
                return false;
            }
        };
        patch.apply_to(entity);
        // Chat lines are relayed, never kept for later snapshots.
        entity.message = None;

        let delivered = roster.fan_out(&Outbound::Delta(delta), Some(conn));
        trace!(conn = ?conn, kind = ?frame.kind(), delivered, "Delta relayed");
        true
    }

    /// Identity bridge: renames and recolours entity `id`, links the external
    /// identity for chat attribution, and tells every connection, the claimed
    /// one included.
    pub async fn link_identity(&self, id: EntityId, claim: IdentityClaim) -> bool {
        let mut roster = self.roster.lock().await;
        let Some(conn) = roster.holder_of(id) else {
            return false;
        };

        let frame = Frame::Identity {
            id,
            color: claim.color,
            display_name: claim.display_name,
        };
        let delta = match self.codec.encode(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(entity = %id, error = %e, "Identity claim does not fit a frame");
                return false;
            }
        };

        if let Some(record) = roster.records.get_mut(&conn) {
            if let Some(entity) = record.entity.as_mut() {
                frame.patch().apply_to(entity);
            }
            info!(conn = ?conn, entity = %id, identity = %claim.identity, "Identity linked");
            record.identity = Some(claim.identity);
        }

        roster.fan_out(&Outbound::Delta(delta), None);
        true
    }

    pub async fn identity_of(&self, conn: ConnectionId) -> Option<IdentityId> {
        let roster = self.roster.lock().await;
        roster.records.get(&conn).and_then(|r| r.identity.clone())
    }

    pub async fn entity_of(&self, conn: ConnectionId) -> Option<RemoteEntity> {
        let roster = self.roster.lock().await;
        roster.records.get(&conn).and_then(|r| r.entity.clone())
    }

    /// Entities of all identified connections.
    pub async fn roster(&self) -> Vec<RemoteEntity> {
        self.roster.lock().await.entities()
    }

    pub async fn connection_count(&self) -> usize {
        self.roster.lock().await.records.len()
    }

    /// Drops `conn`. When it had an entity the full roster goes out again, so
    /// everyone learns about the departure.
    pub async fn remove(&self, conn: ConnectionId) -> Option<RemoteEntity> {
        let mut roster = self.roster.lock().await;
        let record = roster.records.remove(&conn)?;
        let entity = record.entity?;

        let delivered = roster.broadcast_roster(&self.codec);
        info!(conn = ?conn, entity = %entity.id, delivered, "Entity left");
        Some(entity)
    }
}
