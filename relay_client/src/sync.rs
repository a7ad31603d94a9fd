//! Client-side roster mirror.
//!
//! Roster snapshots are the only way entities appear or disappear. Deltas
//! only touch entities the model already knows. The local entity is driven
//! by the player: inbound positions about it are ignored.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use relay_shared::{
    chat::MESSAGE_TTL_TICKS,
    entity::{EntityId, RemoteEntity, SPAWN_SENTINEL},
    math::Vec2,
    net::{Frame, Inbound},
};
use tracing::{debug, trace};

/// Direction an entity sprite faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Facing {
    Up,
    #[default]
    Down,
    Left,
    Right,
}

impl Facing {
    /// Facing for a displacement. Horizontal movement wins over vertical.
    pub fn from_delta(dx: i32, dy: i32) -> Option<Self> {
        let mut facing = None;
        if dy < 0 {
            facing = Some(Facing::Up);
        } else if dy > 0 {
            facing = Some(Facing::Down);
        }
        if dx < 0 {
            facing = Some(Facing::Left);
        } else if dx > 0 {
            facing = Some(Facing::Right);
        }
        facing
    }
}

/// A roster entity plus what the client needs to draw it between tiles.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayEntity {
    pub entity: RemoteEntity,
    /// Sub-tile offset from the settled tile toward the target.
    pub offset: Vec2,
    /// Target tile minus settled tile.
    pub delta: (i32, i32),
    pub moving: bool,
    pub facing: Facing,
    /// Ticks until the chat line is cleared.
    pub message_ticks: u32,
}

impl DisplayEntity {
    pub fn new(entity: RemoteEntity) -> Self {
        let message_ticks = if entity.message.is_some() {
            MESSAGE_TTL_TICKS
        } else {
            0
        };
        Self {
            entity,
            offset: Vec2::ZERO,
            delta: (0, 0),
            moving: false,
            facing: Facing::default(),
            message_ticks,
        }
    }

    pub fn id(&self) -> EntityId {
        self.entity.id
    }

    /// Last tile the entity came to rest on.
    pub fn settled(&self) -> (i32, i32) {
        self.entity.position()
    }

    /// Tile the entity is heading to; the settled tile when idle.
    pub fn target(&self) -> (i32, i32) {
        let (x, y) = self.settled();
        (x + self.delta.0, y + self.delta.1)
    }

    /// Position to draw at, in fractional tiles.
    pub fn displayed(&self) -> Vec2 {
        let (x, y) = self.settled();
        Vec2::from_tiles(x, y) + self.offset
    }

    pub fn has_position(&self) -> bool {
        !self.entity.awaiting_spawn()
    }

    /// Text drawn above the entity: the current chat line, else the name.
    pub fn label(&self) -> &str {
        self.entity
            .message
            .as_deref()
            .unwrap_or(&self.entity.display_name)
    }

    /// Starts moving toward `(x, y)`. An in-flight offset is kept and the
    /// delta is measured from the settled tile.
    pub fn set_target(&mut self, x: i32, y: i32) {
        let (sx, sy) = self.settled();
        self.delta = (x - sx, y - sy);
        if let Some(facing) = Facing::from_delta(self.delta.0, self.delta.1) {
            self.facing = facing;
        }
        self.moving = true;
    }

    /// Puts the entity on `(x, y)` at rest.
    pub fn teleport(&mut self, x: i32, y: i32) {
        self.entity.x = x;
        self.entity.y = y;
        self.offset = Vec2::ZERO;
        self.delta = (0, 0);
        self.moving = false;
    }

    pub fn show_message(&mut self, text: String) {
        self.entity.message = Some(text);
        self.message_ticks = MESSAGE_TTL_TICKS;
    }
}

/// Change the caller has to react to after applying inbound state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    Joined(EntityId),
    Left(EntityId),
    /// The local entity has no position in its scene; pick a spawn tile.
    LocalPlacementRequired,
}

/// Local mirror of the relay's roster.
#[derive(Debug, Clone)]
pub struct ClientSyncModel {
    entities: BTreeMap<EntityId, DisplayEntity>,
    local: EntityId,
    scene: String,
}

impl ClientSyncModel {
    pub fn new(local: EntityId, scene: impl Into<String>) -> Self {
        Self {
            entities: BTreeMap::new(),
            local,
            scene: scene.into(),
        }
    }

    pub fn local_id(&self) -> EntityId {
        self.local
    }

    /// Scene the local player is in.
    pub fn scene(&self) -> &str {
        &self.scene
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: EntityId) -> Option<&DisplayEntity> {
        self.entities.get(&id)
    }

    pub fn local(&self) -> Option<&DisplayEntity> {
        self.entities.get(&self.local)
    }

    pub fn local_mut(&mut self) -> Option<&mut DisplayEntity> {
        self.entities.get_mut(&self.local)
    }

    pub fn entities_mut(&mut self) -> impl Iterator<Item = &mut DisplayEntity> {
        self.entities.values_mut()
    }

    pub fn apply(&mut self, inbound: Inbound) -> Vec<SyncEvent> {
        match inbound {
            Inbound::Roster(clients) => self.apply_snapshot(clients),
            Inbound::Delta(frame) => self.apply_delta(frame).into_iter().collect(),
        }
    }

    /// Reconciles membership with a full roster. Entities already known keep
    /// their display state.
    pub fn apply_snapshot(&mut self, clients: Vec<RemoteEntity>) -> Vec<SyncEvent> {
        let mut events = Vec::new();

        let present: Vec<EntityId> = clients.iter().map(|c| c.id).collect();
        self.entities.retain(|id, _| {
            let keep = present.contains(id);
            if !keep {
                events.push(SyncEvent::Left(*id));
            }
            keep
        });

        for client in clients {
            if self.entities.contains_key(&client.id) {
                continue;
            }
            let id = client.id;
            let mut entity = DisplayEntity::new(client);
            if id == self.local {
                entity.entity.scene = self.scene.clone();
                if entity.has_position() {
                    debug!(entity = %id, "Local entity restored from roster");
                } else {
                    events.push(SyncEvent::LocalPlacementRequired);
                }
            }
            self.entities.insert(id, entity);
            events.push(SyncEvent::Joined(id));
        }

        events
    }

    /// Applies one delta. Unknown ids are ignored.
    pub fn apply_delta(&mut self, frame: Frame) -> Option<SyncEvent> {
        let id = frame.id();
        let is_local = id == self.local;
        let Some(display) = self.entities.get_mut(&id) else {
            trace!(entity = %id, kind = ?frame.kind(), "Delta for unknown entity");
            return None;
        };

        let patch = frame.patch();
        if let Some(name) = patch.display_name {
            display.entity.display_name = name;
        }
        if let Some(color) = patch.color {
            display.entity.color = color;
        }
        if let Some(message) = patch.message {
            display.show_message(message);
        }

        if is_local {
            if let Some(scene) = patch.scene {
                display.entity.scene = scene.clone();
                display.teleport(SPAWN_SENTINEL.0, SPAWN_SENTINEL.1);
                self.scene = scene;
                return Some(SyncEvent::LocalPlacementRequired);
            }
            return None;
        }

        if let Some(scene) = patch.scene {
            // Position in the new scene is unknown until its first Move.
            display.entity.scene = scene;
            display.teleport(SPAWN_SENTINEL.0, SPAWN_SENTINEL.1);
        }
        if let Some((x, y)) = patch.position {
            if display.has_position() {
                display.set_target(x, y);
            } else {
                display.teleport(x, y);
            }
        }
        None
    }

    /// Entities to draw, in draw order: by row, then right to left.
    pub fn visible(&self) -> Vec<&DisplayEntity> {
        let mut out: Vec<&DisplayEntity> = self
            .entities
            .values()
            .filter(|e| e.entity.scene == self.scene && e.has_position())
            .collect();
        out.sort_by_key(|e| {
            let (x, y) = e.settled();
            (y, Reverse(x), e.id())
        });
        out
    }

    /// Visible entity standing on, or heading to, `(x, y)`.
    pub fn entity_at(&self, x: i32, y: i32) -> Option<&DisplayEntity> {
        self.visible()
            .into_iter()
            .find(|e| e.settled() == (x, y) || e.target() == (x, y))
    }

    /// Puts the local entity on `(x, y)` in the current scene.
    pub fn place_local(&mut self, x: i32, y: i32) -> bool {
        let scene = self.scene.clone();
        match self.local_mut() {
            Some(local) => {
                local.entity.scene = scene;
                local.teleport(x, y);
                true
            }
            None => false,
        }
    }

    /// Moves the local player to `scene`. The local entity loses its
    /// position until placed again.
    pub fn set_scene(&mut self, scene: impl Into<String>) {
        self.scene = scene.into();
        let scene = self.scene.clone();
        if let Some(local) = self.local_mut() {
            local.entity.scene = scene;
            local.teleport(SPAWN_SENTINEL.0, SPAWN_SENTINEL.1);
        }
    }
}
