//! Input handling.
//!
//! Keyboard capture lives outside this crate. Callers hand in a direction
//! or a tile displacement and get back the `Move` frame to send, if the step
//! is allowed.

use relay_shared::{
    map::SparseMap,
    net::Frame,
};
use tracing::trace;

use crate::sync::ClientSyncModel;

/// One-tile step direction. Rows grow downward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" | "w" => Some(Direction::Up),
            "down" | "s" => Some(Direction::Down),
            "left" | "a" => Some(Direction::Left),
            "right" | "d" => Some(Direction::Right),
            _ => None,
        }
    }
}

/// Starts moving the local entity by `(dx, dy)` tiles.
///
/// Refused while the entity is unplaced or still moving, and when the
/// destination is Void, Wall, or taken by another visible entity.
pub fn try_step(model: &mut ClientSyncModel, map: &SparseMap, dx: i32, dy: i32) -> Option<Frame> {
    let local = model.local()?;
    if !local.has_position() || local.moving {
        return None;
    }

    let (x, y) = local.settled();
    let (tx, ty) = (x + dx, y + dy);
    let tile = map.tile_at(tx, ty);
    if !tile.is_walkable() {
        trace!(x = tx, y = ty, ?tile, "Step blocked by tile");
        return None;
    }
    let local_id = model.local_id();
    if let Some(other) = model.entity_at(tx, ty).filter(|e| e.id() != local_id) {
        trace!(x = tx, y = ty, entity = %other.id(), "Step blocked by entity");
        return None;
    }

    let local = model.local_mut()?;
    local.set_target(tx, ty);
    Some(Frame::Move {
        id: local_id,
        x: tx,
        y: ty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Facing;
    use relay_shared::entity::{EntityId, RemoteEntity};

    fn map() -> SparseMap {
        // Tile coordinates run -2..2 on both axes.
        #[rustfmt::skip]
        let grid = [
            1, 1, 1, 1,
            1, 2, 1, 0,
            1, 1, 3, 1,
            1, 1, 1, 1,
        ];
        SparseMap::author(4, &grid).unwrap()
    }

    fn model() -> ClientSyncModel {
        let mut model = ClientSyncModel::new(EntityId(1), "spawn");
        model.apply_snapshot(vec![
            RemoteEntity {
                x: 0,
                y: 0,
                ..RemoteEntity::spawned(EntityId(1))
            },
            RemoteEntity {
                x: 0,
                y: 1,
                ..RemoteEntity::spawned(EntityId(2))
            },
        ]);
        model
    }

    #[test]
    fn walkable_step_starts_moving() {
        let mut model = model();
        let (dx, dy) = Direction::Left.delta();
        let frame = try_step(&mut model, &map(), dx, dy);
        assert_eq!(
            frame,
            Some(Frame::Move {
                id: EntityId(1),
                x: -1,
                y: 0
            })
        );
        let local = model.local().unwrap();
        assert!(local.moving);
        assert_eq!(local.facing, Facing::Left);

        // Still moving: a second step is refused.
        assert_eq!(try_step(&mut model, &map(), 0, -1), None);
    }

    #[test]
    fn walls_void_and_entities_block() {
        let mut model = model();
        let map = map();
        assert_eq!(map.tile_at(-1, -1).id(), 2);
        assert_eq!(try_step(&mut model, &map, -1, -1), None);
        assert_eq!(try_step(&mut model, &map, 1, -1), None);
        assert_eq!(try_step(&mut model, &map, 0, 1), None);
        assert_eq!(try_step(&mut model, &map, 0, -5), None);
        assert!(!model.local().unwrap().moving);
    }

    #[test]
    fn unplaced_entity_cannot_step() {
        let mut model = ClientSyncModel::new(EntityId(1), "spawn");
        model.apply_snapshot(vec![RemoteEntity::spawned(EntityId(1))]);
        assert_eq!(try_step(&mut model, &map(), 1, 0), None);
        assert_eq!(Direction::parse("w"), Some(Direction::Up));
        assert_eq!(Direction::parse("jump"), None);
    }
}
