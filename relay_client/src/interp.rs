//! Interpolation.
//!
//! The relay sends discrete tile positions. The client renders at its own
//! rate and slides each entity from its settled tile toward the target, one
//! step per tick. Step length grows with the square root of the distance, so
//! long corrections close proportionally faster than single-tile moves.

use relay_shared::math::Vec2;

use crate::sync::{ClientSyncModel, DisplayEntity};

/// Step scale in tiles per tick, before the distance factor.
pub const BASE_SPEED: f32 = 0.2;

/// Convergence tolerance as a multiple of the step length.
pub const CONVERGENCE_SLACK: f32 = 1.1;

/// Advances displayed positions and chat countdowns.
#[derive(Debug, Clone, Copy)]
pub struct MovementInterpolator {
    base_speed: f32,
}

impl Default for MovementInterpolator {
    fn default() -> Self {
        Self::new(BASE_SPEED)
    }
}

impl MovementInterpolator {
    pub fn new(base_speed: f32) -> Self {
        Self { base_speed }
    }

    /// Step length for a move of `distance` tiles.
    pub fn step_size(&self, distance: f32) -> f32 {
        self.base_speed * distance.sqrt()
    }

    /// One tick for every entity in the model.
    pub fn tick(&self, model: &mut ClientSyncModel) {
        for entity in model.entities_mut() {
            self.advance(entity);
        }
    }

    /// One tick for one entity. Returns true when it came to rest this tick.
    pub fn advance(&self, entity: &mut DisplayEntity) -> bool {
        if entity.message_ticks > 0 {
            entity.message_ticks -= 1;
            if entity.message_ticks == 0 {
                entity.entity.message = None;
            }
        }

        if !entity.moving {
            return false;
        }

        let (dx, dy) = entity.delta;
        if dx == 0 && dy == 0 {
            settle(entity);
            return true;
        }

        let delta = Vec2::from_tiles(dx, dy);
        let distance = delta.len();
        let direction = delta.normalized();
        let step = self.step_size(distance);

        entity.offset += direction * step;
        let travelled = entity.offset.dot(direction);
        if distance - travelled < step * CONVERGENCE_SLACK {
            settle(entity);
            return true;
        }
        false
    }
}

fn settle(entity: &mut DisplayEntity) {
    let (x, y) = entity.target();
    entity.teleport(x, y);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use relay_shared::chat::MESSAGE_TTL_TICKS;
    use relay_shared::entity::{EntityId, RemoteEntity};

    fn at(x: i32, y: i32) -> DisplayEntity {
        DisplayEntity::new(RemoteEntity {
            x,
            y,
            ..RemoteEntity::spawned(EntityId(1))
        })
    }

    fn run_to_rest(interp: &MovementInterpolator, entity: &mut DisplayEntity) -> usize {
        let mut ticks = 0;
        while entity.moving {
            interp.advance(entity);
            ticks += 1;
            assert!(ticks < 10_000, "interpolation did not converge");
        }
        ticks
    }

    #[test]
    fn single_tile_move_takes_a_few_ticks() {
        let interp = MovementInterpolator::default();
        let mut e = at(0, 0);
        e.set_target(1, 0);

        assert!(!interp.advance(&mut e));
        assert!((e.offset.x - 0.2).abs() < 1e-6);
        assert!((e.displayed().x - 0.2).abs() < 1e-6);

        let ticks = run_to_rest(&interp, &mut e) + 1;
        assert_eq!(ticks, 4);
        assert_eq!(e.settled(), (1, 0));
        assert_eq!(e.offset, Vec2::ZERO);
    }

    #[test]
    fn longer_moves_take_longer_steps() {
        let interp = MovementInterpolator::default();
        assert!(interp.step_size(16.0) > interp.step_size(1.0) * 3.9);

        let mut near = at(0, 0);
        near.set_target(2, 0);
        let mut far = at(0, 0);
        far.set_target(32, 0);
        let near_ticks = run_to_rest(&interp, &mut near);
        let far_ticks = run_to_rest(&interp, &mut far);
        // Sixteen times the distance in far fewer than sixteen times the ticks.
        assert!(far_ticks < near_ticks * 8);
    }

    #[test]
    fn retarget_mid_move_keeps_offset() {
        let interp = MovementInterpolator::default();
        let mut e = at(0, 0);
        e.set_target(4, 0);
        interp.advance(&mut e);
        let offset = e.offset;

        e.set_target(4, 4);
        assert_eq!(e.offset, offset);
        assert_eq!(e.delta, (4, 4));
        run_to_rest(&interp, &mut e);
        assert_eq!(e.settled(), (4, 4));
    }

    #[test]
    fn zero_delta_settles_immediately() {
        let interp = MovementInterpolator::default();
        let mut e = at(3, 3);
        e.set_target(3, 3);
        assert!(interp.advance(&mut e));
        assert!(!e.moving);
        assert_eq!(e.settled(), (3, 3));
    }

    #[test]
    fn message_clears_after_countdown() {
        let interp = MovementInterpolator::default();
        let mut e = at(0, 0);
        e.show_message("hello".into());
        for _ in 0..MESSAGE_TTL_TICKS - 1 {
            interp.advance(&mut e);
        }
        assert_eq!(e.label(), "hello");
        interp.advance(&mut e);
        assert_eq!(e.label(), "Player #1");
    }

    proptest! {
        #[test]
        fn every_move_converges_exactly(
            sx in -32i32..32, sy in -32i32..32,
            dx in -64i32..=64, dy in -64i32..=64,
        ) {
            let interp = MovementInterpolator::default();
            let mut e = at(sx, sy);
            e.set_target(sx + dx, sy + dy);

            let mut ticks = 0;
            while e.moving {
                interp.advance(&mut e);
                ticks += 1;
                prop_assert!(ticks < 10_000);
            }
            prop_assert_eq!(e.offset, Vec2::ZERO);
            prop_assert_eq!(e.delta, (0, 0));
            prop_assert_eq!(e.settled(), (sx + dx, sy + dy));
            prop_assert_eq!(e.target(), e.settled());
        }
    }
}
