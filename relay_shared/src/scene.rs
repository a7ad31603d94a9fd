//! Scene directory.
//!
//! Scenes are named rooms, each backed by its own map. The directory comes
//! from configuration; the relay only echoes scene names, it never checks
//! them. Clients place one link per known scene on the map's Channel tiles
//! and send the player home through Exit tiles.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::entity::DEFAULT_SCENE;
use crate::map::{SparseMap, Tile};

/// A scene name placed on a Channel tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneLink {
    pub scene: String,
    pub x: i32,
    pub y: i32,
}

/// Known scenes and the scene Exit tiles lead back to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneDirectory {
    pub home: String,
    pub scenes: Vec<String>,
}

impl Default for SceneDirectory {
    fn default() -> Self {
        Self {
            home: DEFAULT_SCENE.to_string(),
            scenes: Vec::new(),
        }
    }
}

impl SceneDirectory {
    pub fn new(home: impl Into<String>, scenes: Vec<String>) -> Self {
        Self {
            home: home.into(),
            scenes,
        }
    }

    pub fn contains(&self, scene: &str) -> bool {
        scene == self.home || self.scenes.iter().any(|s| s == scene)
    }

    /// Assigns scenes to randomly chosen Channel tiles of `map`. Scenes beyond
    /// the number of Channel tiles stay unplaced; `current` is never linked to
    /// itself.
    pub fn place_links<R: Rng + ?Sized>(
        &self,
        map: &SparseMap,
        current: &str,
        rng: &mut R,
    ) -> Vec<SceneLink> {
        let mut slots: Vec<(i32, i32)> = map
            .cells(Tile::Channel)
            .iter()
            .map(|&i| map.coordinates_of(i))
            .collect();
        slots.shuffle(rng);

        self.scenes
            .iter()
            .filter(|s| s.as_str() != current)
            .zip(slots)
            .map(|(scene, (x, y))| SceneLink {
                scene: scene.clone(),
                x,
                y,
            })
            .collect()
    }
}

/// Link standing at a tile, if any.
pub fn link_at(links: &[SceneLink], x: i32, y: i32) -> Option<&SceneLink> {
    links.iter().find(|l| l.x == x && l.y == y)
}
