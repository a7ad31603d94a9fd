//! Configuration system.
//!
//! Loads relay configuration from JSON strings/files. Every field has a
//! default so partial files work; binaries override fields from flags.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::entity::DEFAULT_SCENE;
use crate::map::DEFAULT_MAP_SIZE;
use crate::net::{FrameLayout, WireCodec};
use crate::scene::SceneDirectory;

/// Root configuration shared by client/server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Server listen address, e.g. `127.0.0.1:40001`.
    pub server_addr: String,
    /// Client tick rate.
    pub tick_hz: u32,
    /// Map edge length in tiles; coordinates travel offset by half of it.
    pub map_size: u16,
    /// Path to maps directory (`<scene>.map` files).
    pub maps_dir: String,
    /// Binary frame layout.
    pub layout: FrameLayout,
    /// Per-connection outbound queue depth. A full queue drops broadcasts.
    pub outbound_queue: usize,
    /// Scene Exit tiles lead to.
    pub home_scene: String,
    /// Other scenes linked from Channel tiles.
    pub scenes: Vec<String>,
    /// Canned lines per external identity, for generated chat.
    pub phrases: HashMap<String, Vec<String>>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40001".to_string(),
            tick_hz: 60,
            map_size: DEFAULT_MAP_SIZE,
            maps_dir: "maps".to_string(),
            layout: FrameLayout::Compact,
            outbound_queue: 64,
            home_scene: DEFAULT_SCENE.to_string(),
            scenes: Vec::new(),
            phrases: HashMap::new(),
        }
    }
}

impl RelayConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads a JSON config file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn map_half(&self) -> i32 {
        i32::from(self.map_size / 2)
    }

    pub fn codec(&self) -> WireCodec {
        WireCodec::new(self.map_size, self.layout)
    }

    pub fn scene_directory(&self) -> SceneDirectory {
        SceneDirectory::new(self.home_scene.clone(), self.scenes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = RelayConfig::from_json_str(
            r#"{ "map_size": 128, "layout": "legacy", "scenes": ["general"] }"#,
        )
        .unwrap();
        assert_eq!(cfg.map_size, 128);
        assert_eq!(cfg.map_half(), 64);
        assert_eq!(cfg.layout, FrameLayout::Legacy);
        assert_eq!(cfg.server_addr, "127.0.0.1:40001");
        assert_eq!(cfg.outbound_queue, 64);
        assert_eq!(cfg.codec().map_half(), 64);
        assert!(cfg.scene_directory().contains("general"));
        assert!(cfg.scene_directory().contains("spawn"));
    }

    #[test]
    fn unknown_layout_is_rejected() {
        assert!(RelayConfig::from_json_str(r#"{ "layout": "fancy" }"#).is_err());
    }
}
