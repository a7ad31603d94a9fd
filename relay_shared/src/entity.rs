//! Entity data model shared by the relay and its clients.
//!
//! A [`RemoteEntity`] is the replicated state of one player avatar. Updates
//! travel as [`EntityPatch`] values so only the fields a delta actually
//! carries are touched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Scene every entity starts in.
pub const DEFAULT_SCENE: &str = "spawn";

/// Position meaning "no known spawn yet"; the owning client must supply one.
pub const SPAWN_SENTINEL: (i32, i32) = (1000, 1000);

/// Identifies a player entity. Chosen by the client and sent in `Load`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntityId(pub u16);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 24-bit colour. Serialized as `"#rrggbb"` in JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const DEFAULT: Rgb = Rgb::new(0x33, 0x33, 0x33);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Colour from a packed `0xRRGGBB` value (upper byte ignored).
    pub const fn from_packed(value: u32) -> Self {
        Self::new((value >> 16) as u8, (value >> 8) as u8, value as u8)
    }

    pub const fn packed(self) -> u32 {
        (self.r as u32) << 16 | (self.g as u32) << 8 | self.b as u32
    }
}

impl Default for Rgb {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Error type for colour parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid colour {0:?}, expected #rrggbb")]
pub struct ColorParseError(pub String);

impl FromStr for Rgb {
    type Err = ColorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ColorParseError(s.to_string()));
        }
        u32::from_str_radix(hex, 16)
            .map(Rgb::from_packed)
            .map_err(|_| ColorParseError(s.to_string()))
    }
}

impl TryFrom<String> for Rgb {
    type Error = ColorParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rgb> for String {
    fn from(value: Rgb) -> Self {
        value.to_string()
    }
}

/// Replicated state of one player avatar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntity {
    pub id: EntityId,
    pub display_name: String,
    pub color: Rgb,
    pub scene: String,
    pub x: i32,
    pub y: i32,
    /// Last chat line, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RemoteEntity {
    /// Entity as synthesized by the relay on `Load`.
    pub fn spawned(id: EntityId) -> Self {
        Self {
            id,
            display_name: default_display_name(id),
            color: Rgb::DEFAULT,
            scene: DEFAULT_SCENE.to_string(),
            x: SPAWN_SENTINEL.0,
            y: SPAWN_SENTINEL.1,
            message: None,
        }
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    /// True while the entity still sits on the spawn sentinel.
    pub fn awaiting_spawn(&self) -> bool {
        self.position() == SPAWN_SENTINEL
    }
}

/// Name given to an entity before any identity is claimed.
pub fn default_display_name(id: EntityId) -> String {
    format!("Player #{}", id.0)
}

/// Partial update of a [`RemoteEntity`]. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityPatch {
    pub position: Option<(i32, i32)>,
    pub scene: Option<String>,
    pub message: Option<String>,
    pub display_name: Option<String>,
    pub color: Option<Rgb>,
}

impl EntityPatch {
    pub fn is_empty(&self) -> bool {
        self.position.is_none()
            && self.scene.is_none()
            && self.message.is_none()
            && self.display_name.is_none()
            && self.color.is_none()
    }

    /// Writes every present field into `entity`.
    pub fn apply_to(&self, entity: &mut RemoteEntity) {
        if let Some((x, y)) = self.position {
            entity.x = x;
            entity.y = y;
        }
        if let Some(scene) = &self.scene {
            entity.scene = scene.clone();
        }
        if let Some(message) = &self.message {
            entity.message = Some(message.clone());
        }
        if let Some(name) = &self.display_name {
            entity.display_name = name.clone();
        }
        if let Some(color) = self.color {
            entity.color = color;
        }
    }
}
