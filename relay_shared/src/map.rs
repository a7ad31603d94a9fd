//! Sparse tile maps.
//!
//! A map is a square grid of `size × size` cells. On disk it is stored as, per
//! tile type, the list of cell indices (`y * size + x`) holding that type:
//!
//! ```text
//! [0]              u8            N, number of tile types present
//! [1..1+N)         u8 × N        tile type ids, ascending
//! [1+N..1+3N)      u16le × N     index count per type, same order
//! [1+3N..)         u16le × Σ     indices grouped by type in header order;
//!                                within a type grouped by row, each row in
//!                                descending column order
//! ```
//!
//! Maps are produced once by an authoring tool and loaded at startup. Any
//! inconsistency in the buffer is fatal at load time.
//!
//! # Usage
//! ```ignore
//! let map = SparseMap::load("maps/spawn.map", 64)?;
//! let spawn = map.random_spawn(&mut rand::thread_rng());
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::seq::SliceRandom;
use rand::Rng;

/// Default map edge length in tiles.
pub const DEFAULT_MAP_SIZE: u16 = 64;

/// Largest edge length whose cell indices still fit in a `u16`.
pub const MAX_MAP_SIZE: u16 = 256;

/// Known tile types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Tile {
    Void = 0,
    Ground = 1,
    Wall = 2,
    Spawn = 3,
    Channel = 4,
    Exit = 5,
}

impl Tile {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Tile::Void),
            1 => Some(Tile::Ground),
            2 => Some(Tile::Wall),
            3 => Some(Tile::Spawn),
            4 => Some(Tile::Channel),
            5 => Some(Tile::Exit),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    /// Whether an entity may stand on this tile.
    pub fn is_walkable(self) -> bool {
        !matches!(self, Tile::Void | Tile::Wall)
    }
}

/// Map decoding and authoring errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("map size {0} must be even and between 2 and 256")]
    InvalidSize(u16),
    #[error("map truncated in {section}: needed {needed} bytes, had {available}")]
    Truncated {
        section: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("tile ids not ascending: {tile} follows {previous}")]
    UnsortedTiles { previous: u8, tile: u8 },
    #[error("tile {tile} declares {declared} indices but only {available} remain")]
    CountExceedsBuffer {
        tile: u8,
        declared: u16,
        available: usize,
    },
    #[error("tile {tile} index {index} outside a {cells}-cell map")]
    IndexOutOfRange { tile: u8, index: u16, cells: usize },
    #[error("tile {tile} lists index {index} twice")]
    DuplicateIndex { tile: u8, index: u16 },
    #[error("{0} trailing bytes after map data")]
    TrailingBytes(usize),
    #[error("grid has {actual} cells, expected {expected}")]
    GridSize { expected: usize, actual: usize },
    #[error("tile {tile} covers {count} cells, more than a count field holds")]
    TooManyCells { tile: u8, count: usize },
    #[error("{0} tile types present, more than a header holds")]
    TooManyTileTypes(usize),
}

/// All cells of one tile type, in stored order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileLayer {
    pub tile: u8,
    pub cells: Vec<u16>,
}

/// Immutable decoded map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseMap {
    size: u16,
    layers: Vec<TileLayer>,
    grid: Vec<u8>,
}

fn check_size(size: u16) -> Result<(), MapError> {
    if size < 2 || size > MAX_MAP_SIZE || size % 2 != 0 {
        return Err(MapError::InvalidSize(size));
    }
    Ok(())
}

fn need(buf: &[u8], section: &'static str, needed: usize) -> Result<(), MapError> {
    if buf.remaining() < needed {
        return Err(MapError::Truncated {
            section,
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

impl SparseMap {
    fn from_layers(size: u16, layers: Vec<TileLayer>) -> Self {
        let cells = usize::from(size) * usize::from(size);
        let mut grid = vec![Tile::Void.id(); cells];
        for layer in &layers {
            for &index in &layer.cells {
                grid[usize::from(index)] = layer.tile;
            }
        }
        Self { size, layers, grid }
    }

    /// Decodes a map buffer. Each type consumes exactly its declared count.
    pub fn decode(buf: &[u8], size: u16) -> Result<Self, MapError> {
        check_size(size)?;
        let cells = usize::from(size) * usize::from(size);
        let mut r = buf;

        need(r, "tile count", 1)?;
        let n = usize::from(r.get_u8());

        need(r, "tile ids", n)?;
        let tiles = r[..n].to_vec();
        r.advance(n);
        for pair in tiles.windows(2) {
            if pair[0] >= pair[1] {
                return Err(MapError::UnsortedTiles {
                    previous: pair[0],
                    tile: pair[1],
                });
            }
        }

        need(r, "index counts", n * 2)?;
        let counts: Vec<u16> = (0..n).map(|_| r.get_u16_le()).collect();

        let mut layers = Vec::with_capacity(n);
        for (&tile, &declared) in tiles.iter().zip(&counts) {
            let available = r.remaining() / 2;
            if usize::from(declared) > available {
                return Err(MapError::CountExceedsBuffer {
                    tile,
                    declared,
                    available,
                });
            }

            let mut seen = HashSet::with_capacity(usize::from(declared));
            let mut layer = Vec::with_capacity(usize::from(declared));
            for _ in 0..declared {
                let index = r.get_u16_le();
                if usize::from(index) >= cells {
                    return Err(MapError::IndexOutOfRange { tile, index, cells });
                }
                if !seen.insert(index) {
                    return Err(MapError::DuplicateIndex { tile, index });
                }
                layer.push(index);
            }
            layers.push(TileLayer { tile, cells: layer });
        }

        if r.has_remaining() {
            return Err(MapError::TrailingBytes(r.remaining()));
        }
        Ok(Self::from_layers(size, layers))
    }

    /// Encodes the map back into its on-disk form, preserving stored order.
    pub fn encode(&self) -> Bytes {
        let total: usize = self.layers.iter().map(|l| l.cells.len()).sum();
        let mut buf = BytesMut::with_capacity(1 + self.layers.len() * 3 + total * 2);
        // Layer and cell counts are bounded by `decode`/`author`.
        buf.put_u8(self.layers.len() as u8);
        for layer in &self.layers {
            buf.put_u8(layer.tile);
        }
        for layer in &self.layers {
            buf.put_u16_le(layer.cells.len() as u16);
        }
        for layer in &self.layers {
            for &index in &layer.cells {
                buf.put_u16_le(index);
            }
        }
        buf.freeze()
    }

    /// Builds a map from a dense row-major grid of tile ids, ordering cells
    /// the way the authoring tool stores them. Void cells are omitted.
    pub fn author(size: u16, grid: &[u8]) -> Result<Self, MapError> {
        check_size(size)?;
        let expected = usize::from(size) * usize::from(size);
        if grid.len() != expected {
            return Err(MapError::GridSize {
                expected,
                actual: grid.len(),
            });
        }

        let mut by_tile: BTreeMap<u8, Vec<u16>> = BTreeMap::new();
        for (index, &tile) in grid.iter().enumerate() {
            if tile == Tile::Void.id() {
                continue;
            }
            // `expected` is at most 65536, so every index fits.
            by_tile.entry(tile).or_default().push(index as u16);
        }
        if by_tile.len() > usize::from(u8::MAX) {
            return Err(MapError::TooManyTileTypes(by_tile.len()));
        }

        let mut layers = Vec::with_capacity(by_tile.len());
        for (tile, indices) in by_tile {
            if indices.len() > usize::from(u16::MAX) {
                return Err(MapError::TooManyCells {
                    tile,
                    count: indices.len(),
                });
            }
            let mut cells = Vec::with_capacity(indices.len());
            for row in indices.chunk_by(|a, b| a / size == b / size) {
                cells.extend(row.iter().rev());
            }
            layers.push(TileLayer { tile, cells });
        }
        Ok(Self::from_layers(size, layers))
    }

    /// Reads and decodes a map file.
    pub fn load<P: AsRef<Path>>(path: P, size: u16) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).with_context(|| format!("read map {}", path.display()))?;
        let map = Self::decode(&data, size).with_context(|| format!("decode map {}", path.display()))?;
        tracing::debug!(
            path = %path.display(),
            tiles = map.layers.len(),
            "Map decoded"
        );
        Ok(map)
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn half(&self) -> i32 {
        i32::from(self.size / 2)
    }

    pub fn layers(&self) -> &[TileLayer] {
        &self.layers
    }

    /// Cells holding `tile`, in stored order.
    pub fn cells(&self, tile: Tile) -> &[u16] {
        self.layers
            .iter()
            .find(|l| l.tile == tile.id())
            .map(|l| l.cells.as_slice())
            .unwrap_or(&[])
    }

    /// Cell index of a signed tile coordinate, if it lies on the map.
    pub fn index_of(&self, x: i32, y: i32) -> Option<u16> {
        let size = i32::from(self.size);
        let ox = x + self.half();
        let oy = y + self.half();
        if (0..size).contains(&ox) && (0..size).contains(&oy) {
            u16::try_from(oy * size + ox).ok()
        } else {
            None
        }
    }

    /// Signed tile coordinate of a cell index.
    pub fn coordinates_of(&self, index: u16) -> (i32, i32) {
        let size = i32::from(self.size);
        let index = i32::from(index);
        (index % size - self.half(), index / size - self.half())
    }

    /// Tile at a signed coordinate; off-map and unknown ids read as Void.
    pub fn tile_at(&self, x: i32, y: i32) -> Tile {
        self.index_of(x, y)
            .and_then(|i| Tile::from_id(self.grid[usize::from(i)]))
            .unwrap_or(Tile::Void)
    }

    pub fn random_spawn<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<(i32, i32)> {
        self.cells(Tile::Spawn)
            .choose(rng)
            .map(|&i| self.coordinates_of(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn header(tiles: &[u8], counts: &[u16]) -> Vec<u8> {
        let mut buf = vec![tiles.len() as u8];
        buf.extend_from_slice(tiles);
        for c in counts {
            buf.extend_from_slice(&c.to_le_bytes());
        }
        buf
    }

    fn push_indices(buf: &mut Vec<u8>, indices: &[u16]) {
        for i in indices {
            buf.extend_from_slice(&i.to_le_bytes());
        }
    }

    #[test]
    fn counts_bound_each_type() {
        // Indices chosen so a reader ignoring boundaries would misattribute
        // d2 (smaller than d0) to the second type.
        let data = [30u16, 20, 10, 40, 5];
        let mut buf = header(&[1, 2], &[3, 2]);
        push_indices(&mut buf, &data);

        let map = SparseMap::decode(&buf, 64).unwrap();
        assert_eq!(map.layers().len(), 2);
        assert_eq!(map.layers()[0].tile, 1);
        assert_eq!(map.layers()[0].cells, vec![30, 20, 10]);
        assert_eq!(map.layers()[1].tile, 2);
        assert_eq!(map.layers()[1].cells, vec![40, 5]);
        assert_eq!(&map.encode()[..], &buf[..]);
    }

    #[test]
    fn declared_count_past_end_is_fatal() {
        let mut buf = header(&[1, 2], &[3, 4]);
        push_indices(&mut buf, &[1, 2, 3, 4, 5]);
        assert_eq!(
            SparseMap::decode(&buf, 64),
            Err(MapError::CountExceedsBuffer {
                tile: 2,
                declared: 4,
                available: 2
            })
        );
    }

    #[test]
    fn header_violations_are_fatal() {
        assert!(matches!(
            SparseMap::decode(&[], 64),
            Err(MapError::Truncated { section: "tile count", .. })
        ));
        assert!(matches!(
            SparseMap::decode(&[2, 1], 64),
            Err(MapError::Truncated { section: "tile ids", .. })
        ));
        assert!(matches!(
            SparseMap::decode(&[1, 1, 0], 64),
            Err(MapError::Truncated { section: "index counts", .. })
        ));
        assert_eq!(
            SparseMap::decode(&header(&[3, 1], &[0, 0]), 64),
            Err(MapError::UnsortedTiles {
                previous: 3,
                tile: 1
            })
        );
        assert_eq!(
            SparseMap::decode(&header(&[], &[]), 63),
            Err(MapError::InvalidSize(63))
        );
    }

    #[test]
    fn index_violations_are_fatal() {
        let mut buf = header(&[1], &[1]);
        push_indices(&mut buf, &[16]);
        assert_eq!(
            SparseMap::decode(&buf, 4),
            Err(MapError::IndexOutOfRange {
                tile: 1,
                index: 16,
                cells: 16
            })
        );

        let mut buf = header(&[1], &[2]);
        push_indices(&mut buf, &[3, 3]);
        assert_eq!(
            SparseMap::decode(&buf, 4),
            Err(MapError::DuplicateIndex { tile: 1, index: 3 })
        );

        let mut buf = header(&[1], &[1]);
        push_indices(&mut buf, &[3]);
        buf.push(0);
        assert_eq!(SparseMap::decode(&buf, 4), Err(MapError::TrailingBytes(1)));
    }

    #[test]
    fn author_reverses_rows() {
        // 4x4 grid, row 0 all ground, row 2 has ground at columns 1 and 3,
        // a spawn at (0,1) and a wall at (3,3).
        #[rustfmt::skip]
        let grid = [
            1, 1, 1, 1,
            3, 0, 0, 0,
            0, 1, 0, 1,
            0, 0, 0, 2,
        ];
        let map = SparseMap::author(4, &grid).unwrap();
        let tiles: Vec<u8> = map.layers().iter().map(|l| l.tile).collect();
        assert_eq!(tiles, vec![1, 2, 3]);
        assert_eq!(map.cells(Tile::Ground), &[3, 2, 1, 0, 11, 9]);
        assert_eq!(map.cells(Tile::Wall), &[15]);
        assert_eq!(map.cells(Tile::Spawn), &[4]);

        let decoded = SparseMap::decode(&map.encode(), 4).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn coordinate_queries() {
        #[rustfmt::skip]
        let grid = [
            1, 1, 1, 1,
            3, 0, 0, 0,
            0, 1, 4, 1,
            0, 0, 5, 2,
        ];
        let map = SparseMap::author(4, &grid).unwrap();
        assert_eq!(map.half(), 2);
        assert_eq!(map.tile_at(-2, -2), Tile::Ground);
        assert_eq!(map.tile_at(-2, -1), Tile::Spawn);
        assert_eq!(map.tile_at(0, 0), Tile::Channel);
        assert_eq!(map.tile_at(0, 1), Tile::Exit);
        assert_eq!(map.tile_at(1, 1), Tile::Wall);
        assert_eq!(map.tile_at(-1, -1), Tile::Void);
        assert_eq!(map.tile_at(2, 0), Tile::Void);
        assert_eq!(map.index_of(-3, 0), None);
        assert_eq!(map.index_of(1, 1), Some(15));
        assert_eq!(map.coordinates_of(15), (1, 1));
        assert_eq!(map.cells(Tile::Spawn), &[4]);
        assert_eq!(map.random_spawn(&mut rand::thread_rng()), Some((-2, -1)));
        assert!(!Tile::Wall.is_walkable());
        assert!(Tile::Exit.is_walkable());
    }

    #[test]
    fn author_rejects_wrong_grid() {
        assert_eq!(
            SparseMap::author(4, &[0; 15]),
            Err(MapError::GridSize {
                expected: 16,
                actual: 15
            })
        );
    }

    fn arb_map_buffer() -> impl Strategy<Value = (u16, Vec<u8>)> {
        (1u16..=16).prop_map(|h| h * 2).prop_flat_map(|size| {
            let cells = size * size;
            let layers = prop::collection::btree_map(
                any::<u8>(),
                prop::collection::hash_set(0..cells, 0..24),
                0..6,
            );
            (Just(size), layers).prop_map(|(size, layers)| {
                let tiles: Vec<u8> = layers.keys().copied().collect();
                let counts: Vec<u16> = layers.values().map(|s| s.len() as u16).collect();
                let mut buf = header(&tiles, &counts);
                for indices in layers.values() {
                    let indices: Vec<u16> = indices.iter().copied().collect();
                    push_indices(&mut buf, &indices);
                }
                (size, buf)
            })
        })
    }

    proptest! {
        #[test]
        fn encode_inverts_decode((size, buf) in arb_map_buffer()) {
            let map = SparseMap::decode(&buf, size).unwrap();
            prop_assert_eq!(&map.encode()[..], &buf[..]);
        }

        #[test]
        fn authored_maps_survive_the_codec(
            grid in prop::collection::vec(0u8..6, 64)
        ) {
            let map = SparseMap::author(8, &grid).unwrap();
            let decoded = SparseMap::decode(&map.encode(), 8).unwrap();
            for (i, &tile) in grid.iter().enumerate() {
                let (x, y) = decoded.coordinates_of(i as u16);
                prop_assert_eq!(decoded.tile_at(x, y).id(), tile);
            }
        }
    }
}
