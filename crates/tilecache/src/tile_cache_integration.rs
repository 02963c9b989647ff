//! Hand-off of rebuilt tile meshes to a navigation mesh
//!
//! The tile cache never owns the navigation mesh. Finished tiles are passed
//! to anything implementing [`NavMeshTiles`]; [`TileMeshStore`] is a simple
//! in-memory implementation used by tooling and tests.

use std::collections::HashMap;

use log::debug;
#[cfg(feature = "serialization")]
use tilecache_common::Error;
use tilecache_common::Result;

use crate::polymesh::TileCachePolyMesh;
use crate::tile_cache::TileCacheParams;
use crate::tile_cache_data::TileCacheLayerHeader;

/// Polygon mesh of one tile ready to be integrated into a navigation mesh
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileMeshData {
    /// Tile position X
    pub tx: i32,
    /// Tile position Y
    pub ty: i32,
    /// Tile layer
    pub tlayer: i32,
    /// Vertices as `[x, y, z]` triples in cell units relative to `bmin`
    pub verts: Vec<u16>,
    /// `nvp` vertex indices followed by `nvp` neighbour slots per polygon
    pub polys: Vec<u16>,
    /// Area ID of each polygon
    pub areas: Vec<u8>,
    /// User defined flags of each polygon
    pub flags: Vec<u16>,
    /// Max vertices per polygon
    pub nvp: usize,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    /// Cell size
    pub cs: f32,
    /// Cell height
    pub ch: f32,
    /// Layer bounds minimum
    pub bmin: [f32; 3],
    /// Layer bounds maximum
    pub bmax: [f32; 3],
}

impl TileMeshData {
    /// Packages a layer's polygon mesh with the parameters it was built with
    pub fn from_poly_mesh(
        mesh: TileCachePolyMesh,
        header: &TileCacheLayerHeader,
        params: &TileCacheParams,
    ) -> Self {
        Self {
            tx: header.tx,
            ty: header.ty,
            tlayer: header.tlayer,
            verts: mesh.verts,
            polys: mesh.polys,
            areas: mesh.areas,
            flags: mesh.flags,
            nvp: mesh.nvp,
            walkable_height: params.walkable_height,
            walkable_radius: params.walkable_radius,
            walkable_climb: params.walkable_climb,
            cs: params.cs,
            ch: params.ch,
            bmin: header.bmin,
            bmax: header.bmax,
        }
    }

    /// Number of polygons
    pub fn poly_count(&self) -> usize {
        if self.nvp == 0 {
            0
        } else {
            self.polys.len() / (self.nvp * 2)
        }
    }

    /// Number of vertices
    pub fn vert_count(&self) -> usize {
        self.verts.len() / 3
    }

    /// Tile coordinates as a lookup key
    pub fn key(&self) -> (i32, i32, i32) {
        (self.tx, self.ty, self.tlayer)
    }
}

/// Navigation mesh that receives rebuilt tiles
pub trait NavMeshTiles {
    /// Adds a tile, replacing any tile at the same coordinates
    fn add_tile(&mut self, tile: TileMeshData) -> Result<()>;

    /// Removes the tile at the coordinates if present
    fn remove_tile_at(&mut self, tx: i32, ty: i32, tlayer: i32) -> Result<()>;
}

/// Hook run on every rebuilt tile before it reaches the navigation mesh,
/// typically to assign polygon flags from area ids
pub trait TileCacheMeshProcess: Send + Sync {
    fn process(&self, tile: &mut TileMeshData);
}

/// In-memory navigation mesh keyed by tile coordinates
#[derive(Debug, Default, Clone)]
pub struct TileMeshStore {
    tiles: HashMap<(i32, i32, i32), TileMeshData>,
}

impl TileMeshStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Tile at the coordinates
    pub fn tile(&self, tx: i32, ty: i32, tlayer: i32) -> Option<&TileMeshData> {
        self.tiles.get(&(tx, ty, tlayer))
    }

    /// Number of stored tiles
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Total number of polygons over all tiles
    pub fn poly_count(&self) -> usize {
        self.tiles.values().map(TileMeshData::poly_count).sum()
    }

    /// Tiles ordered by coordinates
    pub fn tiles(&self) -> Vec<&TileMeshData> {
        let mut tiles: Vec<&TileMeshData> = self.tiles.values().collect();
        tiles.sort_by_key(|t| t.key());
        tiles
    }

    #[cfg(feature = "serialization")]
    fn from_tiles(tiles: Vec<TileMeshData>) -> Self {
        Self {
            tiles: tiles.into_iter().map(|t| (t.key(), t)).collect(),
        }
    }

    #[cfg(feature = "serialization")]
    fn to_tiles(&self) -> Vec<TileMeshData> {
        self.tiles().into_iter().cloned().collect()
    }

    /// Saves the store to a JSON file
    #[cfg(feature = "serialization")]
    pub fn save_to_json<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.to_tiles())
            .map_err(|e| Error::Serialization(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Loads a store from a JSON file
    #[cfg(feature = "serialization")]
    pub fn load_from_json<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let tiles: Vec<TileMeshData> =
            serde_json::from_str(&json).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Self::from_tiles(tiles))
    }

    /// Saves the store to a file in binary format
    #[cfg(feature = "serialization")]
    pub fn save_to_binary<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let encoded = postcard::to_allocvec(&self.to_tiles())
            .map_err(|e| Error::Serialization(e.to_string()))?;
        std::fs::write(path, encoded)?;
        Ok(())
    }

    /// Loads a store from a binary file
    #[cfg(feature = "serialization")]
    pub fn load_from_binary<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path)?;
        let tiles: Vec<TileMeshData> =
            postcard::from_bytes(&data).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Self::from_tiles(tiles))
    }
}

impl NavMeshTiles for TileMeshStore {
    fn add_tile(&mut self, tile: TileMeshData) -> Result<()> {
        debug!(
            "Storing tile ({}, {}, {}) with {} polygons",
            tile.tx,
            tile.ty,
            tile.tlayer,
            tile.poly_count()
        );
        self.tiles.insert(tile.key(), tile);
        Ok(())
    }

    fn remove_tile_at(&mut self, tx: i32, ty: i32, tlayer: i32) -> Result<()> {
        self.tiles.remove(&(tx, ty, tlayer));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(tx: i32, ty: i32, npolys: usize) -> TileMeshData {
        let nvp = 6;
        TileMeshData {
            tx,
            ty,
            tlayer: 0,
            verts: vec![0, 0, 0, 8, 0, 0, 8, 0, 8],
            polys: vec![0xffff; npolys * nvp * 2],
            areas: vec![63; npolys],
            flags: vec![1; npolys],
            nvp,
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.9,
            cs: 0.3,
            ch: 0.2,
            bmin: [0.0; 3],
            bmax: [2.4, 1.0, 2.4],
        }
    }

    #[test]
    fn test_store_replaces_and_removes() {
        let mut store = TileMeshStore::new();
        store.add_tile(tile(0, 0, 1)).unwrap();
        store.add_tile(tile(1, 0, 2)).unwrap();
        store.add_tile(tile(0, 0, 3)).unwrap();

        assert_eq!(store.tile_count(), 2);
        assert_eq!(store.poly_count(), 5);
        assert_eq!(store.tile(0, 0, 0).unwrap().poly_count(), 3);

        store.remove_tile_at(0, 0, 0).unwrap();
        store.remove_tile_at(5, 5, 0).unwrap();
        assert_eq!(store.tile_count(), 1);
        assert!(store.tile(0, 0, 0).is_none());
    }

    #[test]
    fn test_tile_counts() {
        let t = tile(0, 0, 2);
        assert_eq!(t.poly_count(), 2);
        assert_eq!(t.vert_count(), 3);
        assert_eq!(t.key(), (0, 0, 0));
    }

    #[cfg(feature = "serialization")]
    #[test]
    fn test_store_json_persistence() {
        let mut store = TileMeshStore::new();
        store.add_tile(tile(0, 0, 1)).unwrap();
        store.add_tile(tile(2, 1, 2)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiles.json");
        store.save_to_json(&path).unwrap();

        let loaded = TileMeshStore::load_from_json(&path).unwrap();
        assert_eq!(loaded.tile_count(), 2);
        assert_eq!(loaded.tile(2, 1, 0), store.tile(2, 1, 0));
    }

    #[cfg(feature = "serialization")]
    #[test]
    fn test_store_binary_persistence() {
        let mut store = TileMeshStore::new();
        store.add_tile(tile(3, 4, 2)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiles.bin");
        store.save_to_binary(&path).unwrap();

        let loaded = TileMeshStore::load_from_binary(&path).unwrap();
        assert_eq!(loaded.poly_count(), 2);
        assert_eq!(loaded.tile(3, 4, 0), store.tile(3, 4, 0));
    }

    #[cfg(feature = "serialization")]
    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = TileMeshStore::load_from_json(dir.path().join("missing.json"));
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
