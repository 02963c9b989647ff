//! Tile cache implementation
//!
//! This module contains the TileCache structure, which stores compressed
//! tile layers, tracks runtime obstacles and rebuilds only the tiles an
//! obstacle change touches, one tile per call to [`TileCache::update`].

use std::collections::{HashMap, VecDeque};
use std::fmt;

use glam::Vec3;
use log::{debug, warn};
use tilecache_common::{ilog2, next_pow2, overlap_bounds, Error, Result};

use crate::compressor::TileCacheCompressor;
use crate::obstacle::{
    ObstacleRef, ObstacleRequest, ObstacleRequestAction, ObstacleShape, ObstacleState,
    TileCacheObstacle,
};
use crate::tile_cache_builder::{build_layer_mesh, TileBuildOutput};
use crate::tile_cache_data::TileCacheLayerHeader;
use crate::tile_cache_integration::{NavMeshTiles, TileCacheMeshProcess};

/// Fewer salt bits than this make stale tile references too likely to collide
const MIN_SALT_BITS: u32 = 10;

/// Largest polygon size a navigation mesh tile accepts
const MAX_VERTS_PER_POLY: usize = 6;

/// Versioned tile handle: salt in the high bits, slot index in the low `tile_bits`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileRef(pub u32);

impl TileRef {
    /// Reference that never resolves
    pub const NULL: TileRef = TileRef(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Tile cache parameters
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileCacheParams {
    /// World-space origin of the tile grid
    pub orig: [f32; 3],
    /// Cell size (horizontal resolution)
    pub cs: f32,
    /// Cell height (vertical resolution)
    pub ch: f32,
    /// Width of a tile (in cells)
    pub width: i32,
    /// Height of a tile (in cells)
    pub height: i32,
    /// Agent height in world units
    pub walkable_height: f32,
    /// Agent radius in world units
    pub walkable_radius: f32,
    /// Maximum ledge an agent can step over, in world units
    pub walkable_climb: f32,
    /// Maximum distance a simplified contour may deviate from the raw one, in cells
    pub max_simplification_error: f32,
    /// Number of tile slots
    pub max_tiles: usize,
    /// Number of obstacle slots
    pub max_obstacles: usize,
    /// Maximum number of vertices per polygon
    pub max_verts_per_poly: usize,
}

impl Default for TileCacheParams {
    fn default() -> Self {
        Self {
            orig: [0.0; 3],
            cs: 0.3,
            ch: 0.2,
            width: 48,
            height: 48,
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.9,
            max_simplification_error: 1.3,
            max_tiles: 128,
            max_obstacles: 128,
            max_verts_per_poly: MAX_VERTS_PER_POLY,
        }
    }
}

impl TileCacheParams {
    /// Checks that the parameters describe a usable tile grid
    pub fn validate(&self) -> Result<()> {
        if self.orig.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidParam("origin must be finite".to_string()));
        }
        if !(self.cs.is_finite() && self.cs > 0.0 && self.ch.is_finite() && self.ch > 0.0) {
            return Err(Error::InvalidParam(format!(
                "cell size and height must be positive, got {} and {}",
                self.cs, self.ch
            )));
        }
        if !(1..=255).contains(&self.width) || !(1..=255).contains(&self.height) {
            return Err(Error::InvalidParam(format!(
                "tile size must be within 1..=255 cells, got {}x{}",
                self.width, self.height
            )));
        }
        if self.walkable_climb < 0.0 || self.max_simplification_error < 0.0 {
            return Err(Error::InvalidParam(
                "walkable climb and simplification error must not be negative".to_string(),
            ));
        }
        if self.max_tiles == 0 || self.max_tiles > u32::MAX as usize / 2 {
            return Err(Error::InvalidParam(format!(
                "invalid tile count {}",
                self.max_tiles
            )));
        }
        if self.max_obstacles == 0 || self.max_obstacles > 0xffff {
            return Err(Error::InvalidParam(format!(
                "obstacle count must be within 1..=65535, got {}",
                self.max_obstacles
            )));
        }
        if !(3..=MAX_VERTS_PER_POLY).contains(&self.max_verts_per_poly) {
            return Err(Error::InvalidParam(format!(
                "max vertices per polygon must be within 3..={}, got {}",
                MAX_VERTS_PER_POLY, self.max_verts_per_poly
            )));
        }
        Ok(())
    }

    /// Grid origin
    pub fn origin(&self) -> Vec3 {
        Vec3::from(self.orig)
    }

    /// Tile extent along x in world units
    pub fn tile_width(&self) -> f32 {
        self.width as f32 * self.cs
    }

    /// Tile extent along z in world units
    pub fn tile_height(&self) -> f32 {
        self.height as f32 * self.cs
    }

    /// Loads parameters from a JSON file
    #[cfg(feature = "serialization")]
    pub fn load_from_json<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let params: Self =
            serde_json::from_str(&json).map_err(|e| Error::Serialization(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    /// Saves parameters to a JSON file
    #[cfg(feature = "serialization")]
    pub fn save_to_json<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Tile slot holding a compressed layer blob
#[derive(Debug, Clone)]
pub struct CompressedTile {
    /// Version counter of the slot, never 0
    pub salt: u32,
    /// Header of the stored blob, `None` while the slot is free
    pub header: Option<TileCacheLayerHeader>,
    /// Compressed blob
    pub data: Vec<u8>,
    /// User flags passed to `add_tile`
    pub flags: u8,
}

impl CompressedTile {
    fn new() -> Self {
        Self {
            salt: 1,
            header: None,
            data: Vec::new(),
            flags: 0,
        }
    }

    /// Whether the slot currently holds a tile
    pub fn is_occupied(&self) -> bool {
        self.header.is_some()
    }
}

/// Tile cache structure
pub struct TileCache {
    params: TileCacheParams,
    compressor: Box<dyn TileCacheCompressor>,
    mesh_process: Option<Box<dyn TileCacheMeshProcess>>,
    tile_bits: u32,
    salt_bits: u32,
    /// Tile slots, fixed at `max_tiles`
    tiles: Vec<CompressedTile>,
    /// Free tile slots, lowest index on top
    next_free_tile: Vec<usize>,
    /// Occupied tile slots per grid column
    pos_lookup: HashMap<(i32, i32), Vec<usize>>,
    /// Obstacle slots, grown on demand up to `max_obstacles`
    obstacles: Vec<TileCacheObstacle>,
    next_free_obstacle: Vec<usize>,
    requests: VecDeque<ObstacleRequest>,
    /// Tiles waiting to be rebuilt, each at most once
    update: VecDeque<TileRef>,
}

impl fmt::Debug for TileCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileCache")
            .field("params", &self.params)
            .field("tile_bits", &self.tile_bits)
            .field("salt_bits", &self.salt_bits)
            .field("tiles", &self.pos_lookup.values().map(Vec::len).sum::<usize>())
            .field("obstacles", &self.obstacles.len())
            .field("requests", &self.requests.len())
            .field("update", &self.update.len())
            .finish_non_exhaustive()
    }
}

impl TileCache {
    /// Creates a tile cache with every tile slot free
    pub fn init(
        params: TileCacheParams,
        compressor: Box<dyn TileCacheCompressor>,
        mesh_process: Option<Box<dyn TileCacheMeshProcess>>,
    ) -> Result<Self> {
        params.validate()?;

        let tile_bits = ilog2(next_pow2(params.max_tiles as u32));
        let salt_bits = (32 - tile_bits).min(31);
        if salt_bits < MIN_SALT_BITS {
            return Err(Error::InvalidParam(format!(
                "{} tiles leave only {} salt bits",
                params.max_tiles, salt_bits
            )));
        }

        let tiles = (0..params.max_tiles).map(|_| CompressedTile::new()).collect();
        let next_free_tile = (0..params.max_tiles).rev().collect();

        debug!(
            "Tile cache with {} tile slots ({} tile bits, {} salt bits) and {} obstacle slots",
            params.max_tiles, tile_bits, salt_bits, params.max_obstacles
        );

        Ok(Self {
            params,
            compressor,
            mesh_process,
            tile_bits,
            salt_bits,
            tiles,
            next_free_tile,
            pos_lookup: HashMap::new(),
            obstacles: Vec::new(),
            next_free_obstacle: Vec::new(),
            requests: VecDeque::new(),
            update: VecDeque::new(),
        })
    }

    /// Gets the tile cache parameters
    pub fn params(&self) -> &TileCacheParams {
        &self.params
    }

    /// Compressor used for stored blobs
    pub fn compressor(&self) -> &dyn TileCacheCompressor {
        self.compressor.as_ref()
    }

    pub fn mesh_process(&self) -> Option<&dyn TileCacheMeshProcess> {
        self.mesh_process.as_deref()
    }

    /// Packs a slot salt and index into a tile reference
    pub fn encode_tile_ref(&self, salt: u32, idx: usize) -> TileRef {
        TileRef((salt << self.tile_bits) | idx as u32)
    }

    pub fn decode_tile_ref_salt(&self, tile_ref: TileRef) -> u32 {
        let salt_mask = (1u32 << self.salt_bits) - 1;
        (tile_ref.0 >> self.tile_bits) & salt_mask
    }

    pub fn decode_tile_ref_idx(&self, tile_ref: TileRef) -> usize {
        let tile_mask = (1u32 << self.tile_bits) - 1;
        (tile_ref.0 & tile_mask) as usize
    }

    /// Registers a compressed tile blob. Returns [`TileRef::NULL`] when a tile
    /// already occupies the same grid location.
    pub fn add_tile(&mut self, data: Vec<u8>, flags: u8) -> Result<TileRef> {
        let header = TileCacheLayerHeader::from_blob(&data)?;

        if self.get_tile_at(header.tx, header.ty, header.tlayer).is_some() {
            warn!(
                "Tile ({}, {}, {}) is already in the cache",
                header.tx, header.ty, header.tlayer
            );
            return Ok(TileRef::NULL);
        }

        let idx = self.next_free_tile.pop().ok_or_else(|| {
            Error::OutOfMemory(format!("all {} tile slots in use", self.params.max_tiles))
        })?;

        self.pos_lookup
            .entry((header.tx, header.ty))
            .or_default()
            .push(idx);

        let tile = &mut self.tiles[idx];
        tile.header = Some(header);
        tile.data = data;
        tile.flags = flags;
        let salt = tile.salt;

        Ok(self.encode_tile_ref(salt, idx))
    }

    /// Removes a tile and hands back its blob. The slot's salt changes, so
    /// `tile_ref` and every copy of it stop resolving.
    pub fn remove_tile(&mut self, tile_ref: TileRef) -> Result<Vec<u8>> {
        let idx = self.resolve_tile(tile_ref)?;

        let salt_mask = (1u32 << self.salt_bits) - 1;
        let tile = &mut self.tiles[idx];
        let header = tile.header.take();
        let data = std::mem::take(&mut tile.data);
        tile.flags = 0;
        tile.salt = (tile.salt + 1) & salt_mask;
        if tile.salt == 0 {
            tile.salt = 1;
        }

        if let Some(header) = header {
            let key = (header.tx, header.ty);
            if let Some(slots) = self.pos_lookup.get_mut(&key) {
                slots.retain(|&i| i != idx);
                if slots.is_empty() {
                    self.pos_lookup.remove(&key);
                }
            }
        }
        self.next_free_tile.push(idx);

        Ok(data)
    }

    /// Slot index of a live tile reference
    fn resolve_tile(&self, tile_ref: TileRef) -> Result<usize> {
        if tile_ref.is_null() {
            return Err(Error::InvalidTileRef(tile_ref.0));
        }
        let idx = self.decode_tile_ref_idx(tile_ref);
        match self.tiles.get(idx) {
            Some(tile)
                if tile.is_occupied() && tile.salt == self.decode_tile_ref_salt(tile_ref) =>
            {
                Ok(idx)
            }
            _ => Err(Error::InvalidTileRef(tile_ref.0)),
        }
    }

    /// Gets a tile by reference
    pub fn get_tile_by_ref(&self, tile_ref: TileRef) -> Option<&CompressedTile> {
        self.resolve_tile(tile_ref).ok().map(|idx| &self.tiles[idx])
    }

    /// Gets a tile slot by index
    pub fn get_tile(&self, idx: usize) -> Option<&CompressedTile> {
        self.tiles.get(idx)
    }

    /// Gets the reference of an occupied tile slot
    pub fn get_tile_ref(&self, idx: usize) -> Option<TileRef> {
        self.tiles
            .get(idx)
            .filter(|tile| tile.is_occupied())
            .map(|tile| self.encode_tile_ref(tile.salt, idx))
    }

    /// Number of tile slots
    pub fn get_tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// References of every stored tile in slot order
    pub fn tile_refs(&self) -> Vec<TileRef> {
        (0..self.tiles.len())
            .filter_map(|idx| self.get_tile_ref(idx))
            .collect()
    }

    /// Gets the tile at the given grid location
    pub fn get_tile_at(&self, tx: i32, ty: i32, tlayer: i32) -> Option<&CompressedTile> {
        self.pos_lookup.get(&(tx, ty))?.iter().find_map(|&idx| {
            let tile = &self.tiles[idx];
            tile.header
                .as_ref()
                .filter(|h| h.tlayer == tlayer)
                .map(|_| tile)
        })
    }

    /// Gets all tile layers at the given tile coordinates
    pub fn get_tiles_at(&self, tx: i32, ty: i32) -> Vec<TileRef> {
        self.pos_lookup
            .get(&(tx, ty))
            .map(|slots| {
                slots
                    .iter()
                    .filter_map(|&idx| self.get_tile_ref(idx))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// World bounds of the usable sub-region of a tile
    pub fn calc_tight_tile_bounds(&self, header: &TileCacheLayerHeader) -> (Vec3, Vec3) {
        let cs = self.params.cs;
        let bmin = Vec3::new(
            header.bmin[0] + header.minx as f32 * cs,
            header.bmin[1],
            header.bmin[2] + header.miny as f32 * cs,
        );
        let bmax = Vec3::new(
            header.bmin[0] + (header.maxx as f32 + 1.0) * cs,
            header.bmax[1],
            header.bmin[2] + (header.maxy as f32 + 1.0) * cs,
        );
        (bmin, bmax)
    }

    /// Queries tiles whose tight bounds overlap the given bounding box
    pub fn query_tiles(&self, bmin: Vec3, bmax: Vec3) -> Vec<TileRef> {
        let orig = self.params.origin();
        let tw = self.params.tile_width();
        let th = self.params.tile_height();

        let tx0 = ((bmin.x - orig.x) / tw).floor() as i32;
        let tx1 = ((bmax.x - orig.x) / tw).floor() as i32;
        let ty0 = ((bmin.z - orig.z) / th).floor() as i32;
        let ty1 = ((bmax.z - orig.z) / th).floor() as i32;

        let mut results = Vec::new();
        for ty in ty0..=ty1 {
            for tx in tx0..=tx1 {
                let Some(slots) = self.pos_lookup.get(&(tx, ty)) else {
                    continue;
                };
                for &idx in slots {
                    let tile = &self.tiles[idx];
                    let Some(header) = &tile.header else {
                        continue;
                    };
                    let (tbmin, tbmax) = self.calc_tight_tile_bounds(header);
                    if overlap_bounds(bmin, bmax, tbmin, tbmax) {
                        results.push(self.encode_tile_ref(tile.salt, idx));
                    }
                }
            }
        }
        results
    }

    /// Adds a cylinder obstacle standing on `pos`
    pub fn add_obstacle(&mut self, pos: Vec3, radius: f32, height: f32) -> Result<ObstacleRef> {
        self.add_obstacle_shape(ObstacleShape::Cylinder {
            pos: pos.to_array(),
            radius,
            height,
        })
    }

    /// Adds an axis-aligned box obstacle
    pub fn add_box_obstacle(&mut self, bmin: Vec3, bmax: Vec3) -> Result<ObstacleRef> {
        self.add_obstacle_shape(ObstacleShape::Box {
            bmin: bmin.to_array(),
            bmax: bmax.to_array(),
        })
    }

    /// Adds a box obstacle rotated by `y_radians` around the Y axis
    pub fn add_oriented_box_obstacle(
        &mut self,
        center: Vec3,
        half_extents: Vec3,
        y_radians: f32,
    ) -> Result<ObstacleRef> {
        self.add_obstacle_shape(ObstacleShape::oriented_box(center, half_extents, y_radians))
    }

    /// Allocates an obstacle slot and queues its addition. Tiles are only
    /// rebuilt by later calls to [`TileCache::update`].
    pub fn add_obstacle_shape(&mut self, shape: ObstacleShape) -> Result<ObstacleRef> {
        let idx = match self.next_free_obstacle.pop() {
            Some(idx) => idx,
            None if self.obstacles.len() < self.params.max_obstacles => {
                self.obstacles.push(TileCacheObstacle::new(shape.clone()));
                self.obstacles.len() - 1
            }
            None => {
                return Err(Error::OutOfMemory(format!(
                    "all {} obstacle slots in use",
                    self.params.max_obstacles
                )))
            }
        };

        let obstacle = &mut self.obstacles[idx];
        obstacle.shape = shape;
        obstacle.state = ObstacleState::Processing;
        obstacle.touched.clear();
        obstacle.pending.clear();

        let reference = ObstacleRef::encode(obstacle.salt, idx);
        self.requests.push_back(ObstacleRequest {
            action: ObstacleRequestAction::Add,
            reference,
        });
        Ok(reference)
    }

    /// Queues the removal of an obstacle. A null reference is ignored and a
    /// reference gone stale by the time the queue drains is skipped.
    pub fn remove_obstacle(&mut self, reference: ObstacleRef) -> Result<()> {
        if reference.is_null() {
            return Ok(());
        }
        if reference.index() >= self.params.max_obstacles {
            return Err(Error::InvalidObstacleRef(reference.0));
        }
        self.requests.push_back(ObstacleRequest {
            action: ObstacleRequestAction::Remove,
            reference,
        });
        Ok(())
    }

    /// Gets an obstacle by reference
    pub fn get_obstacle_by_ref(&self, reference: ObstacleRef) -> Option<&TileCacheObstacle> {
        if reference.is_null() {
            return None;
        }
        self.obstacles
            .get(reference.index())
            .filter(|obstacle| obstacle.salt == reference.salt())
    }

    /// Gets an obstacle slot by index
    pub fn get_obstacle(&self, idx: usize) -> Option<&TileCacheObstacle> {
        self.obstacles.get(idx)
    }

    /// Gets the reference for an obstacle at the given index
    pub fn get_obstacle_ref(&self, idx: usize) -> Option<ObstacleRef> {
        self.obstacles
            .get(idx)
            .map(|obstacle| ObstacleRef::encode(obstacle.salt, idx))
    }

    /// Number of allocated obstacle slots
    pub fn get_obstacle_count(&self) -> usize {
        self.obstacles.len()
    }

    /// Gets the bounds of an obstacle
    pub fn get_obstacle_bounds(&self, obstacle: &TileCacheObstacle) -> (Vec3, Vec3) {
        obstacle.shape.bounds()
    }

    /// Whether no obstacle request or tile rebuild is outstanding
    pub fn is_up_to_date(&self) -> bool {
        self.update.is_empty() && self.requests.is_empty()
    }

    /// Performs one step of obstacle processing.
    ///
    /// When no tile is waiting, every queued obstacle request is applied and
    /// the touched tiles are queued. Otherwise exactly one queued tile is
    /// rebuilt into `nav_mesh`. Returns true once both queues are empty.
    pub fn update(&mut self, nav_mesh: &mut dyn NavMeshTiles) -> Result<bool> {
        if self.update.is_empty() {
            self.process_requests();
        } else if let Some(tile_ref) = self.update.pop_front() {
            let status = self.build_nav_mesh_tile(tile_ref, nav_mesh);

            for idx in 0..self.obstacles.len() {
                let obstacle = &mut self.obstacles[idx];
                if !matches!(
                    obstacle.state,
                    ObstacleState::Processing | ObstacleState::Removing
                ) {
                    continue;
                }
                let before = obstacle.pending.len();
                obstacle.pending.retain(|&r| r != tile_ref);
                if obstacle.pending.len() != before {
                    self.settle_obstacle(idx);
                }
            }

            status?;
        }

        Ok(self.is_up_to_date())
    }

    fn process_requests(&mut self) {
        while let Some(request) = self.requests.pop_front() {
            let idx = request.reference.index();
            let Some(obstacle) = self.obstacles.get(idx) else {
                continue;
            };
            if obstacle.salt != request.reference.salt() {
                debug!(
                    "Skipping {:?} request for stale obstacle {:#x}",
                    request.action, request.reference.0
                );
                continue;
            }

            let pending = match request.action {
                ObstacleRequestAction::Add => {
                    let (bmin, bmax) = obstacle.shape.bounds();
                    let touched = self.query_tiles(bmin, bmax);
                    let obstacle = &mut self.obstacles[idx];
                    obstacle.state = ObstacleState::Processing;
                    obstacle.touched = touched;
                    obstacle.touched.clone()
                }
                ObstacleRequestAction::Remove => {
                    let obstacle = &mut self.obstacles[idx];
                    obstacle.state = ObstacleState::Removing;
                    obstacle.touched.clone()
                }
            };

            debug!(
                "Obstacle {:#x} {:?} touches {} tiles",
                request.reference.0,
                request.action,
                pending.len()
            );

            for &tile_ref in &pending {
                if !self.update.contains(&tile_ref) {
                    self.update.push_back(tile_ref);
                }
            }
            self.obstacles[idx].pending = pending;
            self.settle_obstacle(idx);
        }
    }

    /// Advances an obstacle whose pending set has emptied
    fn settle_obstacle(&mut self, idx: usize) {
        let obstacle = &mut self.obstacles[idx];
        if !obstacle.pending.is_empty() {
            return;
        }
        match obstacle.state {
            ObstacleState::Processing => obstacle.state = ObstacleState::Processed,
            ObstacleState::Removing => {
                obstacle.state = ObstacleState::Empty;
                obstacle.bump_salt();
                obstacle.touched.clear();
                self.next_free_obstacle.push(idx);
            }
            ObstacleState::Processed | ObstacleState::Empty => {}
        }
    }

    /// Runs the build pipeline for one tile with every active obstacle touching it
    /// stamped in, without modifying the cache
    pub fn build_tile(&self, tile_ref: TileRef) -> Result<TileBuildOutput> {
        let idx = self.resolve_tile(tile_ref)?;
        let shapes = self
            .obstacles
            .iter()
            .filter(|obstacle| obstacle.is_active() && obstacle.touched.contains(&tile_ref))
            .map(|obstacle| &obstacle.shape);

        build_layer_mesh(
            &self.params,
            self.compressor.as_ref(),
            &self.tiles[idx].data,
            shapes,
            self.mesh_process.as_deref(),
        )
    }

    /// Rebuilds a tile and replaces it in the navigation mesh, or removes it
    /// there when nothing walkable is left
    pub fn build_nav_mesh_tile(
        &self,
        tile_ref: TileRef,
        nav_mesh: &mut dyn NavMeshTiles,
    ) -> Result<()> {
        debug!("Rebuilding tile {:#x}", tile_ref.0);
        self.build_tile(tile_ref)?.apply(nav_mesh)
    }

    /// Rebuilds every layer at the given tile coordinates
    pub fn build_nav_mesh_tiles_at(
        &self,
        tx: i32,
        ty: i32,
        nav_mesh: &mut dyn NavMeshTiles,
    ) -> Result<()> {
        for tile_ref in self.get_tiles_at(tx, ty) {
            self.build_nav_mesh_tile(tile_ref, nav_mesh)?;
        }
        Ok(())
    }
}
