//! Per-tile build pipeline and the parallel initial build
//!
//! A tile is built by decompressing its layer, stamping the obstacles that
//! touch it, partitioning regions, tracing contours and meshing them. The
//! pipeline only reads the cache, so independent tiles can be built on a
//! thread pool and handed to the navigation mesh afterwards.

use glam::Vec3;
use log::{info, warn};
use rayon::prelude::*;
use tilecache_common::Result;

use crate::area::mark_obstacle_area;
use crate::compressor::TileCacheCompressor;
use crate::contour::build_tile_cache_contours;
use crate::obstacle::ObstacleShape;
use crate::polymesh::build_tile_cache_poly_mesh;
use crate::region::build_tile_cache_regions;
use crate::tile_cache::{TileCache, TileCacheParams, TileRef};
use crate::tile_cache_data::decompress_tile_cache_layer;
use crate::tile_cache_integration::{NavMeshTiles, TileCacheMeshProcess, TileMeshData};

/// Result of building one tile
#[derive(Debug, Clone, PartialEq)]
pub enum TileBuildOutput {
    /// Mesh replacing whatever the navigation mesh holds at its coordinates
    Mesh(TileMeshData),
    /// Nothing walkable is left; the tile is removed from the navigation mesh
    Empty { tx: i32, ty: i32, tlayer: i32 },
}

impl TileBuildOutput {
    /// Hands the result to a navigation mesh
    pub fn apply(self, nav_mesh: &mut dyn NavMeshTiles) -> Result<()> {
        match self {
            TileBuildOutput::Mesh(tile) => nav_mesh.add_tile(tile),
            TileBuildOutput::Empty { tx, ty, tlayer } => nav_mesh.remove_tile_at(tx, ty, tlayer),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, TileBuildOutput::Empty { .. })
    }
}

/// Builds the polygon mesh of a compressed layer with `obstacles` stamped in
pub(crate) fn build_layer_mesh<'a>(
    params: &TileCacheParams,
    compressor: &dyn TileCacheCompressor,
    data: &[u8],
    obstacles: impl IntoIterator<Item = &'a ObstacleShape>,
    mesh_process: Option<&dyn TileCacheMeshProcess>,
) -> Result<TileBuildOutput> {
    let mut layer = decompress_tile_cache_layer(compressor, data)?;
    let orig = Vec3::from(layer.header.bmin);

    for shape in obstacles {
        mark_obstacle_area(&mut layer, orig, params.cs, params.ch, shape);
    }

    let walkable_climb = (params.walkable_climb / params.ch) as i32;
    build_tile_cache_regions(&mut layer, walkable_climb)?;
    let lcset = build_tile_cache_contours(&layer, walkable_climb, params.max_simplification_error);
    let mesh = build_tile_cache_poly_mesh(&lcset, params.max_verts_per_poly)?;

    let header = &layer.header;
    if mesh.npolys == 0 {
        warn!(
            "Tile ({}, {}, {}) has no walkable polygons",
            header.tx, header.ty, header.tlayer
        );
        return Ok(TileBuildOutput::Empty {
            tx: header.tx,
            ty: header.ty,
            tlayer: header.tlayer,
        });
    }

    let mut tile = TileMeshData::from_poly_mesh(mesh, header, params);
    if let Some(process) = mesh_process {
        process.process(&mut tile);
    }
    Ok(TileBuildOutput::Mesh(tile))
}

/// Builds every stored tile on a pool of `threads` workers (0 picks the
/// core count) and adds the results to `nav_mesh` in slot order.
///
/// Obstacles are stamped as they currently stand; the request and rebuild
/// queues are left untouched. Returns the number of tiles with polygons.
pub fn build_all_tiles_parallel(
    cache: &TileCache,
    nav_mesh: &mut dyn NavMeshTiles,
    threads: usize,
) -> Result<usize> {
    let refs = cache.tile_refs();
    let build = |tile_ref: &TileRef| cache.build_tile(*tile_ref);

    let results: Vec<Result<TileBuildOutput>> =
        match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
            Ok(pool) => pool.install(|| refs.par_iter().map(build).collect()),
            Err(e) => {
                warn!(
                    "Failed to create thread pool ({}), building {} tiles sequentially",
                    e,
                    refs.len()
                );
                refs.iter().map(build).collect()
            }
        };

    let mut built = 0;
    for result in results {
        let output = result?;
        if !output.is_empty() {
            built += 1;
        }
        output.apply(nav_mesh)?;
    }

    info!("Built {} of {} tiles", built, refs.len());
    Ok(built)
}
