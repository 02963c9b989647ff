//! Dynamic obstacle management and tile caching for navigation meshes
//!
//! This crate keeps a tiled navigation mesh in step with runtime obstacles.
//! Tiles are stored as compressed height/area/connection layers; adding or
//! removing an obstacle only rebuilds the tiles it overlaps.
//!
//! # Features
//!
//! - **Tile Caching**: Compressed storage of tile layers behind versioned references
//! - **Dynamic Obstacles**: Add/remove cylinder, box, and oriented box obstacles
//! - **Incremental Updates**: One tile rebuild per [`TileCache::update`] call
//! - **Compression**: LZ4 compression for efficient tile storage
//! - **Parallel Initial Build**: Build every stored tile on a thread pool
//!
//! # Example
//!
//! ```rust,ignore
//! use tilecache::{Lz4Compressor, TileCache, TileCacheParams, TileMeshStore};
//! use glam::Vec3;
//!
//! let mut tile_cache = TileCache::init(TileCacheParams::default(), Box::new(Lz4Compressor), None)?;
//! for blob in tile_blobs {
//!     tile_cache.add_tile(blob, 0)?;
//! }
//!
//! let mut nav_mesh = TileMeshStore::new();
//! tilecache::build_all_tiles_parallel(&tile_cache, &mut nav_mesh, 4)?;
//!
//! // Add a cylinder obstacle and tick until every touched tile is rebuilt
//! let obstacle = tile_cache.add_obstacle(Vec3::new(10.0, 0.0, 10.0), 2.0, 4.0)?;
//! while !tile_cache.update(&mut nav_mesh)? {}
//!
//! // Remove the obstacle later
//! tile_cache.remove_obstacle(obstacle)?;
//! while !tile_cache.update(&mut nav_mesh)? {}
//! ```
//!
//! # Architecture
//!
//! - [`TileCache`]: Main cache managing tiles, obstacles and the rebuild queues
//! - [`tile_cache_builder`]: Per-tile pipeline (marking, regions, contours, polygons)
//! - [`TileCacheLayer`]: Decompressed tile layer data
//! - [`NavMeshTiles`]: Receiver of rebuilt tiles

pub mod area;
pub mod compressor;
pub mod contour;
pub mod obstacle;
pub mod polymesh;
pub mod region;
pub mod tile_cache;
pub mod tile_cache_builder;
pub mod tile_cache_data;
pub mod tile_cache_integration;

mod tile_cache_tests;

pub use compressor::*;
pub use obstacle::*;
pub use tile_cache::*;
pub use tile_cache_builder::{build_all_tiles_parallel, TileBuildOutput};
pub use tile_cache_data::*;
pub use tile_cache_integration::*;
