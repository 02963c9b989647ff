//! CLI utility for building a tile cache navigation mesh and replaying obstacle changes

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use glam::Vec3;
use log::{info, LevelFilter};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tilecache::{
    build_all_tiles_parallel, build_tile_cache_layer, calc_layer_connections, Lz4Compressor,
    ObstacleRef, TileCache, TileCacheLayerHeader, TileCacheMeshProcess, TileCacheParams,
    TileMeshData, TileMeshStore, TILECACHE_WALKABLE_AREA,
};

/// A CLI utility for tile cache navigation meshes with runtime obstacles
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Log rebuild progress
    #[clap(long, short, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build every tile of a synthetic world
    Build {
        #[clap(flatten)]
        world: WorldArgs,

        /// Output navigation mesh file (.json, anything else is binary)
        #[clap(long, value_parser)]
        output: Option<PathBuf>,
    },

    /// Build a synthetic world, then add and optionally remove obstacles
    Simulate {
        #[clap(flatten)]
        world: WorldArgs,

        /// Cylinder obstacle base position (x,y,z), repeatable
        #[clap(long, value_parser = parse_vector)]
        cylinder: Vec<Vec3>,

        /// Cylinder radius
        #[clap(long, default_value = "1.0")]
        radius: f32,

        /// Cylinder height
        #[clap(long, default_value = "2.0")]
        height: f32,

        /// Axis-aligned box obstacle as min and max corners (x,y,z:x,y,z), repeatable
        #[clap(long = "box", value_parser = parse_box)]
        boxes: Vec<(Vec3, Vec3)>,

        /// Remove every obstacle again once the cache has settled
        #[clap(long)]
        remove: bool,

        /// Print the summary as JSON
        #[clap(long)]
        json: bool,

        /// Output navigation mesh file (.json, anything else is binary)
        #[clap(long, value_parser)]
        output: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
struct WorldArgs {
    /// Number of tiles along each axis
    #[clap(long, default_value = "4")]
    tiles: i32,

    /// Worker threads for the initial build (0 = one per core)
    #[clap(long, default_value = "0")]
    threads: usize,

    /// Tile cache parameters (JSON); defaults are used otherwise
    #[clap(long, value_parser)]
    params: Option<PathBuf>,
}

/// Parse a comma-separated vector
fn parse_vector(s: &str) -> Result<Vec3, String> {
    let parts: Vec<&str> = s.split(',').collect();

    if parts.len() != 3 {
        return Err(format!(
            "Vector must have 3 components, got {}",
            parts.len()
        ));
    }

    let x = parts[0].parse::<f32>().map_err(|e| e.to_string())?;
    let y = parts[1].parse::<f32>().map_err(|e| e.to_string())?;
    let z = parts[2].parse::<f32>().map_err(|e| e.to_string())?;

    Ok(Vec3::new(x, y, z))
}

/// Parse two colon-separated vectors
fn parse_box(s: &str) -> Result<(Vec3, Vec3), String> {
    let (min, max) = s
        .split_once(':')
        .ok_or_else(|| "Box must be given as min:max".to_string())?;
    Ok((parse_vector(min)?, parse_vector(max)?))
}

/// Marks walkable polygons as passable
struct WalkableFlags;

impl TileCacheMeshProcess for WalkableFlags {
    fn process(&self, tile: &mut TileMeshData) {
        for (flag, &area) in tile.flags.iter_mut().zip(&tile.areas) {
            if area == TILECACHE_WALKABLE_AREA {
                *flag = 1;
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .parse_default_env()
        .init();

    match args.command {
        Commands::Build { world, output } => {
            let (_, nav_mesh) = build_world(&world)?;
            if let Some(output) = output {
                save_nav_mesh(&nav_mesh, &output)?;
            }
            Ok(())
        }
        Commands::Simulate {
            world,
            cylinder,
            radius,
            height,
            boxes,
            remove,
            json,
            output,
        } => {
            let (mut tile_cache, mut nav_mesh) = build_world(&world)?;
            simulate(
                &mut tile_cache,
                &mut nav_mesh,
                &cylinder,
                radius,
                height,
                &boxes,
                remove,
                json,
            )?;
            if let Some(output) = output {
                save_nav_mesh(&nav_mesh, &output)?;
            }
            Ok(())
        }
    }
}

/// Flat, fully walkable tile whose borders towards other tiles are portals
fn flat_tile_blob(params: &TileCacheParams, tx: i32, ty: i32, tiles: i32) -> Result<Vec<u8>> {
    let w = params.width as usize;
    let h = params.height as usize;
    let orig = params.origin();
    let header = TileCacheLayerHeader {
        tx,
        ty,
        tlayer: 0,
        bmin: [
            orig.x + tx as f32 * params.tile_width(),
            orig.y,
            orig.z + ty as f32 * params.tile_height(),
        ],
        bmax: [
            orig.x + (tx + 1) as f32 * params.tile_width(),
            orig.y + params.walkable_height,
            orig.z + (ty + 1) as f32 * params.tile_height(),
        ],
        width: w as u8,
        height: h as u8,
        maxx: (w - 1) as u8,
        maxy: (h - 1) as u8,
        ..Default::default()
    };

    let mut portals = 0u8;
    if tx > 0 {
        portals |= 1;
    }
    if ty + 1 < tiles {
        portals |= 1 << 1;
    }
    if tx + 1 < tiles {
        portals |= 1 << 2;
    }
    if ty > 0 {
        portals |= 1 << 3;
    }

    let heights = vec![0u8; w * h];
    let areas = vec![TILECACHE_WALKABLE_AREA; w * h];
    let climb = (params.walkable_climb / params.ch) as i32;
    let cons = calc_layer_connections(w, h, &heights, &areas, climb, portals);
    build_tile_cache_layer(&Lz4Compressor, &header, &heights, &areas, &cons)
        .map_err(|e| anyhow!("Failed to build tile ({}, {}): {}", tx, ty, e))
}

/// Fill a tile cache with a synthetic world and build every tile
fn build_world(world: &WorldArgs) -> Result<(TileCache, TileMeshStore)> {
    let params = match &world.params {
        Some(path) => TileCacheParams::load_from_json(path)
            .with_context(|| format!("Failed to load parameters from {}", path.display()))?,
        None => TileCacheParams {
            max_tiles: (world.tiles.max(1) * world.tiles.max(1)) as usize,
            ..Default::default()
        },
    };

    let mut tile_cache = TileCache::init(
        params.clone(),
        Box::new(Lz4Compressor),
        Some(Box::new(WalkableFlags)),
    )
    .context("Failed to create tile cache")?;

    for ty in 0..world.tiles {
        for tx in 0..world.tiles {
            let blob = flat_tile_blob(&params, tx, ty, world.tiles)?;
            tile_cache
                .add_tile(blob, 0)
                .with_context(|| format!("Failed to add tile ({}, {})", tx, ty))?;
        }
    }

    let start = Instant::now();
    let mut nav_mesh = TileMeshStore::new();
    let built = build_all_tiles_parallel(&tile_cache, &mut nav_mesh, world.threads)
        .context("Failed to build tiles")?;
    info!(
        "Built {} tiles with {} polygons in {:.2?}",
        built,
        nav_mesh.poly_count(),
        start.elapsed()
    );

    Ok((tile_cache, nav_mesh))
}

/// Tick the tile cache until it settles; returns the number of update calls
fn run_until_settled(tile_cache: &mut TileCache, nav_mesh: &mut TileMeshStore) -> Result<usize> {
    let mut steps = 1;
    while !tile_cache.update(nav_mesh).context("Tile cache update failed")? {
        steps += 1;
    }
    Ok(steps)
}

#[allow(clippy::too_many_arguments)]
fn simulate(
    tile_cache: &mut TileCache,
    nav_mesh: &mut TileMeshStore,
    cylinders: &[Vec3],
    radius: f32,
    height: f32,
    boxes: &[(Vec3, Vec3)],
    remove: bool,
    json: bool,
) -> Result<()> {
    let polys_before = nav_mesh.poly_count();

    let mut obstacles: Vec<ObstacleRef> = Vec::new();
    for &pos in cylinders {
        obstacles.push(tile_cache.add_obstacle(pos, radius, height)?);
    }
    for &(bmin, bmax) in boxes {
        obstacles.push(tile_cache.add_box_obstacle(bmin, bmax)?);
    }

    let start = Instant::now();
    let add_steps = run_until_settled(tile_cache, nav_mesh)?;
    let add_time = start.elapsed();
    let polys_with_obstacles = nav_mesh.poly_count();
    let touched: usize = obstacles
        .iter()
        .filter_map(|&r| tile_cache.get_obstacle_by_ref(r))
        .map(|obstacle| obstacle.touched.len())
        .sum();
    info!(
        "Applied {} obstacles touching {} tiles in {} updates ({:.2?})",
        obstacles.len(),
        touched,
        add_steps,
        add_time
    );

    let mut remove_steps = 0;
    if remove {
        for &r in &obstacles {
            tile_cache.remove_obstacle(r)?;
        }
        remove_steps = run_until_settled(tile_cache, nav_mesh)?;
        info!("Removed {} obstacles in {} updates", obstacles.len(), remove_steps);
    }

    if json {
        let summary = serde_json::json!({
            "tiles": nav_mesh.tile_count(),
            "obstacles": obstacles.len(),
            "touched_tiles": touched,
            "add_updates": add_steps,
            "remove_updates": remove_steps,
            "polys_before": polys_before,
            "polys_with_obstacles": polys_with_obstacles,
            "polys_after": nav_mesh.poly_count(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Tiles: {}", nav_mesh.tile_count());
        println!(
            "Polygons: {} before, {} with obstacles, {} now",
            polys_before,
            polys_with_obstacles,
            nav_mesh.poly_count()
        );
    }

    Ok(())
}

/// Save the navigation mesh, picking the format from the extension
fn save_nav_mesh(nav_mesh: &TileMeshStore, output: &Path) -> Result<()> {
    if output.extension().and_then(|ext| ext.to_str()) == Some("json") {
        nav_mesh
            .save_to_json(output)
            .map_err(|e| anyhow!("Failed to save as JSON: {:?}", e))?;
        println!("Saved navigation mesh as JSON to {}", output.display());
    } else {
        nav_mesh
            .save_to_binary(output)
            .map_err(|e| anyhow!("Failed to save as binary: {:?}", e))?;
        println!("Saved navigation mesh as binary to {}", output.display());
    }
    Ok(())
}
