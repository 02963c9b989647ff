//! Scenario tests for the tile cache
//!
//! A small world of flat tiles is loaded into a cache and driven through
//! obstacle changes while recording which tiles reach the navigation mesh.

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use glam::Vec3;
    use tilecache_common::{Error, Result};

    use crate::contour::build_tile_cache_contours;
    use crate::polymesh::build_tile_cache_poly_mesh;
    use crate::region::build_tile_cache_regions;
    use crate::{
        build_all_tiles_parallel, build_tile_cache_layer, calc_layer_connections,
        decompress_tile_cache_layer, Lz4Compressor, NavMeshTiles, ObstacleRef, ObstacleState,
        TileCache, TileCacheLayerHeader, TileCacheParams, TileMeshData, TileMeshStore, TileRef,
        TILECACHE_WALKABLE_AREA,
    };

    const TILE_CELLS: usize = 8;

    /// Navigation mesh that remembers the order tiles were touched in
    #[derive(Default)]
    struct RecordingNavMesh {
        store: TileMeshStore,
        rebuilt: Vec<(i32, i32, i32)>,
    }

    impl NavMeshTiles for RecordingNavMesh {
        fn add_tile(&mut self, tile: TileMeshData) -> Result<()> {
            self.rebuilt.push(tile.key());
            self.store.add_tile(tile)
        }

        fn remove_tile_at(&mut self, tx: i32, ty: i32, tlayer: i32) -> Result<()> {
            self.rebuilt.push((tx, ty, tlayer));
            self.store.remove_tile_at(tx, ty, tlayer)
        }
    }

    fn params() -> TileCacheParams {
        TileCacheParams {
            cs: 1.0,
            ch: 0.5,
            width: TILE_CELLS as i32,
            height: TILE_CELLS as i32,
            walkable_climb: 0.9,
            max_tiles: 32,
            max_obstacles: 8,
            ..Default::default()
        }
    }

    /// Flat walkable tile; borders facing another tile of a `grid`x`grid` world are portals
    fn flat_tile(tx: i32, ty: i32, grid: i32) -> Vec<u8> {
        let size = TILE_CELLS as f32;
        let header = TileCacheLayerHeader {
            tx,
            ty,
            bmin: [tx as f32 * size, 0.0, ty as f32 * size],
            bmax: [(tx + 1) as f32 * size, 2.0, (ty + 1) as f32 * size],
            width: TILE_CELLS as u8,
            height: TILE_CELLS as u8,
            maxx: TILE_CELLS as u8 - 1,
            maxy: TILE_CELLS as u8 - 1,
            ..Default::default()
        };

        let mut portals = 0u8;
        if tx > 0 {
            portals |= 1 << 0;
        }
        if ty + 1 < grid {
            portals |= 1 << 1;
        }
        if tx + 1 < grid {
            portals |= 1 << 2;
        }
        if ty > 0 {
            portals |= 1 << 3;
        }

        let n = TILE_CELLS * TILE_CELLS;
        let heights = vec![0; n];
        let areas = vec![TILECACHE_WALKABLE_AREA; n];
        let cons = calc_layer_connections(TILE_CELLS, TILE_CELLS, &heights, &areas, 1, portals);
        build_tile_cache_layer(&Lz4Compressor, &header, &heights, &areas, &cons).unwrap()
    }

    fn world(grid: i32) -> TileCache {
        let mut tc = TileCache::init(params(), Box::new(Lz4Compressor), None).unwrap();
        for ty in 0..grid {
            for tx in 0..grid {
                let r = tc.add_tile(flat_tile(tx, ty, grid), 0).unwrap();
                assert!(!r.is_null());
            }
        }
        tc
    }

    /// Calls update until it reports settled; returns the number of calls that did work
    fn run_until_settled(tc: &mut TileCache, nav_mesh: &mut dyn NavMeshTiles) -> usize {
        let mut steps = 0;
        while !tc.update(nav_mesh).unwrap() {
            steps += 1;
            assert!(steps < 1000, "tile cache never settled");
        }
        steps
    }

    fn coords(tc: &TileCache, refs: &[TileRef]) -> HashSet<(i32, i32, i32)> {
        refs.iter()
            .map(|&r| {
                let header = tc.get_tile_by_ref(r).unwrap().header.as_ref().unwrap();
                (header.tx, header.ty, header.tlayer)
            })
            .collect()
    }

    #[test]
    fn test_stale_tile_refs_never_resolve() {
        let mut tc = TileCache::init(params(), Box::new(Lz4Compressor), None).unwrap();
        let mut seen = HashSet::new();
        let mut stale = Vec::new();

        for i in 0..100 {
            let r = tc.add_tile(flat_tile(i % 3, 0, 1), 0).unwrap();
            assert!(!r.is_null());
            assert!(seen.insert(r), "reference {:#x} handed out twice", r.0);
            assert_eq!(tc.get_tile_by_ref(r).unwrap().header.as_ref().unwrap().tx, i % 3);

            tc.remove_tile(r).unwrap();
            stale.push(r);
            for &old in &stale {
                assert!(tc.get_tile_by_ref(old).is_none());
            }
        }

        // Same slot, new salt
        let fresh = tc.add_tile(flat_tile(0, 0, 1), 0).unwrap();
        assert_eq!(
            tc.decode_tile_ref_idx(fresh),
            tc.decode_tile_ref_idx(stale[0])
        );
        assert_ne!(
            tc.decode_tile_ref_salt(fresh),
            tc.decode_tile_ref_salt(stale[0])
        );
        assert!(matches!(
            tc.remove_tile(stale[0]),
            Err(Error::InvalidTileRef(_))
        ));
    }

    #[test]
    fn test_update_is_idempotent_once_settled() {
        let mut tc = world(2);
        let mut nav = RecordingNavMesh::default();

        assert!(tc.update(&mut nav).unwrap());
        assert!(tc.update(&mut nav).unwrap());
        assert!(nav.rebuilt.is_empty());

        tc.add_obstacle(Vec3::new(4.0, 0.0, 4.0), 1.0, 2.0).unwrap();
        run_until_settled(&mut tc, &mut nav);
        let rebuilt = nav.rebuilt.len();

        assert!(tc.update(&mut nav).unwrap());
        assert!(tc.update(&mut nav).unwrap());
        assert_eq!(nav.rebuilt.len(), rebuilt);
    }

    #[test]
    fn test_obstacle_lifecycle() {
        let mut tc = world(3);
        let mut nav = RecordingNavMesh::default();
        let center = tc.get_tiles_at(1, 1)[0];

        let r = tc.add_obstacle(Vec3::new(12.0, 0.0, 12.0), 1.0, 2.0).unwrap();
        assert_eq!(tc.get_obstacle_by_ref(r).unwrap().state, ObstacleState::Processing);

        // Drain the request
        assert!(!tc.update(&mut nav).unwrap());
        let obstacle = tc.get_obstacle_by_ref(r).unwrap();
        assert_eq!(obstacle.state, ObstacleState::Processing);
        assert_eq!(obstacle.touched, vec![center]);
        assert_eq!(obstacle.pending, vec![center]);
        assert!(nav.rebuilt.is_empty());

        // Rebuild the only touched tile
        assert!(tc.update(&mut nav).unwrap());
        let obstacle = tc.get_obstacle_by_ref(r).unwrap();
        assert_eq!(obstacle.state, ObstacleState::Processed);
        assert!(obstacle.pending.is_empty());
        assert_eq!(nav.rebuilt, vec![(1, 1, 0)]);

        tc.remove_obstacle(r).unwrap();
        assert!(!tc.update(&mut nav).unwrap());
        assert_eq!(tc.get_obstacle_by_ref(r).unwrap().state, ObstacleState::Removing);
        assert!(tc.update(&mut nav).unwrap());
        assert!(tc.get_obstacle_by_ref(r).is_none());
        assert_eq!(tc.get_obstacle(r.index()).unwrap().state, ObstacleState::Empty);
        assert_eq!(nav.rebuilt, vec![(1, 1, 0), (1, 1, 0)]);

        // The slot is reused with a new salt
        let again = tc.add_box_obstacle(Vec3::ZERO, Vec3::ONE).unwrap();
        assert_eq!(again.index(), r.index());
        assert_ne!(again.salt(), r.salt());
    }

    #[test]
    fn test_rebuilt_tiles_equal_queried_tiles() {
        let mut tc = world(3);
        let mut nav = RecordingNavMesh::default();

        // Straddles the corner shared by tiles (0,0), (1,0), (0,1) and (1,1)
        let bmin = Vec3::new(6.0, 0.0, 6.0);
        let bmax = Vec3::new(10.0, 1.0, 10.0);
        let expected = coords(&tc, &tc.query_tiles(bmin, bmax));
        assert_eq!(expected.len(), 4);

        let r = tc.add_box_obstacle(bmin, bmax).unwrap();
        run_until_settled(&mut tc, &mut nav);
        let rebuilt: HashSet<_> = nav.rebuilt.iter().copied().collect();
        assert_eq!(rebuilt, expected);
        assert_eq!(nav.rebuilt.len(), expected.len());

        nav.rebuilt.clear();
        tc.remove_obstacle(r).unwrap();
        run_until_settled(&mut tc, &mut nav);
        let rebuilt: HashSet<_> = nav.rebuilt.iter().copied().collect();
        assert_eq!(rebuilt, expected);
        assert_eq!(nav.rebuilt.len(), expected.len());
    }

    #[test]
    fn test_shared_tiles_are_rebuilt_once_per_batch() {
        let mut tc = world(3);
        let mut nav = RecordingNavMesh::default();

        let a = tc.add_obstacle(Vec3::new(7.5, 0.0, 4.0), 1.0, 2.0).unwrap();
        let b = tc.add_obstacle(Vec3::new(8.5, 0.0, 4.0), 1.0, 2.0).unwrap();
        let steps = run_until_settled(&mut tc, &mut nav);

        let distinct: HashSet<_> = nav.rebuilt.iter().copied().collect();
        assert_eq!(distinct.len(), nav.rebuilt.len());
        assert_eq!(distinct, HashSet::from([(0, 0, 0), (1, 0, 0)]));
        // The drain and every rebuild but the last report unsettled
        assert_eq!(steps, distinct.len());
        for r in [a, b] {
            assert_eq!(tc.get_obstacle_by_ref(r).unwrap().state, ObstacleState::Processed);
        }
    }

    #[test]
    fn test_obstacle_outside_world_settles_on_drain() {
        let mut tc = world(2);
        let mut nav = RecordingNavMesh::default();

        let r = tc.add_obstacle(Vec3::new(100.0, 0.0, 100.0), 1.0, 2.0).unwrap();
        assert!(tc.update(&mut nav).unwrap());
        let obstacle = tc.get_obstacle_by_ref(r).unwrap();
        assert_eq!(obstacle.state, ObstacleState::Processed);
        assert!(obstacle.touched.is_empty());

        tc.remove_obstacle(r).unwrap();
        assert!(tc.update(&mut nav).unwrap());
        assert!(tc.get_obstacle_by_ref(r).is_none());
        assert!(nav.rebuilt.is_empty());
    }

    #[test]
    fn test_stale_obstacle_request_is_skipped() {
        let mut tc = world(2);
        let mut nav = RecordingNavMesh::default();

        let r = tc.add_obstacle(Vec3::new(4.0, 0.0, 4.0), 1.0, 2.0).unwrap();
        run_until_settled(&mut tc, &mut nav);
        tc.remove_obstacle(r).unwrap();
        run_until_settled(&mut tc, &mut nav);
        let rebuilt = nav.rebuilt.len();

        // Removing again with the expired reference does nothing
        tc.remove_obstacle(r).unwrap();
        assert!(tc.update(&mut nav).unwrap());
        assert_eq!(nav.rebuilt.len(), rebuilt);
        assert_eq!(tc.get_obstacle(r.index()).unwrap().state, ObstacleState::Empty);

        let fresh: ObstacleRef = tc.add_obstacle(Vec3::new(4.0, 0.0, 4.0), 1.0, 2.0).unwrap();
        assert_eq!(fresh.index(), r.index());
        assert_eq!(fresh.salt(), 2);
    }

    #[test]
    fn test_add_and_remove_in_one_batch() {
        let mut tc = world(1);
        let mut nav = RecordingNavMesh::default();

        let r = tc.add_obstacle(Vec3::new(4.0, 0.0, 4.0), 3.0, 2.0).unwrap();
        tc.remove_obstacle(r).unwrap();
        run_until_settled(&mut tc, &mut nav);

        assert!(tc.get_obstacle_by_ref(r).is_none());
        assert_eq!(nav.rebuilt, vec![(0, 0, 0)]);
        // The removed obstacle was not stamped
        let tile = nav.store.tile(0, 0, 0).unwrap();
        assert_eq!(tile.poly_count(), 1);
        assert_eq!(tile.vert_count(), 4);
    }

    #[test]
    fn test_removed_tile_in_queue_reports_error() {
        let mut tc = world(2);
        let mut nav = RecordingNavMesh::default();

        let r = tc.add_obstacle(Vec3::new(4.0, 0.0, 4.0), 1.0, 2.0).unwrap();
        assert!(!tc.update(&mut nav).unwrap());
        let tile = tc.get_tiles_at(0, 0)[0];
        tc.remove_tile(tile).unwrap();

        assert!(matches!(
            tc.update(&mut nav),
            Err(Error::InvalidTileRef(_))
        ));
        // The obstacle is not left waiting on the missing tile
        assert_eq!(tc.get_obstacle_by_ref(r).unwrap().state, ObstacleState::Processed);
        assert!(tc.update(&mut nav).unwrap());
    }

    #[test]
    fn test_covering_obstacle_removes_tile_from_nav_mesh() {
        let mut tc = world(1);
        let mut nav = RecordingNavMesh::default();
        tc.build_nav_mesh_tiles_at(0, 0, &mut nav).unwrap();
        assert_eq!(nav.store.tile_count(), 1);

        let r = tc
            .add_box_obstacle(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(9.0, 3.0, 9.0))
            .unwrap();
        run_until_settled(&mut tc, &mut nav);
        assert_eq!(nav.store.tile_count(), 0);

        tc.remove_obstacle(r).unwrap();
        run_until_settled(&mut tc, &mut nav);
        assert_eq!(nav.store.tile_count(), 1);
    }

    #[test]
    fn test_single_flat_tile_scenario() {
        let blob = flat_tile(0, 0, 1);
        let mut layer = decompress_tile_cache_layer(&Lz4Compressor, &blob).unwrap();

        build_tile_cache_regions(&mut layer, 1).unwrap();
        assert_eq!(layer.reg_count, 1);

        let lcset = build_tile_cache_contours(&layer, 1, 1.3);
        assert_eq!(lcset.conts.len(), 1);
        assert_eq!(lcset.conts[0].verts.len(), 4);

        let mesh = build_tile_cache_poly_mesh(&lcset, 6).unwrap();
        assert_eq!(mesh.npolys, 1);
        assert_eq!(mesh.poly_verts(0).len(), 4);
        assert_eq!(mesh.areas, vec![TILECACHE_WALKABLE_AREA]);

        // Same result through the cache
        let tc = world(1);
        let mut nav = RecordingNavMesh::default();
        tc.build_nav_mesh_tile(tc.get_tiles_at(0, 0)[0], &mut nav).unwrap();
        let tile = nav.store.tile(0, 0, 0).unwrap();
        assert_eq!(tile.poly_count(), 1);
        assert_eq!(tile.areas, vec![TILECACHE_WALKABLE_AREA]);
    }

    #[test]
    fn test_parallel_build_matches_sequential() {
        let mut tc = world(3);
        let mut warmup = RecordingNavMesh::default();
        tc.add_obstacle(Vec3::new(12.0, 0.0, 12.0), 2.0, 2.0).unwrap();
        run_until_settled(&mut tc, &mut warmup);

        let mut sequential = TileMeshStore::new();
        for r in tc.tile_refs() {
            tc.build_nav_mesh_tile(r, &mut sequential).unwrap();
        }

        for threads in [1, 4] {
            let mut parallel = TileMeshStore::new();
            let built = build_all_tiles_parallel(&tc, &mut parallel, threads).unwrap();
            assert_eq!(built, 9);
            assert_eq!(parallel.tiles(), sequential.tiles());
        }
        assert!(tc.is_up_to_date());
    }
}
