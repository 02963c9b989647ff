//! Contour extraction and simplification for tile layers
//!
//! Each region boundary is walked once and simplified against the
//! segments between neighbour changes, so two contours sharing an edge
//! simplify to the same vertices from both sides.

use log::warn;
use tilecache_common::{distance_pt_seg_sqr_2d, sqr};

use crate::tile_cache_data::{TileCacheLayer, TILECACHE_NULL_AREA};

/// Contour vertex flag value meaning "no portal"
pub const CONTOUR_NO_PORTAL: u8 = 0x0f;
/// Contour vertex flag marking a vertex that may be removed from the mesh
pub const CONTOUR_REMOVABLE: u8 = 0x80;

const NULL_REG: u8 = 0xff;
/// Raw neighbour values at or above this encode a portal direction
const PORTAL_REG: u8 = 0xf8;

/// A vertex in a tile contour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCacheContourVertex {
    /// X-coordinate (cell units)
    pub x: i32,
    /// Y-coordinate (height units)
    pub y: i32,
    /// Z-coordinate (cell units)
    pub z: i32,
    /// Portal direction of the edge starting here in the low nibble
    /// ([`CONTOUR_NO_PORTAL`] if none), [`CONTOUR_REMOVABLE`] bit on top
    pub flags: u8,
}

impl TileCacheContourVertex {
    pub fn new(x: i32, y: i32, z: i32, flags: u8) -> Self {
        Self { x, y, z, flags }
    }

    /// Portal direction of the edge leaving this vertex
    pub fn portal_dir(&self) -> Option<u8> {
        let dir = self.flags & 0x0f;
        (dir != CONTOUR_NO_PORTAL).then_some(dir)
    }

    pub fn is_removable(&self) -> bool {
        self.flags & CONTOUR_REMOVABLE != 0
    }
}

/// Simplified boundary of one region
#[derive(Debug, Clone, Default)]
pub struct TileCacheContour {
    pub verts: Vec<TileCacheContourVertex>,
    pub reg: u8,
    pub area: u8,
}

/// Contours of a layer, indexed by region id
#[derive(Debug, Clone, Default)]
pub struct TileCacheContourSet {
    pub conts: Vec<TileCacheContour>,
}

/// Raw boundary point with the neighbour seen across the edge that produced it
#[derive(Debug, Clone, Copy, PartialEq)]
struct RawVertex {
    x: i32,
    y: i32,
    z: i32,
    r: u8,
}

#[inline]
fn get_dir_offset_x(dir: usize) -> i32 {
    [-1, 0, 1, 0][dir & 3]
}

#[inline]
fn get_dir_offset_y(dir: usize) -> i32 {
    [0, 1, 0, -1][dir & 3]
}

/// Region across `dir`, `0xf8 + dir` for an unconnected portal edge, 0xff for a wall
fn get_neighbour_reg(layer: &TileCacheLayer, ax: i32, ay: i32, dir: usize) -> u8 {
    let w = layer.width() as i32;
    let h = layer.height() as i32;
    let ia = (ax + ay * w) as usize;

    let con = layer.cons[ia] & 0xf;
    let portal = layer.cons[ia] >> 4;
    let mask = 1u8 << dir;

    if con & mask == 0 {
        // No connection, return portal or hard edge.
        if portal & mask != 0 {
            return PORTAL_REG + dir as u8;
        }
        return NULL_REG;
    }

    let bx = ax + get_dir_offset_x(dir);
    let by = ay + get_dir_offset_y(dir);
    if bx < 0 || by < 0 || bx >= w || by >= h {
        return NULL_REG;
    }
    layer.regs[(bx + by * w) as usize]
}

/// Appends a boundary point, extending the last segment when the point continues it
fn append_vertex(verts: &mut Vec<RawVertex>, x: i32, y: i32, z: i32, r: u8) {
    let n = verts.len();
    if n > 1 {
        let pa = verts[n - 2];
        let pb = &mut verts[n - 1];
        if pb.r == r {
            if pa.x == pb.x && pb.x == x {
                // Aligned along the z-axis, slide z.
                pb.y = y;
                pb.z = z;
                return;
            } else if pa.z == pb.z && pb.z == z {
                // Aligned along the x-axis, slide x.
                pb.x = x;
                pb.y = y;
                return;
            }
        }
    }
    verts.push(RawVertex { x, y, z, r });
}

fn walk_contour(layer: &TileCacheLayer, mut x: i32, mut y: i32) -> Vec<RawVertex> {
    let w = layer.width() as i32;
    let h = layer.height() as i32;
    let mut verts = Vec::new();

    let reg_at = |x: i32, y: i32| layer.regs[(x + y * w) as usize];

    let start_x = x;
    let start_y = y;
    let Some(start_dir) = (0..4)
        .map(|i| (i + 3) & 3)
        .find(|&dir| get_neighbour_reg(layer, x, y, dir) != reg_at(x, y))
    else {
        return verts;
    };

    let mut dir = start_dir;
    // Every (cell, direction) state is visited at most once before returning to the start.
    let max_iter = 4 * w * h;
    let mut iter = 0;
    let mut closed = false;
    while iter <= max_iter {
        let rn = get_neighbour_reg(layer, x, y, dir);

        let mut nx = x;
        let mut ny = y;
        let ndir;

        if rn != reg_at(x, y) {
            // Solid edge.
            let mut px = x;
            let mut pz = y;
            match dir {
                0 => pz += 1,
                1 => {
                    px += 1;
                    pz += 1;
                }
                2 => px += 1,
                _ => {}
            }
            let height = layer.heights[(x + y * w) as usize] as i32;
            append_vertex(&mut verts, px, height, pz, rn);
            ndir = (dir + 1) & 0x3; // Rotate CW
        } else {
            nx = x + get_dir_offset_x(dir);
            ny = y + get_dir_offset_y(dir);
            ndir = (dir + 3) & 0x3; // Rotate CCW
        }

        if iter > 0 && x == start_x && y == start_y && dir == start_dir {
            closed = true;
            break;
        }

        x = nx;
        y = ny;
        dir = ndir;
        iter += 1;
    }

    if !closed {
        warn!(
            "Contour walk from ({}, {}) did not close after {} steps",
            start_x, start_y, max_iter
        );
    }

    // Remove last vertex if it is duplicate of the first one.
    if verts.len() > 1 {
        let pa = verts[verts.len() - 1];
        let pb = verts[0];
        if pa.x == pb.x && pa.z == pb.z {
            verts.pop();
        }
    }

    verts
}

/// Reduces a raw contour to the vertices needed to stay within `max_error`
fn simplify_contour(verts: &[RawVertex], max_error: f32) -> Vec<RawVertex> {
    let n = verts.len();
    if n == 0 {
        return Vec::new();
    }

    // Seed with the start of every wall segment.
    let mut poly: Vec<usize> = (0..n).filter(|&i| verts[(i + 1) % n].r != verts[i].r).collect();

    if poly.len() < 2 {
        // No transitions, seed with the lower-left and upper-right vertices.
        let mut lli = 0;
        let mut uri = 0;
        for (i, v) in verts.iter().enumerate().skip(1) {
            let ll = verts[lli];
            let ur = verts[uri];
            if v.x < ll.x || (v.x == ll.x && v.z < ll.z) {
                lli = i;
            }
            if v.x > ur.x || (v.x == ur.x && v.z > ur.z) {
                uri = i;
            }
        }
        poly = vec![lli, uri];
    }

    // Add points until all raw points are within error tolerance to the simplified shape.
    let max_error_sqr = sqr(max_error);
    let mut i = 0;
    while i < poly.len() {
        let ii = (i + 1) % poly.len();

        let ai = poly[i];
        let bi = poly[ii];
        let a = verts[ai];
        let b = verts[bi];

        // Traverse the segment in lexicographic order so that the max deviation
        // is the same when the opposite segment is simplified.
        let (mut ci, cinc, endi) = if b.x > a.x || (b.x == a.x && b.z > a.z) {
            ((ai + 1) % n, 1, bi)
        } else {
            ((bi + n - 1) % n, n - 1, ai)
        };

        let mut maxd = 0.0;
        let mut maxi = None;
        while ci != endi {
            let c = verts[ci];
            let d = distance_pt_seg_sqr_2d(c.x, c.z, a.x, a.z, b.x, b.z);
            if d > maxd {
                maxd = d;
                maxi = Some(ci);
            }
            ci = (ci + cinc) % n;
        }

        match maxi {
            Some(maxi) if maxd > max_error_sqr => poly.insert(i + 1, maxi),
            _ => i += 1,
        }
    }

    // Start from the lowest raw index.
    let start = poly
        .iter()
        .enumerate()
        .min_by_key(|&(_, &p)| p)
        .map(|(i, _)| i)
        .unwrap_or(0);

    (0..poly.len())
        .map(|i| verts[poly[(start + i) % poly.len()]])
        .collect()
}

/// Height of a contour corner and whether the corner may be removed
fn get_corner_height(layer: &TileCacheLayer, x: i32, y: i32, z: i32, walkable_climb: i32) -> (i32, bool) {
    let w = layer.width() as i32;
    let h = layer.height() as i32;

    let mut n = 0;
    let mut portal = 0xfu8;
    let mut height = 0;
    let mut preg = NULL_REG;
    let mut all_same_reg = true;

    for dz in -1..=0 {
        for dx in -1..=0 {
            let px = x + dx;
            let pz = z + dz;
            if px < 0 || pz < 0 || px >= w || pz >= h {
                continue;
            }
            let idx = (px + pz * w) as usize;
            let lh = layer.heights[idx] as i32;
            if (lh - y).abs() <= walkable_climb && layer.areas[idx] != TILECACHE_NULL_AREA {
                height = height.max(lh);
                portal &= layer.cons[idx] >> 4;
                if preg != NULL_REG && preg != layer.regs[idx] {
                    all_same_reg = false;
                }
                preg = layer.regs[idx];
                n += 1;
            }
        }
    }

    let portal_count = portal.count_ones();
    (height, n > 1 && portal_count == 1 && all_same_reg)
}

/// Extracts one simplified contour per region of a partitioned layer
pub fn build_tile_cache_contours(
    layer: &TileCacheLayer,
    walkable_climb: i32,
    max_error: f32,
) -> TileCacheContourSet {
    let w = layer.width();
    let h = layer.height();

    let mut cset = TileCacheContourSet {
        conts: vec![TileCacheContour::default(); layer.reg_count as usize],
    };

    for y in 0..h {
        for x in 0..w {
            let idx = x + y * w;
            let ri = layer.regs[idx];
            if ri == NULL_REG {
                continue;
            }

            let Some(cont) = cset.conts.get_mut(ri as usize) else {
                continue;
            };
            if !cont.verts.is_empty() {
                continue;
            }

            cont.reg = ri;
            cont.area = layer.areas[idx];

            let raw = walk_contour(layer, x as i32, y as i32);
            let simplified = simplify_contour(&raw, max_error);
            let n = simplified.len();

            // The neighbour of an edge is stored on its start vertex.
            cont.verts = (0..n)
                .map(|j| {
                    let v = simplified[j];
                    let nei = simplified[(j + 1) % n].r;
                    let (lh, removable) = get_corner_height(layer, v.x, v.y, v.z, walkable_climb);
                    let mut flags = CONTOUR_NO_PORTAL;
                    if nei != NULL_REG && nei >= PORTAL_REG {
                        flags = nei - PORTAL_REG;
                    }
                    if removable {
                        flags |= CONTOUR_REMOVABLE;
                    }
                    TileCacheContourVertex::new(v.x, lh, v.z, flags)
                })
                .collect();
        }
    }

    cset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::build_tile_cache_regions;
    use crate::tile_cache_data::{TileCacheLayerHeader, TILECACHE_WALKABLE_AREA};

    /// Fully walkable layer with neighbour connections inside the grid
    fn open_layer(w: usize, h: usize) -> TileCacheLayer {
        let header = TileCacheLayerHeader {
            width: w as u8,
            height: h as u8,
            maxx: (w - 1) as u8,
            maxy: (h - 1) as u8,
            ..Default::default()
        };
        let mut cons = vec![0u8; w * h];
        for y in 0..h {
            for x in 0..w {
                let c = &mut cons[x + y * w];
                for dir in 0..4 {
                    let nx = x as i32 + get_dir_offset_x(dir);
                    let ny = y as i32 + get_dir_offset_y(dir);
                    if nx >= 0 && ny >= 0 && nx < w as i32 && ny < h as i32 {
                        *c |= 1 << dir;
                    }
                }
            }
        }
        TileCacheLayer::new(header, vec![0; w * h], vec![TILECACHE_WALKABLE_AREA; w * h], cons)
            .unwrap()
    }

    fn corners(cont: &TileCacheContour) -> Vec<(i32, i32)> {
        cont.verts.iter().map(|v| (v.x, v.z)).collect()
    }

    #[test]
    fn test_square_contour() {
        let mut layer = open_layer(8, 8);
        build_tile_cache_regions(&mut layer, 1).unwrap();
        let cset = build_tile_cache_contours(&layer, 1, 1.3);

        assert_eq!(cset.conts.len(), 1);
        let cont = &cset.conts[0];
        assert_eq!(cont.area, TILECACHE_WALKABLE_AREA);
        assert_eq!(corners(cont), vec![(0, 0), (0, 8), (8, 8), (8, 0)]);
        assert!(cont.verts.iter().all(|v| v.flags == CONTOUR_NO_PORTAL));
    }

    #[test]
    fn test_straight_strip_simplifies_to_extremes() {
        let mut layer = open_layer(8, 1);
        build_tile_cache_regions(&mut layer, 1).unwrap();

        let raw = walk_contour(&layer, 0, 0);
        assert_eq!(raw.len(), 4);

        let cset = build_tile_cache_contours(&layer, 1, 1.3);
        assert_eq!(corners(&cset.conts[0]), vec![(0, 0), (8, 1)]);
    }

    #[test]
    fn test_long_outline_walks_every_tooth() {
        let mut layer = open_layer(8, 8);
        for z in 1..8 {
            for x in (1..8).step_by(2) {
                layer.areas[x + z * 8] = TILECACHE_NULL_AREA;
            }
        }
        build_tile_cache_regions(&mut layer, 1).unwrap();
        assert_eq!(layer.reg_count, 1);

        let raw: Vec<(i32, i32)> = walk_contour(&layer, 0, 0).iter().map(|v| (v.x, v.z)).collect();
        let expected = vec![
            (0, 0), (0, 8), (1, 8), (1, 1),
            (2, 1), (2, 8), (3, 8), (3, 1),
            (4, 1), (4, 8), (5, 8), (5, 1),
            (6, 1), (6, 8), (7, 8), (7, 1),
            (8, 1), (8, 0),
        ];
        assert_eq!(raw, expected);
    }

    #[test]
    fn test_portal_edge_flags() {
        let mut layer = open_layer(8, 8);
        // Open the +x border towards the neighbouring tile
        for y in 0..8 {
            layer.cons[7 + y * 8] |= 1 << (2 + 4);
        }
        build_tile_cache_regions(&mut layer, 1).unwrap();
        let cset = build_tile_cache_contours(&layer, 1, 1.3);

        let cont = &cset.conts[0];
        assert_eq!(corners(cont), vec![(0, 0), (0, 8), (8, 8), (8, 0)]);
        let dirs: Vec<Option<u8>> = cont.verts.iter().map(|v| v.portal_dir()).collect();
        assert_eq!(dirs, vec![None, None, Some(2), None]);
    }

    #[test]
    fn test_corner_heights_follow_cells() {
        let mut layer = open_layer(4, 4);
        layer.heights.fill(3);
        build_tile_cache_regions(&mut layer, 1).unwrap();
        let cset = build_tile_cache_contours(&layer, 1, 1.3);
        assert!(cset.conts[0].verts.iter().all(|v| v.y == 3));
    }

    #[test]
    fn test_two_regions_two_contours() {
        let mut layer = open_layer(5, 3);
        for y in 0..3 {
            layer.areas[2 + y * 5] = TILECACHE_NULL_AREA;
        }
        build_tile_cache_regions(&mut layer, 1).unwrap();
        let cset = build_tile_cache_contours(&layer, 1, 1.3);
        assert_eq!(cset.conts.len(), 2);
        assert_eq!(corners(&cset.conts[0]), vec![(0, 0), (0, 3), (2, 3), (2, 0)]);
        assert_eq!(corners(&cset.conts[1]), vec![(3, 0), (3, 3), (5, 3), (5, 0)]);
    }
}
