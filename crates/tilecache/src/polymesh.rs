//! Polygon mesh generation from tile contours
//!
//! Contours are ear-clipped into triangles, greedily merged into convex
//! polygons of at most `nvp` vertices, stripped of removable border
//! vertices and finally linked through a shared-edge adjacency table.

use std::collections::VecDeque;

use log::warn;
use tilecache_common::{Error, Result};

use crate::contour::{TileCacheContourSet, CONTOUR_NO_PORTAL};
use crate::tile_cache_data::TILECACHE_NULL_IDX;

/// Vertex bucket count for spatial hashing
const VERTEX_BUCKET_COUNT: usize = 1 << 8;

/// Marks a triangulation index whose vertex is the tip of a valid ear
const EAR_FLAG: u16 = 0x8000;
const INDEX_MASK: u16 = 0x7fff;

/// Neighbour value flag for an edge that continues into the adjacent tile;
/// the low bits hold the portal direction
pub const TILECACHE_PORTAL_FLAG: u16 = 0x8000;

/// Polygon mesh of a single tile layer
#[derive(Debug, Clone)]
pub struct TileCachePolyMesh {
    /// Max vertices per polygon
    pub nvp: usize,
    /// Number of vertices
    pub nverts: usize,
    /// Number of polygons
    pub npolys: usize,
    /// Mesh vertices `[x, y, z]` * nverts in cell units
    pub verts: Vec<u16>,
    /// Polygon vertex indices followed by neighbour slots, `nvp * 2` per polygon
    pub polys: Vec<u16>,
    /// Area ID of each polygon
    pub areas: Vec<u8>,
    /// User defined flags of each polygon
    pub flags: Vec<u16>,
}

impl TileCachePolyMesh {
    /// Creates a new empty polygon mesh
    pub fn new(nvp: usize) -> Self {
        Self {
            nvp,
            nverts: 0,
            npolys: 0,
            verts: Vec::new(),
            polys: Vec::new(),
            areas: Vec::new(),
            flags: Vec::new(),
        }
    }

    /// Vertex indices and neighbour slots of a polygon
    pub fn poly(&self, i: usize) -> &[u16] {
        &self.polys[i * self.nvp * 2..(i + 1) * self.nvp * 2]
    }

    /// Vertex indices of a polygon without the unused slots
    pub fn poly_verts(&self, i: usize) -> &[u16] {
        let p = &self.poly(i)[..self.nvp];
        &p[..count_poly_verts(p)]
    }

    /// Neighbour slots of a polygon
    pub fn poly_neis(&self, i: usize) -> &[u16] {
        &self.poly(i)[self.nvp..]
    }

    pub fn vertex(&self, i: usize) -> [u16; 3] {
        [self.verts[i * 3], self.verts[i * 3 + 1], self.verts[i * 3 + 2]]
    }

    fn push_poly(&mut self, verts: &[u16], area: u8) {
        let start = self.polys.len();
        self.polys.resize(start + self.nvp * 2, TILECACHE_NULL_IDX);
        self.polys[start..start + verts.len()].copy_from_slice(verts);
        self.areas.push(area);
        self.npolys += 1;
    }

    /// Removes a polygon by moving the last one into its slot
    fn swap_remove_poly(&mut self, i: usize) {
        let stride = self.nvp * 2;
        let last = self.npolys - 1;
        if i != last {
            self.polys.copy_within(last * stride..(last + 1) * stride, i * stride);
        }
        self.polys.truncate(last * stride);
        self.areas.swap_remove(i);
        self.npolys -= 1;
    }
}

#[inline]
fn prev(i: usize, n: usize) -> usize {
    if i >= 1 {
        i - 1
    } else {
        n - 1
    }
}

#[inline]
fn next(i: usize, n: usize) -> usize {
    if i + 1 < n {
        i + 1
    } else {
        0
    }
}

#[inline]
fn area2(a: &[i32; 3], b: &[i32; 3], c: &[i32; 3]) -> i32 {
    (b[0] - a[0]) * (c[2] - a[2]) - (c[0] - a[0]) * (b[2] - a[2])
}

#[inline]
fn left(a: &[i32; 3], b: &[i32; 3], c: &[i32; 3]) -> bool {
    area2(a, b, c) < 0
}

#[inline]
fn left_on(a: &[i32; 3], b: &[i32; 3], c: &[i32; 3]) -> bool {
    area2(a, b, c) <= 0
}

#[inline]
fn collinear(a: &[i32; 3], b: &[i32; 3], c: &[i32; 3]) -> bool {
    area2(a, b, c) == 0
}

#[inline]
fn vequal(a: &[i32; 3], b: &[i32; 3]) -> bool {
    a[0] == b[0] && a[2] == b[2]
}

/// Proper intersection of ab and cd, touching does not count
fn intersect_prop(a: &[i32; 3], b: &[i32; 3], c: &[i32; 3], d: &[i32; 3]) -> bool {
    if collinear(a, b, c) || collinear(a, b, d) || collinear(c, d, a) || collinear(c, d, b) {
        return false;
    }
    (left(a, b, c) ^ left(a, b, d)) && (left(c, d, a) ^ left(c, d, b))
}

/// Whether c lies on the closed segment ab
fn between(a: &[i32; 3], b: &[i32; 3], c: &[i32; 3]) -> bool {
    if !collinear(a, b, c) {
        return false;
    }
    if a[0] != b[0] {
        (a[0] <= c[0] && c[0] <= b[0]) || (a[0] >= c[0] && c[0] >= b[0])
    } else {
        (a[2] <= c[2] && c[2] <= b[2]) || (a[2] >= c[2] && c[2] >= b[2])
    }
}

fn intersect(a: &[i32; 3], b: &[i32; 3], c: &[i32; 3], d: &[i32; 3]) -> bool {
    intersect_prop(a, b, c, d) || between(a, b, c) || between(a, b, d) || between(c, d, a) || between(c, d, b)
}

#[inline]
fn point<'a>(verts: &'a [[i32; 3]], indices: &[u16], i: usize) -> &'a [i32; 3] {
    &verts[(indices[i] & INDEX_MASK) as usize]
}

/// Whether (i, j) is a proper internal or external diagonal, ignoring edges incident to i or j
fn diagonalie(i: usize, j: usize, n: usize, verts: &[[i32; 3]], indices: &[u16]) -> bool {
    let d0 = point(verts, indices, i);
    let d1 = point(verts, indices, j);

    for k in 0..n {
        let k1 = next(k, n);
        if k == i || k1 == i || k == j || k1 == j {
            continue;
        }
        let p0 = point(verts, indices, k);
        let p1 = point(verts, indices, k1);
        if vequal(d0, p0) || vequal(d1, p0) || vequal(d0, p1) || vequal(d1, p1) {
            continue;
        }
        if intersect(d0, d1, p0, p1) {
            return false;
        }
    }
    true
}

/// Whether the diagonal (i, j) is strictly inside the polygon near vertex i
fn in_cone(i: usize, j: usize, n: usize, verts: &[[i32; 3]], indices: &[u16]) -> bool {
    let pi = point(verts, indices, i);
    let pj = point(verts, indices, j);
    let pi1 = point(verts, indices, next(i, n));
    let pin1 = point(verts, indices, prev(i, n));

    if left_on(pin1, pi, pi1) {
        // Convex vertex
        left(pi, pj, pin1) && left(pj, pi, pi1)
    } else {
        // Reflex vertex
        !(left_on(pi, pj, pi1) && left_on(pj, pi, pin1))
    }
}

fn diagonal(i: usize, j: usize, n: usize, verts: &[[i32; 3]], indices: &[u16]) -> bool {
    in_cone(i, j, n, verts, indices) && diagonalie(i, j, n, verts, indices)
}

/// Ear-clips the polygon `indices` into `tris`.
///
/// Returns the triangle count, negated when no ear could be found and the
/// triangulation stopped early.
fn triangulate(verts: &[[i32; 3]], indices: &mut Vec<u16>, tris: &mut Vec<[u16; 3]>) -> i32 {
    let mut n = indices.len();
    if n < 3 {
        return 0;
    }

    for i in 0..n {
        let i1 = next(i, n);
        let i2 = next(i1, n);
        if diagonal(i, i2, n, verts, indices) {
            indices[i1] |= EAR_FLAG;
        }
    }

    while n > 3 {
        let mut min_len = -1;
        let mut mini = None;
        for i in 0..n {
            let i1 = next(i, n);
            if indices[i1] & EAR_FLAG != 0 {
                let p0 = point(verts, indices, i);
                let p2 = point(verts, indices, next(i1, n));
                let dx = p2[0] - p0[0];
                let dz = p2[2] - p0[2];
                let len = dx * dx + dz * dz;
                if min_len < 0 || len < min_len {
                    min_len = len;
                    mini = Some(i);
                }
            }
        }

        let Some(i) = mini else {
            return -(tris.len() as i32);
        };

        let i1 = next(i, n);
        let i2 = next(i1, n);
        tris.push([
            indices[i] & INDEX_MASK,
            indices[i1] & INDEX_MASK,
            indices[i2] & INDEX_MASK,
        ]);

        // Clip the ear tip
        indices.remove(i1);
        n -= 1;
        let i1 = if i1 >= n { 0 } else { i1 };
        let i = prev(i1, n);

        // Update diagonal flags of the two vertices around the clipped tip
        if diagonal(prev(i, n), i1, n, verts, indices) {
            indices[i] |= EAR_FLAG;
        } else {
            indices[i] &= INDEX_MASK;
        }
        if diagonal(i, next(i1, n), n, verts, indices) {
            indices[i1] |= EAR_FLAG;
        } else {
            indices[i1] &= INDEX_MASK;
        }
    }

    tris.push([
        indices[0] & INDEX_MASK,
        indices[1] & INDEX_MASK,
        indices[2] & INDEX_MASK,
    ]);
    tris.len() as i32
}

#[inline]
fn compute_vertex_hash(x: u16, z: u16) -> usize {
    const H1: u32 = 0x8da6b343;
    const H3: u32 = 0xcb1ab31f;
    let n = H1.wrapping_mul(x as u32).wrapping_add(H3.wrapping_mul(z as u32));
    (n & (VERTEX_BUCKET_COUNT as u32 - 1)) as usize
}

/// Adds a vertex, reusing an existing one at the same x/z within a height tolerance of 2
fn add_vertex(
    mesh: &mut TileCachePolyMesh,
    x: u16,
    y: u16,
    z: u16,
    first_vert: &mut [u16],
    next_vert: &mut Vec<u16>,
) -> u16 {
    let bucket = compute_vertex_hash(x, z);
    let mut i = first_vert[bucket];
    while i != TILECACHE_NULL_IDX {
        let v = mesh.vertex(i as usize);
        if v[0] == x && v[2] == z && (v[1] as i32 - y as i32).abs() <= 2 {
            return i;
        }
        i = next_vert[i as usize];
    }

    let i = mesh.nverts as u16;
    mesh.verts.extend_from_slice(&[x, y, z]);
    mesh.nverts += 1;
    next_vert.push(first_vert[bucket]);
    first_vert[bucket] = i;
    i
}

fn count_poly_verts(p: &[u16]) -> usize {
    p.iter()
        .position(|&v| v == TILECACHE_NULL_IDX)
        .unwrap_or(p.len())
}

/// Strict left turn of mesh vertices a, b, c
fn uleft(a: [u16; 3], b: [u16; 3], c: [u16; 3]) -> bool {
    (b[0] as i32 - a[0] as i32) * (c[2] as i32 - a[2] as i32)
        - (c[0] as i32 - a[0] as i32) * (b[2] as i32 - a[2] as i32)
        < 0
}

/// Squared length of the shared edge if `pa` and `pb` merge into a convex polygon
/// of at most `nvp` vertices, with the shared edge index in each
fn get_poly_merge_value(
    pa: &[u16],
    pb: &[u16],
    mesh: &TileCachePolyMesh,
    nvp: usize,
) -> Option<(i32, usize, usize)> {
    let na = count_poly_verts(pa);
    let nb = count_poly_verts(pb);

    // If the merged polygon would be too big, do not merge.
    if na + nb - 2 > nvp {
        return None;
    }

    // Check if the polygons share an edge.
    let mut shared = None;
    'outer: for i in 0..na {
        let (va0, va1) = ordered(pa[i], pa[(i + 1) % na]);
        for j in 0..nb {
            let (vb0, vb1) = ordered(pb[j], pb[(j + 1) % nb]);
            if va0 == vb0 && va1 == vb1 {
                shared = Some((i, j));
                break 'outer;
            }
        }
    }
    let (ea, eb) = shared?;

    // Check to see if the merged polygon would be convex.
    let v = |i: u16| mesh.vertex(i as usize);
    if !uleft(v(pa[(ea + na - 1) % na]), v(pa[ea]), v(pb[(eb + 2) % nb])) {
        return None;
    }
    if !uleft(v(pb[(eb + nb - 1) % nb]), v(pb[eb]), v(pa[(ea + 2) % na])) {
        return None;
    }

    let va = v(pa[ea]);
    let vb = v(pa[(ea + 1) % na]);
    let dx = va[0] as i32 - vb[0] as i32;
    let dz = va[2] as i32 - vb[2] as i32;
    Some((dx * dx + dz * dz, ea, eb))
}

#[inline]
fn ordered(a: u16, b: u16) -> (u16, u16) {
    if a > b {
        (b, a)
    } else {
        (a, b)
    }
}

/// Joins `pb` into `pa` across their shared edges `ea` and `eb`
fn merge_poly_verts(pa: &[u16], pb: &[u16], ea: usize, eb: usize, nvp: usize) -> Vec<u16> {
    let na = count_poly_verts(pa);
    let nb = count_poly_verts(pb);

    let mut tmp = Vec::with_capacity(nvp);
    tmp.extend((0..na - 1).map(|i| pa[(ea + 1 + i) % na]));
    tmp.extend((0..nb - 1).map(|i| pb[(eb + 1 + i) % nb]));
    tmp.resize(nvp, TILECACHE_NULL_IDX);
    tmp
}

/// Greedily merges polygons of equal area, best shared edge first, until nothing merges
fn merge_polys(polys: &mut Vec<u16>, areas: &mut Vec<u8>, mesh: &TileCachePolyMesh, nvp: usize) {
    if nvp <= 3 {
        return;
    }

    loop {
        let npolys = areas.len();
        let mut best_merge_val = 0;
        let mut best = None;

        for j in 0..npolys.saturating_sub(1) {
            let pj = &polys[j * nvp..(j + 1) * nvp];
            for k in j + 1..npolys {
                if areas[j] != areas[k] {
                    continue;
                }
                let pk = &polys[k * nvp..(k + 1) * nvp];
                if let Some((v, ea, eb)) = get_poly_merge_value(pj, pk, mesh, nvp) {
                    if v > best_merge_val {
                        best_merge_val = v;
                        best = Some((j, k, ea, eb));
                    }
                }
            }
        }

        let Some((pa, pb, ea, eb)) = best else {
            break;
        };

        let merged = merge_poly_verts(
            &polys[pa * nvp..(pa + 1) * nvp],
            &polys[pb * nvp..(pb + 1) * nvp],
            ea,
            eb,
            nvp,
        );
        polys[pa * nvp..(pa + 1) * nvp].copy_from_slice(&merged);

        let last = npolys - 1;
        polys.copy_within(last * nvp..(last + 1) * nvp, pb * nvp);
        polys.truncate(last * nvp);
        areas.swap_remove(pb);
    }
}

/// Whether removing `rem` leaves a polygon behind and keeps the hole boundary simple
fn can_remove_vertex(mesh: &TileCachePolyMesh, rem: u16) -> bool {
    let mut num_remaining_edges = 0;
    for i in 0..mesh.npolys {
        let p = mesh.poly_verts(i);
        let num_removed = p.iter().filter(|&&v| v == rem).count();
        if num_removed > 0 {
            num_remaining_edges += p.len() - (num_removed + 1);
        }
    }

    // There would be too few edges remaining to create a polygon. This happens
    // when the tip of a triangle is marked but no other polygon shares it.
    if num_remaining_edges <= 2 {
        return false;
    }

    // Edges touching the removed vertex as (other vertex, share count)
    let mut edges: Vec<(u16, u32)> = Vec::new();
    for i in 0..mesh.npolys {
        let p = mesh.poly_verts(i);
        let nv = p.len();
        let mut k = nv - 1;
        for j in 0..nv {
            if p[j] == rem || p[k] == rem {
                let b = if p[k] == rem { p[j] } else { p[k] };
                match edges.iter_mut().find(|(other, _)| *other == b) {
                    Some(edge) => edge.1 += 1,
                    None => edges.push((b, 1)),
                }
            }
            k = j;
        }
    }

    // More than two open edges means two non-adjacent polygons share the vertex.
    let num_open_edges = edges.iter().filter(|(_, count)| *count < 2).count();
    num_open_edges <= 2
}

/// Removes vertex `rem` and re-triangulates the hole left by its polygons
fn remove_vertex(mesh: &mut TileCachePolyMesh, rem: u16, max_tris: usize) -> Result<()> {
    let nvp = mesh.nvp;

    // Boundary edges of the removed polygons as [a, b, area]
    let mut edges: Vec<[u16; 3]> = Vec::new();
    let mut i = 0;
    while i < mesh.npolys {
        let p = mesh.poly_verts(i);
        if !p.contains(&rem) {
            i += 1;
            continue;
        }

        let nv = p.len();
        let mut k = nv - 1;
        for j in 0..nv {
            if p[j] != rem && p[k] != rem {
                edges.push([p[k], p[j], mesh.areas[i] as u16]);
            }
            k = j;
        }
        mesh.swap_remove_poly(i);
    }

    // Remove vertex.
    let r = rem as usize;
    mesh.verts.drain(r * 3..r * 3 + 3);
    mesh.nverts -= 1;

    // Adjust indices to match the removed vertex layout.
    for i in 0..mesh.npolys {
        let start = i * nvp * 2;
        for v in mesh.polys[start..start + nvp].iter_mut() {
            if *v != TILECACHE_NULL_IDX && *v > rem {
                *v -= 1;
            }
        }
    }
    for e in edges.iter_mut() {
        if e[0] > rem {
            e[0] -= 1;
        }
        if e[1] > rem {
            e[1] -= 1;
        }
    }

    if edges.is_empty() {
        return Ok(());
    }

    // Start with one vertex, keep appending connected segments to the start and end of the hole.
    let mut hole: VecDeque<u16> = VecDeque::from([edges[0][0]]);
    let mut harea: VecDeque<u16> = VecDeque::from([edges[0][2]]);

    while !edges.is_empty() {
        let mut matched = false;
        let mut i = 0;
        while i < edges.len() {
            let [ea, eb, a] = edges[i];
            let added = if hole.front() == Some(&eb) {
                hole.push_front(ea);
                harea.push_front(a);
                true
            } else if hole.back() == Some(&ea) {
                hole.push_back(eb);
                harea.push_back(a);
                true
            } else {
                false
            };

            if added {
                edges.swap_remove(i);
                matched = true;
            } else {
                i += 1;
            }
        }
        if !matched {
            break;
        }
    }

    if hole.len() < 3 {
        return Ok(());
    }

    let tverts: Vec<[i32; 3]> = hole
        .iter()
        .map(|&h| {
            let v = mesh.vertex(h as usize);
            [v[0] as i32, v[1] as i32, v[2] as i32]
        })
        .collect();
    let mut tpoly: Vec<u16> = (0..hole.len() as u16).collect();
    let mut tris = Vec::with_capacity(hole.len());
    let ntris = triangulate(&tverts, &mut tpoly, &mut tris);
    if ntris <= 0 {
        warn!(
            "hole triangulation around removed vertex {} stopped after {} triangles",
            rem, -ntris
        );
    }

    // Build initial polygons.
    let mut polys: Vec<u16> = Vec::with_capacity(tris.len() * nvp);
    let mut pareas: Vec<u8> = Vec::with_capacity(tris.len());
    for t in &tris {
        if t[0] != t[1] && t[0] != t[2] && t[1] != t[2] {
            let start = polys.len();
            polys.resize(start + nvp, TILECACHE_NULL_IDX);
            for (k, &ti) in t.iter().enumerate() {
                polys[start + k] = hole[ti as usize];
            }
            pareas.push(harea[t[0] as usize] as u8);
        }
    }
    if pareas.is_empty() {
        return Ok(());
    }

    merge_polys(&mut polys, &mut pareas, mesh, nvp);

    for (p, &area) in polys.chunks(nvp).zip(pareas.iter()) {
        if mesh.npolys >= max_tris {
            return Err(Error::BufferTooSmall(format!(
                "more than {} polygons after vertex removal",
                max_tris
            )));
        }
        mesh.push_poly(p, area);
    }

    Ok(())
}

#[inline]
fn overlap_range_exl(amin: u16, amax: u16, bmin: u16, bmax: u16) -> bool {
    !(amin >= bmax || amax <= bmin)
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    vert: [u16; 2],
    poly_edge: [u16; 2],
    poly: [u16; 2],
}

/// Links polygons sharing an edge and tags open edges lying on contour portals
fn build_mesh_adjacency(mesh: &mut TileCachePolyMesh, lcset: &TileCacheContourSet) {
    const UNMATCHED: u16 = 0xff;

    let nvp = mesh.nvp;
    let mut first_edge = vec![TILECACHE_NULL_IDX; mesh.nverts];
    let mut next_edge: Vec<u16> = Vec::with_capacity(mesh.npolys * nvp);
    let mut edges: Vec<Edge> = Vec::with_capacity(mesh.npolys * nvp);

    let poly_edge_verts = |p: &[u16], j: usize| {
        let v1 = if j + 1 >= nvp || p[j + 1] == TILECACHE_NULL_IDX {
            p[0]
        } else {
            p[j + 1]
        };
        (p[j], v1)
    };

    for i in 0..mesh.npolys {
        let p = mesh.poly(i);
        for j in 0..nvp {
            if p[j] == TILECACHE_NULL_IDX {
                break;
            }
            let (v0, v1) = poly_edge_verts(p, j);
            if v0 < v1 {
                edges.push(Edge {
                    vert: [v0, v1],
                    poly_edge: [j as u16, UNMATCHED],
                    poly: [i as u16, i as u16],
                });
                next_edge.push(first_edge[v0 as usize]);
                first_edge[v0 as usize] = (edges.len() - 1) as u16;
            }
        }
    }

    for i in 0..mesh.npolys {
        let p = mesh.poly(i);
        for j in 0..nvp {
            if p[j] == TILECACHE_NULL_IDX {
                break;
            }
            let (v0, v1) = poly_edge_verts(p, j);
            if v0 <= v1 {
                continue;
            }

            let mut found = false;
            let mut e = first_edge[v1 as usize];
            while e != TILECACHE_NULL_IDX {
                let edge = &mut edges[e as usize];
                if edge.vert[1] == v0 && edge.poly[0] == edge.poly[1] {
                    edge.poly[1] = i as u16;
                    edge.poly_edge[1] = j as u16;
                    found = true;
                    break;
                }
                e = next_edge[e as usize];
            }

            if !found {
                // Open edge, add it.
                edges.push(Edge {
                    vert: [v1, v0],
                    poly_edge: [j as u16, UNMATCHED],
                    poly: [i as u16, i as u16],
                });
                next_edge.push(first_edge[v1 as usize]);
                first_edge[v1 as usize] = (edges.len() - 1) as u16;
            }
        }
    }

    // Mark portal edges.
    for cont in lcset.conts.iter().filter(|c| c.verts.len() >= 3) {
        let n = cont.verts.len();
        let mut k = n - 1;
        for j in 0..n {
            let va = cont.verts[k];
            let vb = cont.verts[j];
            k = j;

            let dir = va.flags & 0x0f;
            if dir == CONTOUR_NO_PORTAL {
                continue;
            }

            // Portals on the x sides run along z and vice versa.
            let along_z = dir == 0 || dir == 2;
            let (fixed, a, b) = if along_z {
                (va.x as u16, va.z as u16, vb.z as u16)
            } else {
                (va.z as u16, va.x as u16, vb.x as u16)
            };
            let (amin, amax) = ordered(a, b);
            let (fixed_axis, run_axis) = if along_z { (0, 2) } else { (2, 0) };

            for e in edges.iter_mut() {
                // Skip connected edges.
                if e.poly[0] != e.poly[1] {
                    continue;
                }
                let eva = mesh.vertex(e.vert[0] as usize);
                let evb = mesh.vertex(e.vert[1] as usize);
                if eva[fixed_axis] == fixed && evb[fixed_axis] == fixed {
                    let (bmin, bmax) = ordered(eva[run_axis], evb[run_axis]);
                    if overlap_range_exl(amin, amax, bmin, bmax) {
                        // Reuse the other poly edge to store dir.
                        e.poly_edge[1] = dir as u16;
                    }
                }
            }
        }
    }

    // Store adjacency
    for e in &edges {
        let p0 = e.poly[0] as usize * nvp * 2 + nvp;
        if e.poly[0] != e.poly[1] {
            let p1 = e.poly[1] as usize * nvp * 2 + nvp;
            mesh.polys[p0 + e.poly_edge[0] as usize] = e.poly[1];
            mesh.polys[p1 + e.poly_edge[1] as usize] = e.poly[0];
        } else if e.poly_edge[1] != UNMATCHED {
            mesh.polys[p0 + e.poly_edge[0] as usize] = TILECACHE_PORTAL_FLAG | e.poly_edge[1];
        }
    }
}

/// Builds the polygon mesh of a layer from its contours
pub fn build_tile_cache_poly_mesh(lcset: &TileCacheContourSet, nvp: usize) -> Result<TileCachePolyMesh> {
    if nvp < 3 {
        return Err(Error::InvalidParam(format!(
            "max vertices per polygon must be at least 3, got {}",
            nvp
        )));
    }

    let mut max_vertices = 0;
    let mut max_tris = 0;
    for cont in lcset.conts.iter().filter(|c| c.verts.len() >= 3) {
        max_vertices += cont.verts.len();
        max_tris += cont.verts.len() - 2;
    }
    if max_vertices >= 0xfffe {
        return Err(Error::BufferTooSmall(format!(
            "too many vertices {}",
            max_vertices
        )));
    }

    let mut mesh = TileCachePolyMesh::new(nvp);
    let mut vflags = vec![false; max_vertices];
    let mut first_vert = vec![TILECACHE_NULL_IDX; VERTEX_BUCKET_COUNT];
    let mut next_vert: Vec<u16> = Vec::with_capacity(max_vertices);

    for cont in lcset.conts.iter().filter(|c| c.verts.len() >= 3) {
        let pts: Vec<[i32; 3]> = cont.verts.iter().map(|v| [v.x, v.y, v.z]).collect();
        let mut indices: Vec<u16> = (0..pts.len() as u16).collect();
        let mut tris = Vec::with_capacity(pts.len());
        let ntris = triangulate(&pts, &mut indices, &mut tris);
        if ntris <= 0 {
            warn!(
                "contour of region {} triangulated partially ({} triangles)",
                cont.reg, -ntris
            );
        }

        // Add and merge vertices.
        let vert_ids: Vec<u16> = cont
            .verts
            .iter()
            .map(|v| {
                let id = add_vertex(
                    &mut mesh,
                    v.x as u16,
                    v.y as u16,
                    v.z as u16,
                    &mut first_vert,
                    &mut next_vert,
                );
                if v.is_removable() {
                    vflags[id as usize] = true;
                }
                id
            })
            .collect();

        // Build initial polygons.
        let mut polys: Vec<u16> = Vec::with_capacity(tris.len() * nvp);
        for t in &tris {
            if t[0] != t[1] && t[0] != t[2] && t[1] != t[2] {
                let start = polys.len();
                polys.resize(start + nvp, TILECACHE_NULL_IDX);
                for (k, &ti) in t.iter().enumerate() {
                    polys[start + k] = vert_ids[ti as usize];
                }
            }
        }
        if polys.is_empty() {
            continue;
        }

        let mut areas = vec![cont.area; polys.len() / nvp];
        merge_polys(&mut polys, &mut areas, &mesh, nvp);

        for p in polys.chunks(nvp) {
            mesh.push_poly(p, cont.area);
            if mesh.npolys > max_tris {
                return Err(Error::BufferTooSmall(format!(
                    "more than {} polygons",
                    max_tris
                )));
            }
        }
    }

    // Remove edge vertices.
    let mut i = 0;
    while i < mesh.nverts {
        if vflags[i] && can_remove_vertex(&mesh, i as u16) {
            remove_vertex(&mut mesh, i as u16, max_tris)?;
            // The vertex layout shifted down by one.
            vflags.remove(i);
            continue;
        }
        i += 1;
    }

    build_mesh_adjacency(&mut mesh, lcset);
    mesh.flags = vec![0; mesh.npolys];

    Ok(mesh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contour::{build_tile_cache_contours, TileCacheContour, TileCacheContourVertex, CONTOUR_REMOVABLE};
    use crate::region::build_tile_cache_regions;
    use crate::tile_cache_data::{
        calc_layer_connections, TileCacheLayer, TileCacheLayerHeader, TILECACHE_NULL_AREA,
        TILECACHE_WALKABLE_AREA,
    };

    fn contour_set(points: &[(i32, i32, u8)]) -> TileCacheContourSet {
        TileCacheContourSet {
            conts: vec![TileCacheContour {
                verts: points
                    .iter()
                    .map(|&(x, z, flags)| TileCacheContourVertex::new(x, 0, z, flags))
                    .collect(),
                reg: 0,
                area: TILECACHE_WALKABLE_AREA,
            }],
        }
    }

    /// Twice the x/z area of a polygon
    fn poly_area2(mesh: &TileCachePolyMesh, i: usize) -> i32 {
        let p = mesh.poly_verts(i);
        let mut sum = 0;
        for j in 0..p.len() {
            let a = mesh.vertex(p[j] as usize);
            let b = mesh.vertex(p[(j + 1) % p.len()] as usize);
            sum += a[0] as i32 * b[2] as i32 - b[0] as i32 * a[2] as i32;
        }
        sum.abs()
    }

    fn total_area2(mesh: &TileCachePolyMesh) -> i32 {
        (0..mesh.npolys).map(|i| poly_area2(mesh, i)).sum()
    }

    /// Flat layer whose walkable cells are picked by `walkable`
    fn masked_layer(w: usize, h: usize, walkable: impl Fn(usize, usize) -> bool) -> TileCacheLayer {
        let header = TileCacheLayerHeader {
            width: w as u8,
            height: h as u8,
            maxx: (w - 1) as u8,
            maxy: (h - 1) as u8,
            ..Default::default()
        };
        let heights = vec![0u8; w * h];
        let areas: Vec<u8> = (0..w * h)
            .map(|i| {
                if walkable(i % w, i / w) {
                    TILECACHE_WALKABLE_AREA
                } else {
                    TILECACHE_NULL_AREA
                }
            })
            .collect();
        let cons = calc_layer_connections(w, h, &heights, &areas, 1, 0);
        let mut layer = TileCacheLayer::new(header, heights, areas, cons).unwrap();
        build_tile_cache_regions(&mut layer, 1).unwrap();
        layer
    }

    const HEXAGON: [(i32, i32, u8); 6] = [
        (0, 2, CONTOUR_NO_PORTAL),
        (0, 6, CONTOUR_NO_PORTAL),
        (4, 8, CONTOUR_NO_PORTAL),
        (8, 6, CONTOUR_NO_PORTAL),
        (8, 2, CONTOUR_NO_PORTAL),
        (4, 0, CONTOUR_NO_PORTAL),
    ];

    #[test]
    fn test_triangulate_square() {
        let pts = [[0, 0, 0], [0, 0, 8], [8, 0, 8], [8, 0, 0]];
        let mut indices = vec![0, 1, 2, 3];
        let mut tris = Vec::new();
        assert_eq!(triangulate(&pts, &mut indices, &mut tris), 2);
    }

    #[test]
    fn test_triangulate_without_ear_is_negative() {
        // Wrong winding, no vertex is convex
        let pts = [[0, 0, 0], [8, 0, 0], [8, 0, 8], [0, 0, 8]];
        let mut indices = vec![0, 1, 2, 3];
        let mut tris = Vec::new();
        assert!(triangulate(&pts, &mut indices, &mut tris) <= 0);
    }

    #[test]
    fn test_convex_contour_single_polygon() {
        let mesh = build_tile_cache_poly_mesh(&contour_set(&HEXAGON), 6).unwrap();
        assert_eq!(mesh.npolys, 1);
        assert_eq!(mesh.nverts, 6);
        assert_eq!(mesh.poly_verts(0).len(), 6);
        assert_eq!(total_area2(&mesh), 96);
        assert!(mesh.poly_neis(0).iter().all(|&n| n == TILECACHE_NULL_IDX));
    }

    #[test]
    fn test_small_nvp_splits_with_matching_adjacency() {
        for nvp in [3, 4] {
            let mesh = build_tile_cache_poly_mesh(&contour_set(&HEXAGON), nvp).unwrap();
            assert!(mesh.npolys >= 2);
            assert_eq!(total_area2(&mesh), 96);

            let mut internal = 0;
            for i in 0..mesh.npolys {
                let verts = mesh.poly_verts(i);
                for (j, &nei) in mesh.poly_neis(i).iter().enumerate().take(verts.len()) {
                    if nei == TILECACHE_NULL_IDX {
                        continue;
                    }
                    internal += 1;
                    let (a, b) = (verts[j], verts[(j + 1) % verts.len()]);
                    let other = mesh.poly_verts(nei as usize);
                    let back = (0..other.len())
                        .find(|&k| other[k] == b && other[(k + 1) % other.len()] == a)
                        .expect("shared edge missing on the neighbour");
                    assert_eq!(mesh.poly_neis(nei as usize)[back], i as u16);
                }
            }
            // Every internal edge is seen once from each side
            assert_eq!(internal, 2 * (mesh.npolys - 1));
        }
    }

    #[test]
    fn test_removable_vertex_is_removed() {
        let cset = contour_set(&[
            (0, 0, CONTOUR_NO_PORTAL),
            (0, 4, CONTOUR_NO_PORTAL | CONTOUR_REMOVABLE),
            (0, 8, CONTOUR_NO_PORTAL),
            (8, 8, CONTOUR_NO_PORTAL),
            (8, 0, CONTOUR_NO_PORTAL),
        ]);
        let mesh = build_tile_cache_poly_mesh(&cset, 6).unwrap();
        assert_eq!(mesh.nverts, 4);
        assert!(mesh.npolys >= 1);
        assert_eq!(total_area2(&mesh), 128);
        for i in 0..mesh.npolys {
            assert!(mesh.poly_verts(i).iter().all(|&v| (v as usize) < mesh.nverts));
        }
        assert!((0..mesh.nverts).all(|i| mesh.vertex(i) != [0, 0, 4]));
    }

    #[test]
    fn test_triangle_tip_is_kept() {
        let cset = contour_set(&[
            (0, 0, CONTOUR_NO_PORTAL | CONTOUR_REMOVABLE),
            (0, 8, CONTOUR_NO_PORTAL),
            (8, 0, CONTOUR_NO_PORTAL),
        ]);
        let mesh = build_tile_cache_poly_mesh(&cset, 6).unwrap();
        assert_eq!(mesh.nverts, 3);
        assert_eq!(mesh.npolys, 1);
    }

    #[test]
    fn test_flat_tile_with_portal() {
        let w = 8;
        let header = TileCacheLayerHeader {
            width: w as u8,
            height: w as u8,
            maxx: (w - 1) as u8,
            maxy: (w - 1) as u8,
            ..Default::default()
        };
        let mut cons = vec![0u8; w * w];
        for z in 0..w {
            for x in 0..w {
                let c = &mut cons[x + z * w];
                if x > 0 {
                    *c |= 1;
                }
                if z + 1 < w {
                    *c |= 1 << 1;
                }
                if x + 1 < w {
                    *c |= 1 << 2;
                } else {
                    // Portal towards +x
                    *c |= 1 << (4 + 2);
                }
                if z > 0 {
                    *c |= 1 << 3;
                }
            }
        }
        let mut layer = TileCacheLayer::new(
            header,
            vec![0; w * w],
            vec![TILECACHE_WALKABLE_AREA; w * w],
            cons,
        )
        .unwrap();
        build_tile_cache_regions(&mut layer, 1).unwrap();
        let cset = build_tile_cache_contours(&layer, 1, 1.3);
        let mesh = build_tile_cache_poly_mesh(&cset, 6).unwrap();

        assert_eq!(mesh.npolys, 1);
        let verts = mesh.poly_verts(0);
        assert_eq!(verts.len(), 4);
        let neis = mesh.poly_neis(0);
        let portals: Vec<usize> = (0..4)
            .filter(|&j| neis[j] == TILECACHE_PORTAL_FLAG | 2)
            .collect();
        assert_eq!(portals.len(), 1);
        let j = portals[0];
        assert_eq!(mesh.vertex(verts[j] as usize)[0], 8);
        assert_eq!(mesh.vertex(verts[(j + 1) % 4] as usize)[0], 8);
    }

    #[test]
    fn test_thin_strip_is_fully_meshed() {
        let layer = masked_layer(8, 1, |_, _| true);

        let cset = build_tile_cache_contours(&layer, 1, 0.5);
        let corners: Vec<(i32, i32)> = cset.conts[0].verts.iter().map(|v| (v.x, v.z)).collect();
        assert_eq!(corners, vec![(0, 0), (0, 1), (8, 1), (8, 0)]);

        let mesh = build_tile_cache_poly_mesh(&cset, 6).unwrap();
        assert_eq!(mesh.npolys, 1);
        assert_eq!(total_area2(&mesh), 16);
    }

    #[test]
    fn test_comb_keeps_every_tooth() {
        // Spine along z = 0 with teeth rising from every even column
        let layer = masked_layer(8, 8, |x, z| z == 0 || x % 2 == 0);
        let walkable = layer.areas.iter().filter(|&&a| a != TILECACHE_NULL_AREA).count();
        assert_eq!(walkable, 36);
        assert_eq!(layer.reg_count, 1);

        let cset = build_tile_cache_contours(&layer, 1, 0.0);
        let xs: Vec<i32> = cset.conts[0].verts.iter().map(|v| v.x).collect();
        for tooth in [0, 2, 4, 6] {
            assert!(cset.conts[0]
                .verts
                .iter()
                .any(|v| v.x == tooth + 1 && v.z == 8));
        }
        assert!(xs.contains(&8));

        let mesh = build_tile_cache_poly_mesh(&cset, 6).unwrap();
        assert_eq!(total_area2(&mesh), 2 * walkable as i32);
    }

    #[test]
    fn test_invalid_nvp() {
        assert!(build_tile_cache_poly_mesh(&contour_set(&HEXAGON), 2).is_err());
    }
}
