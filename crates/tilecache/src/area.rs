//! Stamping obstacle shapes into a decompressed layer
//!
//! Marking only ever clears cells to [`TILECACHE_NULL_AREA`]. Every shape
//! additionally requires the cell height to lie within its vertical extent.

use glam::Vec3;
use tilecache_common::sqr;

use crate::obstacle::ObstacleShape;
use crate::tile_cache_data::{TileCacheLayer, TILECACHE_NULL_AREA};

/// Cell-space footprint of a shape clamped to the layer, or `None` when it misses the layer
struct Footprint {
    minx: i32,
    maxx: i32,
    minz: i32,
    maxz: i32,
    miny: i32,
    maxy: i32,
}

impl Footprint {
    fn new(layer: &TileCacheLayer, orig: Vec3, cs: f32, ch: f32, bmin: Vec3, bmax: Vec3) -> Option<Self> {
        let w = layer.width() as i32;
        let h = layer.height() as i32;
        let ics = 1.0 / cs;
        let ich = 1.0 / ch;

        let minx = ((bmin.x - orig.x) * ics).floor() as i32;
        let miny = ((bmin.y - orig.y) * ich).floor() as i32;
        let minz = ((bmin.z - orig.z) * ics).floor() as i32;
        let maxx = ((bmax.x - orig.x) * ics).floor() as i32;
        let maxy = ((bmax.y - orig.y) * ich).floor() as i32;
        let maxz = ((bmax.z - orig.z) * ics).floor() as i32;

        if maxx < 0 || minx >= w || maxz < 0 || minz >= h {
            return None;
        }

        Some(Self {
            minx: minx.max(0),
            maxx: maxx.min(w - 1),
            minz: minz.max(0),
            maxz: maxz.min(h - 1),
            miny,
            maxy,
        })
    }

    /// Clears every cell in the footprint accepted by `inside` whose height is in range
    fn clear(&self, layer: &mut TileCacheLayer, mut inside: impl FnMut(i32, i32) -> bool) {
        let w = layer.width();
        for z in self.minz..=self.maxz {
            for x in self.minx..=self.maxx {
                if !inside(x, z) {
                    continue;
                }
                let idx = x as usize + z as usize * w;
                let y = layer.heights[idx] as i32;
                if y < self.miny || y > self.maxy {
                    continue;
                }
                layer.areas[idx] = TILECACHE_NULL_AREA;
            }
        }
    }
}

/// Marks the cells covered by an upright cylinder as non-walkable
pub fn mark_cylinder_area(
    layer: &mut TileCacheLayer,
    orig: Vec3,
    cs: f32,
    ch: f32,
    pos: Vec3,
    radius: f32,
    height: f32,
) {
    let bmin = Vec3::new(pos.x - radius, pos.y, pos.z - radius);
    let bmax = Vec3::new(pos.x + radius, pos.y + height, pos.z + radius);
    let Some(footprint) = Footprint::new(layer, orig, cs, ch, bmin, bmax) else {
        return;
    };

    let r2 = sqr(radius / cs + 0.5);
    let px = (pos.x - orig.x) / cs;
    let pz = (pos.z - orig.z) / cs;

    footprint.clear(layer, |x, z| {
        let dx = x as f32 + 0.5 - px;
        let dz = z as f32 + 0.5 - pz;
        dx * dx + dz * dz <= r2
    });
}

/// Marks the cells inside an axis-aligned box as non-walkable
pub fn mark_box_area(layer: &mut TileCacheLayer, orig: Vec3, cs: f32, ch: f32, bmin: Vec3, bmax: Vec3) {
    if let Some(footprint) = Footprint::new(layer, orig, cs, ch, bmin, bmax) {
        footprint.clear(layer, |_, _| true);
    }
}

/// Marks the cells inside a box rotated around the Y axis as non-walkable
pub fn mark_oriented_box_area(
    layer: &mut TileCacheLayer,
    orig: Vec3,
    cs: f32,
    ch: f32,
    center: Vec3,
    half_extents: Vec3,
    rot_aux: [f32; 2],
) {
    let ics = 1.0 / cs;
    let max_r = 1.41 * half_extents.x.max(half_extents.z);
    let ext = Vec3::new(max_r, half_extents.y, max_r);
    let Some(footprint) = Footprint::new(layer, orig, cs, ch, center - ext, center + ext) else {
        return;
    };

    let cx = (center.x - orig.x) * ics;
    let cz = (center.z - orig.z) * ics;
    let xhalf = half_extents.x * ics + 0.5;
    let zhalf = half_extents.z * ics + 0.5;

    footprint.clear(layer, |x, z| {
        let x2 = 2.0 * (x as f32 - cx);
        let z2 = 2.0 * (z as f32 - cz);
        let xrot = rot_aux[1] * x2 + rot_aux[0] * z2;
        let zrot = rot_aux[1] * z2 - rot_aux[0] * x2;
        xrot.abs() <= xhalf && zrot.abs() <= zhalf
    });
}

/// Stamps an obstacle shape into a layer whose origin is `orig`
pub fn mark_obstacle_area(layer: &mut TileCacheLayer, orig: Vec3, cs: f32, ch: f32, shape: &ObstacleShape) {
    match shape {
        ObstacleShape::Cylinder {
            pos,
            radius,
            height,
        } => mark_cylinder_area(layer, orig, cs, ch, Vec3::from(*pos), *radius, *height),
        ObstacleShape::Box { bmin, bmax } => {
            mark_box_area(layer, orig, cs, ch, Vec3::from(*bmin), Vec3::from(*bmax))
        }
        ObstacleShape::OrientedBox {
            center,
            half_extents,
            rot_aux,
        } => mark_oriented_box_area(
            layer,
            orig,
            cs,
            ch,
            Vec3::from(*center),
            Vec3::from(*half_extents),
            *rot_aux,
        ),
    }
}
