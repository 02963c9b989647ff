//! Monotone region partitioning of a tile layer

use tilecache_common::{Error, Result};

use crate::tile_cache_data::{TileCacheLayer, TILECACHE_NULL_AREA};

const NULL_REG: u8 = 0xff;

#[derive(Debug, Clone, Copy)]
struct SweepSpan {
    /// Number of cells connected to `nei` in the previous row
    ns: u16,
    /// Final region id
    id: u8,
    /// Single neighbour region in the previous row, or NULL_REG
    nei: u8,
}

impl Default for SweepSpan {
    fn default() -> Self {
        Self {
            ns: 0,
            id: NULL_REG,
            nei: NULL_REG,
        }
    }
}

#[derive(Debug, Clone)]
struct MonotoneRegion {
    area: usize,
    neis: Vec<u8>,
    reg_id: u8,
    area_id: u8,
}

fn is_connected(layer: &TileCacheLayer, ia: usize, ib: usize, walkable_climb: i32) -> bool {
    layer.areas[ia] == layer.areas[ib]
        && (layer.heights[ia] as i32 - layer.heights[ib] as i32).abs() <= walkable_climb
}

fn add_unique_last(neis: &mut Vec<u8>, v: u8) {
    if neis.last() != Some(&v) {
        neis.push(v);
    }
}

/// Whether relabelling `old_reg_id` to `new_reg_id` leaves a single point of contact
fn can_merge(old_reg_id: u8, new_reg_id: u8, regs: &[MonotoneRegion]) -> bool {
    let mut count = 0;
    for reg in regs.iter().filter(|r| r.reg_id == old_reg_id) {
        count += reg
            .neis
            .iter()
            .filter(|&&nei| regs[nei as usize].reg_id == new_reg_id)
            .count();
    }
    count == 1
}

/// Partitions the walkable cells of a layer into at most 255 regions.
///
/// Writes the region of every cell into `layer.regs` (0xff for unwalkable
/// cells) and the region count into `layer.reg_count`.
pub fn build_tile_cache_regions(layer: &mut TileCacheLayer, walkable_climb: i32) -> Result<()> {
    let w = layer.width();
    let h = layer.height();

    layer.regs.fill(NULL_REG);

    let mut sweeps = vec![SweepSpan::default(); w.max(1)];
    let mut prev_count = [0u16; 256];
    let mut reg_id: usize = 0;

    for y in 0..h {
        prev_count[..reg_id].fill(0);
        let mut sweep_id: usize = 0;

        for x in 0..w {
            let idx = x + y * w;
            if layer.areas[idx] == TILECACHE_NULL_AREA {
                continue;
            }

            let mut sid = NULL_REG;

            // -x
            if x > 0 && is_connected(layer, idx, idx - 1, walkable_climb) {
                sid = layer.regs[idx - 1];
            }

            if sid == NULL_REG {
                sid = sweep_id as u8;
                sweep_id += 1;
                sweeps[sid as usize].nei = NULL_REG;
                sweeps[sid as usize].ns = 0;
            }

            // -y
            if y > 0 && is_connected(layer, idx, idx - w, walkable_climb) {
                let nr = layer.regs[idx - w];
                if nr != NULL_REG {
                    let sweep = &mut sweeps[sid as usize];
                    // Set neighbour when first valid neighbour is encountered.
                    if sweep.ns == 0 {
                        sweep.nei = nr;
                    }
                    if sweep.nei == nr {
                        sweep.ns += 1;
                        prev_count[nr as usize] += 1;
                    } else {
                        // More than one neighbour region, cannot inherit.
                        sweep.nei = NULL_REG;
                    }
                }
            }

            layer.regs[idx] = sid;
        }

        // Inherit the neighbour region only when every overlap belongs to this span.
        for sweep in sweeps.iter_mut().take(sweep_id) {
            if sweep.nei != NULL_REG && prev_count[sweep.nei as usize] == sweep.ns {
                sweep.id = sweep.nei;
            } else {
                if reg_id == NULL_REG as usize {
                    return Err(Error::BufferTooSmall(
                        "layer needs more than 255 regions".to_string(),
                    ));
                }
                sweep.id = reg_id as u8;
                reg_id += 1;
            }
        }

        for x in 0..w {
            let idx = x + y * w;
            if layer.regs[idx] != NULL_REG {
                layer.regs[idx] = sweeps[layer.regs[idx] as usize].id;
            }
        }
    }

    // Region adjacency
    let nregs = reg_id;
    let mut regs: Vec<MonotoneRegion> = (0..nregs)
        .map(|i| MonotoneRegion {
            area: 0,
            neis: Vec::new(),
            reg_id: i as u8,
            area_id: TILECACHE_NULL_AREA,
        })
        .collect();

    for y in 0..h {
        for x in 0..w {
            let idx = x + y * w;
            let ri = layer.regs[idx];
            if ri == NULL_REG {
                continue;
            }

            regs[ri as usize].area += 1;
            regs[ri as usize].area_id = layer.areas[idx];

            // Update neighbours
            if y > 0 && is_connected(layer, idx, idx - w, walkable_climb) {
                let rai = layer.regs[idx - w];
                if rai != NULL_REG && rai != ri {
                    add_unique_last(&mut regs[ri as usize].neis, rai);
                    add_unique_last(&mut regs[rai as usize].neis, ri);
                }
            }
        }
    }

    // Merge each region into its largest safe neighbour of the same area type
    for i in 0..nregs {
        let mut merge_area = 0;
        let mut merge: Option<u8> = None;
        for &nei in &regs[i].neis {
            let regn = &regs[nei as usize];
            if regs[i].reg_id == regn.reg_id || regs[i].area_id != regn.area_id {
                continue;
            }
            if regn.area > merge_area && can_merge(regs[i].reg_id, regn.reg_id, &regs) {
                merge_area = regn.area;
                merge = Some(nei);
            }
        }

        if let Some(nei) = merge {
            let old_id = regs[i].reg_id;
            let new_id = regs[nei as usize].reg_id;
            for reg in regs.iter_mut().filter(|r| r.reg_id == old_id) {
                reg.reg_id = new_id;
            }
        }
    }

    // Compact ids
    let mut remap = [NULL_REG; 256];
    for reg in &regs {
        remap[reg.reg_id as usize] = 0;
    }
    let mut next_id: u8 = 0;
    for slot in remap.iter_mut().filter(|s| **s == 0) {
        *slot = next_id;
        next_id += 1;
    }
    for reg in &mut regs {
        reg.reg_id = remap[reg.reg_id as usize];
    }
    layer.reg_count = next_id;

    for r in layer.regs.iter_mut().filter(|r| **r != NULL_REG) {
        *r = regs[*r as usize].reg_id;
    }

    Ok(())
}
