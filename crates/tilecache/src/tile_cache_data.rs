//! Tile cache layer data and its compressed blob format
//!
//! A tile blob is an uncompressed little-endian header followed, at the
//! next 4-byte boundary, by the compressed height, area and connection grids.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tilecache_common::{align4, Error, Result};

use crate::compressor::TileCacheCompressor;

/// Magic number for tile cache layers ('DTLR')
pub const TILECACHE_MAGIC: u32 =
    (b'D' as u32) << 24 | (b'T' as u32) << 16 | (b'L' as u32) << 8 | b'R' as u32;

/// Version number for tile cache data format
pub const TILECACHE_VERSION: u32 = 1;

/// Area id of cells that cannot be walked on
pub const TILECACHE_NULL_AREA: u8 = 0;
/// Default area id of walkable cells
pub const TILECACHE_WALKABLE_AREA: u8 = 63;
/// Marker for an unused vertex or neighbour slot
pub const TILECACHE_NULL_IDX: u16 = 0xffff;

/// Size of the serialized header in bytes
pub const TILECACHE_LAYER_HEADER_SIZE: usize = 54;

/// Tile cache layer header
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileCacheLayerHeader {
    /// Magic number for validation
    pub magic: u32,
    /// Version of the tile cache format
    pub version: u32,
    /// Tile position X
    pub tx: i32,
    /// Tile position Y
    pub ty: i32,
    /// Tile layer
    pub tlayer: i32,
    /// Bounding box minimum
    pub bmin: [f32; 3],
    /// Bounding box maximum
    pub bmax: [f32; 3],
    /// Lowest height in the layer (in cells)
    pub hmin: u16,
    /// Highest height in the layer (in cells)
    pub hmax: u16,
    /// Width of the layer (in cells)
    pub width: u8,
    /// Height of the layer (in cells)
    pub height: u8,
    /// Usable sub-region, minimum x cell
    pub minx: u8,
    /// Usable sub-region, maximum x cell
    pub maxx: u8,
    /// Usable sub-region, minimum y cell
    pub miny: u8,
    /// Usable sub-region, maximum y cell
    pub maxy: u8,
}

impl Default for TileCacheLayerHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl TileCacheLayerHeader {
    /// Creates a new tile cache layer header
    pub fn new() -> Self {
        Self {
            magic: TILECACHE_MAGIC,
            version: TILECACHE_VERSION,
            tx: 0,
            ty: 0,
            tlayer: 0,
            bmin: [0.0; 3],
            bmax: [0.0; 3],
            hmin: 0,
            hmax: 0,
            width: 0,
            height: 0,
            minx: 0,
            maxx: 0,
            miny: 0,
            maxy: 0,
        }
    }

    /// Number of cells in the layer grids
    pub fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Validates the header
    pub fn validate(&self) -> Result<()> {
        if self.magic != TILECACHE_MAGIC {
            return Err(Error::Codec(format!("bad magic {:#x}", self.magic)));
        }
        if self.version != TILECACHE_VERSION {
            return Err(Error::Codec(format!("unsupported version {}", self.version)));
        }
        Ok(())
    }

    /// Serializes the header
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_i32::<LittleEndian>(self.tx)?;
        writer.write_i32::<LittleEndian>(self.ty)?;
        writer.write_i32::<LittleEndian>(self.tlayer)?;
        for v in self.bmin.iter().chain(self.bmax.iter()) {
            writer.write_f32::<LittleEndian>(*v)?;
        }
        writer.write_u16::<LittleEndian>(self.hmin)?;
        writer.write_u16::<LittleEndian>(self.hmax)?;
        writer.write_all(&[
            self.width,
            self.height,
            self.minx,
            self.maxx,
            self.miny,
            self.maxy,
        ])?;
        Ok(())
    }

    /// Deserializes and validates the header
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        let version = reader.read_u32::<LittleEndian>()?;
        let tx = reader.read_i32::<LittleEndian>()?;
        let ty = reader.read_i32::<LittleEndian>()?;
        let tlayer = reader.read_i32::<LittleEndian>()?;
        let mut bmin = [0.0f32; 3];
        for v in &mut bmin {
            *v = reader.read_f32::<LittleEndian>()?;
        }
        let mut bmax = [0.0f32; 3];
        for v in &mut bmax {
            *v = reader.read_f32::<LittleEndian>()?;
        }
        let hmin = reader.read_u16::<LittleEndian>()?;
        let hmax = reader.read_u16::<LittleEndian>()?;
        let mut dims = [0u8; 6];
        reader.read_exact(&mut dims)?;

        let header = Self {
            magic,
            version,
            tx,
            ty,
            tlayer,
            bmin,
            bmax,
            hmin,
            hmax,
            width: dims[0],
            height: dims[1],
            minx: dims[2],
            maxx: dims[3],
            miny: dims[4],
            maxy: dims[5],
        };
        header.validate()?;
        Ok(header)
    }

    /// Reads the header at the start of a tile blob
    pub fn from_blob(data: &[u8]) -> Result<Self> {
        if data.len() < TILECACHE_LAYER_HEADER_SIZE {
            return Err(Error::Codec(format!(
                "tile blob of {} bytes is shorter than its header",
                data.len()
            )));
        }
        Self::read_from(&mut Cursor::new(data))
    }
}

/// Decompressed tile cache layer
#[derive(Debug, Clone)]
pub struct TileCacheLayer {
    /// Header information
    pub header: TileCacheLayerHeader,
    /// Number of regions after partitioning
    pub reg_count: u8,
    /// Cell heights
    pub heights: Vec<u8>,
    /// Cell area ids
    pub areas: Vec<u8>,
    /// Cell connections: low nibble neighbour mask, high nibble portal mask
    pub cons: Vec<u8>,
    /// Cell region ids, 0xff when unassigned
    pub regs: Vec<u8>,
}

impl TileCacheLayer {
    /// Creates a layer from its grids
    pub fn new(
        header: TileCacheLayerHeader,
        heights: Vec<u8>,
        areas: Vec<u8>,
        cons: Vec<u8>,
    ) -> Result<Self> {
        let n = header.cell_count();
        if heights.len() != n || areas.len() != n || cons.len() != n {
            return Err(Error::InvalidParam(format!(
                "layer grids must hold {} cells ({}, {}, {})",
                n,
                heights.len(),
                areas.len(),
                cons.len()
            )));
        }
        Ok(Self {
            header,
            reg_count: 0,
            heights,
            areas,
            cons,
            regs: vec![0xff; n],
        })
    }

    /// Width of the grid in cells
    pub fn width(&self) -> usize {
        self.header.width as usize
    }

    /// Height of the grid in cells
    pub fn height(&self) -> usize {
        self.header.height as usize
    }
}

/// Packs layer grids into a compressed tile blob suitable for `TileCache::add_tile`
pub fn build_tile_cache_layer(
    compressor: &dyn TileCacheCompressor,
    header: &TileCacheLayerHeader,
    heights: &[u8],
    areas: &[u8],
    cons: &[u8],
) -> Result<Vec<u8>> {
    let n = header.cell_count();
    if heights.len() != n || areas.len() != n || cons.len() != n {
        return Err(Error::InvalidParam(format!(
            "layer grids must hold {} cells",
            n
        )));
    }

    let mut grids = Vec::with_capacity(n * 3);
    grids.extend_from_slice(heights);
    grids.extend_from_slice(areas);
    grids.extend_from_slice(cons);
    let payload = compressor.compress(&grids)?;

    let payload_offset = align4(TILECACHE_LAYER_HEADER_SIZE);
    let mut blob = Vec::with_capacity(payload_offset + payload.len());
    header.write_to(&mut blob)?;
    blob.resize(payload_offset, 0);
    blob.extend_from_slice(&payload);
    Ok(blob)
}

/// Unpacks a compressed tile blob into a layer
pub fn decompress_tile_cache_layer(
    compressor: &dyn TileCacheCompressor,
    data: &[u8],
) -> Result<TileCacheLayer> {
    let header = TileCacheLayerHeader::from_blob(data)?;
    let payload_offset = align4(TILECACHE_LAYER_HEADER_SIZE);
    let payload = data.get(payload_offset..).unwrap_or(&[]);
    let n = header.cell_count();
    let mut grids = compressor.decompress(payload, n * 3)?;

    if grids.len() != n * 3 {
        return Err(Error::Codec(format!(
            "expected {} grid bytes, got {}",
            n * 3,
            grids.len()
        )));
    }
    let cons = grids.split_off(n * 2);
    let areas = grids.split_off(n);
    TileCacheLayer::new(header, grids, areas, cons)
}

/// Computes the connection grid of a layer.
///
/// Low nibble: bit `dir` is set when the neighbour across `dir` (0 = -x,
/// 1 = +y, 2 = +x, 3 = -y) is inside the grid, walkable and within
/// `walkable_climb` height. High nibble: for walkable border cells, bit
/// `dir` is set for each direction in `portal_dirs`, marking an edge that
/// continues into the adjacent tile.
pub fn calc_layer_connections(
    width: usize,
    height: usize,
    heights: &[u8],
    areas: &[u8],
    walkable_climb: i32,
    portal_dirs: u8,
) -> Vec<u8> {
    const DX: [i32; 4] = [-1, 0, 1, 0];
    const DY: [i32; 4] = [0, 1, 0, -1];

    let mut cons = vec![0u8; width * height];
    for y in 0..height {
        for x in 0..width {
            let idx = x + y * width;
            if areas[idx] == TILECACHE_NULL_AREA {
                continue;
            }
            for dir in 0..4 {
                let nx = x as i32 + DX[dir];
                let ny = y as i32 + DY[dir];
                if nx < 0 || ny < 0 || nx >= width as i32 || ny >= height as i32 {
                    if portal_dirs & (1 << dir) != 0 {
                        cons[idx] |= 1 << (dir + 4);
                    }
                    continue;
                }
                let nidx = nx as usize + ny as usize * width;
                if areas[nidx] != TILECACHE_NULL_AREA
                    && (heights[idx] as i32 - heights[nidx] as i32).abs() <= walkable_climb
                {
                    cons[idx] |= 1 << dir;
                }
            }
        }
    }
    cons
}
