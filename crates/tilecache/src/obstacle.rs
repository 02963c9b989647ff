//! Runtime obstacles and their lifecycle

use glam::Vec3;

use crate::tile_cache::TileRef;

/// Versioned obstacle handle: 16-bit salt in the high half, slot index in the low half
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ObstacleRef(pub u32);

impl ObstacleRef {
    /// Reference that never resolves
    pub const NULL: ObstacleRef = ObstacleRef(0);

    /// Packs a salt and slot index
    pub fn encode(salt: u16, idx: usize) -> Self {
        ObstacleRef((salt as u32) << 16 | (idx as u32 & 0xffff))
    }

    pub fn salt(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn index(self) -> usize {
        (self.0 & 0xffff) as usize
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Obstacle shape
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum ObstacleShape {
    /// Upright cylinder standing on `pos`
    Cylinder {
        /// Base center position
        pos: [f32; 3],
        /// Radius
        radius: f32,
        /// Height
        height: f32,
    },
    /// Axis-aligned box obstacle
    Box {
        /// Minimum bounds
        bmin: [f32; 3],
        /// Maximum bounds
        bmax: [f32; 3],
    },
    /// Oriented box obstacle (rotated in Y axis)
    OrientedBox {
        /// Center position
        center: [f32; 3],
        /// Half extents (width/2, height/2, depth/2)
        half_extents: [f32; 3],
        /// Rotation auxiliary values [cos(0.5*angle)*sin(-0.5*angle), cos(0.5*angle)*cos(0.5*angle) - 0.5]
        rot_aux: [f32; 2],
    },
}

impl ObstacleShape {
    /// Builds an oriented box from its rotation around the Y axis
    pub fn oriented_box(center: Vec3, half_extents: Vec3, y_radians: f32) -> Self {
        let cos_half = (y_radians * 0.5).cos();
        let sin_half = (y_radians * 0.5).sin();
        ObstacleShape::OrientedBox {
            center: center.to_array(),
            half_extents: half_extents.to_array(),
            rot_aux: [cos_half * -sin_half, cos_half * cos_half - 0.5],
        }
    }

    /// World-space bounds used to find the tiles the shape touches
    pub fn bounds(&self) -> (Vec3, Vec3) {
        match self {
            ObstacleShape::Cylinder {
                pos,
                radius,
                height,
            } => {
                let pos = Vec3::from(*pos);
                (
                    Vec3::new(pos.x - radius, pos.y, pos.z - radius),
                    Vec3::new(pos.x + radius, pos.y + height, pos.z + radius),
                )
            }
            ObstacleShape::Box { bmin, bmax } => (Vec3::from(*bmin), Vec3::from(*bmax)),
            ObstacleShape::OrientedBox {
                center,
                half_extents,
                ..
            } => {
                // Conservative over any rotation
                let max_r = 1.41 * half_extents[0].max(half_extents[2]);
                let center = Vec3::from(*center);
                let ext = Vec3::new(max_r, half_extents[1], max_r);
                (center - ext, center + ext)
            }
        }
    }
}

/// Obstacle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum ObstacleState {
    /// Slot is free
    Empty,
    /// Added, touched tiles still being rebuilt
    Processing,
    /// Fully applied to every touched tile
    Processed,
    /// Removal requested, touched tiles still being rebuilt
    Removing,
}

/// Obstacle in the tile cache
#[derive(Debug, Clone)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileCacheObstacle {
    /// Obstacle shape
    pub shape: ObstacleShape,
    /// Obstacle state
    pub state: ObstacleState,
    /// Salt value for reference generation, never 0
    pub salt: u16,
    /// Tiles overlapped when the add request was drained
    pub touched: Vec<TileRef>,
    /// Touched tiles not yet rebuilt for the current request
    pub pending: Vec<TileRef>,
}

impl TileCacheObstacle {
    pub(crate) fn new(shape: ObstacleShape) -> Self {
        Self {
            shape,
            state: ObstacleState::Empty,
            salt: 1,
            touched: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Whether the obstacle should be stamped into tiles it touches
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ObstacleState::Processing | ObstacleState::Processed
        )
    }

    pub(crate) fn bump_salt(&mut self) {
        self.salt = self.salt.wrapping_add(1);
        if self.salt == 0 {
            self.salt = 1;
        }
    }
}

/// Queued obstacle action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObstacleRequestAction {
    Add,
    Remove,
}

/// Obstacle change waiting for the next drain in `TileCache::update`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObstacleRequest {
    pub action: ObstacleRequestAction,
    pub reference: ObstacleRef,
}
