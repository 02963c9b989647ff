//! Common utilities shared by the tile cache crates

mod geometry;
mod math;

pub use geometry::*;
pub use math::*;

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("invalid tile reference: {0:#x}")]
    InvalidTileRef(u32),

    #[error("invalid obstacle reference: {0:#x}")]
    InvalidObstacleRef(u32),

    #[error("buffer too small: {0}")]
    BufferTooSmall(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("tile layer codec error: {0}")]
    Codec(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for tile cache operations
pub type Result<T> = std::result::Result<T, Error>;
