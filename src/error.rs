use std::fmt::Debug;
use thiserror::Error;

use crate::pixels::PixelsId;

/// Enum with all errors in this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TileError {
    /// Tile width or height of zero.
    #[error("Invalid tile size {width}x{height}")]
    InvalidTileSize { width: u32, height: u32 },

    /// The pixel set reference carries no identifier.
    #[error("Pixels reference has no identifier")]
    MissingPixelsId,

    /// Tile access before the resource was opened or after it was closed.
    #[error("Tile data is not open")]
    NotOpen,

    /// Write attempted through a handle opened read-only.
    #[error("Pixel store for {0} is read-only")]
    ReadOnly(PixelsId),

    #[error("Tile z={z} c={c} t={t} x={x} y={y} w={w} h={h} lies outside the pixel set")]
    OutOfBounds {
        z: u32,
        c: u32,
        t: u32,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
    },

    #[error("Tile buffer has {actual} bytes, expected {expected}")]
    BufferLength { expected: usize, actual: usize },

    #[error("Pixels {0} not found")]
    PixelsNotFound(PixelsId),

    #[error("Invalid pixels descriptor: {0}")]
    InvalidDescriptor(String),

    /// Error raised by a caller's iteration callback.
    #[error("Tile iteration failed: {0}")]
    Iteration(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, TileError>;
