pub mod error;
pub mod object;
pub mod pixels;
pub mod rps;
pub mod service;
pub mod tiles;

pub use error::{Result, TileError};
pub use object::{ObjectPixelStore, ObjectPixelsService, ServiceConfig};
pub use pixels::{Dimensions, PixelType, PixelsDescriptor, PixelsId, PixelsRef};
pub use rps::{RpsTileData, RpsTileLoop};
pub use service::{PixelStore, PixelsService, DEFAULT_TILE_SIZE};
pub use tiles::{for_each_tile, TileCoord, TileData, TileGrid, TileIteration, TileLoop};
