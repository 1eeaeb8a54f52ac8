//! The remote collaborator a tile loop reads from and writes to.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::pixels::{PixelsDescriptor, PixelsId};
use crate::tiles::TileCoord;

/// Tile edge used when the caller does not pick a tile size.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// A service holding pixel sets.
#[async_trait]
pub trait PixelsService: Send + Sync {
    type Store: PixelStore;

    async fn load_pixels(&self, id: PixelsId) -> Result<PixelsDescriptor>;

    /// Open a stateful tile handle on one pixel set.
    async fn open_store(&self, id: PixelsId, writable: bool) -> Result<Self::Store>;

    fn default_tile_size(&self) -> (u32, u32) {
        (DEFAULT_TILE_SIZE, DEFAULT_TILE_SIZE)
    }
}

/// An open handle on one pixel set.
#[async_trait]
pub trait PixelStore: Send {
    async fn get_tile(&mut self, coord: TileCoord) -> Result<Bytes>;

    async fn set_tile(&mut self, buf: &[u8], coord: TileCoord) -> Result<()>;

    /// Persist pending writes and return the descriptor as it now stands.
    async fn save(&mut self) -> Result<PixelsDescriptor>;

    async fn close(&mut self) -> Result<()>;
}
