//! Tile loops over a pixel set held by a [PixelsService].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{Result, TileError};
use crate::pixels::{PixelsDescriptor, PixelsRef};
use crate::service::{PixelStore, PixelsService};
use crate::tiles::{self, TileCoord, TileData, TileIteration, TileLoop};

type SharedPixels = Arc<Mutex<Option<PixelsRef>>>;

fn lock(pixels: &SharedPixels) -> MutexGuard<'_, Option<PixelsRef>> {
    pixels.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A [TileLoop] bound to one pixel set of a [PixelsService].
///
/// The loop keeps the current reference to its pixel set. Closing the tile data
/// of a traversal saves the store and replaces that reference with the saved
/// descriptor, so [pixels](RpsTileLoop::pixels) reflects the last save.
pub struct RpsTileLoop<S: PixelsService> {
    service: S,
    pixels: SharedPixels,
}

impl<S: PixelsService> RpsTileLoop<S> {
    pub fn new(service: S, pixels: impl Into<PixelsRef>) -> Self {
        Self {
            service,
            pixels: Arc::new(Mutex::new(Some(pixels.into()))),
        }
    }

    /// A loop with no pixel set yet; traversals fail until one is set.
    pub fn unbound(service: S) -> Self {
        Self {
            service,
            pixels: Arc::new(Mutex::new(None)),
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn pixels(&self) -> Option<PixelsRef> {
        lock(&self.pixels).clone()
    }

    pub fn set_pixels(&mut self, pixels: impl Into<PixelsRef>) {
        *lock(&self.pixels) = Some(pixels.into());
    }

    /// Fetch the descriptor unless it is already loaded.
    pub async fn ensure_loaded(&self) -> Result<PixelsDescriptor> {
        let id = match lock(&self.pixels).as_ref() {
            None => return Err(TileError::MissingPixelsId),
            Some(PixelsRef::Loaded(descriptor)) => return Ok(descriptor.clone()),
            Some(PixelsRef::Unloaded(id)) => *id,
        };
        debug!("Loading {}", id);
        let descriptor = self.service.load_pixels(id).await?;
        *lock(&self.pixels) = Some(descriptor.clone().into());
        Ok(descriptor)
    }

    /// Fetch the descriptor again, discarding the one held.
    pub async fn refresh(&self) -> Result<PixelsDescriptor> {
        let id = lock(&self.pixels)
            .as_ref()
            .map(PixelsRef::id)
            .ok_or(TileError::MissingPixelsId)?;
        let descriptor = self.service.load_pixels(id).await?;
        *lock(&self.pixels) = Some(descriptor.clone().into());
        Ok(descriptor)
    }

    /// Visit every tile of the pixel set and return the number of tiles visited.
    pub async fn for_each_tile<I>(
        &mut self,
        tile_width: u32,
        tile_height: u32,
        iteration: &mut I,
    ) -> Result<u64>
    where
        I: TileIteration<RpsTileData<S::Store>> + ?Sized,
    {
        let descriptor = self.ensure_loaded().await?;
        tiles::for_each_tile(
            self,
            descriptor.dimensions,
            tile_width,
            tile_height,
            iteration,
        )
        .await
    }

    /// [for_each_tile](Self::for_each_tile) with the service's default tile size.
    pub async fn for_each_default_tile<I>(&mut self, iteration: &mut I) -> Result<u64>
    where
        I: TileIteration<RpsTileData<S::Store>> + ?Sized,
    {
        let (tile_width, tile_height) = self.service.default_tile_size();
        self.for_each_tile(tile_width, tile_height, iteration).await
    }
}

#[async_trait]
impl<S: PixelsService> TileLoop for RpsTileLoop<S> {
    type Data = RpsTileData<S::Store>;

    async fn create_data(&mut self) -> Result<Self::Data> {
        let id = lock(&self.pixels)
            .as_ref()
            .map(PixelsRef::id)
            .ok_or(TileError::MissingPixelsId)?;
        let store = self.service.open_store(id, true).await?;
        Ok(RpsTileData {
            store: Some(store),
            pixels: self.pixels.clone(),
        })
    }
}

/// Tile data backed by an open [PixelStore].
pub struct RpsTileData<P: PixelStore> {
    /// `None` once closed.
    store: Option<P>,
    pixels: SharedPixels,
}

impl<P: PixelStore> RpsTileData<P> {
    pub fn is_open(&self) -> bool {
        self.store.is_some()
    }

    fn store(&mut self) -> Result<&mut P> {
        self.store.as_mut().ok_or(TileError::NotOpen)
    }
}

#[async_trait]
impl<P: PixelStore> TileData for RpsTileData<P> {
    async fn get_tile(&mut self, coord: TileCoord) -> Result<Bytes> {
        self.store()?.get_tile(coord).await
    }

    async fn set_tile(&mut self, buf: &[u8], coord: TileCoord) -> Result<()> {
        self.store()?.set_tile(buf, coord).await
    }

    /// Save the store, publish the saved descriptor to the owning loop, then
    /// release the store. The store is released even if saving fails.
    async fn close(&mut self) -> Result<()> {
        let Some(mut store) = self.store.take() else {
            return Ok(());
        };
        match store.save().await {
            Ok(descriptor) => {
                *lock(&self.pixels) = Some(descriptor.into());
                store.close().await
            }
            Err(err) => {
                if let Err(close_err) = store.close().await {
                    warn!("Failed to release pixel store after failed save: {}", close_err);
                }
                Err(err)
            }
        }
    }
}
