//! Tiled traversal of a five-dimensional pixel set.
//!
//! A [TileLoop] hands out one [TileData] per traversal, and [for_each_tile] walks
//! every (z, c, t) plane in tiles of a bounded size, calling a [TileIteration] for
//! each of them. Tiles are visited with T outermost, then C, then Z, then tile rows
//! and finally tile columns, so all tiles of one plane are contiguous.

use std::panic::{self, AssertUnwindSafe};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use tracing::{debug, trace, warn};

use crate::error::{Result, TileError};
use crate::pixels::{Dimensions, PixelType};

/// A rectangular region of one (z, c, t) plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub z: u32,
    pub c: u32,
    pub t: u32,
    pub x: u32,
    pub y: u32,
    /// Width of this tile, truncated at the right edge of the plane.
    pub w: u32,
    /// Height of this tile, truncated at the bottom edge of the plane.
    pub h: u32,
}

impl TileCoord {
    pub fn new(z: u32, c: u32, t: u32, x: u32, y: u32, w: u32, h: u32) -> Self {
        Self {
            z,
            c,
            t,
            x,
            y,
            w,
            h,
        }
    }

    /// The region covering the whole of plane (z, c, t).
    pub fn plane(z: u32, c: u32, t: u32, dims: &Dimensions) -> Self {
        Self::new(z, c, t, 0, 0, dims.size_x, dims.size_y)
    }

    pub fn byte_len(&self, pixel_type: PixelType) -> usize {
        self.w as usize * self.h as usize * pixel_type.bytes_per_pixel()
    }

    /// Whether the region lies entirely inside the pixel set.
    pub fn fits(&self, dims: &Dimensions) -> bool {
        dims.contains_plane(self.z, self.c, self.t)
            && self.x as u64 + self.w as u64 <= dims.size_x as u64
            && self.y as u64 + self.h as u64 <= dims.size_y as u64
    }
}

/// An open resource from which tiles can be read and into which they can be
/// written.
#[async_trait]
pub trait TileData: Send {
    /// Read `w * h` samples, row-major.
    async fn get_tile(&mut self, coord: TileCoord) -> Result<Bytes>;

    /// Write `buf` into the region. Persistence may be deferred until
    /// [close](TileData::close).
    async fn set_tile(&mut self, buf: &[u8], coord: TileCoord) -> Result<()>;

    /// Release the resource, persisting buffered writes.
    async fn close(&mut self) -> Result<()>;

    async fn get_plane(&mut self, z: u32, c: u32, t: u32, dims: &Dimensions) -> Result<Bytes> {
        self.get_tile(TileCoord::plane(z, c, t, dims)).await
    }

    async fn set_plane(
        &mut self,
        buf: &[u8],
        z: u32,
        c: u32,
        t: u32,
        dims: &Dimensions,
    ) -> Result<()> {
        self.set_tile(buf, TileCoord::plane(z, c, t, dims)).await
    }
}

/// Per-tile callback of [for_each_tile].
#[async_trait]
pub trait TileIteration<D: TileData + ?Sized>: Send {
    async fn run(&mut self, data: &mut D, coord: TileCoord, tile_index: u64) -> Result<()>;
}

/// Source of the [TileData] used by one traversal.
#[async_trait]
pub trait TileLoop: Send {
    type Data: TileData;

    async fn create_data(&mut self) -> Result<Self::Data>;
}

/// The tiles of a pixel set, in traversal order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileGrid {
    dims: Dimensions,
    tile_width: u32,
    tile_height: u32,
}

impl TileGrid {
    pub fn new(dims: Dimensions, tile_width: u32, tile_height: u32) -> Result<Self> {
        if tile_width == 0 || tile_height == 0 {
            return Err(TileError::InvalidTileSize {
                width: tile_width,
                height: tile_height,
            });
        }
        Ok(Self {
            dims,
            tile_width,
            tile_height,
        })
    }

    pub fn dimensions(&self) -> &Dimensions {
        &self.dims
    }

    pub fn tiles_x(&self) -> u32 {
        self.dims.size_x.div_ceil(self.tile_width)
    }

    pub fn tiles_y(&self) -> u32 {
        self.dims.size_y.div_ceil(self.tile_height)
    }

    pub fn tiles_per_plane(&self) -> u64 {
        self.tiles_x() as u64 * self.tiles_y() as u64
    }

    /// Number of tiles, saturating at `u64::MAX`.
    pub fn tile_count(&self) -> u64 {
        let planes = (self.dims.size_z as u64 * self.dims.size_c as u64)
            .saturating_mul(self.dims.size_t as u64);
        planes.saturating_mul(self.tiles_per_plane())
    }

    /// Coordinate of the tile with the given traversal index.
    pub fn tile(&self, index: u64) -> Option<TileCoord> {
        if index >= self.tile_count() {
            return None;
        }
        let per_plane = self.tiles_per_plane();
        let plane = index / per_plane;
        let within = index % per_plane;
        let tiles_x = self.tiles_x() as u64;

        let size_z = self.dims.size_z as u64;
        let size_c = self.dims.size_c as u64;
        let z = (plane % size_z) as u32;
        let c = ((plane / size_z) % size_c) as u32;
        let t = (plane / (size_z * size_c)) as u32;

        let x = (within % tiles_x) as u32 * self.tile_width;
        let y = (within / tiles_x) as u32 * self.tile_height;
        let w = self.tile_width.min(self.dims.size_x - x);
        let h = self.tile_height.min(self.dims.size_y - y);
        Some(TileCoord::new(z, c, t, x, y, w, h))
    }

    pub fn iter(&self) -> TileGridIter {
        TileGridIter {
            grid: *self,
            next: 0,
            count: self.tile_count(),
        }
    }
}

impl IntoIterator for &TileGrid {
    type Item = (u64, TileCoord);
    type IntoIter = TileGridIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct TileGridIter {
    grid: TileGrid,
    next: u64,
    count: u64,
}

impl Iterator for TileGridIter {
    type Item = (u64, TileCoord);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.count {
            return None;
        }
        let index = self.next;
        self.next += 1;
        self.grid.tile(index).map(|coord| (index, coord))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.count - self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TileGridIter {}

/// Visit every tile of a pixel set with `dims` and return the number of tiles
/// visited.
///
/// The tile data is created once before the first tile and closed exactly once
/// afterwards, also when `iteration` fails or panics. A failure while closing
/// after `iteration` failed is logged and the iteration error is returned; a
/// panic resumes once the data is closed.
pub async fn for_each_tile<L, I>(
    tile_loop: &mut L,
    dims: Dimensions,
    tile_width: u32,
    tile_height: u32,
    iteration: &mut I,
) -> Result<u64>
where
    L: TileLoop + ?Sized,
    I: TileIteration<L::Data> + ?Sized,
{
    let grid = TileGrid::new(dims, tile_width, tile_height)?;
    debug!(
        "Tile loop over {:?} in {}x{} tiles ({} tiles)",
        dims,
        tile_width,
        tile_height,
        grid.tile_count()
    );

    let mut data = tile_loop.create_data().await?;
    let visited = AssertUnwindSafe(visit(&grid, &mut data, iteration))
        .catch_unwind()
        .await;
    let closed = data.close().await;
    let visited = match visited {
        Ok(visited) => visited,
        Err(payload) => {
            if let Err(close_err) = closed {
                warn!("Failed to close tile data after panic: {}", close_err);
            }
            panic::resume_unwind(payload);
        }
    };

    match (visited, closed) {
        (Ok(count), Ok(())) => {
            debug!("Tile loop finished after {} tiles", count);
            Ok(count)
        }
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(close_err)) => {
            warn!("Failed to close tile data after error: {}", close_err);
            Err(err)
        }
    }
}

async fn visit<D, I>(grid: &TileGrid, data: &mut D, iteration: &mut I) -> Result<u64>
where
    D: TileData + ?Sized,
    I: TileIteration<D> + ?Sized,
{
    let mut tile_count = 0;
    for (index, coord) in grid {
        trace!("Tile {}: {:?}", index, coord);
        iteration.run(data, coord, index).await?;
        tile_count += 1;
    }
    Ok(tile_count)
}
