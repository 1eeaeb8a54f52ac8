//! Pixel sets kept in an [ObjectStore].
//!
//! Each pixel set lives under `<root>/<id>/`: a `descriptor` object holding the
//! encoded [PixelsDescriptor], and one `planes/z<z>-c<c>-t<t>` object per written
//! plane holding its raw row-major samples. Planes that were never written read
//! as zeros.

use std::ops::Range;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode};
use tracing::{debug, trace, warn};

use crate::error::{Result, TileError};
use crate::pixels::{Dimensions, PixelType, PixelsDescriptor, PixelsId};
use crate::service::{PixelStore, PixelsService, DEFAULT_TILE_SIZE};
use crate::tiles::TileCoord;

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Prefix under which all pixel sets are stored.
    pub root: Path,
    pub default_tile_width: u32,
    pub default_tile_height: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            root: Path::from("pixels"),
            default_tile_width: DEFAULT_TILE_SIZE,
            default_tile_height: DEFAULT_TILE_SIZE,
        }
    }
}

#[derive(Clone, Debug)]
struct Layout {
    root: Path,
}

impl Layout {
    fn pixels(&self, id: PixelsId) -> Path {
        self.root.child(id.0.to_string())
    }

    fn descriptor(&self, id: PixelsId) -> Path {
        self.pixels(id).child("descriptor")
    }

    fn plane(&self, id: PixelsId, z: u32, c: u32, t: u32) -> Path {
        self.pixels(id)
            .child("planes")
            .child(format!("z{z}-c{c}-t{t}"))
    }
}

#[derive(Clone)]
pub struct ObjectPixelsService {
    store: Arc<dyn ObjectStore>,
    config: ServiceConfig,
    layout: Layout,
}

impl ObjectPixelsService {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_config(store, ServiceConfig::default())
    }

    pub fn with_config(store: Arc<dyn ObjectStore>, config: ServiceConfig) -> Self {
        let layout = Layout {
            root: config.root.clone(),
        };
        Self {
            store,
            config,
            layout,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Register a new, zero-filled pixel set. Fails if `id` is already taken.
    pub async fn create_pixels(
        &self,
        id: PixelsId,
        dimensions: Dimensions,
        pixel_type: PixelType,
    ) -> Result<PixelsDescriptor> {
        let mut descriptor = PixelsDescriptor::new(id, dimensions, pixel_type);
        descriptor.updated = now();
        self.store
            .put_opts(
                &self.layout.descriptor(id),
                descriptor.encode()?.into(),
                PutMode::Create.into(),
            )
            .await?;
        debug!("Created {} with {:?} {:?}", id, dimensions, pixel_type);
        Ok(descriptor)
    }
}

#[async_trait]
impl PixelsService for ObjectPixelsService {
    type Store = ObjectPixelStore;

    async fn load_pixels(&self, id: PixelsId) -> Result<PixelsDescriptor> {
        let buf = match self.store.get(&self.layout.descriptor(id)).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(TileError::PixelsNotFound(id))
            }
            Err(err) => return Err(err.into()),
        };
        let descriptor = PixelsDescriptor::decode(&buf)?;
        if descriptor.id != id {
            return Err(TileError::InvalidDescriptor(format!(
                "descriptor for {} stored under {}",
                descriptor.id, id
            )));
        }
        Ok(descriptor)
    }

    async fn open_store(&self, id: PixelsId, writable: bool) -> Result<ObjectPixelStore> {
        let descriptor = self.load_pixels(id).await?;
        debug!("Opened pixel store for {} (writable: {})", id, writable);
        Ok(ObjectPixelStore {
            store: self.store.clone(),
            layout: self.layout.clone(),
            descriptor,
            writable,
            dirty: None,
            flushed: 0,
            open: true,
        })
    }

    fn default_tile_size(&self) -> (u32, u32) {
        (self.config.default_tile_width, self.config.default_tile_height)
    }
}

/// An open handle on one pixel set.
///
/// Writes are buffered for one plane at a time. Moving to another plane writes
/// the buffered plane back to the store; [save](PixelStore::save) writes the last
/// one and the descriptor.
pub struct ObjectPixelStore {
    store: Arc<dyn ObjectStore>,
    layout: Layout,
    descriptor: PixelsDescriptor,
    writable: bool,
    dirty: Option<DirtyPlane>,
    /// Planes written back since the last save.
    flushed: usize,
    open: bool,
}

struct DirtyPlane {
    key: (u32, u32, u32),
    samples: Vec<u8>,
}

impl ObjectPixelStore {
    pub fn descriptor(&self) -> &PixelsDescriptor {
        &self.descriptor
    }

    pub fn has_unsaved_writes(&self) -> bool {
        self.dirty.is_some() || self.flushed > 0
    }

    /// Number of planes held in memory, at most one.
    pub fn buffered_planes(&self) -> usize {
        usize::from(self.dirty.is_some())
    }

    fn check(&self, coord: &TileCoord) -> Result<()> {
        if !self.open {
            return Err(TileError::NotOpen);
        }
        if !coord.fits(&self.descriptor.dimensions) {
            let TileCoord {
                z,
                c,
                t,
                x,
                y,
                w,
                h,
            } = *coord;
            return Err(TileError::OutOfBounds {
                z,
                c,
                t,
                x,
                y,
                w,
                h,
            });
        }
        Ok(())
    }

    /// Byte ranges of the rows of `coord` within its plane object.
    fn row_ranges(&self, coord: &TileCoord) -> Vec<Range<usize>> {
        let bpp = self.descriptor.pixel_type.bytes_per_pixel();
        let stride = self.descriptor.dimensions.size_x as usize * bpp;
        let row_len = coord.w as usize * bpp;
        let first = coord.y as usize * stride + coord.x as usize * bpp;
        if coord.w == self.descriptor.dimensions.size_x {
            // full-width rows are contiguous
            return vec![first..first + row_len * coord.h as usize];
        }
        (0..coord.h as usize)
            .map(|row| {
                let start = first + row * stride;
                start..start + row_len
            })
            .collect()
    }

    async fn fetch_plane(&self, z: u32, c: u32, t: u32) -> Result<Vec<u8>> {
        let path = self.layout.plane(self.descriptor.id, z, c, t);
        let plane_len = self.descriptor.plane_len();
        match self.store.get(&path).await {
            Ok(result) => {
                let buf = result.bytes().await?;
                if buf.len() != plane_len {
                    return Err(TileError::BufferLength {
                        expected: plane_len,
                        actual: buf.len(),
                    });
                }
                Ok(buf.to_vec())
            }
            Err(object_store::Error::NotFound { .. }) => Ok(vec![0; plane_len]),
            Err(err) => Err(err.into()),
        }
    }

    /// Write the buffered plane back to the store.
    async fn flush(&mut self) -> Result<()> {
        let Some(plane) = self.dirty.take() else {
            return Ok(());
        };
        let (z, c, t) = plane.key;
        let path = self.layout.plane(self.descriptor.id, z, c, t);
        trace!("Writing back {}", path);
        if let Err(err) = self.store.put(&path, plane.samples.clone().into()).await {
            self.dirty = Some(plane);
            return Err(err.into());
        }
        self.flushed += 1;
        Ok(())
    }
}

#[async_trait]
impl PixelStore for ObjectPixelStore {
    async fn get_tile(&mut self, coord: TileCoord) -> Result<Bytes> {
        self.check(&coord)?;
        let ranges = self.row_ranges(&coord);
        let tile_len = coord.byte_len(self.descriptor.pixel_type);
        if tile_len == 0 {
            return Ok(Bytes::new());
        }

        let key = (coord.z, coord.c, coord.t);
        if let Some(plane) = self.dirty.as_ref().filter(|plane| plane.key == key) {
            let mut out = Vec::with_capacity(tile_len);
            for range in ranges {
                out.extend_from_slice(&plane.samples[range]);
            }
            return Ok(out.into());
        }

        let path = self.layout.plane(self.descriptor.id, coord.z, coord.c, coord.t);
        trace!("Reading {} rows of {}", ranges.len(), path);
        match self.store.get_ranges(&path, &ranges).await {
            Ok(rows) if rows.len() == 1 => Ok(rows.into_iter().next().unwrap_or_default()),
            Ok(rows) => {
                let mut out = Vec::with_capacity(tile_len);
                for row in rows {
                    out.extend_from_slice(&row);
                }
                Ok(out.into())
            }
            Err(object_store::Error::NotFound { .. }) => Ok(vec![0; tile_len].into()),
            Err(err) => Err(err.into()),
        }
    }

    async fn set_tile(&mut self, buf: &[u8], coord: TileCoord) -> Result<()> {
        self.check(&coord)?;
        if !self.writable {
            return Err(TileError::ReadOnly(self.descriptor.id));
        }
        let expected = coord.byte_len(self.descriptor.pixel_type);
        if buf.len() != expected {
            return Err(TileError::BufferLength {
                expected,
                actual: buf.len(),
            });
        }
        if expected == 0 {
            return Ok(());
        }

        let key = (coord.z, coord.c, coord.t);
        if self.dirty.as_ref().is_some_and(|plane| plane.key != key) {
            self.flush().await?;
        }
        let mut plane = match self.dirty.take() {
            Some(plane) => plane,
            None => DirtyPlane {
                key,
                samples: self.fetch_plane(coord.z, coord.c, coord.t).await?,
            },
        };
        let mut offset = 0;
        for range in self.row_ranges(&coord) {
            let len = range.len();
            plane.samples[range].copy_from_slice(&buf[offset..offset + len]);
            offset += len;
        }
        self.dirty = Some(plane);
        Ok(())
    }

    /// Write the buffered plane and, if any plane was written since the last
    /// save, a new descriptor version.
    ///
    /// Planes written back before a failure stay in the store even though the
    /// descriptor still carries the previous version.
    async fn save(&mut self) -> Result<PixelsDescriptor> {
        if !self.open {
            return Err(TileError::NotOpen);
        }
        self.flush().await?;
        if self.flushed == 0 {
            return Ok(self.descriptor.clone());
        }

        let id = self.descriptor.id;
        let mut descriptor = self.descriptor.clone();
        descriptor.version += 1;
        descriptor.updated = now();
        self.store
            .put(&self.layout.descriptor(id), descriptor.encode()?.into())
            .await?;
        debug!(
            "Saved {} planes of {} (version {})",
            self.flushed, id, descriptor.version
        );
        self.flushed = 0;
        self.descriptor = descriptor;
        Ok(self.descriptor.clone())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        if self.dirty.take().is_some() {
            warn!(
                "Closing pixel store for {} discards an unsaved plane",
                self.descriptor.id
            );
        }
        if self.flushed > 0 {
            warn!(
                "Closing pixel store for {} without saving; {} written planes keep version {}",
                self.descriptor.id, self.flushed, self.descriptor.version
            );
        }
        self.open = false;
        debug!("Closed pixel store for {}", self.descriptor.id);
        Ok(())
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use object_store::memory::InMemory;

    async fn service_with(dims: Dimensions, pixel_type: PixelType) -> ObjectPixelsService {
        let service = ObjectPixelsService::new(Arc::new(InMemory::new()));
        service
            .create_pixels(PixelsId(1), dims, pixel_type)
            .await
            .unwrap();
        service
    }

    #[tokio::test]
    async fn unwritten_planes_read_as_zeros() {
        let service = service_with(Dimensions::new(6, 4, 1, 1, 1), PixelType::Uint16).await;
        let mut store = service.open_store(PixelsId(1), false).await.unwrap();
        let tile = store
            .get_tile(TileCoord::new(0, 0, 0, 1, 1, 3, 2))
            .await
            .unwrap();
        assert_eq!(&tile[..], &[0u8; 12][..]);
    }

    #[tokio::test]
    async fn saved_tiles_are_visible_to_new_handles() {
        let dims = Dimensions::new(4, 3, 2, 1, 1);
        let service = service_with(dims, PixelType::Uint8).await;
        let mut store = service.open_store(PixelsId(1), true).await.unwrap();
        store
            .set_tile(&[1, 2, 3, 4], TileCoord::new(1, 0, 0, 2, 1, 2, 2))
            .await
            .unwrap();

        // buffered writes are visible on the same handle
        let tile = store
            .get_tile(TileCoord::new(1, 0, 0, 1, 1, 3, 1))
            .await
            .unwrap();
        assert_eq!(&tile[..], &[0, 1, 2]);

        let saved = store.save().await.unwrap();
        assert_eq!(saved.version, 1);
        assert!(!store.has_unsaved_writes());
        store.close().await.unwrap();

        let mut reader = service.open_store(PixelsId(1), false).await.unwrap();
        assert_eq!(reader.descriptor(), &saved);
        let plane = reader
            .get_tile(TileCoord::plane(1, 0, 0, &dims))
            .await
            .unwrap();
        assert_eq!(&plane[..], &[0, 0, 0, 0, 0, 0, 1, 2, 0, 0, 3, 4]);
        let tile = reader
            .get_tile(TileCoord::new(1, 0, 0, 2, 2, 2, 1))
            .await
            .unwrap();
        assert_eq!(&tile[..], &[3, 4]);
        let untouched = reader
            .get_tile(TileCoord::plane(0, 0, 0, &dims))
            .await
            .unwrap();
        assert_eq!(&untouched[..], &[0; 12]);
    }

    #[tokio::test]
    async fn save_without_writes_keeps_version() {
        let service = service_with(Dimensions::new(2, 2, 1, 1, 1), PixelType::Uint8).await;
        let mut store = service.open_store(PixelsId(1), true).await.unwrap();
        assert_eq!(store.save().await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn rejects_invalid_access() {
        let service = service_with(Dimensions::new(4, 4, 1, 1, 1), PixelType::Uint16).await;

        let mut reader = service.open_store(PixelsId(1), false).await.unwrap();
        let err = reader
            .set_tile(&[0; 2], TileCoord::new(0, 0, 0, 0, 0, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TileError::ReadOnly(PixelsId(1))));

        let mut store = service.open_store(PixelsId(1), true).await.unwrap();
        let err = store
            .get_tile(TileCoord::new(0, 0, 0, 3, 0, 2, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TileError::OutOfBounds { x: 3, w: 2, .. }));
        let err = store
            .get_tile(TileCoord::new(0, 1, 0, 0, 0, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TileError::OutOfBounds { c: 1, .. }));

        let err = store
            .set_tile(&[0; 3], TileCoord::new(0, 0, 0, 0, 0, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TileError::BufferLength {
                expected: 2,
                actual: 3
            }
        ));

        store.close().await.unwrap();
        let err = store
            .get_tile(TileCoord::new(0, 0, 0, 0, 0, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TileError::NotOpen));
        assert!(matches!(store.save().await, Err(TileError::NotOpen)));
        // closing again is a no-op
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_discards_unsaved_writes() {
        let dims = Dimensions::new(2, 2, 1, 1, 1);
        let service = service_with(dims, PixelType::Uint8).await;
        let mut store = service.open_store(PixelsId(1), true).await.unwrap();
        store
            .set_tile(&[9; 4], TileCoord::plane(0, 0, 0, &dims))
            .await
            .unwrap();
        store.close().await.unwrap();

        let mut reader = service.open_store(PixelsId(1), false).await.unwrap();
        let plane = reader
            .get_tile(TileCoord::plane(0, 0, 0, &dims))
            .await
            .unwrap();
        assert_eq!(&plane[..], &[0; 4]);
        assert_eq!(reader.descriptor().version, 0);
    }

    #[tokio::test]
    async fn buffers_one_plane_at_a_time() {
        let dims = Dimensions::new(64, 64, 10, 5, 1);
        let service = service_with(dims, PixelType::Uint16).await;
        let mut store = service.open_store(PixelsId(1), true).await.unwrap();
        for c in 0..dims.size_c {
            for z in 0..dims.size_z {
                let value = (z * 5 + c + 1) as u8;
                let top = TileCoord::new(z, c, 0, 0, 0, 64, 32);
                let bottom = TileCoord::new(z, c, 0, 0, 32, 64, 32);
                store.set_tile(&[value; 4096], top).await.unwrap();
                store.set_tile(&[value; 4096], bottom).await.unwrap();
                assert_eq!(store.buffered_planes(), 1);
            }
        }
        assert!(store.has_unsaved_writes());

        // planes already written back are read from the store
        let first = store
            .get_tile(TileCoord::new(0, 0, 0, 10, 40, 2, 1))
            .await
            .unwrap();
        assert_eq!(&first[..], &[1; 4]);

        let saved = store.save().await.unwrap();
        assert_eq!(saved.version, 1);
        assert_eq!(store.buffered_planes(), 0);
        assert!(!store.has_unsaved_writes());
        store.close().await.unwrap();

        let mut reader = service.open_store(PixelsId(1), false).await.unwrap();
        for c in 0..dims.size_c {
            for z in 0..dims.size_z {
                let plane = reader
                    .get_tile(TileCoord::plane(z, c, 0, &dims))
                    .await
                    .unwrap();
                let value = (z * 5 + c + 1) as u8;
                assert!(plane.iter().all(|byte| *byte == value), "plane z={z} c={c}");
            }
        }
    }

    #[tokio::test]
    async fn empty_write_leaves_version() {
        let service = service_with(Dimensions::new(4, 4, 1, 1, 1), PixelType::Uint8).await;
        let mut store = service.open_store(PixelsId(1), true).await.unwrap();
        store
            .set_tile(&[], TileCoord::new(0, 0, 0, 2, 2, 0, 2))
            .await
            .unwrap();
        assert!(!store.has_unsaved_writes());
        assert_eq!(store.save().await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn unknown_and_duplicate_pixels() {
        let service = service_with(Dimensions::new(2, 2, 1, 1, 1), PixelType::Uint8).await;
        assert!(matches!(
            service.load_pixels(PixelsId(2)).await,
            Err(TileError::PixelsNotFound(PixelsId(2)))
        ));
        assert!(matches!(
            service.open_store(PixelsId(2), true).await,
            Err(TileError::PixelsNotFound(PixelsId(2)))
        ));
        let err = service
            .create_pixels(PixelsId(1), Dimensions::new(1, 1, 1, 1, 1), PixelType::Uint8)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TileError::ObjectStore(object_store::Error::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn config_sets_root_and_tile_size() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let config = ServiceConfig {
            root: Path::from("lab/raw"),
            default_tile_width: 512,
            default_tile_height: 128,
        };
        let service = ObjectPixelsService::with_config(store.clone(), config);
        assert_eq!(service.default_tile_size(), (512, 128));
        service
            .create_pixels(PixelsId(5), Dimensions::new(1, 1, 1, 1, 1), PixelType::Float)
            .await
            .unwrap();
        store
            .head(&Path::from("lab/raw/5/descriptor"))
            .await
            .unwrap();
    }
}
