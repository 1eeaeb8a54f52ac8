use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{Result, TileError};

const DESCRIPTOR_MAGIC: &[u8; 2] = b"PX";
const DESCRIPTOR_FORMAT: u16 = 1;

/// Identifier of a stored pixel set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PixelsId(pub u64);

impl fmt::Display for PixelsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pixels:{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PixelType {
    Int8 = 1,
    Uint8 = 2,
    Int16 = 3,
    Uint16 = 4,
    Int32 = 5,
    Uint32 = 6,
    Float = 7,
    Double = 8,
    // one byte per sample, not packed
    Bit = 9,
}

impl PixelType {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 | Self::Bit => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float => 4,
            Self::Double => 8,
        }
    }
}

/// Extent of the five pixel axes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dimensions {
    pub size_x: u32,
    pub size_y: u32,
    pub size_z: u32,
    pub size_c: u32,
    pub size_t: u32,
}

impl Dimensions {
    pub fn new(size_x: u32, size_y: u32, size_z: u32, size_c: u32, size_t: u32) -> Self {
        Self {
            size_x,
            size_y,
            size_z,
            size_c,
            size_t,
        }
    }

    /// Number of bytes in one (z, c, t) plane.
    pub fn plane_len(&self, pixel_type: PixelType) -> usize {
        self.size_x as usize * self.size_y as usize * pixel_type.bytes_per_pixel()
    }

    pub fn contains_plane(&self, z: u32, c: u32, t: u32) -> bool {
        z < self.size_z && c < self.size_c && t < self.size_t
    }
}

/// Dimensional and bookkeeping metadata of a pixel set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelsDescriptor {
    pub id: PixelsId,
    pub dimensions: Dimensions,
    pub pixel_type: PixelType,
    /// Number of saves applied so far.
    pub version: u64,
    /// Seconds since the UNIX epoch of the last save.
    pub updated: u64,
}

impl PixelsDescriptor {
    pub fn new(id: PixelsId, dimensions: Dimensions, pixel_type: PixelType) -> Self {
        Self {
            id,
            dimensions,
            pixel_type,
            version: 0,
            updated: 0,
        }
    }

    pub fn plane_len(&self) -> usize {
        self.dimensions.plane_len(self.pixel_type)
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(49);
        buf.extend_from_slice(DESCRIPTOR_MAGIC);
        buf.write_u16::<LittleEndian>(DESCRIPTOR_FORMAT)?;
        buf.write_u64::<LittleEndian>(self.id.0)?;
        buf.write_u8(self.pixel_type.into())?;
        let dims = &self.dimensions;
        for size in [dims.size_x, dims.size_y, dims.size_z, dims.size_c, dims.size_t] {
            buf.write_u32::<LittleEndian>(size)?;
        }
        buf.write_u64::<LittleEndian>(self.version)?;
        buf.write_u64::<LittleEndian>(self.updated)?;
        Ok(buf.into())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let truncated = |_| TileError::InvalidDescriptor("truncated descriptor".to_string());

        let mut magic = [0; 2];
        cursor.read_exact(&mut magic).map_err(truncated)?;
        if &magic != DESCRIPTOR_MAGIC {
            return Err(TileError::InvalidDescriptor(format!(
                "unexpected magic bytes {magic:?}"
            )));
        }
        let format = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
        if format != DESCRIPTOR_FORMAT {
            return Err(TileError::InvalidDescriptor(format!(
                "unsupported descriptor format {format}"
            )));
        }

        let id = PixelsId(cursor.read_u64::<LittleEndian>().map_err(truncated)?);
        let pixel_type = cursor.read_u8().map_err(truncated)?;
        let pixel_type = PixelType::try_from(pixel_type).map_err(|_| {
            TileError::InvalidDescriptor(format!("unknown pixel type {pixel_type}"))
        })?;
        let mut sizes = [0u32; 5];
        for size in sizes.iter_mut() {
            *size = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        }
        let [size_x, size_y, size_z, size_c, size_t] = sizes;
        let version = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let updated = cursor.read_u64::<LittleEndian>().map_err(truncated)?;

        Ok(Self {
            id,
            dimensions: Dimensions::new(size_x, size_y, size_z, size_c, size_t),
            pixel_type,
            version,
            updated,
        })
    }
}

/// A pixel set as held by a caller: either only its identifier is known, or its
/// descriptor has been fetched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PixelsRef {
    Unloaded(PixelsId),
    Loaded(PixelsDescriptor),
}

impl PixelsRef {
    pub fn id(&self) -> PixelsId {
        match self {
            Self::Unloaded(id) => *id,
            Self::Loaded(descriptor) => descriptor.id,
        }
    }

    pub fn descriptor(&self) -> Option<&PixelsDescriptor> {
        match self {
            Self::Unloaded(_) => None,
            Self::Loaded(descriptor) => Some(descriptor),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }
}

impl From<PixelsId> for PixelsRef {
    fn from(id: PixelsId) -> Self {
        Self::Unloaded(id)
    }
}

impl From<PixelsDescriptor> for PixelsRef {
    fn from(descriptor: PixelsDescriptor) -> Self {
        Self::Loaded(descriptor)
    }
}
