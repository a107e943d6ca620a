//! PostGIS WKB raster decoding (`ST_AsBinary` on a raster).
//!
//! Layout: endian flag (0 = big, 1 = little), then version `u16`, band count
//! `u16`, six `f64` georeference values, srid `i32`, width `u16`, height `u16`
//! (60 bytes after the flag). Each band starts with a flag byte holding the
//! pixel type in its low nibble, followed by the nodata value and the pixels.

use crate::types::{DatasetResult, TileDatasetError};

const BAND_OFFLINE: u8 = 0x80;
const BAND_HAS_NODATA: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    Bool1,
    UInt2,
    UInt4,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
}

impl PixelType {
    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => PixelType::Bool1,
            1 => PixelType::UInt2,
            2 => PixelType::UInt4,
            3 => PixelType::Int8,
            4 => PixelType::UInt8,
            5 => PixelType::Int16,
            6 => PixelType::UInt16,
            7 => PixelType::Int32,
            8 => PixelType::UInt32,
            10 => PixelType::Float32,
            11 => PixelType::Float64,
            _ => return None,
        })
    }

    pub fn size(&self) -> usize {
        match self {
            PixelType::Bool1
            | PixelType::UInt2
            | PixelType::UInt4
            | PixelType::Int8
            | PixelType::UInt8 => 1,
            PixelType::Int16 | PixelType::UInt16 => 2,
            PixelType::Int32 | PixelType::UInt32 | PixelType::Float32 => 4,
            PixelType::Float64 => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WkbBand {
    pub pixel_type: PixelType,
    pub nodata: Option<f64>,
    /// Row-major pixel values.
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WkbRaster {
    pub srid: i32,
    pub width: u16,
    pub height: u16,
    pub bands: Vec<WkbBand>,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    little: bool,
}

impl Cursor<'_> {
    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take<const N: usize>(&mut self) -> DatasetResult<[u8; N]> {
        let end = self.pos + N;
        let bytes = self.buf.get(self.pos..end).ok_or_else(|| {
            TileDatasetError::Wkb(format!(
                "truncated: need {N} bytes at offset {}, have {}",
                self.pos,
                self.buf.len()
            ))
        })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u8(&mut self) -> DatasetResult<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> DatasetResult<u16> {
        let b = self.take()?;
        Ok(if self.little { u16::from_le_bytes(b) } else { u16::from_be_bytes(b) })
    }

    fn i32(&mut self) -> DatasetResult<i32> {
        let b = self.take()?;
        Ok(if self.little { i32::from_le_bytes(b) } else { i32::from_be_bytes(b) })
    }

    fn f64(&mut self) -> DatasetResult<f64> {
        let b = self.take()?;
        Ok(if self.little { f64::from_le_bytes(b) } else { f64::from_be_bytes(b) })
    }

    fn pixel(&mut self, ty: PixelType) -> DatasetResult<f64> {
        let little = self.little;
        Ok(match ty {
            PixelType::Bool1 | PixelType::UInt2 | PixelType::UInt4 | PixelType::UInt8 => {
                f64::from(self.u8()?)
            }
            PixelType::Int8 => f64::from(self.u8()? as i8),
            PixelType::Int16 => {
                let b = self.take()?;
                f64::from(if little { i16::from_le_bytes(b) } else { i16::from_be_bytes(b) })
            }
            PixelType::UInt16 => f64::from(self.u16()?),
            PixelType::Int32 => f64::from(self.i32()?),
            PixelType::UInt32 => {
                let b = self.take()?;
                f64::from(if little { u32::from_le_bytes(b) } else { u32::from_be_bytes(b) })
            }
            PixelType::Float32 => {
                let b = self.take()?;
                f64::from(if little { f32::from_le_bytes(b) } else { f32::from_be_bytes(b) })
            }
            PixelType::Float64 => self.f64()?,
        })
    }
}

pub fn decode_wkb_raster(buf: &[u8]) -> DatasetResult<WkbRaster> {
    let endian = *buf
        .first()
        .ok_or_else(|| TileDatasetError::Wkb("empty buffer".to_string()))?;
    let little = match endian {
        0 => false,
        1 => true,
        other => return Err(TileDatasetError::Wkb(format!("bad endian flag {other}"))),
    };
    let mut cur = Cursor { buf, pos: 1, little };

    let _version = cur.u16()?;
    let band_count = cur.u16()?;
    // scale x/y, upper-left x/y, skew x/y
    for _ in 0..6 {
        cur.f64()?;
    }
    let srid = cur.i32()?;
    let width = cur.u16()?;
    let height = cur.u16()?;
    let pixels = width as usize * height as usize;

    let mut bands = Vec::with_capacity(usize::from(band_count).min(cur.remaining()));
    for band in 0..band_count {
        let flags = cur.u8()?;
        if flags & BAND_OFFLINE != 0 {
            return Err(TileDatasetError::Wkb(format!("band {band} is out-db, not supported")));
        }
        let pixel_type = PixelType::from_code(flags & 0x0f).ok_or_else(|| {
            TileDatasetError::Wkb(format!("band {band} has unknown pixel type {}", flags & 0x0f))
        })?;
        if let Some(first) = bands.first().map(|b: &WkbBand| b.pixel_type) {
            if first != pixel_type {
                return Err(TileDatasetError::Wkb(format!(
                    "mixed pixel types ({first:?} and {pixel_type:?}) not supported"
                )));
            }
        }
        let nodata_value = cur.pixel(pixel_type)?;
        let nodata = (flags & BAND_HAS_NODATA != 0).then_some(nodata_value);
        // Header sizes are untrusted; never allocate past what the buffer holds.
        let need = pixels.saturating_mul(pixel_type.size());
        if need > cur.remaining() {
            return Err(TileDatasetError::Wkb(format!(
                "band {band} declares {width}x{height} {pixel_type:?} pixels ({need} bytes), only {} remain",
                cur.remaining()
            )));
        }
        let mut values = Vec::with_capacity(pixels);
        for _ in 0..pixels {
            values.push(cur.pixel(pixel_type)?);
        }
        bands.push(WkbBand {
            pixel_type,
            nodata,
            values,
        });
    }

    Ok(WkbRaster {
        srid,
        width,
        height,
        bands,
    })
}
