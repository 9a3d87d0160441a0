//! GeoPackage geometry blob codec.
//!
//! Geometry values in the file-based backend are blobs wrapping a fixed
//! binary header followed by a well-known-binary geometry body. The header
//! is (see the GeoPackage specification, "GeoPackageBinary"):
//!
//! ```text
//! byte 0-1   magic "GP"
//! byte 2     version (0)
//! byte 3     flags: bit 0 envelope/srid byte order (1 = little endian),
//!            bits 1-3 envelope indicator, bit 4 empty-geometry flag
//! byte 4-7   srs_id (i32)
//! [envelope] 0, 32, 48 or 64 bytes depending on the indicator
//! ```
//!
//! Envelope indicator: 0 no envelope, 1 XY, 2 XYZ, 3 XYM, 4 XYZM.
//!
//! [`strip`] peels the header off to expose the WKB body; [`wrap`] builds
//! a header around a WKB body, recomputing the envelope from the
//! coordinates. Two quirks imitate GDAL's writer: M envelopes are never
//! written, and POINT geometries get no envelope at all.

use crate::errors::{Error, Result};

/// Header length when no envelope is present.
const NO_ENVELOPE_HEADER_SIZE: usize = 8;
/// Position of the flags byte.
const FLAG_BYTE_POS: usize = 3;
/// Bits 1-3 of the flags byte hold the envelope indicator.
const ENVELOPE_SIZE_MASK: u8 = 0x0e;

fn invalid(message: impl Into<String>) -> Error {
    Error::Unsupported(message.into())
}

/// Whether a blob looks like a GeoPackage geometry blob.
#[must_use]
pub fn is_gpkg_blob(blob: &[u8]) -> bool {
    blob.len() >= NO_ENVELOPE_HEADER_SIZE && blob[0] == b'G' && blob[1] == b'P'
}

/// Size of the GeoPackage header of `blob`, derived from the envelope
/// indicator in the flags byte.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] for blobs that are too short, carry the
/// wrong magic or an out-of-range envelope indicator.
pub fn header_size(blob: &[u8]) -> Result<usize> {
    if !is_gpkg_blob(blob) {
        return Err(invalid("not a GeoPackage geometry blob"));
    }
    let envelope_byte = (blob[FLAG_BYTE_POS] & ENVELOPE_SIZE_MASK) >> 1;
    let envelope_size = match envelope_byte {
        0 => 0,
        1 => 32,
        2 | 3 => 48,
        4 => 64,
        other => return Err(invalid(format!("invalid envelope indicator {other}"))),
    };
    Ok(NO_ENVELOPE_HEADER_SIZE + envelope_size)
}

/// Strip the GeoPackage header, returning the WKB body.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] for malformed headers.
pub fn strip(blob: &[u8]) -> Result<&[u8]> {
    let size = header_size(blob)?;
    blob.get(size..)
        .ok_or_else(|| invalid("GeoPackage blob shorter than its header"))
}

/// Wrap a WKB body into a GeoPackage geometry blob.
///
/// The envelope is recomputed from the WKB coordinates. M envelopes are
/// not written, and for POINT geometries no envelope is written at all.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] when the WKB body cannot be parsed.
pub fn wrap(wkb: &[u8], srs_id: i32, geom_type: &str, _has_z: bool, _has_m: bool) -> Result<Vec<u8>> {
    let envelope = wkb_envelope(wkb)?;

    let write_envelope = !envelope.is_empty() && geom_type != "POINT";
    let with_z = write_envelope && envelope.has_z;
    let indicator: u8 = if !write_envelope {
        0
    } else if with_z {
        2
    } else {
        1
    };

    let mut out = Vec::with_capacity(NO_ENVELOPE_HEADER_SIZE + 64 + wkb.len());
    out.push(b'G');
    out.push(b'P');
    out.push(0); // version
    let mut flags: u8 = 0x01; // little-endian header
    flags |= indicator << 1;
    if envelope.is_empty() {
        flags |= 0x10;
    }
    out.push(flags);
    out.extend(srs_id.to_le_bytes());
    if write_envelope {
        out.extend(envelope.min_x.to_le_bytes());
        out.extend(envelope.max_x.to_le_bytes());
        out.extend(envelope.min_y.to_le_bytes());
        out.extend(envelope.max_y.to_le_bytes());
        if with_z {
            out.extend(envelope.min_z.to_le_bytes());
            out.extend(envelope.max_z.to_le_bytes());
        }
    }
    out.extend_from_slice(wkb);
    Ok(out)
}

/// Coordinate bounds gathered from a WKB body.
#[derive(Debug, Clone)]
struct Envelope {
    min_x: f64,
    max_x: f64,
    min_y: f64,
    max_y: f64,
    min_z: f64,
    max_z: f64,
    has_z: bool,
    seen: bool,
}

impl Envelope {
    fn new() -> Self {
        Self {
            min_x: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            min_y: f64::INFINITY,
            max_y: f64::NEG_INFINITY,
            min_z: f64::INFINITY,
            max_z: f64::NEG_INFINITY,
            has_z: false,
            seen: false,
        }
    }

    fn is_empty(&self) -> bool {
        !self.seen
    }

    fn add(&mut self, x: f64, y: f64, z: Option<f64>) {
        if x.is_nan() || y.is_nan() {
            // Empty points encode as NaN coordinates.
            return;
        }
        self.seen = true;
        self.min_x = self.min_x.min(x);
        self.max_x = self.max_x.max(x);
        self.min_y = self.min_y.min(y);
        self.max_y = self.max_y.max(y);
        if let Some(z) = z
            && !z.is_nan()
        {
            self.has_z = true;
            self.min_z = self.min_z.min(z);
            self.max_z = self.max_z.max(z);
        }
    }
}

/// Compute the envelope of an ISO WKB geometry.
fn wkb_envelope(wkb: &[u8]) -> Result<Envelope> {
    let mut cursor = WkbCursor { data: wkb, pos: 0 };
    let mut envelope = Envelope::new();
    read_geometry(&mut cursor, &mut envelope)?;
    Ok(envelope)
}

struct WkbCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl WkbCursor<'_> {
    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| invalid("truncated WKB geometry"))?;
        self.pos += 1;
        Ok(b)
    }

    fn u32(&mut self, little: bool) -> Result<u32> {
        let bytes: [u8; 4] = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| invalid("truncated WKB geometry"))?
            .try_into()
            .expect("4 bytes");
        self.pos += 4;
        Ok(if little {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        })
    }

    fn f64(&mut self, little: bool) -> Result<f64> {
        let bytes: [u8; 8] = self
            .data
            .get(self.pos..self.pos + 8)
            .ok_or_else(|| invalid("truncated WKB geometry"))?
            .try_into()
            .expect("8 bytes");
        self.pos += 8;
        Ok(if little {
            f64::from_le_bytes(bytes)
        } else {
            f64::from_be_bytes(bytes)
        })
    }
}

fn read_geometry(cursor: &mut WkbCursor<'_>, envelope: &mut Envelope) -> Result<()> {
    let little = match cursor.byte()? {
        0 => false,
        1 => true,
        other => return Err(invalid(format!("invalid WKB byte order {other}"))),
    };
    let type_code = cursor.u32(little)?;
    let base = type_code % 1000;
    let (has_z, has_m) = match type_code / 1000 {
        0 => (false, false),
        1 => (true, false),
        2 => (false, true),
        3 => (true, true),
        other => return Err(invalid(format!("invalid WKB dimension flag {other}"))),
    };

    let read_point = |cursor: &mut WkbCursor<'_>, envelope: &mut Envelope| -> Result<()> {
        let x = cursor.f64(little)?;
        let y = cursor.f64(little)?;
        let z = if has_z { Some(cursor.f64(little)?) } else { None };
        if has_m {
            cursor.f64(little)?;
        }
        envelope.add(x, y, z);
        Ok(())
    };

    match base {
        1 => read_point(cursor, envelope)?,
        2 => {
            let n = cursor.u32(little)?;
            for _ in 0..n {
                read_point(cursor, envelope)?;
            }
        }
        3 => {
            let rings = cursor.u32(little)?;
            for _ in 0..rings {
                let n = cursor.u32(little)?;
                for _ in 0..n {
                    read_point(cursor, envelope)?;
                }
            }
        }
        4..=7 => {
            // Multi-geometries and collections nest full WKB geometries.
            let n = cursor.u32(little)?;
            for _ in 0..n {
                read_geometry(cursor, envelope)?;
            }
        }
        other => return Err(invalid(format!("unsupported WKB geometry type {other}"))),
    }
    Ok(())
}
