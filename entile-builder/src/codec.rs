//! Binary chunk container: header layout and point packing.
//!
//! All fixed-width numeric fields are little-endian.
//!
//! Layout:
//! ```text
//! [magic "EWCK" 4B][version u16][flags u16][point_count u32]
//! [uncompressed_size u32][compressed_size u32][reserved u32][body]
//! ```
//!
//! The body is the packed point tuples in insertion order — quantized i32
//! coordinates when the schema carries a scale/offset, raw f64 otherwise,
//! followed by the schema's auxiliary payload — optionally zstd-compressed
//! (flag bit 0). Flag bit 1 records a sealed base cell so a resumed build
//! reconstructs the overflow state exactly.
//!
//! Decoding verifies magic, version, counts and sizes; any mismatch is
//! `ChunkCorrupt`.

use entile_core::{Error, Point, Result, Schema};

/// Magic bytes identifying a chunk.
pub const MAGIC: [u8; 4] = *b"EWCK";

/// Current container version.
pub const VERSION: u16 = 1;

/// Header size in bytes (fixed).
pub const HEADER_LEN: usize = 24;

/// Bit 0: body is zstd-compressed.
pub const FLAG_ZSTD: u16 = 0x01;

/// Bit 1: the cell was a sealed base cell when written.
pub const FLAG_SEALED: u16 = 0x02;

/// Compression level for chunk bodies.
const ZSTD_LEVEL: i32 = 3;

/// Serialize points into a chunk blob.
pub fn encode(points: &[Point], schema: &Schema, compress: bool, sealed: bool) -> Result<Vec<u8>> {
    let point_size = schema.point_size();
    let extra_size = schema.extra_size();
    let mut body = Vec::with_capacity(points.len() * point_size);

    for point in points {
        match &schema.scale_offset {
            Some(so) => {
                for (axis, value) in point.position().into_iter().enumerate() {
                    body.extend_from_slice(&so.forward(axis, value).to_le_bytes());
                }
            }
            None => {
                for value in point.position() {
                    body.extend_from_slice(&value.to_le_bytes());
                }
            }
        }
        if point.extra.len() != extra_size {
            return Err(Error::invalid_input(format!(
                "point payload is {} bytes, schema expects {}",
                point.extra.len(),
                extra_size
            )));
        }
        body.extend_from_slice(&point.extra);
    }

    let uncompressed_size = body.len();
    if uncompressed_size > u32::MAX as usize || points.len() > u32::MAX as usize {
        return Err(Error::invalid_input("chunk exceeds the u32 container limits"));
    }

    let mut flags = 0u16;
    if sealed {
        flags |= FLAG_SEALED;
    }
    let body = if compress {
        flags |= FLAG_ZSTD;
        zstd::encode_all(body.as_slice(), ZSTD_LEVEL)
            .map_err(|e| Error::invalid_input(format!("zstd compression failed: {}", e)))?
    } else {
        body
    };

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&(points.len() as u32).to_le_bytes());
    out.extend_from_slice(&(uncompressed_size as u32).to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parse a chunk blob back into points plus the sealed flag.
pub fn decode(bytes: &[u8], schema: &Schema) -> Result<(Vec<Point>, bool)> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::chunk_corrupt(format!(
            "chunk is {} bytes, header needs {}",
            bytes.len(),
            HEADER_LEN
        )));
    }
    if bytes[0..4] != MAGIC {
        return Err(Error::chunk_corrupt("bad magic"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(Error::chunk_corrupt(format!(
            "unsupported chunk version {}",
            version
        )));
    }
    let flags = u16::from_le_bytes([bytes[6], bytes[7]]);
    let point_count = read_u32(bytes, 8) as usize;
    let uncompressed_size = read_u32(bytes, 12) as usize;
    let compressed_size = read_u32(bytes, 16) as usize;

    if bytes.len() - HEADER_LEN != compressed_size {
        return Err(Error::chunk_corrupt(format!(
            "body is {} bytes, header claims {}",
            bytes.len() - HEADER_LEN,
            compressed_size
        )));
    }

    let body = &bytes[HEADER_LEN..];
    let body = if flags & FLAG_ZSTD != 0 {
        zstd::decode_all(body).map_err(|e| Error::chunk_corrupt(format!("zstd: {}", e)))?
    } else {
        body.to_vec()
    };

    if body.len() != uncompressed_size {
        return Err(Error::chunk_corrupt(format!(
            "decompressed to {} bytes, header claims {}",
            body.len(),
            uncompressed_size
        )));
    }
    let point_size = schema.point_size();
    if point_count * point_size != body.len() {
        return Err(Error::chunk_corrupt(format!(
            "{} points of {} bytes do not fill a {}-byte body",
            point_count,
            point_size,
            body.len()
        )));
    }

    let extra_size = schema.extra_size();
    let mut points = Vec::with_capacity(point_count);
    for record in body.chunks_exact(point_size) {
        let mut pos = [0.0f64; 3];
        let coords_end;
        match &schema.scale_offset {
            Some(so) => {
                for (axis, p) in pos.iter_mut().enumerate() {
                    let stored =
                        i32::from_le_bytes(record[axis * 4..axis * 4 + 4].try_into().unwrap());
                    *p = so.backward(axis, stored);
                }
                coords_end = 12;
            }
            None => {
                for (axis, p) in pos.iter_mut().enumerate() {
                    *p = f64::from_le_bytes(record[axis * 8..axis * 8 + 8].try_into().unwrap());
                }
                coords_end = 24;
            }
        }
        let extra = record[coords_end..coords_end + extra_size].to_vec();
        points.push(Point::with_extra(pos[0], pos[1], pos[2], extra));
    }

    Ok((points, flags & FLAG_SEALED != 0))
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}
