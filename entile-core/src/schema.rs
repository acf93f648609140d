//! Point schema: the ordered dimension list fixed at build time.
//!
//! The first three dimensions are always X, Y, Z. Coordinates may be
//! stored as scaled 32-bit integers (`stored = round((value - offset) /
//! scale)`); every other dimension is carried as an opaque fixed-width
//! payload whose layout the schema describes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Storage type of a single dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float,
    Double,
}

impl DimType {
    /// Packed width in bytes.
    pub fn size(&self) -> usize {
        match self {
            DimType::Int8 | DimType::Uint8 => 1,
            DimType::Int16 | DimType::Uint16 => 2,
            DimType::Int32 | DimType::Uint32 | DimType::Float => 4,
            DimType::Int64 | DimType::Uint64 | DimType::Double => 8,
        }
    }
}

/// One dimension of the point record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    #[serde(rename = "type")]
    pub dtype: DimType,
}

impl Dimension {
    pub fn new(name: impl Into<String>, dtype: DimType) -> Self {
        Dimension {
            name: name.into(),
            dtype,
        }
    }
}

/// Scale/offset quantization applied to the coordinate dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleOffset {
    pub scale: [f64; 3],
    pub offset: [f64; 3],
}

impl ScaleOffset {
    pub fn new(scale: [f64; 3], offset: [f64; 3]) -> Result<Self> {
        if scale.iter().any(|s| !(*s > 0.0)) {
            return Err(Error::invalid_input(format!(
                "scale must be positive, got {:?}",
                scale
            )));
        }
        Ok(ScaleOffset { scale, offset })
    }

    /// Quantize one coordinate value for storage.
    pub fn forward(&self, axis: usize, value: f64) -> i32 {
        ((value - self.offset[axis]) / self.scale[axis]).round() as i32
    }

    /// Reconstruct a coordinate from its stored form.
    pub fn backward(&self, axis: usize, stored: i32) -> f64 {
        stored as f64 * self.scale[axis] + self.offset[axis]
    }
}

/// The build-wide point layout: coordinate dimensions, optional
/// quantization, and the auxiliary payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub dims: Vec<Dimension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_offset: Option<ScaleOffset>,
}

impl Schema {
    /// A coordinate-only schema.
    pub fn xyz() -> Self {
        Schema {
            dims: vec![
                Dimension::new("X", DimType::Double),
                Dimension::new("Y", DimType::Double),
                Dimension::new("Z", DimType::Double),
            ],
            scale_offset: None,
        }
    }

    /// Validate the dimension list: X, Y, Z first, then the payload.
    pub fn validate(&self) -> Result<()> {
        let names: Vec<&str> = self.dims.iter().map(|d| d.name.as_str()).collect();
        if names.len() < 3 || names[0] != "X" || names[1] != "Y" || names[2] != "Z" {
            return Err(Error::invalid_input(format!(
                "schema must begin with X, Y, Z dimensions, got {:?}",
                names
            )));
        }
        Ok(())
    }

    /// Stored width of one coordinate (quantized i32 or raw f64).
    pub fn coord_size(&self) -> usize {
        if self.scale_offset.is_some() {
            4
        } else {
            8
        }
    }

    /// Packed width of the auxiliary (non-coordinate) payload.
    pub fn extra_size(&self) -> usize {
        self.dims.iter().skip(3).map(|d| d.dtype.size()).sum()
    }

    /// Total packed width of one point record.
    pub fn point_size(&self) -> usize {
        self.coord_size() * 3 + self.extra_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_xyz() {
        let mut s = Schema::xyz();
        assert!(s.validate().is_ok());
        s.dims.remove(0);
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_sizes() {
        let mut s = Schema::xyz();
        assert_eq!(s.point_size(), 24);
        s.dims.push(Dimension::new("Intensity", DimType::Uint16));
        s.dims.push(Dimension::new("Classification", DimType::Uint8));
        assert_eq!(s.extra_size(), 3);
        assert_eq!(s.point_size(), 27);
        s.scale_offset = Some(ScaleOffset::new([0.01; 3], [0.0; 3]).unwrap());
        assert_eq!(s.point_size(), 15);
    }

    #[test]
    fn test_scale_offset_roundtrip() {
        let so = ScaleOffset::new([0.01, 0.01, 0.001], [500.0, -200.0, 0.0]).unwrap();
        let v = 523.37;
        let q = so.forward(0, v);
        assert!((so.backward(0, q) - v).abs() < 0.005 + 1e-9);
        // Negative scale rejected
        assert!(ScaleOffset::new([0.0, 0.01, 0.01], [0.0; 3]).is_err());
    }

    #[test]
    fn test_dim_type_serde_names() {
        let d = Dimension::new("Intensity", DimType::Uint16);
        let s = serde_json::to_string(&d).unwrap();
        assert_eq!(s, r#"{"name":"Intensity","type":"uint16"}"#);
    }
}
