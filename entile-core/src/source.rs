//! Source descriptors: one per input file, carried from the pre-analysis
//! scan through ingestion into the manifest.

use crate::bounds::Bounds;
use crate::schema::DimType;
use serde::{Deserialize, Serialize};

/// Ingestion state of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    /// Not yet (fully) ingested.
    Pending,
    /// Fully ingested; skipped on resume.
    Inserted,
    /// Failed; `info.errors` holds the causes.
    Error,
}

/// Per-dimension statistics from the pre-analysis scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionStat {
    pub name: String,
    #[serde(rename = "type")]
    pub dtype: DimType,
    pub min: f64,
    pub max: f64,
    /// Quantization grid declared by the source format (LAS headers carry
    /// one per coordinate axis); used to derive the build scale when the
    /// configuration leaves it unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
}

/// What the external reader learned about one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    pub points: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srs: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dimensions: Vec<DimensionStat>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// One input file and its build state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub path: String,
    pub status: SourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<SourceInfo>,
    /// Points consumed from the reader so far. Lets a resumed build
    /// fast-forward a partially ingested source instead of re-inserting it.
    #[serde(default)]
    pub points_inserted: u64,
}

impl Source {
    pub fn new(path: impl Into<String>) -> Self {
        Source {
            path: path.into(),
            status: SourceStatus::Pending,
            info: None,
            points_inserted: 0,
        }
    }

    /// Filename stem used for the per-source info object
    /// (`ept-sources/<stem>.json`).
    pub fn stem(&self) -> String {
        let name = self.path.rsplit(['/', '\\']).next().unwrap_or(&self.path);
        match name.rfind('.') {
            Some(0) | None => name.to_string(),
            Some(dot) => name[..dot].to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stem() {
        assert_eq!(Source::new("a/b/survey-12.laz").stem(), "survey-12");
        assert_eq!(Source::new("survey.laz").stem(), "survey");
        assert_eq!(Source::new("noext").stem(), "noext");
        assert_eq!(Source::new("dir.d/noext").stem(), "noext");
    }

    #[test]
    fn test_serde_defaults() {
        let json = r#"{"path":"a.laz","status":"pending"}"#;
        let s: Source = serde_json::from_str(json).unwrap();
        assert_eq!(s.status, SourceStatus::Pending);
        assert_eq!(s.points_inserted, 0);
        assert!(s.info.is_none());
    }

    #[test]
    fn test_roundtrip_with_info() {
        let mut s = Source::new("a.laz");
        s.status = SourceStatus::Inserted;
        s.points_inserted = 42;
        s.info = Some(SourceInfo {
            bounds: Some(Bounds::new([0.0; 3], [1.0; 3]).unwrap()),
            points: 42,
            srs: Some("EPSG:26915".to_string()),
            dimensions: vec![DimensionStat {
                name: "X".to_string(),
                dtype: DimType::Double,
                min: 0.0,
                max: 1.0,
                scale: Some(0.01),
            }],
            errors: vec![],
        });
        let json = serde_json::to_string(&s).unwrap();
        let back: Source = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }
}
