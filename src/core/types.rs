use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use crate::common::{KioskError, Result};

pub type Embedding = Vec<f32>;

/// Camera device identifier as configured in `[[cameras]]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraId(String);

impl CameraId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Enrolled client identity. Restricted to `[A-Za-z0-9._-]{1,64}` since it
/// doubles as a storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn parse(id: &str) -> Result<Self> {
        let valid = !id.is_empty()
            && id.len() <= 64
            && id != "."
            && id != ".."
            && id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

        if valid {
            Ok(Self(id.to_string()))
        } else {
            Err(KioskError::InvalidIdentity(id.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which embedding model produced a vector. Distances are only meaningful
/// between vectors carrying equal tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderTag {
    pub name: String,
    pub model_version: String,
}

impl ProviderTag {
    pub fn new(name: impl Into<String>, model_version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_version: model_version.into(),
        }
    }
}

impl fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.model_version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl FaceBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }
}

/// A decoded camera frame. The image is shared so handing a frame to the
/// extractor, the renderer and the snapshot writer does not copy pixels.
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera: CameraId,
    pub captured_at: DateTime<Utc>,
    pub image: Arc<DynamicImage>,
}

/// One extractor result for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub provider: ProviderTag,
    pub embedding: Embedding,
    pub confidence: f32,
    pub face_box: FaceBox,
    pub detected_at: DateTime<Utc>,
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

pub fn l2_normalize(v: &[f32]) -> Embedding {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}
