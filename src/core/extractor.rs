use async_trait::async_trait;
use crate::common::{KioskError, Result};
use crate::core::types::{Detection, Embedding, FaceBox, Frame, ProviderTag};

/// Raw extractor output before it is stamped with provider and time.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub embedding: Embedding,
    pub confidence: f32,
    pub face_box: FaceBox,
}

/// Image frame to embedding. One implementation per embedding model,
/// chosen when the pipeline is configured.
#[async_trait]
pub trait FeatureExtractor: Send + Sync {
    fn provider(&self) -> &ProviderTag;

    /// Length D of every embedding this provider returns.
    fn dimension(&self) -> usize;

    /// `Ok(None)` means the frame contains no face.
    async fn extract(&self, frame: &Frame) -> Result<Option<Extraction>>;
}

/// Calls the extractor and checks its output against the provider contract.
pub async fn extract_detection(
    extractor: &dyn FeatureExtractor,
    frame: &Frame,
) -> Result<Option<Detection>> {
    let Some(extraction) = extractor.extract(frame).await? else {
        return Ok(None);
    };

    if extraction.embedding.len() != extractor.dimension() {
        return Err(KioskError::Extractor(format!(
            "{} returned a {}-dimensional embedding, expected {}",
            extractor.provider(),
            extraction.embedding.len(),
            extractor.dimension()
        )));
    }
    if extraction.embedding.iter().any(|v| !v.is_finite()) || !extraction.confidence.is_finite() {
        return Err(KioskError::Extractor(format!(
            "{} returned non-finite values", extractor.provider()
        )));
    }

    Ok(Some(Detection {
        provider: extractor.provider().clone(),
        embedding: extraction.embedding,
        confidence: extraction.confidence.clamp(0.0, 1.0),
        face_box: extraction.face_box,
        detected_at: frame.captured_at,
    }))
}
