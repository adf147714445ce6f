use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::io::Cursor;
use std::time::Duration;
use crate::common::config::ExtractorConfig;
use crate::common::{KioskError, Result};
use crate::core::extractor::{Extraction, FeatureExtractor};
use crate::core::types::{Frame, ProviderTag};
use crate::service::protocol::ExtractResponse;

/// Feature extractor served over HTTP. The frame is posted as a PNG body and
/// the endpoint answers with an [`ExtractResponse`].
pub struct HttpFeatureExtractor {
    client: reqwest::Client,
    endpoint: String,
    provider: ProviderTag,
    dimension: usize,
}

impl HttpFeatureExtractor {
    pub fn new(config: &ExtractorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            provider: ProviderTag::new(config.provider.clone(), config.model_version.clone()),
            dimension: config.dimension,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

async fn encode_png(frame: &Frame) -> Result<Vec<u8>> {
    let image = frame.image.clone();
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, image::ImageOutputFormat::Png)?;
        Ok(buf.into_inner())
    })
    .await
    .map_err(|e| KioskError::Other(anyhow::anyhow!("PNG encoding task failed: {}", e)))?
}

#[async_trait]
impl FeatureExtractor for HttpFeatureExtractor {
    fn provider(&self) -> &ProviderTag {
        &self.provider
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn extract(&self, frame: &Frame) -> Result<Option<Extraction>> {
        let body = encode_png(frame).await?;

        let response = self.client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "image/png")
            .header("X-Camera-Id", frame.camera.as_str())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(KioskError::Extractor(format!(
                "{} returned {}: {}", self.endpoint, status, message.trim()
            )));
        }

        let parsed: ExtractResponse = response.json().await?;
        Ok(parsed.face.map(Extraction::from))
    }
}
