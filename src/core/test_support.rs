//! Fakes shared by the unit tests.

use async_trait::async_trait;
use chrono::Utc;
use image::{DynamicImage, GrayImage};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use crate::camera::{FramePoll, FrameSource};
use crate::common::{KioskError, Result};
use crate::core::acquisition::CancelToken;
use crate::core::extractor::{Extraction, FeatureExtractor};
use crate::core::illumination::IlluminationAssist;
use crate::core::types::{CameraId, FaceBox, Frame, ProviderTag};

pub fn frame(camera: &str) -> Frame {
    Frame {
        camera: CameraId::new(camera),
        captured_at: Utc::now(),
        image: Arc::new(DynamicImage::ImageLuma8(GrayImage::new(8, 8))),
    }
}

pub fn face(embedding: Vec<f32>, confidence: f32) -> Extraction {
    Extraction {
        embedding,
        confidence,
        face_box: FaceBox { x1: 1.0, y1: 1.0, x2: 6.0, y2: 6.0 },
    }
}

pub fn provider() -> ProviderTag {
    ProviderTag::new("test", "1")
}

pub struct StaticFrameSource {
    frame: Option<Frame>,
}

impl StaticFrameSource {
    pub fn pending() -> Self {
        Self { frame: None }
    }

    pub fn ready(frame: Frame) -> Self {
        Self { frame: Some(frame) }
    }
}

impl FrameSource for StaticFrameSource {
    fn current_frame(&self, _camera: &CameraId) -> Result<FramePoll> {
        Ok(match &self.frame {
            Some(frame) => FramePoll::Ready(frame.clone()),
            None => FramePoll::Pending,
        })
    }
}

pub type Step = std::result::Result<Option<Extraction>, String>;

/// Replays a fixed script of extractor answers, then reports "no face".
pub struct ScriptedExtractor {
    provider: ProviderTag,
    dimension: usize,
    script: Mutex<VecDeque<Step>>,
    calls: Arc<AtomicUsize>,
    hang: bool,
    cancel_on: Option<(usize, CancelToken)>,
}

impl ScriptedExtractor {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            provider: provider(),
            dimension: 2,
            script: Mutex::new(script.into()),
            calls: Arc::new(AtomicUsize::new(0)),
            hang: false,
            cancel_on: None,
        }
    }

    /// Trips `token` while serving the `call`-th request (1-based), as an
    /// operator pressing cancel mid-sample would.
    pub fn cancelling_on(mut self, call: usize, token: CancelToken) -> Self {
        self.cancel_on = Some((call, token));
        self
    }

    /// Never answers.
    pub fn hanging() -> Self {
        Self { hang: true, ..Self::new(vec![]) }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl FeatureExtractor for ScriptedExtractor {
    fn provider(&self) -> &ProviderTag {
        &self.provider
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn extract(&self, _frame: &Frame) -> Result<Option<Extraction>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((at, token)) = &self.cancel_on {
            if *at == call {
                token.cancel();
            }
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Ok(extraction)) => Ok(extraction),
            Some(Err(reason)) => Err(KioskError::Extractor(reason)),
            None => Ok(None),
        }
    }
}

#[derive(Default)]
pub struct CountingIllumination {
    pub on: AtomicUsize,
    pub off: AtomicUsize,
}

impl CountingIllumination {
    pub fn counts(&self) -> (usize, usize) {
        (self.on.load(Ordering::SeqCst), self.off.load(Ordering::SeqCst))
    }
}

impl IlluminationAssist for CountingIllumination {
    fn on(&self, _camera: &CameraId) -> Result<()> {
        self.on.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn off(&self, _camera: &CameraId) -> Result<()> {
        self.off.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
