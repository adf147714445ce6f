#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use image::{DynamicImage, GrayImage};
use kiosk_face::camera::{FramePoll, FrameSource};
use kiosk_face::core::{Extraction, FaceBox, FeatureExtractor, Frame, IlluminationAssist, ProviderTag};
use kiosk_face::{CameraId, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn frame(camera: &CameraId) -> Frame {
    Frame {
        camera: camera.clone(),
        captured_at: Utc::now(),
        image: Arc::new(DynamicImage::ImageLuma8(GrayImage::new(32, 24))),
    }
}

/// Always has a fresh frame for whichever camera asks.
pub struct LiveCameras;

impl FrameSource for LiveCameras {
    fn current_frame(&self, camera: &CameraId) -> Result<FramePoll> {
        Ok(FramePoll::Ready(frame(camera)))
    }
}

/// Hands out queued faces in order, then reports an empty frame.
pub struct QueuedFaces {
    provider: ProviderTag,
    dimension: usize,
    queue: Mutex<VecDeque<Extraction>>,
}

impl QueuedFaces {
    pub fn new(provider: ProviderTag, dimension: usize) -> Self {
        Self { provider, dimension, queue: Mutex::new(VecDeque::new()) }
    }

    pub fn push(&self, embedding: Vec<f32>, confidence: f32) {
        self.queue.lock().unwrap().push_back(Extraction {
            embedding,
            confidence,
            face_box: FaceBox { x1: 4.0, y1: 4.0, x2: 20.0, y2: 20.0 },
        });
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[async_trait]
impl FeatureExtractor for QueuedFaces {
    fn provider(&self) -> &ProviderTag {
        &self.provider
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn extract(&self, _frame: &Frame) -> Result<Option<Extraction>> {
        Ok(self.queue.lock().unwrap().pop_front())
    }
}

#[derive(Default)]
pub struct CountingLight {
    on: AtomicUsize,
    off: AtomicUsize,
}

impl CountingLight {
    pub fn counts(&self) -> (usize, usize) {
        (self.on.load(Ordering::SeqCst), self.off.load(Ordering::SeqCst))
    }
}

impl IlluminationAssist for CountingLight {
    fn on(&self, _camera: &CameraId) -> Result<()> {
        self.on.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn off(&self, _camera: &CameraId) -> Result<()> {
        self.off.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
