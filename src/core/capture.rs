//! Passive per-camera capture loop.
//!
//! Each `tick()` pulls the latest frame, runs the extractor once and
//! returns what it saw. Rendering and recognition are separate consumers of
//! that value, so the loop holds no reference to either.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use crate::camera::{FramePoll, FrameSource};
use crate::core::extractor::{extract_detection, FeatureExtractor};
use crate::core::types::{CameraId, Detection, Frame};

#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// No decodable frame yet.
    Pending,
    /// An enrollment run owns this camera right now.
    Suspended,
    /// A frame was processed but yielded no usable face (or the extractor failed).
    NoFace { frame: Frame },
    Detected { frame: Frame, detection: Detection },
}

impl TickOutcome {
    pub fn detection(&self) -> Option<&Detection> {
        match self {
            TickOutcome::Detected { detection, .. } => Some(detection),
            _ => None,
        }
    }
}

/// Consumes tick outcomes to draw live feedback.
pub trait OverlayRenderer: Send {
    fn render(&mut self, camera: &CameraId, outcome: &TickOutcome);
}

/// Shared switch that pauses a camera's passive loop while an enrollment
/// run drives the camera and its light.
#[derive(Debug, Clone, Default)]
pub struct SuspendHandle(Arc<AtomicUsize>);

impl SuspendHandle {
    pub fn suspend(&self) -> SuspendGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        SuspendGuard(Arc::clone(&self.0))
    }

    pub fn is_suspended(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }
}

pub struct SuspendGuard(Arc<AtomicUsize>);

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopStats {
    pub ticks: u64,
    pub pending: u64,
    pub suspended: u64,
    pub no_face: u64,
    pub extractor_errors: u64,
    pub detections: u64,
}

pub struct CaptureLoop {
    camera: CameraId,
    source: Arc<dyn FrameSource>,
    extractor: Arc<dyn FeatureExtractor>,
    last: Option<Detection>,
    suspend: SuspendHandle,
    consecutive_errors: u32,
    stats: LoopStats,
}

impl CaptureLoop {
    pub fn new(camera: CameraId, source: Arc<dyn FrameSource>, extractor: Arc<dyn FeatureExtractor>) -> Self {
        Self {
            camera,
            source,
            extractor,
            last: None,
            suspend: SuspendHandle::default(),
            consecutive_errors: 0,
            stats: LoopStats::default(),
        }
    }

    pub fn camera(&self) -> &CameraId {
        &self.camera
    }

    pub fn suspend_handle(&self) -> SuspendHandle {
        self.suspend.clone()
    }

    pub fn last_detection(&self) -> Option<&Detection> {
        self.last.as_ref()
    }

    /// Hands the last detection to a consumer; the loop forgets it.
    pub fn take_detection(&mut self) -> Option<Detection> {
        self.last.take()
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub async fn tick(&mut self) -> TickOutcome {
        self.stats.ticks += 1;

        if self.suspend.is_suspended() {
            self.stats.suspended += 1;
            // whoever is in front of the camera now is not who was seen before
            self.last = None;
            return TickOutcome::Suspended;
        }

        let frame = match self.source.current_frame(&self.camera) {
            Ok(FramePoll::Ready(frame)) => frame,
            Ok(FramePoll::Pending) => {
                self.stats.pending += 1;
                return TickOutcome::Pending;
            }
            Err(e) => {
                tracing::debug!("Camera {} frame unavailable: {}", self.camera, e);
                self.stats.pending += 1;
                return TickOutcome::Pending;
            }
        };

        match extract_detection(self.extractor.as_ref(), &frame).await {
            Ok(Some(detection)) => {
                self.consecutive_errors = 0;
                self.stats.detections += 1;
                tracing::debug!("Camera {} face at confidence {:.3}", self.camera, detection.confidence);
                self.last = Some(detection.clone());
                TickOutcome::Detected { frame, detection }
            }
            Ok(None) => {
                self.consecutive_errors = 0;
                self.stats.no_face += 1;
                self.last = None;
                TickOutcome::NoFace { frame }
            }
            Err(e) => {
                self.consecutive_errors += 1;
                self.stats.extractor_errors += 1;
                if self.consecutive_errors == 1 {
                    tracing::warn!("Extractor failed on camera {}: {}", self.camera, e);
                } else {
                    tracing::debug!("Extractor failed on camera {} ({} in a row): {}",
                        self.camera, self.consecutive_errors, e);
                }
                self.last = None;
                TickOutcome::NoFace { frame }
            }
        }
    }
}
