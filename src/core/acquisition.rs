//! Enrollment sample collection.
//!
//! A run collects exactly N accepted embeddings for one identity, one sample
//! at a time. Every attempt is bracketed by the illumination assist and reads
//! a fresh frame straight from the source, never the capture loop's cached
//! detection. Any sample that cannot be acquired aborts the whole run, so a
//! caller either gets all N embeddings or none.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use crate::camera::{FramePoll, FrameSource};
use crate::common::config::EnrollmentConfig;
use crate::core::capture::SuspendHandle;
use crate::core::clock::Clock;
use crate::core::extractor::{extract_detection, FeatureExtractor};
use crate::core::illumination::AssistController;
use crate::core::retry::{retry, RetryError, RetryPolicy};
use crate::core::types::{CameraId, Embedding, ProviderTag};

#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    pub samples: usize,
    pub min_confidence: f32,
    /// Total attempts per sample, including the first.
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub sample_timeout: Duration,
}

impl From<&EnrollmentConfig> for AcquisitionSettings {
    fn from(config: &EnrollmentConfig) -> Self {
        Self {
            samples: config.num_samples,
            min_confidence: config.min_confidence,
            max_attempts: config.max_attempts,
            retry_delay: config.retry_delay(),
            sample_timeout: config.sample_timeout(),
        }
    }
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self::from(&EnrollmentConfig::default())
    }
}

/// Why a single attempt did not yield a sample.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleRejection {
    FrameNotReady,
    NoFace,
    LowConfidence(f32),
    Extractor(String),
}

impl fmt::Display for SampleRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleRejection::FrameNotReady => write!(f, "camera produced no frame"),
            SampleRejection::NoFace => write!(f, "no face in frame"),
            SampleRejection::LowConfidence(c) => write!(f, "face confidence {:.3} below threshold", c),
            SampleRejection::Extractor(reason) => write!(f, "extractor error: {}", reason),
        }
    }
}

/// Enrollment failure. `sample` is 1-based so it can be shown to an operator as is.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcquisitionError {
    #[error("Sample {sample} of {total} timed out after {attempts} attempts ({elapsed:?})")]
    SampleTimeout {
        sample: usize,
        total: usize,
        attempts: u32,
        elapsed: Duration,
        last: Option<SampleRejection>,
    },

    #[error("Sample {sample} of {total}: no acceptable face after {attempts} attempts ({last})")]
    NoFaceDetected {
        sample: usize,
        total: usize,
        attempts: u32,
        last: SampleRejection,
    },

    #[error("Sample {sample} of {total}: extractor failed after {attempts} attempts: {reason}")]
    ExtractorFailed {
        sample: usize,
        total: usize,
        attempts: u32,
        reason: String,
    },

    #[error("Enrollment cancelled after {completed} of {total} samples")]
    Cancelled { completed: usize, total: usize },
}

impl AcquisitionError {
    /// The sample that failed, if the run got as far as one.
    pub fn sample(&self) -> Option<usize> {
        match self {
            AcquisitionError::SampleTimeout { sample, .. }
            | AcquisitionError::NoFaceDetected { sample, .. }
            | AcquisitionError::ExtractorFailed { sample, .. } => Some(*sample),
            AcquisitionError::Cancelled { .. } => None,
        }
    }
}

/// Cooperative cancellation, honored between samples.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquiredSample {
    pub embedding: Embedding,
    pub confidence: f32,
    /// Attempt on which this sample was accepted.
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    pub provider: ProviderTag,
    pub samples: Vec<AcquiredSample>,
}

impl Acquisition {
    pub fn embeddings(&self) -> Vec<Embedding> {
        self.samples.iter().map(|s| s.embedding.clone()).collect()
    }

    pub fn into_embeddings(self) -> Vec<Embedding> {
        self.samples.into_iter().map(|s| s.embedding).collect()
    }
}

pub struct SampleAcquisition {
    source: Arc<dyn FrameSource>,
    extractor: Arc<dyn FeatureExtractor>,
    assist: AssistController,
    clock: Arc<dyn Clock>,
    settings: AcquisitionSettings,
}

impl SampleAcquisition {
    pub fn new(
        source: Arc<dyn FrameSource>,
        extractor: Arc<dyn FeatureExtractor>,
        assist: AssistController,
        clock: Arc<dyn Clock>,
        settings: AcquisitionSettings,
    ) -> Self {
        Self { source, extractor, assist, clock, settings }
    }

    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    pub fn provider(&self) -> &ProviderTag {
        self.extractor.provider()
    }

    /// Runs the protocol on `camera`. While it runs, the camera's passive
    /// loop is paused through `suspend` if one is given.
    pub async fn acquire(
        &self,
        camera: &CameraId,
        suspend: Option<&SuspendHandle>,
        cancel: &CancelToken,
    ) -> Result<Acquisition, AcquisitionError> {
        let _paused = suspend.map(SuspendHandle::suspend);
        let total = self.settings.samples;
        let policy = RetryPolicy::new(self.settings.max_attempts, self.settings.retry_delay)
            .with_timeout(self.settings.sample_timeout);

        info!("Acquiring {} samples on camera {} with {}", total, camera, self.provider());

        let mut samples = Vec::with_capacity(total);
        for index in 0..total {
            if cancel.is_cancelled() {
                info!("Enrollment on camera {} cancelled after {} samples", camera, samples.len());
                return Err(AcquisitionError::Cancelled { completed: samples.len(), total });
            }

            let sample = index + 1;
            let outcome = retry(&policy, self.clock.as_ref(), |attempt| {
                debug!("Sample {}/{} attempt {}", sample, total, attempt);
                self.attempt(camera, attempt)
            })
            .await;

            match outcome {
                Ok(accepted) => {
                    info!("Sample {}/{} accepted at confidence {:.3} (attempt {})",
                        sample, total, accepted.confidence, accepted.attempt);
                    samples.push(accepted);
                }
                Err(e) => {
                    let error = Self::sample_error(sample, total, e);
                    warn!("Enrollment on camera {} failed: {}", camera, error);
                    return Err(error);
                }
            }
        }

        Ok(Acquisition {
            provider: self.provider().clone(),
            samples,
        })
    }

    async fn attempt(&self, camera: &CameraId, attempt: u32) -> Result<AcquiredSample, SampleRejection> {
        let _light = self.assist.engage(camera, self.clock.as_ref()).await;

        let frame = match self.source.current_frame(camera) {
            Ok(FramePoll::Ready(frame)) => frame,
            Ok(FramePoll::Pending) => return Err(SampleRejection::FrameNotReady),
            Err(e) => {
                debug!("Camera {} frame unavailable: {}", camera, e);
                return Err(SampleRejection::FrameNotReady);
            }
        };

        match extract_detection(self.extractor.as_ref(), &frame).await {
            Ok(Some(detection)) if detection.confidence >= self.settings.min_confidence => {
                Ok(AcquiredSample {
                    embedding: detection.embedding,
                    confidence: detection.confidence,
                    attempt,
                })
            }
            Ok(Some(detection)) => Err(SampleRejection::LowConfidence(detection.confidence)),
            Ok(None) => Err(SampleRejection::NoFace),
            Err(e) => Err(SampleRejection::Extractor(e.to_string())),
        }
    }

    fn sample_error(sample: usize, total: usize, error: RetryError<SampleRejection>) -> AcquisitionError {
        match error {
            RetryError::TimedOut { attempts, elapsed, last } => {
                AcquisitionError::SampleTimeout { sample, total, attempts, elapsed, last }
            }
            RetryError::Exhausted { attempts, last: SampleRejection::Extractor(reason) } => {
                AcquisitionError::ExtractorFailed { sample, total, attempts, reason }
            }
            RetryError::Exhausted { attempts, last } => {
                AcquisitionError::NoFaceDetected { sample, total, attempts, last }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::test_support::{face, frame, CountingIllumination, ScriptedExtractor, StaticFrameSource};

    fn protocol(
        source: StaticFrameSource,
        extractor: ScriptedExtractor,
        light: Arc<CountingIllumination>,
        clock: Arc<ManualClock>,
    ) -> SampleAcquisition {
        SampleAcquisition::new(
            Arc::new(source),
            Arc::new(extractor),
            AssistController::new(light, Duration::from_millis(150)),
            clock,
            AcquisitionSettings::default(),
        )
    }

    fn lobby() -> CameraId {
        CameraId::new("lobby")
    }

    #[tokio::test]
    async fn collects_exactly_n_accepted_samples() {
        let light = Arc::new(CountingIllumination::default());
        let extractor = ScriptedExtractor::new(vec![
            Ok(Some(face(vec![0.1, 0.1], 0.9))),
            Ok(Some(face(vec![0.2, 0.2], 0.2))),
            Ok(None),
            Ok(Some(face(vec![0.3, 0.3], 0.35))),
            Ok(Some(face(vec![0.4, 0.4], 0.8))),
        ]);
        let acquisition = protocol(
            StaticFrameSource::ready(frame("lobby")),
            extractor,
            light.clone(),
            Arc::new(ManualClock::new()),
        );

        let result = acquisition.acquire(&lobby(), None, &CancelToken::new()).await.unwrap();

        assert_eq!(result.samples.len(), 3);
        assert!(result.samples.iter().all(|s| s.confidence >= 0.35));
        assert_eq!(result.embeddings(), vec![vec![0.1, 0.1], vec![0.3, 0.3], vec![0.4, 0.4]]);
        assert_eq!(result.samples[1].attempt, 3);
        assert_eq!(light.counts(), (5, 5));
    }

    #[tokio::test]
    async fn exhausted_retries_name_the_failing_sample() {
        let light = Arc::new(CountingIllumination::default());
        // first sample succeeds, the second never sees a face
        let extractor = ScriptedExtractor::new(vec![Ok(Some(face(vec![0.1, 0.1], 0.9)))]);
        let clock = Arc::new(ManualClock::new());
        let acquisition = protocol(StaticFrameSource::ready(frame("lobby")), extractor, light.clone(), clock);

        let error = acquisition.acquire(&lobby(), None, &CancelToken::new()).await.unwrap_err();

        match &error {
            AcquisitionError::NoFaceDetected { sample, attempts, last, .. } => {
                assert_eq!(*sample, 2);
                assert_eq!(*attempts, 10);
                assert_eq!(*last, SampleRejection::NoFace);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(error.sample(), Some(2));
        assert_eq!(light.counts(), (11, 11));
    }

    #[tokio::test]
    async fn extractor_errors_are_reported_as_such() {
        let light = Arc::new(CountingIllumination::default());
        let script = (0..10).map(|_| Err("model offline".to_string())).collect();
        let acquisition = protocol(
            StaticFrameSource::ready(frame("lobby")),
            ScriptedExtractor::new(script),
            light,
            Arc::new(ManualClock::new()),
        );

        let error = acquisition.acquire(&lobby(), None, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(
            error,
            AcquisitionError::ExtractorFailed { sample: 1, attempts: 10, ref reason, .. } if reason.contains("model offline")
        ));
    }

    #[tokio::test]
    async fn hanging_extractor_times_out_and_light_goes_off() {
        let light = Arc::new(CountingIllumination::default());
        let clock = Arc::new(ManualClock::new());
        let acquisition = protocol(
            StaticFrameSource::ready(frame("lobby")),
            ScriptedExtractor::hanging(),
            light.clone(),
            clock.clone(),
        );

        let error = acquisition.acquire(&lobby(), None, &CancelToken::new()).await.unwrap_err();

        match error {
            AcquisitionError::SampleTimeout { sample, attempts, elapsed, .. } => {
                assert_eq!(sample, 1);
                assert_eq!(attempts, 1);
                assert!(elapsed >= Duration::from_secs(12));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(light.counts(), (1, 1));
    }

    #[tokio::test]
    async fn pending_frames_count_as_rejections() {
        let light = Arc::new(CountingIllumination::default());
        let acquisition = protocol(
            StaticFrameSource::pending(),
            ScriptedExtractor::new(vec![]),
            light.clone(),
            Arc::new(ManualClock::new()),
        );

        let error = acquisition.acquire(&lobby(), None, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(
            error,
            AcquisitionError::NoFaceDetected { sample: 1, last: SampleRejection::FrameNotReady, .. }
        ));
        assert_eq!(light.counts(), (10, 10));
    }

    #[tokio::test]
    async fn cancellation_is_checked_before_each_sample() {
        let light = Arc::new(CountingIllumination::default());
        let extractor = ScriptedExtractor::new(vec![]);
        let calls = extractor.calls();
        let acquisition = protocol(
            StaticFrameSource::ready(frame("lobby")),
            extractor,
            light.clone(),
            Arc::new(ManualClock::new()),
        );

        let cancel = CancelToken::new();
        cancel.cancel();
        let error = acquisition.acquire(&lobby(), None, &cancel).await.unwrap_err();

        assert_eq!(error, AcquisitionError::Cancelled { completed: 0, total: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(light.counts(), (0, 0));
    }

    #[tokio::test]
    async fn cancel_during_a_sample_finishes_that_sample_first() {
        let light = Arc::new(CountingIllumination::default());
        let cancel = CancelToken::new();
        let extractor = ScriptedExtractor::new(vec![
            Ok(Some(face(vec![0.1, 0.1], 0.1))),
            Ok(Some(face(vec![0.2, 0.2], 0.9))),
            Ok(Some(face(vec![0.3, 0.3], 0.9))),
        ])
        .cancelling_on(2, cancel.clone());
        let calls = extractor.calls();
        let acquisition = protocol(
            StaticFrameSource::ready(frame("lobby")),
            extractor,
            light.clone(),
            Arc::new(ManualClock::new()),
        );

        let error = acquisition.acquire(&lobby(), None, &cancel).await.unwrap_err();

        assert_eq!(error, AcquisitionError::Cancelled { completed: 1, total: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(light.counts(), (2, 2));
    }

    #[tokio::test]
    async fn capture_loop_is_suspended_for_the_run_only() {
        let suspend = SuspendHandle::default();
        let extractor = ScriptedExtractor::new(vec![
            Ok(Some(face(vec![0.1, 0.1], 0.9))),
            Ok(Some(face(vec![0.2, 0.2], 0.9))),
            Ok(Some(face(vec![0.3, 0.3], 0.9))),
        ]);
        let acquisition = protocol(
            StaticFrameSource::ready(frame("lobby")),
            extractor,
            Arc::new(CountingIllumination::default()),
            Arc::new(ManualClock::new()),
        );

        acquisition.acquire(&lobby(), Some(&suspend), &CancelToken::new()).await.unwrap();
        assert!(!suspend.is_suspended());
    }
}
