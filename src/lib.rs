pub mod camera;
pub mod cli;
pub mod common;
pub mod core;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use crate::common::{Config, DevMode, KioskError, Result};
pub use crate::core::{
    AcquisitionError, CameraId, CaptureLoop, Classification, Clock, Detection, Embedding,
    EnrollmentService, FeatureExtractor, Frame, IdentityId, MatchResult, MatchingEngine,
    ProviderTag, RecognitionPipeline, SampleAcquisition,
};
pub use crate::camera::{FramePoll, FrameSource};
pub use crate::storage::{DetectionLedger, ProfileStore};
