pub mod acquisition;
pub mod capture;
pub mod clock;
pub mod enrollment;
pub mod extractor;
pub mod illumination;
pub mod matcher;
pub mod pipeline;
pub mod retry;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use acquisition::{AcquisitionError, AcquisitionSettings, CancelToken, SampleAcquisition};
pub use capture::{CaptureLoop, OverlayRenderer, SuspendHandle, TickOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use enrollment::{EnrollmentError, EnrollmentService};
pub use extractor::{Extraction, FeatureExtractor};
pub use illumination::{AssistController, IlluminationAssist, NoopIllumination};
pub use matcher::{Classification, GallerySnapshot, MatchPolicy, MatchResult, MatchingEngine};
pub use pipeline::{CameraWorker, EnrollmentKind, EnrollmentReply, EnrollmentRequest, RecognitionPipeline};
pub use retry::{retry, RetryError, RetryPolicy};
pub use types::{CameraId, Detection, Embedding, FaceBox, Frame, IdentityId, ProviderTag};
