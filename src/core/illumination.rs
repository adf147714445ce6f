use std::sync::Arc;
use std::time::Duration;
use crate::common::Result;
use crate::core::clock::Clock;
use crate::core::types::CameraId;

/// External light next to a camera. Both calls only issue the request;
/// there is no acknowledgment to wait for.
pub trait IlluminationAssist: Send + Sync {
    fn on(&self, camera: &CameraId) -> Result<()>;
    fn off(&self, camera: &CameraId) -> Result<()>;
}

/// For cameras without a controllable light.
pub struct NoopIllumination;

impl IlluminationAssist for NoopIllumination {
    fn on(&self, _camera: &CameraId) -> Result<()> {
        Ok(())
    }

    fn off(&self, _camera: &CameraId) -> Result<()> {
        Ok(())
    }
}

/// Best-effort light control around a single capture attempt.
pub struct AssistController {
    assist: Arc<dyn IlluminationAssist>,
    settle: Duration,
}

impl AssistController {
    pub fn new(assist: Arc<dyn IlluminationAssist>, settle: Duration) -> Self {
        Self { assist, settle }
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle
    }

    /// Turns the light on and waits out the settle delay. The light goes
    /// off when the returned guard drops, on every exit path.
    pub async fn engage(&self, camera: &CameraId, clock: &dyn Clock) -> AssistGuard {
        if let Err(e) = self.assist.on(camera) {
            tracing::warn!("Illumination on failed for camera {}: {}", camera, e);
        }

        // guard exists before the await so a cancelled settle still turns it off
        let guard = AssistGuard {
            assist: Arc::clone(&self.assist),
            camera: camera.clone(),
        };
        clock.sleep(self.settle).await;
        guard
    }
}

pub struct AssistGuard {
    assist: Arc<dyn IlluminationAssist>,
    camera: CameraId,
}

impl Drop for AssistGuard {
    fn drop(&mut self) {
        if let Err(e) = self.assist.off(&self.camera) {
            tracing::warn!("Illumination off failed for camera {}: {}", self.camera, e);
        }
    }
}
