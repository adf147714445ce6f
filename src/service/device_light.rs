use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use crate::common::config::CameraConfig;
use crate::common::{KioskError, Result};
use crate::core::illumination::IlluminationAssist;
use crate::core::types::CameraId;
use crate::service::protocol::{FlashRequest, LightState};

type Queues = HashMap<CameraId, mpsc::UnboundedSender<LightState>>;

/// Lights driven by the camera's companion device over HTTP.
///
/// Each camera gets a queue drained by its own task, so requests go out in
/// the order `on`/`off` were called while the callers never wait on them.
/// Call [`HttpIllumination::shutdown`] before the runtime goes away, or a
/// queued `off` may never be sent.
pub struct HttpIllumination {
    queues: Mutex<Queues>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    request_timeout: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HttpIllumination {
    /// Must be called from inside a tokio runtime.
    pub fn spawn(cameras: &[CameraConfig], request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        let mut queues = HashMap::new();
        let mut tasks = Vec::new();

        for camera in cameras {
            let Some(base_url) = &camera.light_url else { continue };
            let (tx, rx) = mpsc::unbounded_channel();
            tasks.push(tokio::spawn(drive_light(
                client.clone(),
                CameraId::new(camera.id.clone()),
                format!("{}/flash", base_url.trim_end_matches('/')),
                rx,
            )));
            queues.insert(CameraId::new(camera.id.clone()), tx);
        }

        Ok(Self {
            queues: Mutex::new(queues),
            tasks: Mutex::new(tasks),
            request_timeout,
        })
    }

    pub fn has_light(&self, camera: &CameraId) -> bool {
        lock(&self.queues).contains_key(camera)
    }

    /// Closes every queue and waits until the requests already in them have
    /// been sent, for at most twice the request timeout. Later `on`/`off`
    /// calls are no-ops.
    pub async fn shutdown(&self) {
        lock(&self.queues).clear();
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        if tasks.is_empty() {
            return;
        }

        let drain = async {
            for task in tasks {
                if let Err(e) = task.await {
                    tracing::warn!("Light task ended abnormally: {}", e);
                }
            }
        };
        if tokio::time::timeout(self.request_timeout * 2, drain).await.is_err() {
            tracing::warn!("Camera lights still busy after {:?}; their last request may be lost",
                self.request_timeout * 2);
        }
    }

    fn send(&self, camera: &CameraId, state: LightState) -> Result<()> {
        // cameras without a light are a no-op
        let queues = lock(&self.queues);
        let Some(queue) = queues.get(camera) else {
            return Ok(());
        };
        queue
            .send(state)
            .map_err(|_| KioskError::Illumination(format!("light task for camera {} has stopped", camera)))
    }
}

impl IlluminationAssist for HttpIllumination {
    fn on(&self, camera: &CameraId) -> Result<()> {
        self.send(camera, LightState::On)
    }

    fn off(&self, camera: &CameraId) -> Result<()> {
        self.send(camera, LightState::Off)
    }
}

async fn drive_light(
    client: reqwest::Client,
    camera: CameraId,
    url: String,
    mut requests: mpsc::UnboundedReceiver<LightState>,
) {
    while let Some(state) = requests.recv().await {
        let result = client
            .post(&url)
            .json(&FlashRequest { state })
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(_) => tracing::debug!("Camera {} light {:?}", camera, state),
            Err(e) => tracing::warn!("Camera {} light {:?} request failed: {}", camera, state, e),
        }
    }
    tracing::debug!("Light task for camera {} stopped", camera);
}
