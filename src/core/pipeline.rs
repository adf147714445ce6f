//! Recognition path: detection, then gallery match, then ledger record.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use crate::common::Result;
use crate::core::acquisition::CancelToken;
use crate::core::capture::{CaptureLoop, LoopStats, OverlayRenderer, SuspendHandle, TickOutcome};
use crate::core::clock::Clock;
use crate::core::enrollment::{EnrollmentError, EnrollmentService};
use crate::core::matcher::MatchingEngine;
use crate::core::types::{CameraId, Detection, Frame, IdentityId};
use crate::storage::{CreateOptions, DetectionLedger, LedgerRecord, Profile, ProfileStore, SnapshotWriter};

pub struct RecognitionPipeline {
    store: Arc<dyn ProfileStore>,
    engine: MatchingEngine,
    ledger: Arc<DetectionLedger>,
    snapshots: Option<SnapshotWriter>,
}

impl RecognitionPipeline {
    pub fn new(store: Arc<dyn ProfileStore>, engine: MatchingEngine, ledger: Arc<DetectionLedger>) -> Self {
        Self { store, engine, ledger, snapshots: None }
    }

    pub fn with_snapshots(mut self, writer: SnapshotWriter) -> Self {
        self.snapshots = Some(writer);
        self
    }

    /// Matches one captured detection and records the outcome. A snapshot
    /// that cannot be written is logged and the event recorded without it.
    pub async fn recognize(&self, frame: &Frame, detection: &Detection) -> Result<LedgerRecord> {
        let result = self.engine.match_detection(self.store.as_ref(), detection).await?;

        let snapshot_ref = match &self.snapshots {
            Some(writer) => match writer.save(frame, detection, &result).await {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Snapshot for camera {} not saved: {}", frame.camera, e);
                    None
                }
            },
            None => None,
        };

        let record = self.ledger
            .record(&frame.camera, result, snapshot_ref, detection.detected_at)
            .await?;
        Ok(record)
    }
}

pub type EnrollmentReply = std::result::Result<Profile, EnrollmentError>;

#[derive(Debug, Clone)]
pub enum EnrollmentKind {
    Create(CreateOptions),
    Append,
}

/// Asks a running camera worker to enroll whoever stands in front of it.
pub struct EnrollmentRequest {
    pub identity: IdentityId,
    pub kind: EnrollmentKind,
    pub cancel: CancelToken,
    pub reply: oneshot::Sender<EnrollmentReply>,
}

impl EnrollmentRequest {
    pub fn new(
        identity: IdentityId,
        kind: EnrollmentKind,
        cancel: CancelToken,
    ) -> (Self, oneshot::Receiver<EnrollmentReply>) {
        let (reply, rx) = oneshot::channel();
        (Self { identity, kind, cancel, reply }, rx)
    }
}

const ENROLLMENT_QUEUE: usize = 4;

type PendingEnrollment = Pin<Box<dyn Future<Output = ()> + Send>>;

struct EnrollmentDesk {
    service: Arc<EnrollmentService>,
    requests: mpsc::Receiver<EnrollmentRequest>,
}

/// Drives one camera: ticks its capture loop on a fixed cadence, feeds the
/// overlay and hands detections to the recognition pipeline at most once
/// per cooldown. Enrollment requests run on the same task while the
/// passive loop is suspended.
pub struct CameraWorker {
    capture: CaptureLoop,
    pipeline: Arc<RecognitionPipeline>,
    renderer: Option<Box<dyn OverlayRenderer>>,
    enrollment: Option<EnrollmentDesk>,
    clock: Arc<dyn Clock>,
    cadence: Duration,
    cooldown: Duration,
    last_attempt: Option<Duration>,
}

impl CameraWorker {
    pub fn new(
        capture: CaptureLoop,
        pipeline: Arc<RecognitionPipeline>,
        clock: Arc<dyn Clock>,
        cadence: Duration,
        cooldown: Duration,
    ) -> Self {
        Self {
            capture,
            pipeline,
            renderer: None,
            enrollment: None,
            clock,
            cadence,
            cooldown,
            last_attempt: None,
        }
    }

    pub fn with_renderer(mut self, renderer: Box<dyn OverlayRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Lets this worker serve enrollment requests. The service should read
    /// frames from the same source as the capture loop.
    pub fn with_enrollment(mut self, service: Arc<EnrollmentService>) -> (Self, mpsc::Sender<EnrollmentRequest>) {
        let (tx, requests) = mpsc::channel(ENROLLMENT_QUEUE);
        self.enrollment = Some(EnrollmentDesk { service, requests });
        (self, tx)
    }

    pub fn camera(&self) -> &CameraId {
        self.capture.camera()
    }

    pub fn suspend_handle(&self) -> SuspendHandle {
        self.capture.suspend_handle()
    }

    fn cooling_down(&self) -> bool {
        match self.last_attempt {
            Some(at) => self.clock.elapsed().saturating_sub(at) < self.cooldown,
            None => false,
        }
    }

    /// One tick. Returns the tick outcome after rendering and, if due,
    /// recognition have consumed it.
    pub async fn step(&mut self) -> TickOutcome {
        let outcome = self.capture.tick().await;

        if let Some(renderer) = self.renderer.as_mut() {
            renderer.render(self.capture.camera(), &outcome);
        }

        if let TickOutcome::Detected { frame, .. } = &outcome {
            if !self.cooling_down() {
                if let Some(detection) = self.capture.take_detection() {
                    self.last_attempt = Some(self.clock.elapsed());
                    match self.pipeline.recognize(frame, &detection).await {
                        Ok(record) => debug!("Camera {} recorded event #{}", frame.camera, record.seq),
                        Err(e) => error!("Recognition on camera {} failed: {}", frame.camera, e),
                    }
                }
            }
        }

        outcome
    }

    fn start_enrollment(&self, service: Arc<EnrollmentService>, request: EnrollmentRequest) -> PendingEnrollment {
        let camera = self.camera().clone();
        let suspend = self.suspend_handle();
        info!("Camera {} pausing recognition to enroll {}", camera, request.identity);

        Box::pin(async move {
            let EnrollmentRequest { identity, kind, cancel, reply } = request;
            let outcome = match kind {
                EnrollmentKind::Create(options) => {
                    service.enroll(&identity, &camera, options, Some(&suspend), &cancel).await
                }
                EnrollmentKind::Append => service.append(&identity, &camera, Some(&suspend), &cancel).await,
            };
            if reply.send(outcome).is_err() {
                warn!("Enrollment of {} on camera {} finished after its requester left", identity, camera);
            }
        })
    }

    /// Ticks until `shutdown` turns true or its sender is dropped. An
    /// enrollment still running at shutdown is abandoned.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> LoopStats {
        info!("Camera {} loop started ({:?} cadence)", self.camera(), self.cadence);

        let (service, mut requests) = match self.enrollment.take() {
            Some(desk) => (Some(desk.service), Some(desk.requests)),
            None => (None, None),
        };
        let mut pending: Option<PendingEnrollment> = None;

        while !*shutdown.borrow() {
            self.step().await;

            tokio::select! {
                _ = self.clock.sleep(self.cadence) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(request) = next_request(&mut requests), if pending.is_none() => {
                    if let Some(service) = &service {
                        pending = Some(self.start_enrollment(Arc::clone(service), request));
                    }
                }
                _ = finish(&mut pending), if pending.is_some() => {
                    pending = None;
                    info!("Camera {} resuming recognition", self.camera());
                }
            }
        }

        let stats = self.capture.stats().clone();
        info!("Camera {} loop stopped after {} ticks ({} detections)", self.camera(), stats.ticks, stats.detections);
        stats
    }
}

async fn next_request(requests: &mut Option<mpsc::Receiver<EnrollmentRequest>>) -> Option<EnrollmentRequest> {
    match requests {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn finish(pending: &mut Option<PendingEnrollment>) {
    match pending {
        Some(enrollment) => enrollment.await,
        None => std::future::pending().await,
    }
}
