//! Subcommand bodies for the `kioskface` binary. Each one assembles the
//! components it needs from the loaded config and calls into the library.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use crate::camera::{list_all_cameras, FrameSource, V4l2FrameSource};
use crate::cli::ascii_preview::{clear_screen, AsciiOverlay};
use crate::common::config::CameraConfig;
use crate::common::{Config, DevMode};
use crate::core::{
    AcquisitionSettings, AssistController, CameraId, CameraWorker, CancelToken, CaptureLoop,
    Classification, Clock, EnrollmentKind, EnrollmentService, FeatureExtractor, IdentityId,
    IlluminationAssist, MatchPolicy, MatchingEngine, NoopIllumination, RecognitionPipeline,
    RetryPolicy, SampleAcquisition, SystemClock,
};
use crate::service::control::{self, ControlRequest, ControlResponse, ControlServer};
use crate::service::{HttpFeatureExtractor, HttpIllumination};
use crate::storage::{
    CreateOptions, DetectionLedger, DetectionQuery, FileProfileStore, JsonlLedger, Profile,
    ProfileStore, Sealer, SnapshotWriter, TracingAlertSink,
};

/// Loaded configuration plus the pieces every command builds on.
pub struct Kiosk {
    pub config: Config,
    pub dev: DevMode,
    pub clock: Arc<dyn Clock>,
}

impl Kiosk {
    pub fn new(config: Config, dev: DevMode) -> Self {
        Self { config, dev, clock: Arc::new(SystemClock::new()) }
    }

    pub fn profile_store(&self) -> Result<Arc<dyn ProfileStore>> {
        let dir = self.dev.profiles_dir(&self.config.storage);
        let store = FileProfileStore::open(&dir)
            .with_context(|| format!("opening profile store at {}", dir.display()))?;
        Ok(Arc::new(store))
    }

    pub async fn ledger(&self) -> Result<Arc<DetectionLedger>> {
        let storage = &self.config.storage;
        let sealer = if self.config.ledger.sign_records {
            Sealer::load_or_create_key(&self.dev.ledger_key_path(storage))
                .context("loading ledger signing key")?
        } else {
            Sealer::unsigned()
        };

        let path = self.dev.ledger_path(storage);
        let backend = JsonlLedger::open(&path, sealer)
            .await
            .with_context(|| format!("opening ledger at {}", path.display()))?;

        let policy = RetryPolicy::new(
            self.config.ledger.max_attempts,
            Duration::from_millis(self.config.ledger.retry_delay_ms),
        );
        Ok(Arc::new(DetectionLedger::new(
            Arc::new(backend),
            Arc::new(TracingAlertSink),
            policy,
            Arc::clone(&self.clock),
        )))
    }

    fn extractor(&self) -> Result<Arc<dyn FeatureExtractor>> {
        Ok(Arc::new(HttpFeatureExtractor::new(&self.config.extractor)?))
    }

    /// Light workers for `cameras`, or `None` when illumination is off.
    /// Callers must `shutdown` what they get back before exiting.
    fn lights(&self, cameras: &[CameraConfig]) -> Result<Option<Arc<HttpIllumination>>> {
        let settings = &self.config.illumination;
        if !settings.enabled {
            return Ok(None);
        }
        Ok(Some(Arc::new(HttpIllumination::spawn(
            cameras,
            Duration::from_millis(settings.request_timeout_ms),
        )?)))
    }

    fn cameras(&self, only: Option<&str>) -> Result<Vec<CameraConfig>> {
        match only {
            Some(id) => Ok(vec![self.config.camera(id)?.clone()]),
            None if self.config.cameras.is_empty() => bail!("No cameras configured"),
            None => Ok(self.config.cameras.clone()),
        }
    }

    fn enrollment_service(
        &self,
        source: Arc<dyn FrameSource>,
        extractor: Arc<dyn FeatureExtractor>,
        lights: Option<&Arc<HttpIllumination>>,
        store: Arc<dyn ProfileStore>,
    ) -> EnrollmentService {
        let assist: Arc<dyn IlluminationAssist> = match lights {
            Some(lights) => Arc::clone(lights) as Arc<dyn IlluminationAssist>,
            None => Arc::new(NoopIllumination),
        };
        let acquisition = SampleAcquisition::new(
            source,
            extractor,
            AssistController::new(assist, Duration::from_millis(self.config.illumination.settle_ms)),
            Arc::clone(&self.clock),
            AcquisitionSettings::from(&self.config.enrollment),
        );
        EnrollmentService::new(acquisition, store)
    }

    /// A daemon started with `--camera` listens on its own socket so that
    /// one process per camera can run side by side.
    fn control_socket(&self, camera: Option<&str>) -> PathBuf {
        let base = self.dev.control_socket(&self.config.storage);
        match camera {
            Some(id) => control::camera_socket(&base, id),
            None => base,
        }
    }
}

async fn lights_off(lights: Option<Arc<HttpIllumination>>) {
    if let Some(lights) = lights {
        lights.shutdown().await;
    }
}

fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nCancelling after the current sample...");
            token.cancel();
        }
    });
    cancel
}

pub async fn run(kiosk: &Kiosk, only: Option<&str>, preview: bool) -> Result<()> {
    let cameras = kiosk.cameras(only)?;
    let source: Arc<dyn FrameSource> = Arc::new(V4l2FrameSource::open(&cameras)?);
    let extractor = kiosk.extractor()?;
    let store = kiosk.profile_store()?;

    let mut pipeline = RecognitionPipeline::new(
        Arc::clone(&store),
        MatchingEngine::new(MatchPolicy::from(&kiosk.config.matching)),
        kiosk.ledger().await?,
    );
    if kiosk.config.recognition.save_snapshots {
        pipeline = pipeline.with_snapshots(SnapshotWriter::open(kiosk.dev.snapshots_dir(&kiosk.config.storage))?);
    }
    let pipeline = Arc::new(pipeline);

    let cadence = Duration::from_millis(kiosk.config.capture.tick_interval_ms);
    let cooldown = Duration::from_millis(kiosk.config.recognition.cooldown_ms);
    if preview {
        clear_screen()?;
    }
    let lights = kiosk.lights(&cameras)?;

    let mut workers = Vec::new();
    let mut desks = Vec::new();
    for (i, camera) in cameras.iter().enumerate() {
        let id = CameraId::new(camera.id.clone());
        let capture = CaptureLoop::new(id.clone(), Arc::clone(&source), Arc::clone(&extractor));
        let enrollment = kiosk.enrollment_service(
            Arc::clone(&source),
            Arc::clone(&extractor),
            lights.as_ref(),
            Arc::clone(&store),
        );
        let (mut worker, requests) = CameraWorker::new(capture, Arc::clone(&pipeline), Arc::clone(&kiosk.clock), cadence, cooldown)
            .with_enrollment(Arc::new(enrollment));
        // a single terminal can only show one camera
        if preview && i == 0 {
            worker = worker.with_renderer(Box::new(AsciiOverlay::new(None, None)));
        }
        workers.push(worker);
        desks.push((id, requests));
    }

    let control = match ControlServer::bind(&kiosk.control_socket(only), desks) {
        Ok(control) => control,
        Err(e) => {
            lights_off(lights).await;
            return Err(e).context("binding control socket");
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control = tokio::spawn(control.serve(shutdown_rx.clone()));
    let workers: Vec<_> = workers
        .into_iter()
        .map(|worker| tokio::spawn(worker.run(shutdown_rx.clone())))
        .collect();

    tracing::info!("Recognition running on {} camera(s); Ctrl-C to stop", workers.len());
    let interrupted = tokio::signal::ctrl_c().await;
    let _ = shutdown_tx.send(true);

    for worker in workers {
        match worker.await {
            Ok(stats) => tracing::debug!("Worker stats: {:?}", stats),
            Err(e) => tracing::warn!("Camera worker ended abnormally: {}", e),
        }
    }
    if let Err(e) = control.await {
        tracing::warn!("Control socket task ended abnormally: {}", e);
    }
    lights_off(lights).await;

    interrupted.context("waiting for Ctrl-C")?;
    Ok(())
}

async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_ok() {
        println!("\nCancelling after the current sample...");
    } else {
        std::future::pending::<()>().await;
    }
}

/// Hands `request` to a running `kioskface run`, if there is one: the
/// daemon for `camera` alone first, then the one for all cameras. Ctrl-C
/// asks the daemon to stop after the sample in progress.
async fn ask_daemon(kiosk: &Kiosk, camera: Option<&str>, request: &ControlRequest) -> Result<Option<ControlResponse>> {
    let mut sockets = Vec::new();
    if camera.is_some() {
        sockets.push(kiosk.control_socket(camera));
    }
    sockets.push(kiosk.control_socket(None));

    for socket in sockets {
        if let Some(response) = control::send(&socket, request, interrupted()).await? {
            return Ok(Some(response));
        }
    }
    Ok(None)
}

/// Runs an enrollment in this process when no daemon holds the cameras.
/// No passive loop runs here, so there is nothing to suspend.
async fn enroll_locally(kiosk: &Kiosk, camera: Option<&str>, identity: &IdentityId, kind: EnrollmentKind) -> Result<Profile> {
    let camera = kiosk.cameras(camera)?.remove(0);
    let cameras = std::slice::from_ref(&camera);
    let source: Arc<dyn FrameSource> = Arc::new(V4l2FrameSource::open(cameras)?);
    let extractor = kiosk.extractor()?;
    let store = kiosk.profile_store()?;
    let lights = kiosk.lights(cameras)?;
    let service = kiosk.enrollment_service(source, extractor, lights.as_ref(), store);

    let camera = CameraId::new(camera.id.clone());
    tracing::debug!("No daemon running; enrolling {} on camera {} directly", identity, camera);
    let cancel = cancel_on_ctrl_c();
    let outcome = match kind {
        EnrollmentKind::Create(options) => service.enroll(identity, &camera, options, None, &cancel).await,
        EnrollmentKind::Append => service.append(identity, &camera, None, &cancel).await,
    };
    lights_off(lights).await;
    Ok(outcome?)
}

pub async fn enroll(kiosk: &Kiosk, identity: &str, camera: Option<&str>, replace: bool, image_ref: Option<String>) -> Result<()> {
    let identity = IdentityId::parse(identity)?;
    println!("Enrolling {}. Look at the camera.", identity);

    let request = ControlRequest::Enroll {
        identity: identity.to_string(),
        camera: camera.map(str::to_string),
        replace,
        image_ref: image_ref.clone(),
    };
    match ask_daemon(kiosk, camera, &request).await? {
        Some(ControlResponse::Enrolled { camera, profile_id, embeddings }) => {
            println!("Enrolled {} on camera {} (profile {}, {} embeddings)", identity, camera, profile_id, embeddings);
        }
        Some(ControlResponse::Error(reason)) => bail!("{}", reason),
        None => {
            let options = CreateOptions { replace_active: replace, image_ref };
            let profile = enroll_locally(kiosk, camera, &identity, EnrollmentKind::Create(options)).await?;
            println!("Enrolled {} (profile {}, {} embeddings)", identity, profile.profile_id, profile.embeddings.len());
        }
    }
    Ok(())
}

pub async fn append(kiosk: &Kiosk, identity: &str, camera: Option<&str>) -> Result<()> {
    let identity = IdentityId::parse(identity)?;
    println!("Adding samples for {}. Look at the camera.", identity);

    let request = ControlRequest::Append { identity: identity.to_string(), camera: camera.map(str::to_string) };
    let embeddings = match ask_daemon(kiosk, camera, &request).await? {
        Some(ControlResponse::Enrolled { embeddings, .. }) => embeddings,
        Some(ControlResponse::Error(reason)) => bail!("{}", reason),
        None => enroll_locally(kiosk, camera, &identity, EnrollmentKind::Append).await?.embeddings.len(),
    };

    println!("{} now has {} embeddings", identity, embeddings);
    Ok(())
}

pub async fn deactivate(kiosk: &Kiosk, identity: &str, provider: Option<&str>) -> Result<()> {
    let identity = IdentityId::parse(identity)?;
    let provider = provider.unwrap_or(kiosk.config.extractor.provider.as_str());
    let profile = kiosk.profile_store()?.deactivate(&identity, provider).await?;
    println!("Deactivated profile {} of {} ({})", profile.profile_id, identity, provider);
    Ok(())
}

pub async fn profiles(kiosk: &Kiosk, identity: Option<&str>) -> Result<()> {
    let store = kiosk.profile_store()?;

    match identity {
        Some(identity) => {
            let identity = IdentityId::parse(identity)?;
            let profiles = store.profiles_for(&identity).await?;
            if profiles.is_empty() {
                println!("No profiles for {}", identity);
            }
            for p in profiles {
                println!(
                    "{}  {:<12} {:<8} {:>3} embeddings  created {}{}",
                    p.profile_id,
                    p.provider,
                    if p.active { "active" } else { "inactive" },
                    p.embeddings.len(),
                    p.created_at.format("%Y-%m-%d %H:%M"),
                    p.image_ref.as_ref().map(|r| format!("  image {}", r)).unwrap_or_default()
                );
            }
        }
        None => {
            let counts = store.counts().await?;
            let extractor = &kiosk.config.extractor;
            let provider = crate::core::ProviderTag::new(extractor.provider.clone(), extractor.model_version.clone());
            let gallery = store.list_active(&provider).await?;
            println!("Identities: {}", counts.identities);
            println!("Profiles:   {} ({} active)", counts.profiles, counts.active);
            println!("Gallery {}: {} embeddings", provider, gallery.len());
        }
    }
    Ok(())
}

fn parse_time(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(v)
                .map(|t| t.with_timezone(&Utc))
                .with_context(|| format!("invalid RFC 3339 timestamp: {}", v))
        })
        .transpose()
}

pub struct DetectionFilter<'a> {
    pub camera: Option<&'a str>,
    pub identity: Option<&'a str>,
    pub status: Option<&'a str>,
    pub since: Option<&'a str>,
    pub until: Option<&'a str>,
    pub limit: usize,
    pub offset: usize,
    pub json: bool,
}

pub async fn detections(kiosk: &Kiosk, filter: DetectionFilter<'_>) -> Result<()> {
    let query = DetectionQuery {
        camera: filter.camera.map(CameraId::new),
        identity: filter.identity.map(IdentityId::parse).transpose()?,
        classification: filter.status.map(str::parse::<Classification>).transpose()?,
        since: parse_time(filter.since)?,
        until: parse_time(filter.until)?,
        limit: Some(filter.limit),
        offset: filter.offset,
    };

    let page = kiosk.ledger().await?.query(&query).await?;

    if filter.json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }

    for event in &page.events {
        let result = &event.result;
        println!(
            "{}  {:<10} {:<16} {:<12} conf {}  dist {}",
            event.occurred_at.format("%Y-%m-%d %H:%M:%S"),
            event.camera,
            result.classification,
            result.identity.as_ref().map(|i| i.as_str()).unwrap_or("-"),
            result.confidence.map(|c| format!("{:.2}", c)).unwrap_or_else(|| "-".into()),
            result.best_distance().map(|d| format!("{:.3}", d)).unwrap_or_else(|| "-".into()),
        );
    }
    println!("{} of {} events", page.events.len(), page.total);
    Ok(())
}

pub async fn stats(kiosk: &Kiosk) -> Result<()> {
    let stats = kiosk.ledger().await?.stats().await?;
    println!("Detections:       {}", stats.total);
    println!("  matched:        {}", stats.matched);
    println!("  new faces:      {}", stats.new_faces);
    println!("  multiple:       {}", stats.multiple_matches);
    println!("  unknown:        {}", stats.unknown);
    for (camera, count) in &stats.per_camera {
        println!("  camera {:<8} {}", camera, count);
    }
    Ok(())
}

pub async fn verify_ledger(kiosk: &Kiosk) -> Result<()> {
    let report = kiosk.ledger().await?.verify().await?;
    let signed = if report.signed { "signed" } else { "unsigned" };

    match report.into_result() {
        Ok(report) => {
            println!("Ledger intact: {} records ({})", report.records, signed);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub fn detect_camera() -> Result<()> {
    let cameras = list_all_cameras()?;
    if cameras.is_empty() {
        println!("No cameras found. Check that /dev/video* exists and is readable.");
        return Ok(());
    }

    for camera in &cameras {
        println!(
            "/dev/video{}: {}{}",
            camera.index,
            camera.name,
            if camera.can_capture { "" } else { " (no capture)" }
        );
        if !camera.formats.is_empty() {
            println!("   formats: {}", camera.formats.join(", "));
        }
    }

    println!("\nAdd a camera to the config with:");
    println!("   [[cameras]]");
    println!("   id = \"lobby\"");
    println!("   device_index = <N>");
    Ok(())
}
