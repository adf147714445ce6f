//! Local control socket. `kioskface run` listens here so that `enroll` and
//! `append` can hand their work to the camera worker that already owns the
//! device, instead of opening it a second time.
//!
//! Frames are a little-endian `u32` length followed by a bincode body, in
//! both directions. A client that closes its write half cancels its
//! enrollment after the sample in progress.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use crate::common::{KioskError, Result};
use crate::core::{CameraId, CancelToken, EnrollmentKind, EnrollmentRequest, IdentityId};
use crate::storage::CreateOptions;

const MAX_FRAME: usize = 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ControlRequest {
    Enroll {
        identity: String,
        camera: Option<String>,
        replace: bool,
        image_ref: Option<String>,
    },
    Append {
        identity: String,
        camera: Option<String>,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ControlResponse {
    Enrolled {
        camera: String,
        profile_id: String,
        embeddings: usize,
    },
    Error(String),
}

/// Per-camera request queues, in config order. The first one serves
/// requests that name no camera.
pub type EnrollmentDesks = Vec<(CameraId, mpsc::Sender<EnrollmentRequest>)>;

/// Socket of a daemon started for one camera only, next to `base`.
pub fn camera_socket(base: &Path, camera: &str) -> PathBuf {
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("control");
    base.with_file_name(format!("{}-{}.sock", stem, camera))
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    desks: Arc<EnrollmentDesks>,
}

impl ControlServer {
    /// Binds `path`. A socket left behind by a dead daemon is replaced; one
    /// that still answers is an error.
    pub fn bind(path: &Path, desks: EnrollmentDesks) -> Result<Self> {
        if path.exists() {
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(KioskError::Config(format!(
                    "another kioskface is already listening on {}",
                    path.display()
                )));
            }
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;
        info!("Control socket listening on {}", path.display());

        Ok(Self { listener, path: path.to_path_buf(), desks: Arc::new(desks) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts clients until `shutdown` turns true. Each client is served on
    /// its own task.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let desks = Arc::clone(&self.desks);
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, &desks).await {
                                error!("Control client error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Control connection error: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Control socket {} closing", self.path.display());
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Could not remove control socket {}: {}", self.path.display(), e);
            }
        }
    }
}

fn route<'a>(
    desks: &'a EnrollmentDesks,
    camera: Option<&str>,
) -> std::result::Result<&'a (CameraId, mpsc::Sender<EnrollmentRequest>), String> {
    match camera {
        Some(id) => desks
            .iter()
            .find(|(camera, _)| camera.as_str() == id)
            .ok_or_else(|| format!("camera {} is not served by this daemon", id)),
        None => desks.first().ok_or_else(|| "no cameras are running".to_string()),
    }
}

async fn handle_client(mut stream: UnixStream, desks: &EnrollmentDesks) -> Result<()> {
    let request: ControlRequest = read_frame(&mut stream).await?;
    debug!("Control request: {:?}", request);

    let (identity, camera, kind) = match request {
        ControlRequest::Enroll { identity, camera, replace, image_ref } => {
            (identity, camera, EnrollmentKind::Create(CreateOptions { replace_active: replace, image_ref }))
        }
        ControlRequest::Append { identity, camera } => (identity, camera, EnrollmentKind::Append),
    };

    let (camera, desk) = match route(desks, camera.as_deref()) {
        Ok(entry) => entry,
        Err(reason) => return write_frame(&mut stream, &ControlResponse::Error(reason)).await,
    };
    let identity = match IdentityId::parse(&identity) {
        Ok(identity) => identity,
        Err(e) => return write_frame(&mut stream, &ControlResponse::Error(e.to_string())).await,
    };

    info!("Enrollment of {} requested on camera {}", identity, camera);
    let cancel = CancelToken::new();
    let (request, mut reply) = EnrollmentRequest::new(identity, kind, cancel.clone());
    if desk.send(request).await.is_err() {
        let reason = format!("camera {} has stopped", camera);
        return write_frame(&mut stream, &ControlResponse::Error(reason)).await;
    }

    let (mut reader, mut writer) = stream.split();
    let mut eof = [0u8; 1];
    let outcome = tokio::select! {
        outcome = &mut reply => outcome,
        _ = reader.read(&mut eof) => {
            info!("Control client left; cancelling enrollment on camera {}", camera);
            cancel.cancel();
            reply.await
        }
    };

    let response = match outcome {
        Ok(Ok(profile)) => ControlResponse::Enrolled {
            camera: camera.to_string(),
            profile_id: profile.profile_id,
            embeddings: profile.embeddings.len(),
        },
        Ok(Err(e)) => ControlResponse::Error(e.to_string()),
        Err(_) => ControlResponse::Error(format!("camera {} stopped before enrollment finished", camera)),
    };

    // the client may be gone by now
    if let Err(e) = write_frame(&mut writer, &response).await {
        debug!("Control reply not delivered: {}", e);
    }
    Ok(())
}

/// Sends one request to the daemon at `path`. `Ok(None)` means no daemon is
/// listening there. When `interrupt` completes first the daemon is asked to
/// cancel, and its final answer is still returned.
pub async fn send<F>(path: &Path, request: &ControlRequest, interrupt: F) -> Result<Option<ControlResponse>>
where
    F: Future<Output = ()>,
{
    let mut stream = match UnixStream::connect(path).await {
        Ok(stream) => stream,
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
            debug!("No daemon on {}: {}", path.display(), e);
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    write_frame(&mut stream, request).await?;

    let (mut reader, mut writer) = stream.split();
    let response = tokio::select! {
        response = read_frame(&mut reader) => response?,
        _ = interrupt => {
            writer.shutdown().await?;
            read_frame(&mut reader).await?
        }
    };
    Ok(Some(response))
}

async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(message)
        .map_err(|e| anyhow::anyhow!("Failed to serialize control message: {}", e))?;
    writer.write_all(&(data.len() as u32).to_le_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(anyhow::anyhow!("Control message too large: {} bytes", len).into());
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let message = bincode::deserialize(&buf)
        .map_err(|e| anyhow::anyhow!("Failed to deserialize control message: {}", e))?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::provider;
    use crate::core::{AcquisitionError, EnrollmentError};
    use crate::storage::{MemoryProfileStore, ProfileStore};

    /// Stands in for a camera worker: answers every request with `answer`.
    fn desk<F, Fut>(camera: &str, answer: F) -> (CameraId, mpsc::Sender<EnrollmentRequest>)
    where
        F: Fn(EnrollmentRequest) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::channel::<EnrollmentRequest>(1);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                answer(request).await;
            }
        });
        (CameraId::new(camera), tx)
    }

    fn start(path: &Path, desks: EnrollmentDesks) -> watch::Sender<bool> {
        let server = ControlServer::bind(path, desks).unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(server.serve(rx));
        tx
    }

    fn enroll(identity: &str, camera: Option<&str>) -> ControlRequest {
        ControlRequest::Enroll {
            identity: identity.to_string(),
            camera: camera.map(str::to_string),
            replace: false,
            image_ref: None,
        }
    }

    #[tokio::test]
    async fn request_is_served_by_the_named_camera() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("control.sock");
        let store = Arc::new(MemoryProfileStore::new());

        let lobby = desk("lobby", |_| async { panic!("lobby should not be asked") });
        let door_store = Arc::clone(&store);
        let door = desk("door", move |request| {
            let store = Arc::clone(&door_store);
            async move {
                let EnrollmentRequest { identity, kind, reply, .. } = request;
                let options = match kind {
                    EnrollmentKind::Create(options) => options,
                    EnrollmentKind::Append => panic!("expected a create"),
                };
                let profile = store
                    .create(&identity, vec![vec![0.2, 0.2], vec![0.3, 0.3]], &provider(), options)
                    .await
                    .map_err(EnrollmentError::from);
                let _ = reply.send(profile);
            }
        });
        let _shutdown = start(&path, vec![lobby, door]);

        let response = send(&path, &enroll("alice", Some("door")), std::future::pending())
            .await
            .unwrap()
            .unwrap();

        match response {
            ControlResponse::Enrolled { camera, embeddings, .. } => {
                assert_eq!(camera, "door");
                assert_eq!(embeddings, 2);
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(store.profiles_for(&IdentityId::parse("alice").unwrap()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_camera_and_bad_identity_are_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("control.sock");
        let lobby = desk("lobby", |_| async { panic!("nothing should reach the camera") });
        let _shutdown = start(&path, vec![lobby]);

        let response = send(&path, &enroll("alice", Some("garage")), std::future::pending()).await.unwrap();
        assert!(matches!(response, Some(ControlResponse::Error(reason)) if reason.contains("garage")));

        let response = send(&path, &enroll("../alice", None), std::future::pending()).await.unwrap();
        assert!(matches!(response, Some(ControlResponse::Error(_))));
    }

    #[tokio::test]
    async fn hanging_up_cancels_the_enrollment() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("control.sock");
        let lobby = desk("lobby", |request| async move {
            while !request.cancel.is_cancelled() {
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }
            let _ = request.reply.send(Err(AcquisitionError::Cancelled { completed: 1, total: 3 }.into()));
        });
        let _shutdown = start(&path, vec![lobby]);

        let response = send(
            &path,
            &ControlRequest::Append { identity: "alice".into(), camera: None },
            tokio::time::sleep(std::time::Duration::from_millis(20)),
        )
        .await
        .unwrap();

        match response {
            Some(ControlResponse::Error(reason)) => assert!(reason.contains("cancelled after 1 of 3"), "{}", reason),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn single_camera_daemons_get_their_own_socket() {
        let base = Path::new("/run/kioskface/control.sock");
        assert_eq!(camera_socket(base, "lobby"), PathBuf::from("/run/kioskface/control-lobby.sock"));
    }

    #[tokio::test]
    async fn missing_daemon_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let response = send(&tmp.path().join("control.sock"), &enroll("alice", None), std::future::pending())
            .await
            .unwrap();
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn stale_socket_is_replaced_but_a_live_one_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("control.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let first = ControlServer::bind(&path, vec![]).unwrap();
        assert!(ControlServer::bind(&path, vec![]).is_err());

        drop(first);
        assert!(!path.exists());
    }
}
