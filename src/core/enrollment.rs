use std::sync::Arc;
use thiserror::Error;
use crate::common::KioskError;
use crate::core::acquisition::{AcquisitionError, CancelToken, SampleAcquisition};
use crate::core::capture::SuspendHandle;
use crate::core::types::{CameraId, IdentityId};
use crate::storage::{CreateOptions, Profile, ProfileStore};

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Store(#[from] KioskError),
}

/// Enrollment path: sample acquisition, then a single profile write.
/// Nothing is written unless every sample was acquired.
pub struct EnrollmentService {
    acquisition: SampleAcquisition,
    store: Arc<dyn ProfileStore>,
}

impl EnrollmentService {
    pub fn new(acquisition: SampleAcquisition, store: Arc<dyn ProfileStore>) -> Self {
        Self { acquisition, store }
    }

    async fn has_active(&self, identity: &IdentityId) -> Result<bool, KioskError> {
        let provider = &self.acquisition.provider().name;
        Ok(self.store
            .profiles_for(identity)
            .await?
            .iter()
            .any(|p| p.active && &p.provider == provider))
    }

    /// Creates a profile from a fresh acquisition run. Without
    /// `replace_active` an existing active profile is reported before the
    /// client is asked to pose.
    pub async fn enroll(
        &self,
        identity: &IdentityId,
        camera: &CameraId,
        options: CreateOptions,
        suspend: Option<&SuspendHandle>,
        cancel: &CancelToken,
    ) -> Result<Profile, EnrollmentError> {
        let provider = self.acquisition.provider().clone();
        if !options.replace_active && self.has_active(identity).await? {
            return Err(KioskError::ProfileConflict {
                identity: identity.to_string(),
                provider: provider.name,
            }
            .into());
        }

        let acquired = self.acquisition.acquire(camera, suspend, cancel).await?;
        let profile = self.store.create(identity, acquired.into_embeddings(), &provider, options).await?;

        tracing::info!("Enrolled {} on camera {} as profile {}", identity, camera, profile.profile_id);
        Ok(profile)
    }

    /// Adds a fresh acquisition run to the identity's active profile.
    pub async fn append(
        &self,
        identity: &IdentityId,
        camera: &CameraId,
        suspend: Option<&SuspendHandle>,
        cancel: &CancelToken,
    ) -> Result<Profile, EnrollmentError> {
        let provider = self.acquisition.provider().clone();
        if !self.has_active(identity).await? {
            return Err(KioskError::ProfileNotFound {
                identity: identity.to_string(),
                provider: provider.name,
            }
            .into());
        }

        let acquired = self.acquisition.acquire(camera, suspend, cancel).await?;
        let profile = self.store.append_embeddings(identity, acquired.into_embeddings(), &provider).await?;

        tracing::info!("Re-enrolled {}: {} embeddings", identity, profile.embeddings.len());
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::acquisition::AcquisitionSettings;
    use crate::core::clock::ManualClock;
    use crate::core::illumination::{AssistController, NoopIllumination};
    use crate::core::test_support::{face, frame, provider, ScriptedExtractor, StaticFrameSource};
    use crate::storage::MemoryProfileStore;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn service(extractor: ScriptedExtractor, store: Arc<MemoryProfileStore>) -> EnrollmentService {
        let acquisition = SampleAcquisition::new(
            Arc::new(StaticFrameSource::ready(frame("lobby"))),
            Arc::new(extractor),
            AssistController::new(Arc::new(NoopIllumination), Duration::from_millis(150)),
            Arc::new(ManualClock::new()),
            AcquisitionSettings::default(),
        );
        EnrollmentService::new(acquisition, store)
    }

    fn good_faces(n: usize) -> Vec<crate::core::test_support::Step> {
        (0..n).map(|i| Ok(Some(face(vec![i as f32, 0.5], 0.9)))).collect()
    }

    #[tokio::test]
    async fn failed_run_persists_nothing() {
        let store = Arc::new(MemoryProfileStore::new());
        let enrollment = service(ScriptedExtractor::new(good_faces(2)), store.clone());
        let alice = IdentityId::parse("alice").unwrap();

        let error = enrollment
            .enroll(&alice, &CameraId::new("lobby"), CreateOptions::default(), None, &CancelToken::new())
            .await
            .unwrap_err();

        assert!(matches!(error, EnrollmentError::Acquisition(AcquisitionError::NoFaceDetected { sample: 3, .. })));
        assert!(store.profiles_for(&alice).await.unwrap().is_empty());
        assert!(store.list_active(&provider()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_mid_run_persists_nothing() {
        let store = Arc::new(MemoryProfileStore::new());
        let cancel = CancelToken::new();
        let enrollment = service(ScriptedExtractor::new(good_faces(3)).cancelling_on(1, cancel.clone()), store.clone());
        let alice = IdentityId::parse("alice").unwrap();

        let error = enrollment
            .enroll(&alice, &CameraId::new("lobby"), CreateOptions::default(), None, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(error, EnrollmentError::Acquisition(AcquisitionError::Cancelled { completed: 1, .. })));
        assert!(store.profiles_for(&alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn conflict_is_reported_before_capturing() {
        let store = Arc::new(MemoryProfileStore::new());
        let alice = IdentityId::parse("alice").unwrap();
        store.create(&alice, vec![vec![0.0, 0.0]], &provider(), CreateOptions::default()).await.unwrap();

        let extractor = ScriptedExtractor::new(good_faces(3));
        let calls = extractor.calls();
        let enrollment = service(extractor, store);

        let error = enrollment
            .enroll(&alice, &CameraId::new("lobby"), CreateOptions::default(), None, &CancelToken::new())
            .await
            .unwrap_err();

        assert!(matches!(error, EnrollmentError::Store(KioskError::ProfileConflict { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn enroll_then_append() {
        let store = Arc::new(MemoryProfileStore::new());
        let enrollment = service(ScriptedExtractor::new(good_faces(6)), store.clone());
        let alice = IdentityId::parse("alice").unwrap();
        let lobby = CameraId::new("lobby");

        let created = enrollment
            .enroll(&alice, &lobby, CreateOptions::default(), None, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(created.embeddings.len(), 3);

        let grown = enrollment.append(&alice, &lobby, None, &CancelToken::new()).await.unwrap();
        assert_eq!(grown.embeddings.len(), 6);
        assert_eq!(grown.profile_id, created.profile_id);
    }

    #[tokio::test]
    async fn append_requires_active_profile() {
        let store = Arc::new(MemoryProfileStore::new());
        let enrollment = service(ScriptedExtractor::new(good_faces(3)), store);

        let error = enrollment
            .append(&IdentityId::parse("bob").unwrap(), &CameraId::new("lobby"), None, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, EnrollmentError::Store(KioskError::ProfileNotFound { .. })));
    }
}
