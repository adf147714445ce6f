use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use crate::common::{KioskError, Result};
use crate::core::matcher::{GalleryEntry, GallerySnapshot};
use crate::core::types::{Embedding, IdentityId, ProviderTag};

const STORAGE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredEmbedding {
    pub vector: Embedding,
    pub provider: ProviderTag,
    pub added_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Profile {
    pub profile_id: String,
    pub identity: IdentityId,
    /// Provider name this profile is unique under. Individual embeddings
    /// carry the full tag, model version included.
    pub provider: String,
    pub embeddings: Vec<StoredEmbedding>,
    pub active: bool,
    pub image_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl Profile {
    pub fn dimension(&self) -> Option<usize> {
        self.embeddings.first().map(|e| e.vector.len())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Deactivate an existing active profile instead of failing.
    pub replace_active: bool,
    pub image_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProfileCounts {
    pub identities: usize,
    pub profiles: usize,
    pub active: usize,
}

/// Durable home of enrolled identities.
///
/// Writes for one identity are serialized and land atomically: a reader sees
/// either the state before a create/append or the state after it.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn create(
        &self,
        identity: &IdentityId,
        embeddings: Vec<Embedding>,
        provider: &ProviderTag,
        options: CreateOptions,
    ) -> Result<Profile>;

    async fn append_embeddings(
        &self,
        identity: &IdentityId,
        embeddings: Vec<Embedding>,
        provider: &ProviderTag,
    ) -> Result<Profile>;

    async fn deactivate(&self, identity: &IdentityId, provider: &str) -> Result<Profile>;

    /// Every active embedding enrolled under exactly this provider tag.
    async fn list_active(&self, provider: &ProviderTag) -> Result<GallerySnapshot>;

    /// All profiles of an identity, inactive ones included, newest first.
    async fn profiles_for(&self, identity: &IdentityId) -> Result<Vec<Profile>>;

    async fn counts(&self) -> Result<ProfileCounts>;
}

/// Everything stored for one identity. This is the unit of atomic write.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct IdentityRecord {
    version: u32,
    identity: IdentityId,
    profiles: Vec<Profile>,
}

impl IdentityRecord {
    fn new(identity: IdentityId) -> Self {
        Self { version: STORAGE_VERSION, identity, profiles: Vec::new() }
    }

    fn active_mut(&mut self, provider: &str) -> Option<&mut Profile> {
        self.profiles.iter_mut().find(|p| p.active && p.provider == provider)
    }

    fn create(&mut self, embeddings: Vec<Embedding>, provider: &ProviderTag, options: CreateOptions) -> Result<Profile> {
        check_embeddings(&embeddings, None)?;
        let now = Utc::now();

        let active = self.profiles.iter_mut().find(|p| p.active && p.provider == provider.name);
        if let Some(existing) = active {
            if !options.replace_active {
                return Err(KioskError::ProfileConflict {
                    identity: self.identity.to_string(),
                    provider: provider.name.clone(),
                });
            }
            existing.active = false;
            existing.deactivated_at = Some(now);
            existing.updated_at = now;
            tracing::info!("Replacing active {} profile {} for {}", provider.name, existing.profile_id, self.identity);
        }

        let profile = Profile {
            profile_id: new_profile_id(),
            identity: self.identity.clone(),
            provider: provider.name.clone(),
            embeddings: stamp(embeddings, provider, now),
            active: true,
            image_ref: options.image_ref,
            created_at: now,
            updated_at: now,
            deactivated_at: None,
        };
        self.profiles.push(profile.clone());
        Ok(profile)
    }

    fn append(&mut self, embeddings: Vec<Embedding>, provider: &ProviderTag) -> Result<Profile> {
        let identity = self.identity.to_string();
        let profile = self.active_mut(&provider.name).ok_or_else(|| KioskError::ProfileNotFound {
            identity,
            provider: provider.name.clone(),
        })?;

        check_embeddings(&embeddings, profile.dimension())?;
        let now = Utc::now();
        profile.embeddings.extend(stamp(embeddings, provider, now));
        profile.updated_at = now;
        Ok(profile.clone())
    }

    fn deactivate(&mut self, provider: &str) -> Result<Profile> {
        let identity = self.identity.to_string();
        let profile = self.active_mut(provider).ok_or_else(|| KioskError::ProfileNotFound {
            identity,
            provider: provider.to_string(),
        })?;

        let now = Utc::now();
        profile.active = false;
        profile.deactivated_at = Some(now);
        profile.updated_at = now;
        Ok(profile.clone())
    }

    fn gallery_entries<'a>(&'a self, provider: &'a ProviderTag) -> impl Iterator<Item = GalleryEntry> + 'a {
        self.profiles
            .iter()
            .filter(move |p| p.active && p.provider == provider.name)
            .flat_map(|p| p.embeddings.iter())
            .filter(move |e| &e.provider == provider)
            .map(move |e| GalleryEntry {
                identity: self.identity.clone(),
                embedding: e.vector.clone(),
            })
    }

    fn newest_first(&self) -> Vec<Profile> {
        let mut profiles = self.profiles.clone();
        profiles.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        profiles
    }
}

fn check_embeddings(embeddings: &[Embedding], dimension: Option<usize>) -> Result<()> {
    let Some(first) = embeddings.first() else {
        return Err(KioskError::InvalidEmbedding("at least one embedding is required".into()));
    };
    let expected = dimension.unwrap_or(first.len());
    if expected == 0 {
        return Err(KioskError::InvalidEmbedding("embeddings must not be empty".into()));
    }
    for (i, e) in embeddings.iter().enumerate() {
        if e.len() != expected {
            return Err(KioskError::InvalidEmbedding(format!(
                "embedding {} has {} dimensions, profile uses {}", i + 1, e.len(), expected
            )));
        }
        if e.iter().any(|v| !v.is_finite()) {
            return Err(KioskError::InvalidEmbedding(format!("embedding {} has non-finite values", i + 1)));
        }
    }
    Ok(())
}

fn stamp(embeddings: Vec<Embedding>, provider: &ProviderTag, at: DateTime<Utc>) -> Vec<StoredEmbedding> {
    embeddings
        .into_iter()
        .map(|vector| StoredEmbedding { vector, provider: provider.clone(), added_at: at })
        .collect()
}

fn new_profile_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn counts_of<'a>(records: impl Iterator<Item = &'a IdentityRecord>) -> ProfileCounts {
    let mut counts = ProfileCounts::default();
    for record in records {
        counts.identities += 1;
        counts.profiles += record.profiles.len();
        counts.active += record.profiles.iter().filter(|p| p.active).count();
    }
    counts
}

/// In-process store with the same semantics as [`FileProfileStore`].
#[derive(Default)]
pub struct MemoryProfileStore {
    records: RwLock<BTreeMap<IdentityId, IdentityRecord>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `change` to a copy of the record and publishes the copy only
    /// if the change succeeded.
    async fn update<F>(&self, identity: &IdentityId, change: F) -> Result<Profile>
    where
        F: FnOnce(&mut IdentityRecord) -> Result<Profile> + Send,
    {
        let mut records = self.records.write().await;
        let mut record = records
            .get(identity)
            .cloned()
            .unwrap_or_else(|| IdentityRecord::new(identity.clone()));
        let profile = change(&mut record)?;
        records.insert(identity.clone(), record);
        Ok(profile)
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn create(
        &self,
        identity: &IdentityId,
        embeddings: Vec<Embedding>,
        provider: &ProviderTag,
        options: CreateOptions,
    ) -> Result<Profile> {
        self.update(identity, |r| r.create(embeddings, provider, options)).await
    }

    async fn append_embeddings(
        &self,
        identity: &IdentityId,
        embeddings: Vec<Embedding>,
        provider: &ProviderTag,
    ) -> Result<Profile> {
        self.update(identity, |r| r.append(embeddings, provider)).await
    }

    async fn deactivate(&self, identity: &IdentityId, provider: &str) -> Result<Profile> {
        self.update(identity, |r| r.deactivate(provider)).await
    }

    async fn list_active(&self, provider: &ProviderTag) -> Result<GallerySnapshot> {
        let records = self.records.read().await;
        let entries = records.values().flat_map(|r| r.gallery_entries(provider)).collect();
        Ok(GallerySnapshot::new(provider.clone(), entries))
    }

    async fn profiles_for(&self, identity: &IdentityId) -> Result<Vec<Profile>> {
        let records = self.records.read().await;
        Ok(records.get(identity).map(IdentityRecord::newest_first).unwrap_or_default())
    }

    async fn counts(&self) -> Result<ProfileCounts> {
        Ok(counts_of(self.records.read().await.values()))
    }
}

/// One bincode file per identity under a directory. Each write goes to a
/// temporary file that is synced and then renamed over the old one.
pub struct FileProfileStore {
    dir: PathBuf,
    locks: Mutex<HashMap<IdentityId, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileProfileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        tracing::debug!("Profile store at {}", dir.display());
        Ok(Self { dir, locks: Mutex::new(HashMap::new()) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, identity: &IdentityId) -> PathBuf {
        self.dir.join(format!("{}.bincode", identity))
    }

    fn identity_lock(&self, identity: &IdentityId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(identity.clone()).or_default())
    }

    async fn read_record(path: &Path) -> Result<Option<IdentityRecord>> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut record: IdentityRecord = bincode::deserialize(&data)
            .map_err(|e| KioskError::Storage(format!("Failed to deserialize {}: {}", path.display(), e)))?;

        if record.version < STORAGE_VERSION {
            record.version = STORAGE_VERSION;
        }
        Ok(Some(record))
    }

    async fn write_record(&self, record: &IdentityRecord) -> Result<()> {
        let encoded = bincode::serialize(record)
            .map_err(|e| KioskError::Storage(format!("Failed to serialize: {}", e)))?;

        let path = self.record_path(&record.identity);
        let tmp = self.dir.join(format!(".{}.tmp", record.identity));

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&encoded).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn update<F>(&self, identity: &IdentityId, change: F) -> Result<Profile>
    where
        F: FnOnce(&mut IdentityRecord) -> Result<Profile> + Send,
    {
        let lock = self.identity_lock(identity);
        let _held = lock.lock().await;

        let path = self.record_path(identity);
        let mut record = Self::read_record(&path)
            .await?
            .unwrap_or_else(|| IdentityRecord::new(identity.clone()));

        let profile = change(&mut record)?;
        self.write_record(&record).await?;
        Ok(profile)
    }

    async fn all_records(&self) -> Result<Vec<IdentityRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path.extension().map_or(false, |ext| ext == "bincode")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }
            if let Some(record) = Self::read_record(&path).await? {
                records.push(record);
            }
        }

        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(records)
    }
}

#[async_trait]
impl ProfileStore for FileProfileStore {
    async fn create(
        &self,
        identity: &IdentityId,
        embeddings: Vec<Embedding>,
        provider: &ProviderTag,
        options: CreateOptions,
    ) -> Result<Profile> {
        let profile = self.update(identity, |r| r.create(embeddings, provider, options)).await?;
        tracing::info!("Created {} profile {} for {} with {} embeddings",
            provider, profile.profile_id, identity, profile.embeddings.len());
        Ok(profile)
    }

    async fn append_embeddings(
        &self,
        identity: &IdentityId,
        embeddings: Vec<Embedding>,
        provider: &ProviderTag,
    ) -> Result<Profile> {
        let added = embeddings.len();
        let profile = self.update(identity, |r| r.append(embeddings, provider)).await?;
        tracing::info!("Appended {} embeddings to {} ({} total)", added, identity, profile.embeddings.len());
        Ok(profile)
    }

    async fn deactivate(&self, identity: &IdentityId, provider: &str) -> Result<Profile> {
        let profile = self.update(identity, |r| r.deactivate(provider)).await?;
        tracing::info!("Deactivated {} profile {} for {}", provider, profile.profile_id, identity);
        Ok(profile)
    }

    async fn list_active(&self, provider: &ProviderTag) -> Result<GallerySnapshot> {
        let records = self.all_records().await?;
        let entries = records.iter().flat_map(|r| r.gallery_entries(provider)).collect();
        Ok(GallerySnapshot::new(provider.clone(), entries))
    }

    async fn profiles_for(&self, identity: &IdentityId) -> Result<Vec<Profile>> {
        Ok(Self::read_record(&self.record_path(identity))
            .await?
            .map(|r| r.newest_first())
            .unwrap_or_default())
    }

    async fn counts(&self) -> Result<ProfileCounts> {
        Ok(counts_of(self.all_records().await?.iter()))
    }
}
