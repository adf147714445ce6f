//! Append-only audit trail of matching outcomes.
//!
//! Every record is chained to its predecessor with SHA-256 and, when a key is
//! configured, signed with HMAC-SHA-256, so an edited or removed record shows
//! up as the first broken link on `verify()`. Nothing here updates or deletes
//! a record once written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use crate::common::{KioskError, Result};
use crate::core::clock::Clock;
use crate::core::matcher::{Classification, MatchResult};
use crate::core::retry::{retry, RetryError, RetryPolicy};
use crate::core::types::{CameraId, IdentityId};

type HmacSha256 = Hmac<Sha256>;

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub event_id: String,
    pub camera: CameraId,
    pub result: MatchResult,
    pub snapshot_ref: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// 1-based position in the chain.
    pub seq: u64,
    pub prev_hash: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    pub event: DetectionEvent,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Detection {event_id} from camera {camera} not recorded after {attempts} attempts: {reason}")]
    Unrecorded {
        event_id: String,
        camera: CameraId,
        attempts: u32,
        reason: String,
    },

    #[error("Ledger chain broken at record {seq}: {reason}")]
    ChainBroken { seq: u64, reason: String },
}

/// Outcome of walking the chain from the first record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainReport {
    pub records: u64,
    pub signed: bool,
    pub first_broken: Option<u64>,
    pub reason: Option<String>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.first_broken.is_none()
    }

    pub fn into_result(self) -> std::result::Result<Self, LedgerError> {
        match self.first_broken {
            Some(seq) => Err(LedgerError::ChainBroken {
                seq,
                reason: self.reason.unwrap_or_default(),
            }),
            None => Ok(self),
        }
    }
}

/// Computes and checks record hashes and signatures.
#[derive(Clone, Default)]
pub struct Sealer {
    key: Option<Vec<u8>>,
}

impl fmt::Debug for Sealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sealer").field("signed", &self.is_signed()).finish()
    }
}

impl Sealer {
    pub fn unsigned() -> Self {
        Self { key: None }
    }

    pub fn with_key(key: Vec<u8>) -> Self {
        Self { key: Some(key) }
    }

    /// Reads the signing key, creating a fresh random one (mode 0600) if the
    /// file does not exist yet.
    pub fn load_or_create_key(path: &Path) -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        match std::fs::read(path) {
            Ok(key) if key.len() >= KEY_LEN / 2 => return Ok(Self::with_key(key)),
            Ok(_) => {
                return Err(KioskError::Storage(format!("Ledger key {} is too short", path.display())));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut key = vec![0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(&key)?;
        file.sync_all()?;

        tracing::info!("Created ledger signing key at {}", path.display());
        Ok(Self::with_key(key))
    }

    pub fn is_signed(&self) -> bool {
        self.key.is_some()
    }

    fn digest(seq: u64, prev_hash: &str, event: &DetectionEvent) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(prev_hash.as_bytes());
        hasher.update(seq.to_be_bytes());
        hasher.update(serde_json::to_vec(event)?);
        Ok(to_hex(&hasher.finalize()))
    }

    fn sign(&self, hash: &str) -> Result<Option<String>> {
        let Some(key) = &self.key else {
            return Ok(None);
        };
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| KioskError::Storage(format!("Invalid ledger key: {}", e)))?;
        mac.update(hash.as_bytes());
        Ok(Some(to_hex(&mac.finalize().into_bytes())))
    }

    pub fn seal(&self, seq: u64, prev_hash: &str, event: DetectionEvent) -> Result<LedgerRecord> {
        let hash = Self::digest(seq, prev_hash, &event)?;
        let mac = self.sign(&hash)?;
        Ok(LedgerRecord {
            seq,
            prev_hash: prev_hash.to_string(),
            hash,
            mac,
            event,
        })
    }

    pub fn verify(&self, records: &[LedgerRecord]) -> ChainReport {
        let mut report = ChainReport {
            records: records.len() as u64,
            signed: self.is_signed(),
            first_broken: None,
            reason: None,
        };

        let mut prev = GENESIS_HASH.to_string();
        for (i, record) in records.iter().enumerate() {
            let expected_seq = i as u64 + 1;
            let problem = if record.seq != expected_seq {
                Some(format!("expected sequence {}, found {}", expected_seq, record.seq))
            } else if record.prev_hash != prev {
                Some("previous hash does not match".to_string())
            } else {
                match Self::digest(record.seq, &record.prev_hash, &record.event) {
                    Ok(hash) if hash != record.hash => Some("content hash mismatch".to_string()),
                    Err(e) => Some(e.to_string()),
                    Ok(_) => match self.sign(&record.hash) {
                        Ok(Some(mac)) if record.mac.as_deref() != Some(mac.as_str()) => {
                            Some("signature mismatch".to_string())
                        }
                        Err(e) => Some(e.to_string()),
                        Ok(_) => None,
                    },
                }
            };

            if let Some(reason) = problem {
                report.first_broken = Some(expected_seq);
                report.reason = Some(reason);
                return report;
            }
            prev = record.hash.clone();
        }

        report
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Storage for sealed records. Implementations assign sequence numbers and
/// chain hashes under their own lock so concurrent appends never interleave.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    async fn append(&self, event: &DetectionEvent) -> Result<LedgerRecord>;

    /// All records in chain order.
    async fn records(&self) -> Result<Vec<LedgerRecord>>;

    fn sealer(&self) -> &Sealer;
}

pub struct MemoryLedger {
    sealer: Sealer,
    records: Mutex<Vec<LedgerRecord>>,
}

impl MemoryLedger {
    pub fn new(sealer: Sealer) -> Self {
        Self { sealer, records: Mutex::new(Vec::new()) }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(Sealer::unsigned())
    }
}

#[async_trait]
impl LedgerBackend for MemoryLedger {
    async fn append(&self, event: &DetectionEvent) -> Result<LedgerRecord> {
        let mut records = self.records.lock().await;
        let prev = records.last().map(|r| r.hash.as_str()).unwrap_or(GENESIS_HASH);
        let record = self.sealer.seal(records.len() as u64 + 1, prev, event.clone())?;
        records.push(record.clone());
        Ok(record)
    }

    async fn records(&self) -> Result<Vec<LedgerRecord>> {
        Ok(self.records.lock().await.clone())
    }

    fn sealer(&self) -> &Sealer {
        &self.sealer
    }
}

/// Where the chain currently ends, as read from the file itself.
struct ChainTail {
    seq: u64,
    hash: String,
    /// Bytes of complete records. Anything past this is a torn write.
    committed: u64,
    torn: u64,
}

const TAIL_CHUNK: u64 = 8 * 1024;

/// Reads backwards from the end of the file until the last complete line is
/// in hand.
fn read_tail(file: &mut File, path: &Path) -> Result<ChainTail> {
    let len = file.metadata()?.len();
    let mut buf: Vec<u8> = Vec::new();
    let mut start = len;

    while start > 0 && buf.iter().filter(|b| **b == b'\n').count() < 2 {
        let from = start.saturating_sub(TAIL_CHUNK);
        let mut chunk = vec![0u8; (start - from) as usize];
        file.seek(SeekFrom::Start(from))?;
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;
        start = from;
    }

    let complete = buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    let committed = start + complete as u64;

    let (seq, hash) = match buf[..complete].split(|b| *b == b'\n').filter(|l| !l.is_empty()).last() {
        Some(line) => {
            let last: LedgerRecord = serde_json::from_slice(line).map_err(|e| {
                KioskError::Storage(format!("Last record of {} is unreadable: {}", path.display(), e))
            })?;
            (last.seq, last.hash)
        }
        None => (0, GENESIS_HASH.to_string()),
    };

    Ok(ChainTail { seq, hash, committed, torn: len - committed })
}

/// Seals and writes one record while holding an exclusive lock on the file.
/// The chain head comes from the file, so every writer extends the same
/// chain no matter how many processes share it.
fn append_locked(path: &Path, sealer: &Sealer, event: DetectionEvent) -> Result<LedgerRecord> {
    let mut file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
    FileExt::lock_exclusive(&file)?;

    let tail = read_tail(&mut file, path)?;
    if tail.torn > 0 {
        tracing::warn!("Dropping {} bytes of an unfinished record at the end of {}", tail.torn, path.display());
        file.set_len(tail.committed)?;
    }

    let record = sealer.seal(tail.seq + 1, &tail.hash, event)?;
    let mut line = serde_json::to_vec(&record)?;
    line.push(b'\n');

    file.seek(SeekFrom::Start(tail.committed))?;
    file.write_all(&line)?;
    file.sync_data()?;
    // the lock goes with the descriptor
    Ok(record)
}

/// One JSON record per line, synced to disk before `append` returns.
pub struct JsonlLedger {
    path: PathBuf,
    sealer: Sealer,
    writer: Mutex<()>,
}

impl JsonlLedger {
    pub async fn open(path: impl Into<PathBuf>, sealer: Sealer) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tail_path = path.clone();
        let tail = tokio::task::spawn_blocking(move || -> Result<Option<ChainTail>> {
            let mut file = match File::open(&tail_path) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            FileExt::lock_shared(&file)?;
            read_tail(&mut file, &tail_path).map(Some)
        })
        .await
        .map_err(|e| KioskError::Other(anyhow::anyhow!("Ledger open task failed: {}", e)))??;

        match tail {
            Some(tail) => {
                if tail.torn > 0 {
                    tracing::warn!("Ledger {} ends with {} bytes of an unfinished record; the next append drops them",
                        path.display(), tail.torn);
                }
                tracing::debug!("Ledger {} opened at sequence {}", path.display(), tail.seq);
            }
            None => tracing::debug!("Ledger {} will be created on first append", path.display()),
        }

        Ok(Self { path, sealer, writer: Mutex::new(()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LedgerBackend for JsonlLedger {
    async fn append(&self, event: &DetectionEvent) -> Result<LedgerRecord> {
        let _writer = self.writer.lock().await;

        let path = self.path.clone();
        let sealer = self.sealer.clone();
        let event = event.clone();
        tokio::task::spawn_blocking(move || append_locked(&path, &sealer, event))
            .await
            .map_err(|e| KioskError::Other(anyhow::anyhow!("Ledger append task failed: {}", e)))?
    }

    async fn records(&self) -> Result<Vec<LedgerRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let committed = content.rfind('\n').map_or("", |i| &content[..=i]);
        committed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| {
                    KioskError::Storage(format!("{} line {}: {}", self.path.display(), i + 1, e))
                })
            })
            .collect()
    }

    fn sealer(&self) -> &Sealer {
        &self.sealer
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationalAlert {
    pub camera: CameraId,
    pub attempts: u32,
    pub reason: String,
    pub event: DetectionEvent,
    pub raised_at: DateTime<Utc>,
}

/// Where unrecordable detections are escalated.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: &OperationalAlert);
}

/// Emits alerts as `error!` events on the `kiosk_face::alert` target, with
/// the full event attached so it can be replayed into the ledger.
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: &OperationalAlert) {
        let event = serde_json::to_string(&alert.event)
            .unwrap_or_else(|e| format!("<unserializable event: {}>", e));
        tracing::error!(
            target: "kiosk_face::alert",
            camera = %alert.camera,
            event_id = %alert.event.event_id,
            attempts = alert.attempts,
            reason = %alert.reason,
            event = %event,
            "Detection could not be written to the ledger"
        );
    }
}

#[derive(Debug, Clone, Default)]
pub struct DetectionQuery {
    pub camera: Option<CameraId>,
    pub identity: Option<IdentityId>,
    pub classification: Option<Classification>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Defaults to [`DetectionQuery::DEFAULT_LIMIT`].
    pub limit: Option<usize>,
    pub offset: usize,
}

impl DetectionQuery {
    pub const DEFAULT_LIMIT: usize = 100;

    fn matches(&self, event: &DetectionEvent) -> bool {
        self.camera.as_ref().map_or(true, |c| &event.camera == c)
            && self.identity.as_ref().map_or(true, |i| event.result.identity.as_ref() == Some(i))
            && self.classification.map_or(true, |c| event.result.classification == c)
            && self.since.map_or(true, |t| event.occurred_at >= t)
            && self.until.map_or(true, |t| event.occurred_at <= t)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionPage {
    /// Newest first.
    pub events: Vec<DetectionEvent>,
    /// Matching events before paging.
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionStats {
    pub total: usize,
    pub matched: usize,
    pub new_faces: usize,
    pub multiple_matches: usize,
    pub unknown: usize,
    pub per_camera: BTreeMap<String, usize>,
}

pub struct DetectionLedger {
    backend: Arc<dyn LedgerBackend>,
    alerts: Arc<dyn AlertSink>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl DetectionLedger {
    pub fn new(
        backend: Arc<dyn LedgerBackend>,
        alerts: Arc<dyn AlertSink>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { backend, alerts, policy, clock }
    }

    /// Appends one event. Write failures are retried; if every attempt fails
    /// the event is handed to the alert sink and the error returned.
    pub async fn record(
        &self,
        camera: &CameraId,
        result: MatchResult,
        snapshot_ref: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> std::result::Result<LedgerRecord, LedgerError> {
        let event = DetectionEvent {
            event_id: new_event_id(occurred_at),
            camera: camera.clone(),
            result,
            snapshot_ref,
            occurred_at,
        };

        let outcome = retry(&self.policy, self.clock.as_ref(), |attempt| {
            if attempt > 1 {
                tracing::debug!("Retrying ledger write for {} (attempt {})", event.event_id, attempt);
            }
            self.backend.append(&event)
        })
        .await;

        match outcome {
            Ok(record) => {
                tracing::debug!("Recorded {} as #{}", record.event.event_id, record.seq);
                Ok(record)
            }
            Err(e) => {
                let attempts = e.attempts();
                let reason = match e {
                    RetryError::Exhausted { last, .. } => last.to_string(),
                    RetryError::TimedOut { last: Some(last), .. } => last.to_string(),
                    RetryError::TimedOut { last: None, elapsed, .. } => format!("timed out after {:?}", elapsed),
                };

                self.alerts.raise(&OperationalAlert {
                    camera: camera.clone(),
                    attempts,
                    reason: reason.clone(),
                    event: event.clone(),
                    raised_at: self.clock.now_utc(),
                });

                Err(LedgerError::Unrecorded {
                    event_id: event.event_id,
                    camera: camera.clone(),
                    attempts,
                    reason,
                })
            }
        }
    }

    pub async fn query(&self, query: &DetectionQuery) -> Result<DetectionPage> {
        let mut events: Vec<DetectionEvent> = self.backend
            .records()
            .await?
            .into_iter()
            .rev()
            .map(|r| r.event)
            .filter(|e| query.matches(e))
            .collect();
        // chain order is append order; occurrence time may differ slightly
        events.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));

        let total = events.len();
        let limit = query.limit.unwrap_or(DetectionQuery::DEFAULT_LIMIT);
        let events = events.into_iter().skip(query.offset).take(limit).collect();
        Ok(DetectionPage { events, total })
    }

    pub async fn stats(&self) -> Result<DetectionStats> {
        let mut stats = DetectionStats::default();
        for record in self.backend.records().await? {
            stats.total += 1;
            match record.event.result.classification {
                Classification::Matched => stats.matched += 1,
                Classification::NewFace => stats.new_faces += 1,
                Classification::MultipleMatches => stats.multiple_matches += 1,
                Classification::Unknown => stats.unknown += 1,
            }
            *stats.per_camera.entry(record.event.camera.to_string()).or_default() += 1;
        }
        Ok(stats)
    }

    pub async fn verify(&self) -> Result<ChainReport> {
        let records = self.backend.records().await?;
        Ok(self.backend.sealer().verify(&records))
    }
}

fn new_event_id(at: DateTime<Utc>) -> String {
    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!("{}-{}", at.format("%Y%m%dT%H%M%S%3fZ"), to_hex(&suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::matcher::Candidate;
    use crate::core::types::ProviderTag;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn result(classification: Classification, identity: Option<&str>) -> MatchResult {
        MatchResult {
            classification,
            identity: identity.map(|i| IdentityId::parse(i).unwrap()),
            confidence: identity.map(|_| 0.5),
            query_confidence: 0.9,
            provider: ProviderTag::new("face-api", "1"),
            candidates: identity
                .map(|i| vec![Candidate { identity: IdentityId::parse(i).unwrap(), distance: 0.3 }])
                .unwrap_or_default(),
        }
    }

    fn ledger(backend: Arc<dyn LedgerBackend>, alerts: Arc<dyn AlertSink>) -> DetectionLedger {
        DetectionLedger::new(
            backend,
            alerts,
            RetryPolicy::new(3, Duration::from_millis(100)),
            Arc::new(ManualClock::new()),
        )
    }

    #[derive(Default)]
    struct CollectingAlerts(std::sync::Mutex<Vec<OperationalAlert>>);

    impl AlertSink for CollectingAlerts {
        fn raise(&self, alert: &OperationalAlert) {
            self.0.lock().unwrap().push(alert.clone());
        }
    }

    /// Fails the first `failures` appends, then delegates.
    struct FlakyBackend {
        inner: MemoryLedger,
        failures: AtomicU32,
    }

    #[async_trait]
    impl LedgerBackend for FlakyBackend {
        async fn append(&self, event: &DetectionEvent) -> Result<LedgerRecord> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(KioskError::Storage("disk full".into()));
            }
            self.inner.append(event).await
        }

        async fn records(&self) -> Result<Vec<LedgerRecord>> {
            self.inner.records().await
        }

        fn sealer(&self) -> &Sealer {
            self.inner.sealer()
        }
    }

    fn flaky(failures: u32) -> Arc<FlakyBackend> {
        Arc::new(FlakyBackend { inner: MemoryLedger::default(), failures: AtomicU32::new(failures) })
    }

    #[tokio::test]
    async fn transient_write_failures_are_retried() {
        let alerts = Arc::new(CollectingAlerts::default());
        let ledger = ledger(flaky(2), alerts.clone());

        let record = ledger
            .record(&CameraId::new("lobby"), result(Classification::Matched, Some("alice")), None, Utc::now())
            .await
            .unwrap();

        assert_eq!(record.seq, 1);
        assert!(alerts.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn persistent_failure_raises_an_alert() {
        let alerts = Arc::new(CollectingAlerts::default());
        let ledger = ledger(flaky(10), alerts.clone());

        let error = ledger
            .record(&CameraId::new("lobby"), result(Classification::Unknown, None), None, Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(error, LedgerError::Unrecorded { attempts: 3, .. }));
        let raised = alerts.0.lock().unwrap();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].event.result.classification, Classification::Unknown);
        assert!(raised[0].reason.contains("disk full"));
    }

    #[tokio::test]
    async fn query_filters_and_pages_newest_first() {
        let ledger = ledger(Arc::new(MemoryLedger::default()), Arc::new(TracingAlertSink));
        let start = Utc::now();
        let lobby = CameraId::new("lobby");
        let door = CameraId::new("door");

        for i in 0..5 {
            let at = start + chrono::Duration::seconds(i);
            ledger.record(&lobby, result(Classification::Matched, Some("alice")), None, at).await.unwrap();
        }
        ledger.record(&door, result(Classification::NewFace, None), None, start).await.unwrap();

        let page = ledger
            .query(&DetectionQuery { camera: Some(lobby.clone()), limit: Some(2), offset: 1, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.events[0].occurred_at, start + chrono::Duration::seconds(3));

        let new_faces = ledger
            .query(&DetectionQuery { classification: Some(Classification::NewFace), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(new_faces.total, 1);
        assert_eq!(new_faces.events[0].camera, door);

        let stats = ledger.stats().await.unwrap();
        assert_eq!((stats.total, stats.matched, stats.new_faces), (6, 5, 1));
        assert_eq!(stats.per_camera.get("lobby"), Some(&5));
    }

    #[tokio::test]
    async fn jsonl_chain_verifies_and_detects_tampering() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("detections.jsonl");
        let sealer = Sealer::load_or_create_key(&tmp.path().join(".key")).unwrap();

        {
            let backend = Arc::new(JsonlLedger::open(&path, sealer.clone()).await.unwrap());
            let ledger = ledger(backend, Arc::new(TracingAlertSink));
            for name in ["alice", "bob", "carol"] {
                ledger
                    .record(&CameraId::new("lobby"), result(Classification::Matched, Some(name)), None, Utc::now())
                    .await
                    .unwrap();
            }
            assert!(ledger.verify().await.unwrap().is_intact());
        }

        // reopening continues the chain
        let backend = Arc::new(JsonlLedger::open(&path, sealer.clone()).await.unwrap());
        let record = backend.append(&backend.records().await.unwrap()[0].event).await.unwrap();
        assert_eq!(record.seq, 4);

        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replacen("\"bob\"", "\"mallory\"", 1)).unwrap();

        let report = sealer.verify(&backend.records().await.unwrap());
        assert_eq!(report.first_broken, Some(2));
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn torn_tail_is_discarded_on_open() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("detections.jsonl");
        let backend = JsonlLedger::open(&path, Sealer::unsigned()).await.unwrap();
        let event = DetectionEvent {
            event_id: "e1".into(),
            camera: CameraId::new("lobby"),
            result: result(Classification::NewFace, None),
            snapshot_ref: None,
            occurred_at: Utc::now(),
        };
        backend.append(&event).await.unwrap();
        drop(backend);

        let mut content = std::fs::read(&path).unwrap();
        content.extend_from_slice(b"{\"seq\":2,\"prev");
        std::fs::write(&path, content).unwrap();

        let backend = JsonlLedger::open(&path, Sealer::unsigned()).await.unwrap();
        assert_eq!(backend.records().await.unwrap().len(), 1);
        assert_eq!(backend.append(&event).await.unwrap().seq, 2);
        assert!(Sealer::unsigned().verify(&backend.records().await.unwrap()).is_intact());
    }

    #[tokio::test]
    async fn writers_sharing_a_file_extend_one_chain() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("detections.jsonl");
        let lobby = JsonlLedger::open(&path, Sealer::unsigned()).await.unwrap();
        let entrance = JsonlLedger::open(&path, Sealer::unsigned()).await.unwrap();

        let event = |camera: &str| DetectionEvent {
            event_id: format!("{}-1", camera),
            camera: CameraId::new(camera),
            result: result(Classification::NewFace, None),
            snapshot_ref: None,
            occurred_at: Utc::now(),
        };

        assert_eq!(lobby.append(&event("lobby")).await.unwrap().seq, 1);
        assert_eq!(entrance.append(&event("entrance")).await.unwrap().seq, 2);
        assert_eq!(lobby.append(&event("lobby")).await.unwrap().seq, 3);

        let records = entrance.records().await.unwrap();
        let cameras: Vec<&str> = records.iter().map(|r| r.event.camera.as_str()).collect();
        assert_eq!(cameras, vec!["lobby", "entrance", "lobby"]);
        assert!(Sealer::unsigned().verify(&records).is_intact());
    }

    #[test]
    fn key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("keys/.key");
        let first = Sealer::load_or_create_key(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let again = Sealer::load_or_create_key(&path).unwrap();
        assert_eq!(first.key, again.key);
    }
}
