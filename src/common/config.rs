use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::common::error::{KioskError, Result};
use crate::common::paths;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub illumination: IlluminationConfig,
    #[serde(default)]
    pub enrollment: EnrollmentConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExtractorConfig {
    /// Provider name recorded on every profile and gallery entry
    pub provider: String,
    pub model_version: String,
    pub endpoint: String,
    pub dimension: usize,
    #[serde(default = "default_extractor_timeout")]
    pub timeout_ms: u64,
}

fn default_extractor_timeout() -> u64 { 5000 }

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            provider: "face-api".to_string(),
            model_version: "1".to_string(),
            endpoint: "http://localhost:5001/api/extract".to_string(),
            dimension: 128,
            timeout_ms: default_extractor_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CameraConfig {
    pub id: String,
    pub device_index: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default)]
    pub warmup_frames: u32,
    /// Base URL of the device that owns this camera's light, if any
    #[serde(default)]
    pub light_url: Option<String>,
}

fn default_width() -> u32 { 640 }
fn default_height() -> u32 { 480 }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CaptureConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

fn default_tick_interval() -> u64 { 100 }

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { tick_interval_ms: default_tick_interval() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IlluminationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
    #[serde(default = "default_light_timeout")]
    pub request_timeout_ms: u64,
}

fn default_true() -> bool { true }
fn default_settle() -> u64 { 150 }
fn default_light_timeout() -> u64 { 2000 }

impl Default for IlluminationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settle_ms: default_settle(),
            request_timeout_ms: default_light_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnrollmentConfig {
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,
    #[serde(default = "default_enrollment_confidence")]
    pub min_confidence: f32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_sample_timeout")]
    pub sample_timeout_ms: u64,
}

fn default_num_samples() -> usize { 3 }
fn default_enrollment_confidence() -> f32 { 0.35 }
fn default_max_attempts() -> u32 { 10 }
fn default_retry_delay() -> u64 { 250 }
fn default_sample_timeout() -> u64 { 12_000 }

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            num_samples: default_num_samples(),
            min_confidence: default_enrollment_confidence(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay(),
            sample_timeout_ms: default_sample_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MatchingConfig {
    /// Absolute Euclidean cutoff T
    #[serde(default = "default_distance_threshold")]
    pub distance_threshold: f32,
    /// Required gap M between best and runner-up
    #[serde(default = "default_margin")]
    pub margin: f32,
    #[serde(default = "default_acceptance_floor")]
    pub acceptance_floor: f32,
    #[serde(default)]
    pub normalize_embeddings: bool,
    #[serde(default = "default_reported_candidates")]
    pub reported_candidates: usize,
}

fn default_distance_threshold() -> f32 { 0.6 }
fn default_margin() -> f32 { 0.08 }
fn default_acceptance_floor() -> f32 { 0.3 }
fn default_reported_candidates() -> usize { 3 }

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            distance_threshold: default_distance_threshold(),
            margin: default_margin(),
            acceptance_floor: default_acceptance_floor(),
            normalize_embeddings: false,
            reported_candidates: default_reported_candidates(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecognitionConfig {
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
    #[serde(default = "default_true")]
    pub save_snapshots: bool,
}

fn default_cooldown() -> u64 { 3000 }

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown(),
            save_snapshots: true,
        }
    }
}

/// Overrides for durable locations. Unset paths fall back to the
/// dev or system layout.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub profiles_dir: Option<PathBuf>,
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    #[serde(default)]
    pub snapshots_dir: Option<PathBuf>,
    #[serde(default)]
    pub ledger_key_path: Option<PathBuf>,
    /// Where `run` listens for enrollment requests from the CLI.
    #[serde(default)]
    pub control_socket: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_ledger_delay")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub sign_records: bool,
}

fn default_ledger_attempts() -> u32 { 3 }
fn default_ledger_delay() -> u64 { 100 }

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_ledger_attempts(),
            retry_delay_ms: default_ledger_delay(),
            sign_records: true,
        }
    }
}

impl EnrollmentConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }
}

impl Config {
    pub fn load(path: Option<&Path>, dev: bool) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None if dev => PathBuf::from("configs/kiosk-face.toml"),
            None => {
                let system = paths::system_config_file();
                match paths::user_config_file() {
                    Some(user) if !system.exists() && user.exists() => user,
                    _ => system,
                }
            }
        };
        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(KioskError::Config(format!(
                "Config file not found: {}", path.display()
            )));
        }

        tracing::info!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| KioskError::Config(format!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.extractor.provider.trim().is_empty() {
            return Err(KioskError::Config("Extractor provider must not be empty".into()));
        }
        if self.extractor.dimension == 0 || self.extractor.dimension > 4096 {
            return Err(KioskError::Config(format!(
                "Embedding dimension must be between 1 and 4096, got {}", self.extractor.dimension
            )));
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                return Err(KioskError::Config("Camera id must not be empty".into()));
            }
            if !seen.insert(camera.id.as_str()) {
                return Err(KioskError::Config(format!("Duplicate camera id: {}", camera.id)));
            }
            if camera.width == 0 || camera.width > 4096 || camera.height == 0 || camera.height > 4096 {
                return Err(KioskError::Config(format!(
                    "Camera {} dimensions must be between 1 and 4096, got {}x{}",
                    camera.id, camera.width, camera.height
                )));
            }
        }

        if self.capture.tick_interval_ms == 0 {
            return Err(KioskError::Config("Tick interval must be positive".into()));
        }

        let e = &self.enrollment;
        if e.num_samples == 0 || e.num_samples > 20 {
            return Err(KioskError::Config(format!(
                "Enrollment samples must be between 1 and 20, got {}", e.num_samples
            )));
        }
        if !(0.0..=1.0).contains(&e.min_confidence) {
            return Err(KioskError::Config(format!(
                "Enrollment confidence must be between 0.0 and 1.0, got {}", e.min_confidence
            )));
        }
        if e.max_attempts == 0 {
            return Err(KioskError::Config("Enrollment attempts must be at least 1".into()));
        }
        if e.sample_timeout_ms == 0 {
            return Err(KioskError::Config("Sample timeout must be positive".into()));
        }

        let m = &self.matching;
        if !(m.distance_threshold > 0.0) || !m.distance_threshold.is_finite() {
            return Err(KioskError::Config(format!(
                "Distance threshold must be positive, got {}", m.distance_threshold
            )));
        }
        if !(m.margin >= 0.0) || !m.margin.is_finite() {
            return Err(KioskError::Config(format!(
                "Disambiguation margin must be non-negative, got {}", m.margin
            )));
        }
        if !(0.0..=1.0).contains(&m.acceptance_floor) {
            return Err(KioskError::Config(format!(
                "Acceptance floor must be between 0.0 and 1.0, got {}", m.acceptance_floor
            )));
        }

        if self.ledger.max_attempts == 0 {
            return Err(KioskError::Config("Ledger attempts must be at least 1".into()));
        }

        Ok(())
    }

    pub fn camera(&self, id: &str) -> Result<&CameraConfig> {
        self.cameras
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| KioskError::UnknownCamera(id.to_string()))
    }
}
