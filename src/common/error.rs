use thiserror::Error;

#[derive(Error, Debug)]
pub enum KioskError {
    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Unknown camera: {0}")]
    UnknownCamera(String),

    #[error("Extractor error: {0}")]
    Extractor(String),

    #[error("Illumination error: {0}")]
    Illumination(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Active profile already exists for {identity} under provider {provider}; pass an explicit override to replace it")]
    ProfileConflict { identity: String, provider: String },

    #[error("No active profile for {identity} under provider {provider}")]
    ProfileNotFound { identity: String, provider: String },

    #[error("Invalid embedding: {0}")]
    InvalidEmbedding(String),

    #[error("Invalid identity id: {0:?}")]
    InvalidIdentity(String),

    #[error(transparent)]
    Ledger(#[from] crate::storage::LedgerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, KioskError>;
