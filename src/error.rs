//! Error taxonomy for the extraction run
//!
//! Only [`ConfigError`] and [`ExportError`] end a run. Render and engine
//! failures are recovered where they happen and show up as null fields.

use std::path::PathBuf;
use thiserror::Error;

/// Malformed or missing configuration. Fatal before any page is processed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid ROI configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid settings file: {0}")]
    Settings(#[from] toml::de::Error),

    #[error("unsupported rotate value: {0:?}")]
    Rotation(String),

    #[error("dpi must be positive, got {0}")]
    Dpi(i64),

    #[error("box {field}.{key} is not a finite number")]
    NonFinite { field: &'static str, key: &'static str },

    #[error("no ROI configuration given (use --roi or set general.roi_config)")]
    MissingRoi,
}

/// A document could not be opened or one of its pages not rasterized.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to load PDFium: {0}")]
    Library(String),

    #[error("failed to open document: {0}")]
    Open(String),

    #[error("page {page} out of range (document has {count} pages)")]
    PageOutOfRange { page: usize, count: usize },

    #[error("failed to render page {page}: {reason}")]
    Page { page: usize, reason: String },

    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
}

/// OCR engine failure. Never surfaces past the strategy layer.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("input image is empty")]
    EmptyInput,

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("unexpected model output: {0}")]
    Output(String),
}

impl From<ort::Error> for EngineError {
    fn from(e: ort::Error) -> Self {
        EngineError::Inference(e.to_string())
    }
}

/// Persisting result rows failed.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize rows: {0}")]
    Serialize(#[from] serde_json::Error),
}
