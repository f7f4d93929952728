//! Model management for ONNX Runtime
//!
//! Handles downloading, caching, and loading of the PaddleOCR models used by
//! the local engine.

use anyhow::{Context, Result};
use futures_util::{Stream, StreamExt};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::config::{ModelSettings, OcrSettings};
use crate::error::EngineError;

/// Setting this variable forbids network downloads
pub const OFFLINE_ENV: &str = "INVOICE_ROI_OFFLINE";

/// Files making up the PaddleOCR pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// Text detection model (DBNet)
    Detection,
    /// Text recognition model (SVTR/CRNN, Chinese charset)
    Recognition,
    /// Character dictionary for recognition
    Dictionary,
}

impl ModelType {
    pub const ALL: [ModelType; 3] = [
        ModelType::Detection,
        ModelType::Recognition,
        ModelType::Dictionary,
    ];

    /// Local filename
    pub fn filename(&self) -> &'static str {
        match self {
            ModelType::Detection => "det.onnx",
            ModelType::Recognition => "rec.onnx",
            ModelType::Dictionary => "dict.txt",
        }
    }

    /// Location under the model repository base URL
    pub fn remote_path(&self) -> &'static str {
        match self {
            ModelType::Detection => "detection/v5/det.onnx",
            ModelType::Recognition => "languages/chinese/rec.onnx",
            ModelType::Dictionary => "languages/chinese/dict.txt",
        }
    }

    /// Plausible file size range, used as a cheap integrity check
    pub fn expected_size_range(&self) -> (u64, u64) {
        match self {
            ModelType::Detection => (1_000_000, 200_000_000),
            ModelType::Recognition => (1_000_000, 200_000_000),
            ModelType::Dictionary => (10_000, 2_000_000),
        }
    }

    /// Display name for progress reporting
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelType::Detection => "Text Detection",
            ModelType::Recognition => "Text Recognition",
            ModelType::Dictionary => "Character Dictionary",
        }
    }
}

/// Model manifest tracking downloaded models
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub model_type: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
    /// Unix seconds
    pub downloaded_at: u64,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            models: Vec::new(),
        }
    }
}

/// Progress callback for download operations: (bytes so far, total if known)
pub type DownloadProgressCallback = Box<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Downloads and caches the ONNX models
pub struct ModelManager {
    models_dir: PathBuf,
    base_url: String,
    offline: bool,
}

impl ModelManager {
    /// Manager rooted at the configured directory, or `<data dir>/models`
    pub fn from_settings(settings: &ModelSettings) -> Result<Self> {
        let models_dir = match &settings.dir {
            Some(dir) => dir.clone(),
            None => crate::storage::get_data_dir()?.join("models"),
        };
        let manager = Self::with_dir(models_dir, &settings.base_url)?;
        Ok(manager.offline(std::env::var_os(OFFLINE_ENV).is_some()))
    }

    /// Manager with a custom directory
    pub fn with_dir(models_dir: PathBuf, base_url: &str) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create models directory {:?}", models_dir))?;
        Ok(Self {
            models_dir,
            base_url: base_url.trim_end_matches('/').to_string(),
            offline: false,
        })
    }

    /// Forbid (or allow) network downloads
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn model_path(&self, model_type: ModelType) -> PathBuf {
        self.models_dir.join(model_type.filename())
    }

    pub fn download_url(&self, model_type: ModelType) -> String {
        format!("{}/{}", self.base_url, model_type.remote_path())
    }

    /// Whether the file exists with a plausible size
    pub fn is_model_available(&self, model_type: ModelType) -> bool {
        match std::fs::metadata(self.model_path(model_type)) {
            Ok(metadata) => {
                let (min, max) = model_type.expected_size_range();
                (min..=max).contains(&metadata.len())
            }
            Err(_) => false,
        }
    }

    pub fn are_models_ready(&self) -> bool {
        ModelType::ALL.iter().all(|&m| self.is_model_available(m))
    }

    /// (model, available, size on disk)
    pub fn get_model_status(&self) -> Vec<(ModelType, bool, Option<u64>)> {
        ModelType::ALL
            .iter()
            .map(|&model_type| {
                let size = std::fs::metadata(self.model_path(model_type))
                    .ok()
                    .map(|m| m.len());
                (model_type, self.is_model_available(model_type), size)
            })
            .collect()
    }

    /// Download a model if not already available, returning its path
    pub fn ensure_model(&self, model_type: ModelType) -> Result<PathBuf> {
        let path = self.model_path(model_type);

        if self.is_model_available(model_type) {
            debug!("Model {:?} already available at {:?}", model_type, path);
            return Ok(path);
        }

        info!("Downloading model {:?}...", model_type);
        self.download_model_with_progress(model_type, Some(download_logger(model_type)))?;

        Ok(path)
    }

    pub fn ensure_all_models(&self) -> Result<()> {
        if self.are_models_ready() {
            debug!("All models present in {:?}", self.models_dir);
            return Ok(());
        }
        for model_type in ModelType::ALL {
            self.ensure_model(model_type)?;
        }
        Ok(())
    }

    /// Download a specific model with optional progress callback (blocking)
    pub fn download_model_with_progress(
        &self,
        model_type: ModelType,
        progress: Option<DownloadProgressCallback>,
    ) -> Result<()> {
        let url = self.download_url(model_type);
        let path = self.model_path(model_type);

        if self.offline {
            anyhow::bail!(
                "Offline mode: cannot download models. Please download manually from {} and place at {:?}",
                url,
                path
            );
        }

        info!("Downloading {} model from {}", model_type.display_name(), url);

        let rt = Runtime::new().context("Failed to create tokio runtime")?;
        let sha256 = rt.block_on(download_file(&url, &path, progress))?;

        if !self.is_model_available(model_type) {
            anyhow::bail!(
                "Downloaded {} but its size is outside the expected range",
                model_type.filename()
            );
        }

        self.record_download(model_type, sha256)?;

        info!("Successfully downloaded {} model", model_type.display_name());
        Ok(())
    }

    /// Add or replace the manifest entry for a fresh download
    fn record_download(&self, model_type: ModelType, sha256: String) -> Result<()> {
        let mut manifest = self.load_manifest().unwrap_or_else(|e| {
            warn!("Discarding unreadable model manifest: {}", e);
            ModelManifest::default()
        });

        let size_bytes = std::fs::metadata(self.model_path(model_type))?.len();
        let info = ModelInfo {
            model_type: format!("{:?}", model_type),
            filename: model_type.filename().to_string(),
            size_bytes,
            sha256,
            downloaded_at: unix_now(),
        };

        match manifest.models.iter_mut().find(|m| m.filename == info.filename) {
            Some(existing) => *existing = info,
            None => manifest.models.push(info),
        }

        self.save_manifest(&manifest)
    }

    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let manifest_path = self.models_dir.join("manifest.json");
        if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(ModelManifest::default())
        }
    }

    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        let manifest_path = self.models_dir.join("manifest.json");
        let content = serde_json::to_string_pretty(manifest)?;
        std::fs::write(manifest_path, content)?;
        Ok(())
    }
}

/// Stream `url` into `path` through a temp file; returns the hex SHA-256
async fn download_file(
    url: &str,
    path: &Path,
    progress: Option<DownloadProgressCallback>,
) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to send download request")?;

    if !response.status().is_success() {
        anyhow::bail!("Download failed with status {}: {}", response.status(), url);
    }

    let total_size = response.content_length();
    debug!("Download size: {:?} bytes", total_size);

    save_stream(response.bytes_stream(), path, total_size, progress).await
}

/// Write `stream` into `path` through a sibling temp file and return the hex
/// SHA-256. The temp file is removed when any step fails.
async fn save_stream<S, B, E>(
    mut stream: S,
    path: &Path,
    total_size: Option<u64>,
    progress: Option<DownloadProgressCallback>,
) -> Result<String>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    let temp_path = path.with_extension("tmp");

    let written = async {
        let mut file = std::fs::File::create(&temp_path).context("Failed to create temp file")?;
        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Error reading download stream")?;
            let chunk = chunk.as_ref();
            file.write_all(chunk).context("Failed to write to temp file")?;
            hasher.update(chunk);
            downloaded += chunk.len() as u64;

            if let Some(ref callback) = progress {
                callback(downloaded, total_size);
            }
        }

        file.flush().context("Failed to flush temp file")?;
        drop(file);

        std::fs::rename(&temp_path, path)
            .context("Failed to move downloaded file to final location")?;

        Ok::<_, anyhow::Error>(format!("{:x}", hasher.finalize()))
    }
    .await;

    if written.is_err() && temp_path.exists() {
        if let Err(e) = std::fs::remove_file(&temp_path) {
            warn!("Could not remove partial download {:?}: {}", temp_path, e);
        }
    }
    written
}

/// Logs each further tenth of a download whose size is known
fn download_logger(model_type: ModelType) -> DownloadProgressCallback {
    let name = model_type.display_name();
    let last_tenth = AtomicU64::new(0);
    Box::new(move |downloaded, total| {
        let Some(total) = total.filter(|&t| t > 0) else {
            return;
        };
        let tenth = (downloaded * 10 / total).min(10);
        if tenth > last_tenth.swap(tenth, Ordering::Relaxed) {
            info!("{}: {}%", name, tenth * 10);
        }
    })
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// ONNX Runtime session behind a lock, since a run needs exclusive access
pub struct OnnxSession {
    session: Mutex<Session>,
}

impl OnnxSession {
    /// Load a model file with the configured thread count and provider
    pub fn new(model_path: &Path, settings: &OcrSettings) -> Result<Self> {
        info!("Loading ONNX model from {:?}", model_path);

        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(settings.intra_threads)?;

        #[cfg(target_os = "windows")]
        let builder = if settings.use_gpu {
            use ort::execution_providers::DirectMLExecutionProvider;
            match builder.with_execution_providers([DirectMLExecutionProvider::default().build()]) {
                Ok(builder) => {
                    info!("DirectML GPU acceleration enabled");
                    builder
                }
                Err(e) => {
                    warn!("DirectML not available, using CPU: {}", e);
                    Session::builder()?
                        .with_optimization_level(GraphOptimizationLevel::Level3)?
                        .with_intra_threads(settings.intra_threads)?
                }
            }
        } else {
            builder
        };

        #[cfg(not(target_os = "windows"))]
        if settings.use_gpu {
            warn!("GPU execution is only wired up on Windows, using CPU");
        }

        let session = builder
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load ONNX model {:?}", model_path))?;

        debug!(
            "Model loaded. Inputs: {:?}, Outputs: {:?}",
            session.inputs.iter().map(|i| &i.name).collect::<Vec<_>>(),
            session.outputs.iter().map(|o| &o.name).collect::<Vec<_>>()
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// Run a single-input model on an NCHW tensor; returns the first
    /// output's shape and data
    pub fn run_f32(
        &self,
        shape: [usize; 4],
        data: Vec<f32>,
    ) -> Result<(Vec<usize>, Vec<f32>), EngineError> {
        let input = Value::from_array((shape, data))?;

        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![input])?;

        let first_key = outputs
            .keys()
            .next()
            .ok_or_else(|| EngineError::Output("model produced no outputs".into()))?;
        let (dims, values) = outputs[first_key].try_extract_tensor::<f32>()?;

        let dims: Vec<usize> = dims.iter().map(|&d| d.max(0) as usize).collect();
        Ok((dims, values.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BASE: &str = "https://example.invalid/models/";

    #[test]
    fn test_model_type_filenames() {
        assert_eq!(ModelType::Detection.filename(), "det.onnx");
        assert_eq!(ModelType::Recognition.filename(), "rec.onnx");
        assert_eq!(ModelType::Dictionary.filename(), "dict.txt");
    }

    #[test]
    fn test_download_url_joins_base() {
        let dir = tempdir().unwrap();
        let manager = ModelManager::with_dir(dir.path().join("m"), BASE).unwrap();
        assert_eq!(
            manager.download_url(ModelType::Dictionary),
            "https://example.invalid/models/languages/chinese/dict.txt"
        );
        assert!(manager.models_dir().exists());
    }

    #[test]
    fn test_availability_checks_size() {
        let dir = tempdir().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf(), BASE).unwrap();
        assert!(!manager.is_model_available(ModelType::Dictionary));

        // Too small to be a real dictionary
        std::fs::write(manager.model_path(ModelType::Dictionary), "a\nb\n").unwrap();
        assert!(!manager.is_model_available(ModelType::Dictionary));

        std::fs::write(manager.model_path(ModelType::Dictionary), vec![b'x'; 20_000]).unwrap();
        assert!(manager.is_model_available(ModelType::Dictionary));
        assert!(!manager.are_models_ready());

        let status = manager.get_model_status();
        assert_eq!(status.len(), 3);
        assert_eq!(status[2], (ModelType::Dictionary, true, Some(20_000)));
    }

    #[test]
    fn test_offline_mode_refuses_download() {
        let dir = tempdir().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf(), BASE)
            .unwrap()
            .offline(true);
        let err = manager.ensure_model(ModelType::Detection).unwrap_err();
        assert!(err.to_string().contains("Offline mode"));
    }

    #[test]
    fn test_interrupted_stream_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rec.onnx");
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(vec![1, 2, 3]),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];

        let runtime = Runtime::new().unwrap();
        let result = runtime.block_on(save_stream(
            futures_util::stream::iter(chunks),
            &path,
            Some(6),
            None,
        ));

        assert!(result.is_err());
        assert!(!path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_completed_stream_is_hashed_and_moved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dict.txt");
        let chunks: Vec<std::result::Result<&[u8], std::io::Error>> =
            vec![Ok(&b"ab"[..]), Ok(&b"c"[..])];

        let runtime = Runtime::new().unwrap();
        let sha256 = runtime
            .block_on(save_stream(futures_util::stream::iter(chunks), &path, None, None))
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
        assert_eq!(
            sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_manifest_round_trip() {
        let dir = tempdir().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf(), BASE).unwrap();
        assert!(manager.load_manifest().unwrap().models.is_empty());

        let mut manifest = ModelManifest::default();
        manifest.models.push(ModelInfo {
            model_type: "Detection".into(),
            filename: "det.onnx".into(),
            size_bytes: 42,
            sha256: "ab".into(),
            downloaded_at: 1,
        });
        manager.save_manifest(&manifest).unwrap();

        let loaded = manager.load_manifest().unwrap();
        assert_eq!(loaded.models.len(), 1);
        assert_eq!(loaded.models[0].filename, "det.onnx");
    }
}
