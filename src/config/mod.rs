//! Application Configuration
//!
//! Run settings stored in TOML format, plus the per-template ROI file
//! (see [`roi`]).

pub mod roi;

pub use roi::{
    load_roi_config, save_roi_config, Field, FractionalBox, RoiConfig, Rotation, DEFAULT_DPI,
};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// General settings
    pub general: GeneralConfig,
    /// OCR settings
    pub ocr: OcrSettings,
    /// Field extraction settings
    pub extraction: ExtractionSettings,
    /// Model storage settings
    pub models: ModelSettings,
}

/// General settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// ROI file used when `--roi` is not given
    pub roi_config: Option<PathBuf>,
    /// Directory for result files when `--out` is not given
    pub output_dir: Option<PathBuf>,
}

/// OCR invocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    /// Crops of date/amount lower than this are upscaled
    pub simple_min_height: u32,
    /// Crops of the invoice number lower than this are upscaled
    pub invoice_min_height: u32,
    /// Box score threshold for detection passes
    pub detect_threshold: f32,
    /// Minimum recognition score kept in detection passes
    pub text_score_threshold: f32,
    /// Apply contrast enhancement to date/amount crops
    pub enhance_simple_fields: bool,
    /// Probability map binarization threshold
    pub binarize_threshold: f32,
    /// Detected box expansion ratio
    pub unclip_ratio: f32,
    /// Use GPU execution providers when available
    pub use_gpu: bool,
    /// ONNX Runtime intra-op threads
    pub intra_threads: usize,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            simple_min_height: 60,
            invoice_min_height: 70,
            detect_threshold: 0.3,
            text_score_threshold: 0.3,
            enhance_simple_fields: true,
            binarize_threshold: 0.3,
            unclip_ratio: 1.6,
            use_gpu: false,
            intra_threads: 4,
        }
    }
}

/// Which normalization contract a deployment uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FieldPolicy {
    /// 20-digit invoice numbers only, completeness flag, `YYYYMMDD` dates
    #[default]
    Strict,
    /// Degrading invoice numbers, `YYYY-MM-DD` dates
    Loose,
}

/// Field extraction settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    /// Normalization policy
    pub policy: FieldPolicy,
    /// Save raw ROI crops here for inspection
    pub debug_dir: Option<PathBuf>,
}

/// Model storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Models directory (defaults to `<data dir>/models`)
    pub dir: Option<PathBuf>,
    /// Base URL the model files are fetched from
    pub base_url: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            dir: None,
            base_url: "https://huggingface.co/monkt/paddleocr-onnx/resolve/main".to_string(),
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        assert!(config.general.roi_config.is_none());
        assert_eq!(config.ocr.simple_min_height, 60);
        assert_eq!(config.ocr.invoice_min_height, 70);
        assert!((config.ocr.detect_threshold - 0.3).abs() < 0.001);
        assert!((config.ocr.text_score_threshold - 0.3).abs() < 0.001);
        assert!(config.ocr.enhance_simple_fields);
        assert_eq!(config.extraction.policy, FieldPolicy::Strict);
        assert!(config.extraction.debug_dir.is_none());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = AppConfig::default();
        config.extraction.policy = FieldPolicy::Loose;
        config.general.roi_config = Some(PathBuf::from("templates/vat.json"));

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.extraction.policy, FieldPolicy::Loose);
        assert_eq!(parsed.general.roi_config, config.general.roi_config);
        assert_eq!(parsed.ocr.invoice_min_height, config.ocr.invoice_min_height);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: AppConfig = toml::from_str("[ocr]\nsimple_min_height = 48\n").unwrap();
        assert_eq!(parsed.ocr.simple_min_height, 48);
        assert_eq!(parsed.ocr.invoice_min_height, 70);
        assert_eq!(parsed.extraction.policy, FieldPolicy::Strict);
    }

    #[test]
    fn test_save_and_load_config() {
        let config = AppConfig::default();
        let temp_file = NamedTempFile::new().unwrap();

        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(config.ocr.intra_threads, loaded.ocr.intra_threads);
        assert_eq!(config.models.base_url, loaded.models.base_url);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }
}
