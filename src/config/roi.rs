//! ROI template configuration
//!
//! One JSON file per invoice template, produced once by calibration:
//!
//! ```json
//! { "dpi": 300, "rotate": "cw90",
//!   "invoice_no":   { "x1": 0.62, "y1": 0.04, "x2": 0.95, "y2": 0.09 },
//!   "invoice_date": { "x1": 0.62, "y1": 0.09, "x2": 0.95, "y2": 0.13 },
//!   "total_amount": { "x1": 0.70, "y1": 0.78, "x2": 0.95, "y2": 0.83 } }
//! ```
//!
//! Box coordinates are fractions of the page *after* rotation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

use crate::error::ConfigError;

/// Rendering resolution used when the file does not name one
pub const DEFAULT_DPI: u32 = 300;

/// Forced page rotation applied before any ROI is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Ccw90,
    Half,
}

impl Rotation {
    /// Canonical token written back to configuration files
    pub fn token(&self) -> &'static str {
        match self {
            Rotation::None => "0",
            Rotation::Cw90 => "cw90",
            Rotation::Ccw90 => "ccw90",
            Rotation::Half => "180",
        }
    }
}

impl FromStr for Rotation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "0" | "none" => Ok(Rotation::None),
            "cw90" | "90" | "right" | "r" => Ok(Rotation::Cw90),
            "ccw90" | "-90" | "left" | "l" => Ok(Rotation::Ccw90),
            "180" | "flip" => Ok(Rotation::Half),
            _ => Err(ConfigError::Rotation(s.to_string())),
        }
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Page-relative rectangle, each coordinate a fraction of width or height
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FractionalBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl FractionalBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Convert a pixel rectangle `(x, y, w, h)` measured on a `width` x `height`
    /// page into fractions
    pub fn from_pixels(rect: (u32, u32, u32, u32), width: u32, height: u32) -> Self {
        let (x, y, w, h) = rect;
        let (pw, ph) = (width.max(1) as f64, height.max(1) as f64);
        Self {
            x1: x as f64 / pw,
            y1: y as f64 / ph,
            x2: (x as f64 + w as f64) / pw,
            y2: (y as f64 + h as f64) / ph,
        }
    }

    /// `0 <= x1 < x2 <= 1` and `0 <= y1 < y2 <= 1`
    pub fn is_well_formed(&self) -> bool {
        (0.0..=1.0).contains(&self.x1)
            && (0.0..=1.0).contains(&self.x2)
            && (0.0..=1.0).contains(&self.y1)
            && (0.0..=1.0).contains(&self.y2)
            && self.x1 < self.x2
            && self.y1 < self.y2
    }

    fn check_finite(&self, field: &'static str) -> Result<(), ConfigError> {
        for (key, v) in [("x1", self.x1), ("y1", self.y1), ("x2", self.x2), ("y2", self.y2)] {
            if !v.is_finite() {
                return Err(ConfigError::NonFinite { field, key });
            }
        }
        Ok(())
    }
}

/// The three fields every template locates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    InvoiceNo,
    InvoiceDate,
    TotalAmount,
}

impl Field {
    pub const ALL: [Field; 3] = [Field::InvoiceNo, Field::InvoiceDate, Field::TotalAmount];

    /// Key used in the ROI file
    pub fn key(&self) -> &'static str {
        match self {
            Field::InvoiceNo => "invoice_no",
            Field::InvoiceDate => "invoice_date",
            Field::TotalAmount => "total_amount",
        }
    }

    /// Short tag used in debug file names
    pub fn tag(&self) -> &'static str {
        match self {
            Field::InvoiceNo => "inv",
            Field::InvoiceDate => "date",
            Field::TotalAmount => "amt",
        }
    }
}

/// Validated ROI template. Read-only for the whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct RoiConfig {
    pub dpi: u32,
    pub rotate: Rotation,
    pub invoice_no: FractionalBox,
    pub invoice_date: FractionalBox,
    pub total_amount: FractionalBox,
}

impl RoiConfig {
    pub fn region(&self, field: Field) -> &FractionalBox {
        match field {
            Field::InvoiceNo => &self.invoice_no,
            Field::InvoiceDate => &self.invoice_date,
            Field::TotalAmount => &self.total_amount,
        }
    }

    /// Parse and validate the JSON form
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let raw: RawRoiConfig = serde_json::from_str(content)?;
        raw.validate()
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        let raw = RawRoiConfig {
            dpi: Some(self.dpi as i64),
            rotate: Some(RotateToken::Text(self.rotate.token().to_string())),
            invoice_no: self.invoice_no,
            invoice_date: self.invoice_date,
            total_amount: self.total_amount,
        };
        Ok(serde_json::to_string_pretty(&raw)?)
    }
}

/// `rotate` may be written as a string token or a bare number
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RotateToken {
    Text(String),
    Number(i64),
}

#[derive(Debug, Serialize, Deserialize)]
struct RawRoiConfig {
    #[serde(default)]
    dpi: Option<i64>,
    #[serde(default)]
    rotate: Option<RotateToken>,
    invoice_no: FractionalBox,
    invoice_date: FractionalBox,
    total_amount: FractionalBox,
}

impl RawRoiConfig {
    fn validate(self) -> Result<RoiConfig, ConfigError> {
        let dpi = match self.dpi {
            None => DEFAULT_DPI,
            Some(d) if d > 0 && d <= u32::MAX as i64 => d as u32,
            Some(d) => return Err(ConfigError::Dpi(d)),
        };

        let rotate = match self.rotate {
            None => Rotation::None,
            Some(RotateToken::Text(s)) => s.parse()?,
            Some(RotateToken::Number(n)) => n.to_string().parse()?,
        };

        let config = RoiConfig {
            dpi,
            rotate,
            invoice_no: self.invoice_no,
            invoice_date: self.invoice_date,
            total_amount: self.total_amount,
        };

        for field in Field::ALL {
            let region = config.region(field);
            region.check_finite(field.key())?;
            if !region.is_well_formed() {
                // Resolved per page; an out-of-range box only yields an absent crop
                warn!(field = field.key(), ?region, "ROI box outside the unit square or inverted");
            }
        }

        Ok(config)
    }
}

/// Load the ROI template from a JSON file
pub fn load_roi_config(path: &Path) -> Result<RoiConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    RoiConfig::from_json(&content)
}

/// Save the ROI template as JSON
pub fn save_roi_config(config: &RoiConfig, path: &Path) -> Result<(), ConfigError> {
    let content = config.to_json()?;
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    std::fs::write(path, content).map_err(write_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"{
        "dpi": 200,
        "rotate": "CW90",
        "invoice_no": {"x1": 0.6, "y1": 0.05, "x2": 0.95, "y2": 0.1},
        "invoice_date": {"x1": 0.6, "y1": 0.1, "x2": 0.95, "y2": 0.15},
        "total_amount": {"x1": 0.7, "y1": 0.8, "x2": 0.95, "y2": 0.85}
    }"#;

    #[test]
    fn test_parse_full_config() {
        let config = RoiConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.dpi, 200);
        assert_eq!(config.rotate, Rotation::Cw90);
        assert!((config.invoice_no.x1 - 0.6).abs() < 1e-9);
        assert!((config.total_amount.y2 - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_dpi_and_rotate_default() {
        let json = r#"{
            "invoice_no": {"x1": 0.1, "y1": 0.1, "x2": 0.2, "y2": 0.2},
            "invoice_date": {"x1": 0.1, "y1": 0.1, "x2": 0.2, "y2": 0.2},
            "total_amount": {"x1": 0.1, "y1": 0.1, "x2": 0.2, "y2": 0.2}
        }"#;
        let config = RoiConfig::from_json(json).unwrap();
        assert_eq!(config.dpi, DEFAULT_DPI);
        assert_eq!(config.rotate, Rotation::None);
    }

    #[test]
    fn test_missing_box_key_is_fatal() {
        let json = r#"{
            "invoice_no": {"x1": 0.1, "y1": 0.1, "x2": 0.2},
            "invoice_date": {"x1": 0.1, "y1": 0.1, "x2": 0.2, "y2": 0.2},
            "total_amount": {"x1": 0.1, "y1": 0.1, "x2": 0.2, "y2": 0.2}
        }"#;
        assert!(matches!(RoiConfig::from_json(json), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_box_is_fatal() {
        let json = r#"{
            "invoice_no": {"x1": 0.1, "y1": 0.1, "x2": 0.2, "y2": 0.2},
            "invoice_date": {"x1": 0.1, "y1": 0.1, "x2": 0.2, "y2": 0.2}
        }"#;
        assert!(RoiConfig::from_json(json).is_err());
    }

    #[test]
    fn test_rotation_tokens() {
        assert_eq!("none".parse::<Rotation>().unwrap(), Rotation::None);
        assert_eq!("0".parse::<Rotation>().unwrap(), Rotation::None);
        assert_eq!("R".parse::<Rotation>().unwrap(), Rotation::Cw90);
        assert_eq!("90".parse::<Rotation>().unwrap(), Rotation::Cw90);
        assert_eq!("left".parse::<Rotation>().unwrap(), Rotation::Ccw90);
        assert_eq!("-90".parse::<Rotation>().unwrap(), Rotation::Ccw90);
        assert_eq!("flip".parse::<Rotation>().unwrap(), Rotation::Half);
        assert!(matches!("45".parse::<Rotation>(), Err(ConfigError::Rotation(_))));
    }

    #[test]
    fn test_numeric_rotate_and_bad_dpi() {
        let json = SAMPLE.replace("\"CW90\"", "-90");
        assert_eq!(RoiConfig::from_json(&json).unwrap().rotate, Rotation::Ccw90);

        let json = SAMPLE.replace("200", "0");
        assert!(matches!(RoiConfig::from_json(&json), Err(ConfigError::Dpi(0))));
    }

    #[test]
    fn test_out_of_range_box_is_accepted() {
        let json = SAMPLE.replace("\"x1\": 0.6, \"y1\": 0.05", "\"x1\": 1.1, \"y1\": 0.05");
        let config = RoiConfig::from_json(&json).unwrap();
        assert!(!config.invoice_no.is_well_formed());
    }

    #[test]
    fn test_from_pixels() {
        let b = FractionalBox::from_pixels((100, 50, 200, 25), 1000, 500);
        assert!((b.x1 - 0.1).abs() < 1e-9);
        assert!((b.y1 - 0.1).abs() < 1e-9);
        assert!((b.x2 - 0.3).abs() < 1e-9);
        assert!((b.y2 - 0.15).abs() < 1e-9);
        assert!(b.is_well_formed());
    }

    #[test]
    fn test_from_pixels_with_huge_rectangle() {
        let b = FractionalBox::from_pixels((u32::MAX, 10, u32::MAX, u32::MAX), 1000, 500);
        assert!(b.x2 > b.x1);
        assert!(b.y2 > 1.0);
        assert!(!b.is_well_formed());
    }

    #[test]
    fn test_save_and_load_roi_config() {
        let config = RoiConfig::from_json(SAMPLE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("roi.json");

        save_roi_config(&config, &path).unwrap();
        let loaded = load_roi_config(&path).unwrap();

        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_roi_config_invalid_json() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "{{ not json").unwrap();
        assert!(load_roi_config(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_roi_config_file_not_found() {
        let result = load_roi_config(Path::new("/nonexistent/roi.json"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
