//! Row export

use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::ExportError;
use crate::pipeline::ExtractedRow;

/// Persists the collected rows once per run
pub trait RowExporter {
    fn export(&self, rows: &[ExtractedRow]) -> Result<(), ExportError>;
}

/// Pretty JSON array, one object per row in fixed column order
#[derive(Debug, Clone)]
pub struct JsonExporter {
    path: PathBuf,
}

impl JsonExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RowExporter for JsonExporter {
    fn export(&self, rows: &[ExtractedRow]) -> Result<(), ExportError> {
        let io_error = |source| ExportError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }

        let content = serde_json::to_string_pretty(rows)?;
        std::fs::write(&self.path, content).map_err(io_error)?;

        info!("Exported {} rows to {:?}", rows.len(), self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(page: usize) -> ExtractedRow {
        ExtractedRow {
            file: Some("a.pdf".into()),
            page: Some(page),
            invoice_no: Some("12345678901234567890".into()),
            invoice_date: Some("20240305".into()),
            total_amount: None,
            complete: Some(true),
        }
    }

    #[test]
    fn test_export_creates_parent_and_keeps_order() {
        let dir = tempdir().unwrap();
        let exporter = JsonExporter::new(dir.path().join("out").join("rows.json"));

        exporter.export(&[row(1), row(2)]).unwrap();

        let content = std::fs::read_to_string(exporter.path()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        let rows = parsed.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["page"], 2);
        assert_eq!(rows[0]["total_amount"], serde_json::Value::Null);

        // Column order: file, page, invoice_no, invoice_date, total_amount, complete
        let first = content.find("\"file\"").unwrap();
        let last = content.find("\"complete\"").unwrap();
        assert!(first < content.find("\"page\"").unwrap());
        assert!(content.find("\"total_amount\"").unwrap() < last);
    }

    #[test]
    fn test_export_failure_is_reported() {
        let dir = tempdir().unwrap();
        // A directory where the file should go
        let exporter = JsonExporter::new(dir.path());
        assert!(matches!(exporter.export(&[row(1)]), Err(ExportError::Io { .. })));
    }
}
