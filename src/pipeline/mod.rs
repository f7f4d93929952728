//! Page pipeline orchestrator
//!
//! Per document: select pages, then for each page render, rotate, crop the
//! three ROIs, read them through the OCR strategy and normalize. A page that
//! fails anywhere becomes a placeholder row; the remaining pages still run.

pub mod progress;
pub mod render;

use image::RgbImage;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{Field, FieldPolicy, RoiConfig};
use crate::error::RenderError;
use crate::fields::{normalize_fields, FieldValues};
use crate::vision::geometry::{crop_region, rotate_page};
use crate::vision::ocr::TextRecognizer;
use crate::vision::strategy::OcrStrategy;

pub use progress::{CancelToken, ChannelProgress, LogProgress, ProgressObserver};
pub use render::{open_document, PageSource};

/// One output record per processed page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedRow {
    /// Source file name, only when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// 1-based page number; `None` when the document could not be opened
    pub page: Option<usize>,
    pub invoice_no: Option<String>,
    pub invoice_date: Option<String>,
    pub total_amount: Option<String>,
    /// Present under the strict policy only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
}

impl ExtractedRow {
    fn from_values(page: Option<usize>, values: FieldValues) -> Self {
        Self {
            file: None,
            page,
            invoice_no: values.invoice_no,
            invoice_date: values.invoice_date,
            total_amount: values.total_amount,
            complete: values.complete,
        }
    }

    /// Row with every field null. The strict policy still reports the
    /// number as incomplete.
    pub fn placeholder(page: Option<usize>, policy: FieldPolicy) -> Self {
        let complete = match policy {
            FieldPolicy::Strict => Some(false),
            FieldPolicy::Loose => None,
        };
        Self::from_values(
            page,
            FieldValues {
                complete,
                ..FieldValues::default()
            },
        )
    }
}

/// Which pages of a document to process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageSelection {
    #[default]
    All,
    /// The first N pages
    First(usize),
    /// One page by 0-based index, clamped into range
    Single(usize),
}

impl PageSelection {
    /// 0-based page indices to process for a document of `page_count` pages
    pub fn indices(&self, page_count: usize) -> Vec<usize> {
        match *self {
            PageSelection::All => (0..page_count).collect(),
            PageSelection::First(n) => (0..page_count.min(n)).collect(),
            PageSelection::Single(index) => {
                if page_count == 0 {
                    Vec::new()
                } else {
                    vec![index.min(page_count - 1)]
                }
            }
        }
    }
}

/// Rows of one document and how the run ended
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentReport {
    pub rows: Vec<ExtractedRow>,
    /// Stopped early on a cancellation request
    pub cancelled: bool,
    /// Pages selected for processing
    pub total_pages: usize,
}

/// Extraction pipeline for one ROI template
pub struct InvoicePipeline<R> {
    roi: RoiConfig,
    strategy: OcrStrategy<R>,
    policy: FieldPolicy,
    debug_dir: Option<PathBuf>,
}

impl<R: TextRecognizer> InvoicePipeline<R> {
    pub fn new(roi: RoiConfig, strategy: OcrStrategy<R>, policy: FieldPolicy) -> Self {
        Self {
            roi,
            strategy,
            policy,
            debug_dir: None,
        }
    }

    /// Save raw crops of every page into `dir`
    pub fn with_debug_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.debug_dir = dir;
        self
    }

    /// Open `path` and process it. A document that cannot be opened yields a
    /// single placeholder row without a page number.
    pub fn process_path(
        &self,
        path: &Path,
        selection: PageSelection,
        with_filename: bool,
        observer: &dyn ProgressObserver,
        cancel: &CancelToken,
    ) -> DocumentReport {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());

        let mut report = match open_document(path) {
            Ok(source) => {
                self.process_document(source.as_ref(), &stem, selection, observer, cancel)
            }
            Err(e) => {
                warn!("Failed to open {:?}: {}", path, e);
                DocumentReport {
                    rows: vec![ExtractedRow::placeholder(None, self.policy)],
                    cancelled: false,
                    total_pages: 0,
                }
            }
        };

        if with_filename {
            let name = path
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            for row in &mut report.rows {
                row.file = Some(name.clone());
            }
        }
        report
    }

    /// Process the selected pages of an opened document. `label` names the
    /// document in logs and debug crop files.
    pub fn process_document(
        &self,
        source: &dyn PageSource,
        label: &str,
        selection: PageSelection,
        observer: &dyn ProgressObserver,
        cancel: &CancelToken,
    ) -> DocumentReport {
        let pages = selection.indices(source.page_count());
        let total = pages.len();
        info!("{}: processing {} of {} pages", label, total, source.page_count());

        let mut report = DocumentReport {
            rows: Vec::with_capacity(total),
            cancelled: false,
            total_pages: total,
        };

        for (position, &page_index) in pages.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("{}: cancelled after {} of {} pages", label, position, total);
                report.cancelled = true;
                break;
            }

            let page_number = page_index + 1;
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.process_page(source, page_index, label)
            }));

            let row = match outcome {
                Ok(Ok(values)) => ExtractedRow::from_values(Some(page_number), values),
                Ok(Err(e)) => {
                    warn!("{}: page {} failed: {}", label, page_number, e);
                    ExtractedRow::placeholder(Some(page_number), self.policy)
                }
                Err(_) => {
                    warn!("{}: page {} panicked", label, page_number);
                    ExtractedRow::placeholder(Some(page_number), self.policy)
                }
            };
            report.rows.push(row);

            notify(observer, position + 1, total);
        }

        report
    }

    fn process_page(
        &self,
        source: &dyn PageSource,
        page_index: usize,
        label: &str,
    ) -> Result<FieldValues, RenderError> {
        let page = source.render(page_index, self.roi.dpi)?;
        let page = rotate_page(page, self.roi.rotate);
        debug!(
            page = page_index + 1,
            width = page.width(),
            height = page.height(),
            "Page ready"
        );

        let crops = Field::ALL.map(|field| crop_region(&page, self.roi.region(field)));
        drop(page);

        if let Some(dir) = &self.debug_dir {
            save_debug_crops(dir, label, page_index + 1, &crops);
        }

        let [invoice_no, date, amount] = std::array::from_fn(|i| {
            let field = Field::ALL[i];
            if crops[i].is_none() {
                debug!(field = field.key(), "Region resolves to an empty crop");
            }
            self.strategy.read_field(field, crops[i].as_ref())
        });

        Ok(normalize_fields(self.policy, &invoice_no, &date, &amount))
    }
}

/// Report progress, logging and swallowing observer failures
fn notify(observer: &dyn ProgressObserver, current: usize, total: usize) {
    match catch_unwind(AssertUnwindSafe(|| observer.on_progress(current, total))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Progress observer failed: {}", e),
        Err(_) => warn!("Progress observer panicked"),
    }
}

/// Write `{label}_p{NN}_{tag}.png` for each present crop. Failures are logged.
fn save_debug_crops(dir: &Path, label: &str, page_number: usize, crops: &[Option<RgbImage>; 3]) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!("Cannot create debug directory {:?}: {}", dir, e);
        return;
    }
    for (field, crop) in Field::ALL.iter().zip(crops) {
        let Some(crop) = crop else { continue };
        let path = dir.join(format!("{}_p{:02}_{}.png", label, page_number, field.tag()));
        if let Err(e) = crop.save(&path) {
            warn!("Failed to save debug crop {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FractionalBox, Rotation};
    use crate::error::EngineError;
    use crate::vision::ocr::RecognitionOutput;
    use crate::vision::strategy::tests::ScriptedEngine;
    use crate::vision::strategy::StrategyConfig;
    use image::Rgb;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    /// Pages listed as `Some(image)` render, `None` fail
    struct FakeSource {
        pages: Vec<Option<RgbImage>>,
        renders: Mutex<Vec<usize>>,
    }

    impl FakeSource {
        fn new(pages: Vec<Option<RgbImage>>) -> Self {
            Self {
                pages,
                renders: Mutex::new(Vec::new()),
            }
        }
    }

    impl PageSource for FakeSource {
        fn page_count(&self) -> usize {
            self.pages.len()
        }

        fn render(&self, page_index: usize, _dpi: u32) -> Result<RgbImage, RenderError> {
            self.renders.lock().push(page_index);
            self.pages[page_index].clone().ok_or_else(|| RenderError::Page {
                page: page_index,
                reason: "corrupt page".into(),
            })
        }
    }

    fn page() -> Option<RgbImage> {
        Some(RgbImage::from_pixel(200, 100, Rgb([230, 230, 230])))
    }

    fn roi() -> RoiConfig {
        RoiConfig {
            dpi: 300,
            rotate: Rotation::None,
            invoice_no: FractionalBox::new(0.5, 0.0, 1.0, 0.2),
            invoice_date: FractionalBox::new(0.5, 0.2, 1.0, 0.4),
            total_amount: FractionalBox::new(0.5, 0.8, 1.0, 1.0),
        }
    }

    fn text(s: &str) -> Result<RecognitionOutput, EngineError> {
        Ok(RecognitionOutput::Text(s.to_string()))
    }

    fn pipeline(engine: &ScriptedEngine, policy: FieldPolicy) -> InvoicePipeline<&ScriptedEngine> {
        InvoicePipeline::new(roi(), OcrStrategy::new(engine, StrategyConfig::default()), policy)
    }

    fn ignore_progress(_: usize, _: usize) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn test_page_selection() {
        assert_eq!(PageSelection::All.indices(3), vec![0, 1, 2]);
        assert_eq!(PageSelection::First(2).indices(3), vec![0, 1]);
        assert_eq!(PageSelection::First(9).indices(3), vec![0, 1, 2]);
        assert_eq!(PageSelection::Single(1).indices(3), vec![1]);
        assert_eq!(PageSelection::Single(7).indices(3), vec![2]);
        assert!(PageSelection::Single(0).indices(0).is_empty());
    }

    #[test]
    fn test_failed_page_becomes_placeholder() {
        let engine = ScriptedEngine::new(vec![
            text("12345678901234567890"),
            text("2024年03月05日"),
            text("￥1,234.50"),
            text("发票 09876543210987654321"),
            text("2024.3.6"),
            text("RMB 99"),
        ]);
        let pipeline = pipeline(&engine, FieldPolicy::Strict);
        let source = FakeSource::new(vec![page(), None, page()]);

        let progress = Mutex::new(Vec::new());
        let observer = |current: usize, total: usize| -> anyhow::Result<()> {
            progress.lock().push((current, total));
            Ok(())
        };

        let report = pipeline.process_document(
            &source,
            "doc",
            PageSelection::All,
            &observer,
            &CancelToken::new(),
        );

        assert_eq!(report.rows.len(), 3);
        assert!(!report.cancelled);
        assert_eq!(report.total_pages, 3);

        assert_eq!(
            report.rows[0],
            ExtractedRow {
                file: None,
                page: Some(1),
                invoice_no: Some("12345678901234567890".into()),
                invoice_date: Some("20240305".into()),
                total_amount: Some("1234.50".into()),
                complete: Some(true),
            }
        );
        assert_eq!(report.rows[1], ExtractedRow::placeholder(Some(2), FieldPolicy::Strict));
        assert_eq!(report.rows[2].invoice_no.as_deref(), Some("09876543210987654321"));
        assert_eq!(report.rows[2].invoice_date.as_deref(), Some("20240306"));
        assert_eq!(report.rows[2].total_amount.as_deref(), Some("99"));

        assert_eq!(*progress.lock(), vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[test]
    fn test_observer_failures_are_swallowed() {
        let engine = ScriptedEngine::new(vec![]);
        let pipeline = pipeline(&engine, FieldPolicy::Loose);
        let source = FakeSource::new(vec![page(), page()]);

        let failing = |_: usize, _: usize| -> anyhow::Result<()> { anyhow::bail!("ui gone") };
        let report = pipeline.process_document(
            &source,
            "doc",
            PageSelection::All,
            &failing,
            &CancelToken::new(),
        );
        assert_eq!(report.rows.len(), 2);

        let panicking = |_: usize, _: usize| -> anyhow::Result<()> { panic!("observer bug") };
        let report = pipeline.process_document(
            &source,
            "doc",
            PageSelection::All,
            &panicking,
            &CancelToken::new(),
        );
        assert_eq!(report.rows.len(), 2);
    }

    #[test]
    fn test_cancellation_stops_before_next_render() {
        let engine = ScriptedEngine::new(vec![]);
        let pipeline = pipeline(&engine, FieldPolicy::Loose);
        let source = FakeSource::new(vec![page(), page(), page()]);

        let cancel = CancelToken::new();
        let observer = |current: usize, _: usize| -> anyhow::Result<()> {
            if current == 1 {
                cancel.cancel();
            }
            Ok(())
        };

        let report =
            pipeline.process_document(&source, "doc", PageSelection::All, &observer, &cancel);

        assert!(report.cancelled);
        assert_eq!(report.rows.len(), 1);
        assert_eq!(*source.renders.lock(), vec![0]);
    }

    #[test]
    fn test_single_page_selection_is_clamped() {
        let engine = ScriptedEngine::new(vec![]);
        let pipeline = pipeline(&engine, FieldPolicy::Loose);
        let source = FakeSource::new(vec![page(), page()]);

        let report = pipeline.process_document(
            &source,
            "doc",
            PageSelection::Single(5),
            &ignore_progress,
            &CancelToken::new(),
        );

        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.rows[0].page, Some(2));
        assert_eq!(report.rows[0].complete, None);
        assert_eq!(*source.renders.lock(), vec![1]);
    }

    #[test]
    fn test_out_of_page_roi_reads_nothing() {
        let engine = ScriptedEngine::new(vec![]);
        let mut roi = roi();
        roi.invoice_no = FractionalBox::new(1.1, 0.1, 1.3, 0.2);
        let pipeline = InvoicePipeline::new(
            roi,
            OcrStrategy::new(&engine, StrategyConfig::default()),
            FieldPolicy::Strict,
        );
        let source = FakeSource::new(vec![page()]);

        let report = pipeline.process_document(
            &source,
            "doc",
            PageSelection::All,
            &ignore_progress,
            &CancelToken::new(),
        );

        assert_eq!(report.rows[0].invoice_no, None);
        assert_eq!(report.rows[0].complete, Some(false));
        // Only date and amount reach the engine, each twice (single line, then detection)
        assert_eq!(engine.calls.lock().len(), 4);
    }

    #[test]
    fn test_unopenable_document_yields_placeholder() {
        let engine = ScriptedEngine::new(vec![]);
        let pipeline = pipeline(&engine, FieldPolicy::Strict);
        let dir = tempdir().unwrap();

        let report = pipeline.process_path(
            &dir.path().join("missing.png"),
            PageSelection::All,
            true,
            &ignore_progress,
            &CancelToken::new(),
        );

        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.rows[0].page, None);
        assert_eq!(report.rows[0].file.as_deref(), Some("missing.png"));
        assert_eq!(report.rows[0].invoice_no, None);
    }

    #[test]
    fn test_image_input_and_debug_crops() {
        let engine = ScriptedEngine::new(vec![text("12345678901234567890")]);
        let dir = tempdir().unwrap();
        let input = dir.path().join("scan.png");
        RgbImage::from_pixel(200, 100, Rgb([255, 255, 255])).save(&input).unwrap();

        let debug_dir = dir.path().join("crops");
        let pipeline =
            pipeline(&engine, FieldPolicy::Strict).with_debug_dir(Some(debug_dir.clone()));

        let report = pipeline.process_path(
            &input,
            PageSelection::All,
            false,
            &ignore_progress,
            &CancelToken::new(),
        );

        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.rows[0].file, None);
        assert_eq!(report.rows[0].complete, Some(true));
        for tag in ["inv", "date", "amt"] {
            assert!(debug_dir.join(format!("scan_p01_{tag}.png")).exists());
        }
    }

    #[test]
    fn test_rows_serialize_in_column_order() {
        let row = ExtractedRow {
            file: None,
            page: Some(1),
            invoice_no: None,
            invoice_date: Some("2024-03-05".into()),
            total_amount: Some("99".into()),
            complete: None,
        };
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"{"page":1,"invoice_no":null,"invoice_date":"2024-03-05","total_amount":"99"}"#
        );
    }
}
