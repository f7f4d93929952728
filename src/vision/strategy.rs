//! Field-specific OCR invocation policies
//!
//! Date and amount crops are tight single lines, so recognition without
//! detection runs first and detection is the fallback. The invoice number
//! always goes through detection and gets one enhanced retry when no full
//! 20-digit run comes back. Engine errors never leave this module; a failed
//! call reads as empty text.

use image::RgbImage;
use tracing::{debug, warn};

use crate::config::{Field, OcrSettings};
use crate::fields::invoice_no;
use crate::vision::condition::condition;
use crate::vision::ocr::{flatten_text, RecognizeOptions, TextRecognizer};

/// Thresholds and sizes used by the strategy
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    pub simple_min_height: u32,
    pub invoice_min_height: u32,
    pub detect_threshold: f32,
    pub text_score_threshold: f32,
    pub enhance_simple_fields: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::from(&OcrSettings::default())
    }
}

impl From<&OcrSettings> for StrategyConfig {
    fn from(settings: &OcrSettings) -> Self {
        Self {
            simple_min_height: settings.simple_min_height,
            invoice_min_height: settings.invoice_min_height,
            detect_threshold: settings.detect_threshold,
            text_score_threshold: settings.text_score_threshold,
            enhance_simple_fields: settings.enhance_simple_fields,
        }
    }
}

/// Wraps an engine with the per-field fallback ladders
pub struct OcrStrategy<R> {
    engine: R,
    config: StrategyConfig,
}

impl<R: TextRecognizer> OcrStrategy<R> {
    pub fn new(engine: R, config: StrategyConfig) -> Self {
        Self { engine, config }
    }

    /// Read the text of `field` from its crop
    pub fn read_field(&self, field: Field, crop: Option<&RgbImage>) -> String {
        match field {
            Field::InvoiceNo => self.read_invoice_number(crop),
            Field::InvoiceDate | Field::TotalAmount => self.read_simple_field(field, crop),
        }
    }

    /// Date/amount: single-line recognition, then detection with relaxed
    /// thresholds if nothing came back
    pub fn read_simple_field(&self, field: Field, crop: Option<&RgbImage>) -> String {
        let Some(image) = condition(
            crop,
            self.config.simple_min_height,
            self.config.enhance_simple_fields,
        ) else {
            return String::new();
        };

        let text = self.attempt(field, &image, &RecognizeOptions::single_line());
        if !text.is_empty() {
            return text;
        }

        debug!(field = field.key(), "Single-line pass empty, retrying with detection");
        self.attempt(field, &image, &self.detect_options())
    }

    /// Invoice number: detection pass, then one enhanced retry when the text
    /// holds no 20-digit run. Returns the text with the best digit coverage.
    pub fn read_invoice_number(&self, crop: Option<&RgbImage>) -> String {
        let field = Field::InvoiceNo;
        let Some(image) = condition(crop, self.config.invoice_min_height, false) else {
            return String::new();
        };

        let first = self.attempt(field, &image, &self.detect_options());
        if invoice_no::has_full_number(&first) {
            return first;
        }

        debug!(field = field.key(), text = %first, "No 20-digit run, retrying with enhancement");
        let Some(enhanced) = condition(crop, self.config.invoice_min_height, true) else {
            return first;
        };
        let second = self.attempt(field, &enhanced, &self.detect_options());

        if invoice_no::has_full_number(&second) || digit_count(&second) > digit_count(&first) {
            second
        } else {
            first
        }
    }

    fn detect_options(&self) -> RecognizeOptions {
        RecognizeOptions::detect_with(
            self.config.detect_threshold,
            self.config.text_score_threshold,
        )
    }

    /// One engine call; any engine error reads as empty text
    fn attempt(&self, field: Field, image: &RgbImage, options: &RecognizeOptions) -> String {
        match self.engine.recognize(image, options) {
            Ok(output) => {
                let text = flatten_text(Some(&output));
                debug!(field = field.key(), detect = options.detect, text = %text, "OCR pass");
                text
            }
            Err(e) => {
                warn!(field = field.key(), detect = options.detect, "OCR engine failed: {}", e);
                String::new()
            }
        }
    }
}

fn digit_count(text: &str) -> usize {
    text.chars().filter(|c| c.is_ascii_digit()).count()
}
