//! OCR capability
//!
//! The pipeline talks to any engine through [`TextRecognizer`]. Engines
//! report results in one of several shapes; [`flatten_text`] reduces all of
//! them to one string in engine order.

use image::RgbImage;

use crate::error::EngineError;

/// Per-call engine switches
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecognizeOptions {
    /// Locate text lines first; when off the whole image is one line
    pub detect: bool,
    /// Run the text-direction classifier on detected lines
    pub classify: bool,
    /// Box score threshold for detection, engine default when `None`
    pub detect_threshold: Option<f32>,
    /// Minimum recognition score kept, engine default when `None`
    pub text_score_threshold: Option<f32>,
}

impl RecognizeOptions {
    /// Treat the whole image as a single text line
    pub fn single_line() -> Self {
        Self {
            detect: false,
            classify: false,
            detect_threshold: None,
            text_score_threshold: None,
        }
    }

    /// Detection enabled with explicit thresholds
    pub fn detect_with(detect_threshold: f32, text_score_threshold: f32) -> Self {
        Self {
            detect: true,
            classify: false,
            detect_threshold: Some(detect_threshold),
            text_score_threshold: Some(text_score_threshold),
        }
    }
}

/// One positioned fragment
#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    /// Quadrilateral in image coordinates
    pub polygon: [(f32, f32); 4],
    /// Recognized text; `None` when the engine produced a non-text value
    pub text: Option<String>,
    /// Recognition confidence
    pub score: f32,
}

/// Result shapes an engine may hand back
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionOutput {
    /// Structured result exposing an ordered list of texts
    Lines {
        texts: Vec<Option<String>>,
        scores: Vec<f32>,
    },
    /// Positional fragments
    Spans(Vec<TextSpan>),
    /// A bare string
    Text(String),
    /// Nothing recognized
    Empty,
}

/// Offline OCR engine
pub trait TextRecognizer {
    fn recognize(
        &self,
        image: &RgbImage,
        options: &RecognizeOptions,
    ) -> Result<RecognitionOutput, EngineError>;
}

impl<T: TextRecognizer + ?Sized> TextRecognizer for &T {
    fn recognize(
        &self,
        image: &RgbImage,
        options: &RecognizeOptions,
    ) -> Result<RecognitionOutput, EngineError> {
        (**self).recognize(image, options)
    }
}

/// Concatenate every text fragment in engine order and trim the result.
/// Missing results and non-text fragments contribute nothing.
pub fn flatten_text(output: Option<&RecognitionOutput>) -> String {
    let joined: String = match output {
        None | Some(RecognitionOutput::Empty) => return String::new(),
        Some(RecognitionOutput::Text(s)) => s.clone(),
        Some(RecognitionOutput::Lines { texts, .. }) => {
            texts.iter().flatten().map(String::as_str).collect()
        }
        Some(RecognitionOutput::Spans(spans)) => spans
            .iter()
            .filter_map(|s| s.text.as_deref())
            .collect(),
    };
    joined.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(text: Option<&str>) -> TextSpan {
        TextSpan {
            polygon: [(0.0, 0.0); 4],
            text: text.map(str::to_string),
            score: 0.9,
        }
    }

    #[test]
    fn test_flatten_missing_and_empty() {
        assert_eq!(flatten_text(None), "");
        assert_eq!(flatten_text(Some(&RecognitionOutput::Empty)), "");
    }

    #[test]
    fn test_flatten_lines_skips_non_text() {
        let out = RecognitionOutput::Lines {
            texts: vec![Some("2024年".into()), None, Some("03月05日 ".into())],
            scores: vec![0.9, 0.1, 0.8],
        };
        assert_eq!(flatten_text(Some(&out)), "2024年03月05日");
    }

    #[test]
    fn test_flatten_spans_preserves_order() {
        let out = RecognitionOutput::Spans(vec![span(Some("B")), span(None), span(Some("A"))]);
        assert_eq!(flatten_text(Some(&out)), "BA");
    }

    #[test]
    fn test_flatten_bare_text_is_trimmed() {
        let out = RecognitionOutput::Text("  ￥1,234.50\n".into());
        assert_eq!(flatten_text(Some(&out)), "￥1,234.50");
    }

    #[test]
    fn test_option_constructors() {
        let single = RecognizeOptions::single_line();
        assert!(!single.detect);
        assert!(single.detect_threshold.is_none());

        let det = RecognizeOptions::detect_with(0.3, 0.4);
        assert!(det.detect);
        assert!(!det.classify);
        assert_eq!(det.text_score_threshold, Some(0.4));
    }
}
