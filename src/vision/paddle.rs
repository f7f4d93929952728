//! Local PaddleOCR engine on ONNX Runtime
//!
//! Detection is a DB (differentiable binarization) model producing a text
//! probability map; boxes come from connected components of the binarized
//! map. Recognition is a CTC model decoded greedily.

use anyhow::{Context, Result};
use image::{imageops, GrayImage, Luma, RgbImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use tracing::{debug, trace, warn};

use crate::config::OcrSettings;
use crate::error::EngineError;
use crate::vision::models::{ModelManager, ModelType, OnnxSession};
use crate::vision::ocr::{RecognitionOutput, RecognizeOptions, TextRecognizer, TextSpan};
use crate::vision::preprocess::{prepare_detection, prepare_recognition, PreprocessConfig};

/// Box score threshold when the caller gives none
const DEFAULT_BOX_THRESHOLD: f32 = 0.5;

/// Recognition score threshold when the caller gives none
const DEFAULT_TEXT_SCORE: f32 = 0.5;

/// Components with a shorter side are noise
const MIN_BOX_SIDE: u32 = 3;

/// Boxes whose vertical centres differ by less than this share one line
const SAME_LINE_TOLERANCE: f32 = 10.0;

/// Post-processing knobs for the probability map
#[derive(Debug, Clone, Copy)]
pub struct DetectionParams {
    pub binarize_threshold: f32,
    pub box_threshold: f32,
    pub unclip_ratio: f32,
}

/// Axis-aligned text box in map coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
}

impl TextBox {
    fn polygon(&self) -> [(f32, f32); 4] {
        [
            (self.x1, self.y1),
            (self.x2, self.y1),
            (self.x2, self.y2),
            (self.x1, self.y2),
        ]
    }
}

/// PaddleOCR detection + recognition behind [`TextRecognizer`]
pub struct PaddleOcrEngine {
    det: OnnxSession,
    rec: OnnxSession,
    charset: Vec<String>,
    preprocess: PreprocessConfig,
    binarize_threshold: f32,
    unclip_ratio: f32,
}

impl PaddleOcrEngine {
    /// Fetch missing models and load both sessions
    pub fn new(manager: &ModelManager, settings: &OcrSettings) -> Result<Self> {
        let det_path = manager.ensure_model(ModelType::Detection)?;
        let rec_path = manager.ensure_model(ModelType::Recognition)?;
        let dict_path = manager.ensure_model(ModelType::Dictionary)?;

        let dict = std::fs::read_to_string(&dict_path)
            .with_context(|| format!("Failed to read dictionary {:?}", dict_path))?;
        let charset = load_charset(&dict);
        debug!("Loaded {} recognition classes", charset.len());

        Ok(Self {
            det: OnnxSession::new(&det_path, settings)?,
            rec: OnnxSession::new(&rec_path, settings)?,
            charset,
            preprocess: PreprocessConfig::default(),
            binarize_threshold: settings.binarize_threshold,
            unclip_ratio: settings.unclip_ratio,
        })
    }

    fn detect(&self, image: &RgbImage, box_threshold: f32) -> Result<Vec<TextBox>, EngineError> {
        let input = prepare_detection(image, &self.preprocess);
        let (_, _, h, w) = input.tensor.dim();
        let (data, _) = input.tensor.into_raw_vec_and_offset();

        let (dims, prob) = self.det.run_f32([1, 3, h, w], data)?;
        let (map_h, map_w) = match dims.as_slice() {
            [.., mh, mw] => (*mh, *mw),
            _ => return Err(EngineError::Output(format!("detection shape {:?}", dims))),
        };
        if prob.len() < map_h * map_w {
            return Err(EngineError::Output(format!(
                "detection map has {} values for {}x{}",
                prob.len(),
                map_w,
                map_h
            )));
        }

        let params = DetectionParams {
            binarize_threshold: self.binarize_threshold,
            box_threshold,
            unclip_ratio: self.unclip_ratio,
        };
        let boxes = boxes_from_map(&prob[..map_h * map_w], map_w as u32, map_h as u32, &params);

        // Back to source coordinates
        let (iw, ih) = (image.width() as f32, image.height() as f32);
        Ok(boxes
            .into_iter()
            .map(|b| TextBox {
                x1: (b.x1 * input.scale_x).clamp(0.0, iw),
                y1: (b.y1 * input.scale_y).clamp(0.0, ih),
                x2: (b.x2 * input.scale_x).clamp(0.0, iw),
                y2: (b.y2 * input.scale_y).clamp(0.0, ih),
                score: b.score,
            })
            .collect())
    }

    fn recognize_line(&self, line: &RgbImage) -> Result<(String, f32), EngineError> {
        let tensor = prepare_recognition(line, &self.preprocess);
        let (_, _, h, w) = tensor.dim();
        let (data, _) = tensor.into_raw_vec_and_offset();

        let (dims, logits) = self.rec.run_f32([1, 3, h, w], data)?;
        let (steps, classes) = match dims.as_slice() {
            [_, t, c] => (*t, *c),
            _ => return Err(EngineError::Output(format!("recognition shape {:?}", dims))),
        };
        if logits.len() < steps * classes {
            return Err(EngineError::Output("recognition output truncated".into()));
        }

        Ok(ctc_greedy_decode(&logits, steps, classes, &self.charset))
    }
}

impl TextRecognizer for PaddleOcrEngine {
    fn recognize(
        &self,
        image: &RgbImage,
        options: &RecognizeOptions,
    ) -> Result<RecognitionOutput, EngineError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(EngineError::EmptyInput);
        }
        let min_score = options.text_score_threshold.unwrap_or(DEFAULT_TEXT_SCORE);

        if !options.detect {
            let (text, score) = self.recognize_line(image)?;
            trace!(text = %text, score, "Single-line recognition");
            if text.is_empty() || score < min_score {
                return Ok(RecognitionOutput::Empty);
            }
            return Ok(RecognitionOutput::Lines {
                texts: vec![Some(text)],
                scores: vec![score],
            });
        }

        let box_threshold = options.detect_threshold.unwrap_or(DEFAULT_BOX_THRESHOLD);
        let boxes = self.detect(image, box_threshold)?;
        debug!("Detected {} text boxes", boxes.len());

        let spans = read_boxes(image, boxes, min_score, |line| self.recognize_line(line));

        if spans.is_empty() {
            Ok(RecognitionOutput::Empty)
        } else {
            Ok(RecognitionOutput::Spans(spans))
        }
    }
}

/// Recognize every detected box. A box whose recognition fails is logged
/// and skipped; the other boxes still contribute.
fn read_boxes<F>(
    image: &RgbImage,
    boxes: Vec<TextBox>,
    min_score: f32,
    mut read: F,
) -> Vec<TextSpan>
where
    F: FnMut(&RgbImage) -> Result<(String, f32), EngineError>,
{
    let mut spans = Vec::with_capacity(boxes.len());
    for b in boxes {
        let x = b.x1.floor() as u32;
        let y = b.y1.floor() as u32;
        let w = (b.x2.ceil() as u32).min(image.width()).saturating_sub(x);
        let h = (b.y2.ceil() as u32).min(image.height()).saturating_sub(y);
        if w == 0 || h == 0 {
            continue;
        }

        let line = imageops::crop_imm(image, x, y, w, h).to_image();
        let (text, score) = match read(&line) {
            Ok(result) => result,
            Err(e) => {
                warn!("Skipping text box at ({}, {}): {}", x, y, e);
                continue;
            }
        };
        trace!(text = %text, score, "Box recognition");
        if text.is_empty() || score < min_score {
            continue;
        }
        spans.push(TextSpan {
            polygon: b.polygon(),
            text: Some(text),
            score,
        });
    }
    spans
}

/// Class list for CTC decoding: blank, dictionary lines, then space
pub fn load_charset(dict: &str) -> Vec<String> {
    let mut charset = vec![String::new()];
    charset.extend(
        dict.lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.is_empty())
            .map(str::to_string),
    );
    charset.push(" ".to_string());
    charset
}

/// Greedy CTC: argmax per step, collapse repeats, drop blanks (class 0).
/// Score is the mean probability of the emitted characters.
pub fn ctc_greedy_decode(
    logits: &[f32],
    steps: usize,
    classes: usize,
    charset: &[String],
) -> (String, f32) {
    let mut text = String::new();
    let mut total = 0.0f32;
    let mut emitted = 0usize;
    let mut previous = 0usize;

    for step in logits.chunks_exact(classes).take(steps) {
        let (best, prob) = step
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });

        if best != 0 && best != previous {
            if let Some(ch) = charset.get(best) {
                text.push_str(ch);
                total += prob;
                emitted += 1;
            }
        }
        previous = best;
    }

    let score = if emitted == 0 { 0.0 } else { total / emitted as f32 };
    (text, score)
}

/// Turn a probability map into scored, expanded boxes in reading order
pub fn boxes_from_map(
    prob: &[f32],
    width: u32,
    height: u32,
    params: &DetectionParams,
) -> Vec<TextBox> {
    let mask = GrayImage::from_fn(width, height, |x, y| {
        let p = prob[(y * width + x) as usize];
        Luma([if p > params.binarize_threshold { 255 } else { 0 }])
    });
    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

    struct Acc {
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        sum: f32,
        count: u32,
    }

    let mut components: Vec<Option<Acc>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0] as usize;
        if label == 0 {
            continue;
        }
        if components.len() < label {
            components.resize_with(label, || None);
        }
        let p = prob[(y * width + x) as usize];
        let acc = components[label - 1].get_or_insert(Acc {
            x1: x,
            y1: y,
            x2: x,
            y2: y,
            sum: 0.0,
            count: 0,
        });
        acc.x1 = acc.x1.min(x);
        acc.y1 = acc.y1.min(y);
        acc.x2 = acc.x2.max(x);
        acc.y2 = acc.y2.max(y);
        acc.sum += p;
        acc.count += 1;
    }

    let mut boxes: Vec<TextBox> = components
        .into_iter()
        .flatten()
        .filter_map(|c| {
            let w = c.x2 - c.x1 + 1;
            let h = c.y2 - c.y1 + 1;
            let score = c.sum / c.count as f32;
            if w.min(h) < MIN_BOX_SIDE || score < params.box_threshold {
                return None;
            }

            // Grow by the DB unclip offset: area * ratio / perimeter
            let (wf, hf) = (w as f32, h as f32);
            let d = wf * hf * params.unclip_ratio / (2.0 * (wf + hf));
            Some(TextBox {
                x1: (c.x1 as f32 - d).max(0.0),
                y1: (c.y1 as f32 - d).max(0.0),
                x2: (c.x2 as f32 + 1.0 + d).min(width as f32),
                y2: (c.y2 as f32 + 1.0 + d).min(height as f32),
                score,
            })
        })
        .collect();

    sort_reading_order(&mut boxes);
    boxes
}

/// Top to bottom, left to right within a line. Boxes whose vertical centres
/// chain within `SAME_LINE_TOLERANCE` of each other form one line.
fn sort_reading_order(boxes: &mut Vec<TextBox>) {
    let centre = |b: &TextBox| (b.y1 + b.y2) / 2.0;
    boxes.sort_by(|a, b| centre(a).total_cmp(&centre(b)));

    let mut ordered = Vec::with_capacity(boxes.len());
    let mut line: Vec<TextBox> = Vec::new();
    let mut last_centre = f32::NEG_INFINITY;
    for b in boxes.drain(..) {
        let c = centre(&b);
        if c - last_centre >= SAME_LINE_TOLERANCE && !line.is_empty() {
            line.sort_by(|a, b| a.x1.total_cmp(&b.x1));
            ordered.append(&mut line);
        }
        last_centre = c;
        line.push(b);
    }
    line.sort_by(|a, b| a.x1.total_cmp(&b.x1));
    ordered.append(&mut line);

    *boxes = ordered;
}
