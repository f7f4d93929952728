//! Vision/OCR Layer
//!
//! Turns rendered pages into field text: geometry resolves and crops the
//! regions, conditioning prepares crops, and the strategy drives an OCR
//! engine through its per-field fallbacks. The bundled engine is PaddleOCR
//! via ONNX Runtime.

pub mod condition;
pub mod geometry;
pub mod models;
pub mod ocr;
pub mod paddle;
pub mod preprocess;
pub mod strategy;

pub use models::ModelManager;
pub use paddle::PaddleOcrEngine;
pub use strategy::{OcrStrategy, StrategyConfig};
