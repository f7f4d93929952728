//! Tensor preparation for the PaddleOCR models
//!
//! Detection takes the whole crop resized so both sides are multiples of 32.
//! Recognition takes one text line at a fixed height.

use image::{imageops, RgbImage};
use ndarray::Array4;

/// Preprocessing configuration
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// Longest side limit for the detection input
    pub det_limit_side: u32,
    /// Input height of the recognition model
    pub rec_target_height: u32,
    /// Widest line fed to recognition
    pub rec_max_width: u32,
    /// Detection normalization [R, G, B] (ImageNet statistics)
    pub det_mean: [f32; 3],
    pub det_std: [f32; 3],
    /// Recognition normalization, maps [0, 255] to [-1, 1]
    pub rec_mean: [f32; 3],
    pub rec_std: [f32; 3],
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            det_limit_side: 960,
            rec_target_height: 48,
            rec_max_width: 1600,
            det_mean: [0.485, 0.456, 0.406],
            det_std: [0.229, 0.224, 0.225],
            rec_mean: [0.5, 0.5, 0.5],
            rec_std: [0.5, 0.5, 0.5],
        }
    }
}

/// Detection input plus the factors that map model coordinates back to the
/// source image
#[derive(Debug)]
pub struct DetectionInput {
    pub tensor: Array4<f32>,
    pub scale_x: f32,
    pub scale_y: f32,
}

/// Round to the nearest multiple of 32, never below 32
fn to_multiple_of_32(v: f32) -> u32 {
    (((v / 32.0).round() as u32) * 32).max(32)
}

/// NCHW tensor (batch 1) with per-channel `(v / 255 - mean) / std`
pub fn to_nchw(image: &RgbImage, mean: &[f32; 3], std: &[f32; 3]) -> Array4<f32> {
    let (w, h) = image.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, h as usize, w as usize));

    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            let v = pixel[c] as f32 / 255.0;
            tensor[[0, c, y as usize, x as usize]] = (v - mean[c]) / std[c];
        }
    }

    tensor
}

/// Resize so the longest side fits `det_limit_side` (small images are not
/// enlarged), snapping both sides to multiples of 32
pub fn prepare_detection(image: &RgbImage, config: &PreprocessConfig) -> DetectionInput {
    let (w, h) = image.dimensions();
    let longest = w.max(h).max(1) as f32;
    let ratio = (config.det_limit_side as f32 / longest).min(1.0);

    let new_w = to_multiple_of_32(w as f32 * ratio);
    let new_h = to_multiple_of_32(h as f32 * ratio);
    let resized = imageops::resize(image, new_w, new_h, imageops::FilterType::Triangle);

    DetectionInput {
        tensor: to_nchw(&resized, &config.det_mean, &config.det_std),
        scale_x: w as f32 / new_w as f32,
        scale_y: h as f32 / new_h as f32,
    }
}

/// Resize a line to the recognition height, keeping aspect ratio up to
/// `rec_max_width`
pub fn prepare_recognition(line: &RgbImage, config: &PreprocessConfig) -> Array4<f32> {
    let (w, h) = line.dimensions();
    let target_h = config.rec_target_height;
    let scaled_w = (w as f32 * target_h as f32 / h.max(1) as f32).ceil() as u32;
    let new_w = scaled_w.clamp(1, config.rec_max_width);

    let resized = imageops::resize(line, new_w, target_h, imageops::FilterType::Triangle);
    to_nchw(&resized, &config.rec_mean, &config.rec_std)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_to_nchw_layout_and_normalization() {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(3, 1, Rgb([255, 0, 51]));

        let tensor = to_nchw(&img, &[0.5; 3], &[0.5; 3]);

        assert_eq!(tensor.dim(), (1, 3, 2, 4));
        assert!((tensor[[0, 0, 1, 3]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 1, 3]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 1, 3]] - (0.2 - 0.5) / 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_detection_sides_are_multiples_of_32() {
        let img = RgbImage::new(280, 70);
        let input = prepare_detection(&img, &PreprocessConfig::default());
        let (_, _, h, w) = input.tensor.dim();
        assert_eq!(w % 32, 0);
        assert_eq!(h % 32, 0);
        assert_eq!((w, h), (288, 64));
        assert!((input.scale_x - 280.0 / 288.0).abs() < 1e-6);
    }

    #[test]
    fn test_detection_limits_longest_side() {
        let img = RgbImage::new(2000, 500);
        let input = prepare_detection(&img, &PreprocessConfig::default());
        let (_, _, h, w) = input.tensor.dim();
        assert_eq!(w, 960);
        assert_eq!(h, 256);
    }

    #[test]
    fn test_recognition_height_and_width_cap() {
        let config = PreprocessConfig::default();

        let line = RgbImage::new(200, 24);
        assert_eq!(prepare_recognition(&line, &config).dim(), (1, 3, 48, 400));

        let long = RgbImage::new(5000, 20);
        assert_eq!(
            prepare_recognition(&long, &config).dim(),
            (1, 3, 48, config.rec_max_width as usize)
        );
    }
}
