//! Crop conditioning before OCR
//!
//! Small crops are upscaled so glyphs reach a height the recognizer was
//! trained on. Optional enhancement boosts local contrast without
//! binarizing, since hard thresholds make the detector lose faint strokes.

use image::{imageops, DynamicImage, GrayImage, Luma, RgbImage};
use imageproc::filter::gaussian_blur_f32;
use tracing::debug;

/// Smallest upscale factor ever applied to an undersized crop
const MIN_UPSCALE: f32 = 2.0;

/// Sigma matching a 3x3 Gaussian kernel
const BLUR_SIGMA: f32 = 0.8;

/// Histogram clip limit for adaptive equalization
const CLAHE_CLIP_LIMIT: f32 = 2.0;

/// Tiles per axis for adaptive equalization
const CLAHE_GRID: u32 = 8;

/// Prepare a crop for recognition. Absent crops stay absent.
pub fn condition(crop: Option<&RgbImage>, min_height: u32, enhance: bool) -> Option<RgbImage> {
    let crop = crop?;
    let scaled = upscale_if_small(crop, min_height);
    if enhance {
        Some(enhance_contrast(&scaled))
    } else {
        Some(scaled)
    }
}

/// Upscale isotropically by `max(2, min_height / height)` when the crop is
/// lower than `min_height`
pub fn upscale_if_small(img: &RgbImage, min_height: u32) -> RgbImage {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 || height >= min_height {
        return img.clone();
    }

    let scale = MIN_UPSCALE.max(min_height as f32 / height as f32);
    let new_width = ((width as f32 * scale).round() as u32).max(1);
    let new_height = ((height as f32 * scale).round() as u32).max(1);
    debug!(
        "Upscaling {}x{} crop by {:.2} to {}x{}",
        width, height, scale, new_width, new_height
    );

    imageops::resize(img, new_width, new_height, imageops::FilterType::CatmullRom)
}

/// Luminance, light blur, then tile-based adaptive histogram equalization.
/// Returned as three identical channels.
pub fn enhance_contrast(img: &RgbImage) -> RgbImage {
    if img.width() == 0 || img.height() == 0 {
        return img.clone();
    }

    let gray = imageops::grayscale(img);
    let blurred = gaussian_blur_f32(&gray, BLUR_SIGMA);
    let equalized = clahe(&blurred, CLAHE_CLIP_LIMIT, CLAHE_GRID);

    DynamicImage::ImageLuma8(equalized).to_rgb8()
}

/// Contrast-limited adaptive histogram equalization.
///
/// The image is split into `grid` x `grid` tiles (fewer when the image is
/// smaller than the grid). Each tile gets a clipped-histogram lookup table
/// and every pixel is mapped by bilinear interpolation between the tables of
/// the four nearest tile centres.
fn clahe(img: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (width, height) = img.dimensions();
    let tiles_x = grid.min(width).max(1);
    let tiles_y = grid.min(height).max(1);
    let tile_w = width.div_ceil(tiles_x);
    let tile_h = height.div_ceil(tiles_y);

    let mut luts = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);
            if x0 >= x1 || y0 >= y1 {
                // Trailing tile swallowed by rounding; identity mapping
                let lut = &mut luts[(ty * tiles_x + tx) as usize];
                for (i, v) in lut.iter_mut().enumerate() {
                    *v = i as u8;
                }
                continue;
            }

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[img.get_pixel(x, y)[0] as usize] += 1;
                }
            }

            let area = (x1 - x0) * (y1 - y0);
            clip_histogram(&mut hist, clip_limit, area);

            let lut = &mut luts[(ty * tiles_x + tx) as usize];
            let mut cdf = 0u32;
            let scale = 255.0 / area as f32;
            for (i, count) in hist.iter().enumerate() {
                cdf += count;
                lut[i] = (cdf as f32 * scale).round().min(255.0) as u8;
            }
        }
    }

    let lut_at = |tx: u32, ty: u32| &luts[(ty * tiles_x + tx) as usize];

    GrayImage::from_fn(width, height, |x, y| {
        let v = img.get_pixel(x, y)[0] as usize;

        // Position relative to tile centres
        let gx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
        let gy = (y as f32 + 0.5) / tile_h as f32 - 0.5;

        let tx0 = gx.floor().clamp(0.0, (tiles_x - 1) as f32) as u32;
        let ty0 = gy.floor().clamp(0.0, (tiles_y - 1) as f32) as u32;
        let tx1 = (tx0 + 1).min(tiles_x - 1);
        let ty1 = (ty0 + 1).min(tiles_y - 1);

        let fx = (gx - tx0 as f32).clamp(0.0, 1.0);
        let fy = (gy - ty0 as f32).clamp(0.0, 1.0);

        let top = lut_at(tx0, ty0)[v] as f32 * (1.0 - fx) + lut_at(tx1, ty0)[v] as f32 * fx;
        let bottom = lut_at(tx0, ty1)[v] as f32 * (1.0 - fx) + lut_at(tx1, ty1)[v] as f32 * fx;
        let value = top * (1.0 - fy) + bottom * fy;

        Luma([value.round().clamp(0.0, 255.0) as u8])
    })
}

/// Clip histogram bins at `clip_limit * area / 256` and spread the excess
/// evenly over all bins
fn clip_histogram(hist: &mut [u32; 256], clip_limit: f32, area: u32) {
    let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);

    let mut excess = 0u32;
    for count in hist.iter_mut() {
        if *count > limit {
            excess += *count - limit;
            *count = limit;
        }
    }

    let per_bin = excess / 256;
    let mut residual = excess % 256;
    for count in hist.iter_mut() {
        *count += per_bin;
    }
    if residual > 0 {
        let step = (256 / residual).max(1) as usize;
        let mut i = 0;
        while residual > 0 && i < 256 {
            hist[i] += 1;
            residual -= 1;
            i += step;
        }
    }
}
