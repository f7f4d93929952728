//! Page geometry: forced rotation and fractional ROI resolution
//!
//! Rotation always happens on the full page before any box is resolved,
//! because calibrated boxes live in the post-rotation frame.

use image::{imageops, RgbImage};

use crate::config::{FractionalBox, Rotation};

/// Absolute pixel rectangle, `x1..x2` by `y1..y2` (end exclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }
}

/// Apply the configured rotation to a rendered page
pub fn rotate_page(page: RgbImage, rotation: Rotation) -> RgbImage {
    match rotation {
        Rotation::None => page,
        Rotation::Cw90 => imageops::rotate90(&page),
        Rotation::Ccw90 => imageops::rotate270(&page),
        Rotation::Half => imageops::rotate180(&page),
    }
}

/// Scale a fractional box to a `width` x `height` page, clamped to the page.
///
/// Returns `None` when the clamped rectangle is empty, e.g. for a box lying
/// entirely outside the unit square. That is an expected outcome when a
/// template calibrated on one page meets a slightly different canvas.
pub fn resolve(region: &FractionalBox, width: u32, height: u32) -> Option<PixelRect> {
    let scale = |v: f64, extent: u32| -> u32 {
        let px = (v * extent as f64).round();
        // NaN falls through both comparisons and casts to 0
        px.clamp(0.0, extent as f64) as u32
    };

    let rect = PixelRect {
        x1: scale(region.x1, width),
        y1: scale(region.y1, height),
        x2: scale(region.x2, width),
        y2: scale(region.y2, height),
    };

    if rect.x2 <= rect.x1 || rect.y2 <= rect.y1 {
        return None;
    }
    Some(rect)
}

/// Resolve a region on `page` and copy it out
pub fn crop_region(page: &RgbImage, region: &FractionalBox) -> Option<RgbImage> {
    let rect = resolve(region, page.width(), page.height())?;
    Some(imageops::crop_imm(page, rect.x1, rect.y1, rect.width(), rect.height()).to_image())
}
