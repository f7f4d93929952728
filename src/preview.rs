//! ROI preview overlays and non-interactive calibration
//!
//! Preview draws the resolved regions on rendered pages so a template can be
//! checked by eye. Calibration turns pixel rectangles measured on a rendered
//! page into a fractional ROI configuration.

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{Field, FractionalBox, RoiConfig, Rotation};
use crate::error::RenderError;
use crate::pipeline::PageSource;
use crate::vision::geometry::{resolve, rotate_page};

/// Outline thickness in pixels
const STROKE: u32 = 3;

/// Outline colour per field
pub fn field_color(field: Field) -> Rgb<u8> {
    match field {
        Field::InvoiceNo => Rgb([255, 128, 0]),
        Field::InvoiceDate => Rgb([0, 200, 0]),
        Field::TotalAmount => Rgb([200, 0, 200]),
    }
}

/// Copy of `page` with every resolvable region outlined
pub fn draw_overlay(page: &RgbImage, roi: &RoiConfig) -> RgbImage {
    let mut overlay = page.clone();
    let (width, height) = page.dimensions();

    for field in Field::ALL {
        let Some(rect) = resolve(roi.region(field), width, height) else {
            debug!(field = field.key(), "Region outside the page, not drawn");
            continue;
        };

        // Nested outlines, shrinking inwards
        for inset in 0..STROKE {
            let w = rect.width().saturating_sub(2 * inset);
            let h = rect.height().saturating_sub(2 * inset);
            if w == 0 || h == 0 {
                break;
            }
            let outline =
                Rect::at((rect.x1 + inset) as i32, (rect.y1 + inset) as i32).of_size(w, h);
            draw_hollow_rect_mut(&mut overlay, outline, field_color(field));
        }
    }

    overlay
}

/// Render the first `max_pages` pages (all when `None`), outline the regions
/// and write `page_{NNN}_overlay.png` files into `out_dir`
pub fn write_previews(
    source: &dyn PageSource,
    roi: &RoiConfig,
    max_pages: Option<usize>,
    out_dir: &Path,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create preview directory {:?}", out_dir))?;

    let count = max_pages.map_or(source.page_count(), |n| n.min(source.page_count()));
    let mut written = Vec::with_capacity(count);

    for page_index in 0..count {
        let page = match source.render(page_index, roi.dpi) {
            Ok(page) => rotate_page(page, roi.rotate),
            Err(e) => {
                warn!("Skipping page {} in preview: {}", page_index + 1, e);
                continue;
            }
        };

        let path = out_dir.join(format!("page_{:03}_overlay.png", page_index + 1));
        draw_overlay(&page, roi)
            .save(&path)
            .with_context(|| format!("Failed to write {:?}", path))?;
        written.push(path);
    }

    info!("Wrote {} preview images to {:?}", written.len(), out_dir);
    Ok(written)
}

/// Parse `x,y,w,h` in pixels
pub fn parse_pixel_rect(s: &str) -> Result<(u32, u32, u32, u32), String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [x, y, w, h] = parts[..] else {
        return Err(format!("expected x,y,w,h but got {s:?}"));
    };
    let num = |v: &str| v.parse::<u32>().map_err(|e| format!("{v:?}: {e}"));
    let rect = (num(x)?, num(y)?, num(w)?, num(h)?);
    if rect.2 == 0 || rect.3 == 0 {
        return Err(format!("rectangle {s:?} has zero size"));
    }
    Ok(rect)
}

/// Pixel rectangles for the three fields, measured on the rendered and
/// rotated calibration page
#[derive(Debug, Clone, Copy)]
pub struct CalibrationRects {
    pub invoice_no: (u32, u32, u32, u32),
    pub invoice_date: (u32, u32, u32, u32),
    pub total_amount: (u32, u32, u32, u32),
}

/// Build an ROI configuration from pixel rectangles. The page index is
/// clamped into range.
pub fn calibrate(
    source: &dyn PageSource,
    page_index: usize,
    dpi: u32,
    rotate: Rotation,
    rects: &CalibrationRects,
) -> Result<RoiConfig, RenderError> {
    let count = source.page_count();
    if count == 0 {
        return Err(RenderError::PageOutOfRange { page: page_index, count });
    }
    let page_index = page_index.min(count - 1);

    let page = rotate_page(source.render(page_index, dpi)?, rotate);
    let (width, height) = page.dimensions();
    info!("Calibrating on page {} ({}x{} after rotation)", page_index + 1, width, height);

    let to_box = |rect: (u32, u32, u32, u32)| {
        let region = FractionalBox::from_pixels(rect, width, height);
        if !region.is_well_formed() {
            warn!("Rectangle {:?} extends past the {}x{} page", rect, width, height);
        }
        region
    };

    Ok(RoiConfig {
        dpi,
        rotate,
        invoice_no: to_box(rects.invoice_no),
        invoice_date: to_box(rects.invoice_date),
        total_amount: to_box(rects.total_amount),
    })
}
