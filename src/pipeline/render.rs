//! Document rasterization
//!
//! PDFs go through PDFium. Plain raster images are accepted as one-page
//! documents so scans can be processed without wrapping them in a PDF.

use image::RgbImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::RenderError;

/// PDF user space units per inch
const POINTS_PER_INCH: f32 = 72.0;

/// Longest rendered side; larger pages are scaled down to fit
const MAX_DIMENSION_PX: u32 = 10_000;

/// Raster extensions treated as single-page documents
pub const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "tif", "tiff", "bmp"];

/// A document whose pages can be rasterized on demand
pub trait PageSource {
    fn page_count(&self) -> usize;

    /// Color raster of page `page_index` (0-based) at `dpi`
    fn render(&self, page_index: usize, dpi: u32) -> Result<RgbImage, RenderError>;
}

/// Open `path` as a PDF or a single raster image, by extension
pub fn open_document(path: &Path) -> Result<Box<dyn PageSource>, RenderError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Ok(Box::new(ImageSource::open(path)?))
    } else {
        Ok(Box::new(PdfiumSource::open(path)?))
    }
}

/// Load the PDFium dynamic library.
///
/// Discovery order:
/// 1. `PDFIUM_DYNAMIC_LIB_PATH` env var (explicit path)
/// 2. Alongside the running executable
/// 3. System library search paths
fn load_pdfium() -> Result<Pdfium, RenderError> {
    if let Ok(path) = std::env::var("PDFIUM_DYNAMIC_LIB_PATH") {
        debug!(path = %path, "Loading PDFium from env var");
        let bindings = Pdfium::bind_to_library(&path)
            .map_err(|e| RenderError::Library(format!("{path}: {e}")))?;
        return Ok(Pdfium::new(bindings));
    }

    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        let lib_path =
            Pdfium::pdfium_platform_library_name_at_path(exe_dir.to_string_lossy().as_ref());
        if let Ok(bindings) = Pdfium::bind_to_library(&lib_path) {
            debug!(dir = %exe_dir.display(), "Loaded PDFium next to the executable");
            return Ok(Pdfium::new(bindings));
        }
    }

    let bindings = Pdfium::bind_to_system_library().map_err(|e| {
        RenderError::Library(format!(
            "PDFium not found. Set PDFIUM_DYNAMIC_LIB_PATH or install PDFium: {e}"
        ))
    })?;
    Ok(Pdfium::new(bindings))
}

/// Pixel size of a page at `dpi`, scaled down to fit [`MAX_DIMENSION_PX`]
fn render_dimensions(width_points: f32, height_points: f32, dpi: u32) -> (u32, u32) {
    let scale = dpi as f32 / POINTS_PER_INCH;
    let w = (width_points * scale).max(1.0);
    let h = (height_points * scale).max(1.0);

    let longest = w.max(h);
    if longest > MAX_DIMENSION_PX as f32 {
        let ratio = MAX_DIMENSION_PX as f32 / longest;
        (((w * ratio) as u32).max(1), ((h * ratio) as u32).max(1))
    } else {
        (w.round() as u32, h.round() as u32)
    }
}

/// PDF document rendered through PDFium.
///
/// `Pdfium` handles are not `Send`, so each render binds the library and
/// parses the bytes again; the OS keeps the library loaded between calls.
pub struct PdfiumSource {
    path: PathBuf,
    bytes: Vec<u8>,
    page_count: usize,
}

impl PdfiumSource {
    pub fn open(path: &Path) -> Result<Self, RenderError> {
        let bytes = std::fs::read(path)
            .map_err(|e| RenderError::Open(format!("{}: {e}", path.display())))?;

        let pdfium = load_pdfium()?;
        let page_count = {
            let document = pdfium
                .load_pdf_from_byte_slice(&bytes, None)
                .map_err(|e| RenderError::Open(format!("{}: {e}", path.display())))?;
            document.pages().len() as usize
        };
        debug!("Opened {:?} with {} pages", path, page_count);

        Ok(Self {
            path: path.to_path_buf(),
            bytes,
            page_count,
        })
    }
}

impl PageSource for PdfiumSource {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn render(&self, page_index: usize, dpi: u32) -> Result<RgbImage, RenderError> {
        if page_index >= self.page_count {
            return Err(RenderError::PageOutOfRange {
                page: page_index,
                count: self.page_count,
            });
        }
        let page_error = |reason: String| RenderError::Page {
            page: page_index,
            reason,
        };

        let pdfium = load_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(&self.bytes, None)
            .map_err(|e| RenderError::Open(format!("{}: {e}", self.path.display())))?;

        let index = u16::try_from(page_index)
            .map_err(|_| page_error(format!("index {page_index} exceeds u16")))?;
        let page = document
            .pages()
            .get(index)
            .map_err(|e| page_error(e.to_string()))?;

        let (width, height) = render_dimensions(page.width().value, page.height().value, dpi);
        let config = PdfRenderConfig::new()
            .set_target_width(width as i32)
            .set_maximum_height(height as i32);

        let bitmap = page
            .render_with_config(&config)
            .map_err(|e| page_error(e.to_string()))?;

        let image = bitmap.as_image().to_rgb8();
        debug!(
            page = page_index,
            width = image.width(),
            height = image.height(),
            "Rendered PDF page"
        );
        Ok(image)
    }
}

/// A single raster image treated as a one-page document; DPI is ignored
pub struct ImageSource {
    image: RgbImage,
}

impl ImageSource {
    pub fn open(path: &Path) -> Result<Self, RenderError> {
        let image = image::open(path)
            .map_err(|e| RenderError::Open(format!("{}: {e}", path.display())))?
            .to_rgb8();
        Ok(Self::from_image(image))
    }

    pub fn from_image(image: RgbImage) -> Self {
        Self { image }
    }
}

impl PageSource for ImageSource {
    fn page_count(&self) -> usize {
        1
    }

    fn render(&self, page_index: usize, _dpi: u32) -> Result<RgbImage, RenderError> {
        if page_index != 0 {
            return Err(RenderError::PageOutOfRange {
                page: page_index,
                count: 1,
            });
        }
        Ok(self.image.clone())
    }
}
