//! invoice-roi - Offline invoice field extraction
//!
//! Renders invoice pages, crops calibrated regions of interest, reads them
//! with a local OCR engine and normalizes invoice number, date and amount.

mod config;
mod error;
mod export;
mod fields;
mod pipeline;
mod preview;
mod storage;
mod vision;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{AppConfig, FieldPolicy, RoiConfig, Rotation, DEFAULT_DPI};
use crate::error::ConfigError;
use crate::export::{JsonExporter, RowExporter};
use crate::pipeline::{
    CancelToken, ChannelProgress, InvoicePipeline, LogProgress, PageSelection, ProgressObserver,
};
use crate::preview::{parse_pixel_rect, CalibrationRects};
use crate::vision::{ModelManager, OcrStrategy, PaddleOcrEngine, StrategyConfig};

/// Default export file name
const DEFAULT_OUTPUT: &str = "invoice_rows.json";

/// invoice-roi - Fixed-layout invoice field extraction
#[derive(Parser, Debug)]
#[command(name = "invoice-roi")]
#[command(about = "Extract invoice number, date and amount from fixed ROI crops")]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract fields from PDFs or scanned images
    Extract(ExtractArgs),
    /// Draw the ROI boxes on rendered pages
    Preview(PreviewArgs),
    /// Write an ROI configuration from pixel rectangles
    Calibrate(CalibrateArgs),
    /// Download and verify the OCR models
    Models,
    /// Write a default settings file
    InitConfig {
        /// Destination (defaults to the platform config directory)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct ExtractArgs {
    /// Input documents, processed in order
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// ROI configuration JSON
    #[arg(long)]
    roi: Option<PathBuf>,

    /// Output JSON file
    #[arg(long)]
    out: Option<PathBuf>,

    /// Process every page (default)
    #[arg(long, conflicts_with = "page_index")]
    all_pages: bool,

    /// Process a single page (0-based, clamped into range)
    #[arg(long)]
    page_index: Option<usize>,

    /// Process at most the first N pages
    #[arg(long, conflicts_with = "page_index")]
    max_pages: Option<usize>,

    /// Normalization policy
    #[arg(long, value_enum)]
    policy: Option<FieldPolicy>,

    /// Save raw ROI crops here
    #[arg(long)]
    debug_dir: Option<PathBuf>,

    /// Add the source file name to every row
    #[arg(long)]
    with_filename: bool,
}

impl ExtractArgs {
    fn selection(&self) -> PageSelection {
        match (self.page_index, self.max_pages) {
            (Some(index), _) => PageSelection::Single(index),
            (None, Some(n)) if n > 0 && !self.all_pages => PageSelection::First(n),
            _ => PageSelection::All,
        }
    }
}

#[derive(Args, Debug)]
struct PreviewArgs {
    /// Document to preview
    input: PathBuf,

    /// ROI configuration JSON
    #[arg(long)]
    roi: Option<PathBuf>,

    /// Output directory (defaults to roi_preview_<stem> next to the input)
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Preview at most the first N pages
    #[arg(long)]
    max_pages: Option<usize>,
}

#[derive(Args, Debug)]
struct CalibrateArgs {
    /// Document used for calibration
    input: PathBuf,

    /// Invoice number rectangle x,y,w,h
    #[arg(long, value_parser = parse_pixel_rect)]
    invoice_no: (u32, u32, u32, u32),

    /// Issue date rectangle x,y,w,h
    #[arg(long, value_parser = parse_pixel_rect)]
    date: (u32, u32, u32, u32),

    /// Total amount rectangle x,y,w,h
    #[arg(long, value_parser = parse_pixel_rect)]
    amount: (u32, u32, u32, u32),

    /// Page used for calibration (0-based)
    #[arg(long, default_value = "0")]
    page_index: usize,

    /// Rendering resolution
    #[arg(long, default_value_t = DEFAULT_DPI, value_parser = clap::value_parser!(u32).range(1..))]
    dpi: u32,

    /// Forced rotation: 0, cw90, ccw90 or 180
    #[arg(long, default_value = "0")]
    rotate: Rotation,

    /// Output ROI configuration JSON
    #[arg(long)]
    out: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_or_create_config(cli.config.as_deref())?;

    let result = match cli.command {
        Command::Extract(args) => run_extract(&config, args),
        Command::Preview(args) => run_preview(&config, args),
        Command::Calibrate(args) => run_calibrate(args),
        Command::Models => run_models(&config),
        Command::InitConfig { out } => run_init_config(out),
    };
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

/// `RUST_LOG` wins; otherwise the verbosity flag picks the level
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("invoice_roi={level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from the given file, the platform default, or defaults
fn load_or_create_config(path: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = path {
        let config = config::load_config(path)
            .with_context(|| format!("Failed to load settings from {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    if let Ok(config_dir) = storage::get_config_dir() {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            match config::load_config(&config_path) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", config_path);
                    return Ok(config);
                }
                Err(e) => warn!("Ignoring unreadable {:?}: {}", config_path, e),
            }
        }
    }
    info!("Using default configuration");
    Ok(AppConfig::default())
}

/// ROI from the command line, else from the settings file
fn load_roi(arg: Option<&Path>, config: &AppConfig) -> Result<RoiConfig> {
    let path = arg
        .or(config.general.roi_config.as_deref())
        .ok_or(ConfigError::MissingRoi)?;
    let roi = config::load_roi_config(path)?;
    info!(
        "Loaded ROI template {:?} (dpi {}, rotate {})",
        path, roi.dpi, roi.rotate
    );
    Ok(roi)
}

/// Flip the token on Ctrl-C; pages already done are still exported
fn spawn_ctrl_c_listener(cancel: CancelToken) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Ctrl-C handling unavailable: {}", e);
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing the current page");
                cancel.cancel();
            }
        });
    });
}

fn run_extract(config: &AppConfig, args: ExtractArgs) -> Result<()> {
    let roi = load_roi(args.roi.as_deref(), config)?;
    let policy = args.policy.unwrap_or(config.extraction.policy);
    let selection = args.selection();
    let debug_dir = args.debug_dir.clone().or_else(|| config.extraction.debug_dir.clone());

    let manager = ModelManager::from_settings(&config.models)?;
    let engine = PaddleOcrEngine::new(&manager, &config.ocr).context("Failed to start OCR engine")?;
    let strategy = OcrStrategy::new(engine, StrategyConfig::from(&config.ocr));
    let pipeline = InvoicePipeline::new(roi, strategy, policy).with_debug_dir(debug_dir);

    let cancel = CancelToken::new();
    spawn_ctrl_c_listener(cancel.clone());

    info!("Extracting {} document(s) with {:?} policy", args.inputs.len(), policy);
    let (page_counter, page_events) = ChannelProgress::new();
    let mut rows = Vec::new();
    for input in &args.inputs {
        if cancel.is_cancelled() {
            break;
        }
        let log = LogProgress::new(input.display().to_string());
        let observer = |current: usize, total: usize| -> Result<()> {
            log.on_progress(current, total)?;
            page_counter.on_progress(current, total)
        };
        let report =
            pipeline.process_path(input, selection, args.with_filename, &observer, &cancel);
        rows.extend(report.rows);
        if report.cancelled {
            break;
        }
    }

    let out = args.out.clone().unwrap_or_else(|| {
        config
            .general
            .output_dir
            .as_ref()
            .map_or_else(|| PathBuf::from(DEFAULT_OUTPUT), |dir| dir.join(DEFAULT_OUTPUT))
    });

    let exporter = JsonExporter::new(out);
    if let Err(e) = exporter.export(&rows) {
        // Keep the results reachable even though the file could not be written
        if let Ok(json) = serde_json::to_string_pretty(&rows) {
            println!("{json}");
        }
        return Err(e).context("Export failed");
    }

    let events: Vec<_> = page_events.try_iter().collect();
    let finished_documents = events.iter().filter(|e| e.current == e.total).count();
    let complete = rows.iter().filter(|r| r.complete == Some(true)).count();
    println!(
        "Processed {} pages, {} document(s) to the end",
        events.len(),
        finished_documents
    );
    println!("Wrote {} rows to {}", rows.len(), exporter.path().display());
    if policy == FieldPolicy::Strict {
        println!("Complete invoice numbers: {}/{}", complete, rows.len());
    }
    if cancel.is_cancelled() {
        println!("Run was interrupted; results are partial");
    }
    Ok(())
}

fn run_preview(config: &AppConfig, args: PreviewArgs) -> Result<()> {
    let roi = load_roi(args.roi.as_deref(), config)?;
    let source = pipeline::open_document(&args.input)
        .with_context(|| format!("Failed to open {:?}", args.input))?;

    let out_dir = args.out_dir.unwrap_or_else(|| {
        let stem = args
            .input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        args.input
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("roi_preview_{stem}"))
    });

    let written = preview::write_previews(source.as_ref(), &roi, args.max_pages, &out_dir)?;
    println!("Wrote {} overlay image(s) to {}", written.len(), out_dir.display());
    Ok(())
}

fn run_calibrate(args: CalibrateArgs) -> Result<()> {
    let source = pipeline::open_document(&args.input)
        .with_context(|| format!("Failed to open {:?}", args.input))?;
    let rects = CalibrationRects {
        invoice_no: args.invoice_no,
        invoice_date: args.date,
        total_amount: args.amount,
    };

    let roi = preview::calibrate(source.as_ref(), args.page_index, args.dpi, args.rotate, &rects)?;
    config::save_roi_config(&roi, &args.out)?;
    println!("ROI configuration written to {}", args.out.display());
    Ok(())
}

fn run_models(config: &AppConfig) -> Result<()> {
    let manager = ModelManager::from_settings(&config.models)?;
    manager.ensure_all_models()?;

    println!("Models in {}", manager.models_dir().display());
    for (model_type, available, size) in manager.get_model_status() {
        println!(
            "  {:<22} {:<9} {}",
            model_type.display_name(),
            if available { "ready" } else { "missing" },
            size.map(|s| format!("{s} bytes")).unwrap_or_default()
        );
    }
    Ok(())
}

fn run_init_config(out: Option<PathBuf>) -> Result<()> {
    let path = match out {
        Some(path) => path,
        None => storage::get_config_dir()?.join("config.toml"),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    config::save_config(&AppConfig::default(), &path)?;
    println!("Default settings written to {}", path.display());
    Ok(())
}
