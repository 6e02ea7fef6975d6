// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

use clap::{Args, Parser, Subcommand};
use libstitcher::frame::{self, FrameFormat, FrameGeometry};
use libstitcher::prelude::*;
use libstitcher::utils;
use opencv::core::Mat;
use opencv::imgcodecs;
use opencv::prelude::*;
use std::path::{Path, PathBuf};

/// Tuning file picked up from the working directory when `--config` is not given
const DEFAULT_CONF: &str = "libstitcher.conf";

#[derive(Parser)]
#[command(name = "libstitcher")]
#[command(about = "Calibrate a two camera rig into a stitching map, or composite frames with one")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register two overlapping frames and write the panorama (and the stitching map).
    Calibrate(CalibrateArgs),
    /// Composite a frame pair with an existing stitching map.
    Compose(ComposeArgs),
}

#[derive(Debug, Clone, Args)]
struct FrameArgs {
    /// Left (reference) frame.
    left: PathBuf,
    /// Right frame.
    right: PathBuf,

    /// Size of the raw input frames.
    #[arg(long, value_parser = parse_dim, default_value = "2880x1620")]
    dim: (i32, i32),

    /// Scale raw frames down to this size after loading.
    #[arg(long, alias = "scaled_dim", value_parser = parse_dim)]
    scaled_dim: Option<(i32, i32)>,

    /// Raw frames are planar I420 instead of RGBA.
    #[arg(long)]
    raw: bool,
}

#[derive(Debug, Clone, Args)]
struct CalibrateArgs {
    #[command(flatten)]
    frames: FrameArgs,

    /// Also generate the stitching map.
    #[arg(long)]
    mapgen: bool,

    /// Stitching map file.
    #[arg(long, default_value = "result.mat")]
    map: PathBuf,

    /// Cropped panorama.
    #[arg(long, default_value = "result.jpg")]
    output: PathBuf,

    /// Uncropped panorama.
    #[arg(long)]
    raw_output: Option<PathBuf>,

    /// Coverage mask of the uncropped panorama.
    #[arg(long)]
    mask_output: Option<PathBuf>,

    /// Tuning file with `name value` lines.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, alias = "work_megapix")]
    work_megapix: Option<f64>,

    #[arg(long, alias = "seam_megapix")]
    seam_megapix: Option<f64>,

    #[arg(long, alias = "compose_megapix")]
    compose_megapix: Option<f64>,

    /// Minimum pair confidence for registration.
    #[arg(long, alias = "conf_thresh")]
    conf_thresh: Option<f64>,

    /// Feature match confidence.
    #[arg(long, alias = "match_conf")]
    match_conf: Option<f32>,

    /// Voronoi seams instead of graph cut.
    #[arg(long)]
    voronoi: bool,

    /// Multi band blending with this many bands.
    #[arg(long)]
    multiband: Option<u32>,
}

#[derive(Debug, Clone, Args)]
struct ComposeArgs {
    #[command(flatten)]
    frames: FrameArgs,

    /// Stitching map file.
    #[arg(long, default_value = "result.mat")]
    map: PathBuf,

    /// Output panorama.
    #[arg(long, default_value = "result.jpg")]
    output: PathBuf,
}

fn parse_dim(s: &str) -> Result<(i32, i32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
    let w = w.trim().parse::<i32>().map_err(|e| e.to_string())?;
    let h = h.trim().parse::<i32>().map_err(|e| e.to_string())?;
    if w <= 0 || h <= 0 {
        return Err(format!("dimensions must be positive, got {s:?}"));
    }
    Ok((w, h))
}

fn is_encoded_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| matches!(e.as_str(), "png" | "jpg" | "jpeg" | "tif" | "tiff"))
}

impl FrameArgs {
    fn load(&self) -> Result<(Mat, Mat), StitcherError> {
        let format = if self.raw {
            FrameFormat::I420
        } else {
            FrameFormat::Rgba
        };
        let geometry = FrameGeometry {
            width: self.dim.0,
            height: self.dim.1,
            scaled: self.scaled_dim,
        };
        let load = |path: &PathBuf| {
            if is_encoded_image(path) {
                utils::imread(path, imgcodecs::IMREAD_COLOR)
            } else {
                frame::load_raw_frame(path, format, geometry)
            }
        };
        Ok((load(&self.left)?, load(&self.right)?))
    }
}

impl CalibrateArgs {
    fn to_config(&self) -> Result<StitchConfig, StitcherError> {
        let mut config = StitchConfig::default();
        match &self.config {
            Some(path) => config.apply_conf_file(path)?,
            None if Path::new(DEFAULT_CONF).exists() => config.apply_conf_file(DEFAULT_CONF)?,
            None => (),
        }
        if let Some(v) = self.work_megapix {
            config.work_megapix = v;
        }
        if let Some(v) = self.seam_megapix {
            config.seam_megapix = v;
        }
        if let Some(v) = self.compose_megapix {
            config.compose_megapix = v;
        }
        if let Some(v) = self.conf_thresh {
            config.adjuster_confidence = v;
        }
        if let Some(v) = self.match_conf {
            config.match_confidence = v;
        }
        if self.voronoi {
            config.seam_finder = SeamFinderKind::Voronoi;
        }
        if let Some(bands) = self.multiband {
            config.blend = BlendKind::MultiBand(bands);
        }
        config.generate_map = self.mapgen;
        config.validate()?;
        Ok(config)
    }
}

fn run_calibrate(args: &CalibrateArgs) -> Result<(), StitcherError> {
    let config = args.to_config()?;
    tracing::debug!("{config:?}");
    let (left, right) = args.frames.load()?;
    let calibration = calibrate(&left, &right, &config)?;
    drop((left, right));

    utils::imwrite(&args.output, &calibration.panorama)?;
    tracing::info!(
        "{:?} written, {}x{}",
        args.output,
        calibration.panorama.cols(),
        calibration.panorama.rows()
    );
    if let Some(path) = &args.raw_output {
        utils::imwrite(path, &calibration.full_panorama)?;
    }
    if let Some(path) = &args.mask_output {
        utils::imwrite(path, &calibration.coverage_mask)?;
    }
    if let Some(map) = &calibration.stitching_map {
        map.save(&args.map)?;
    }
    Ok(())
}

fn run_compose(args: &ComposeArgs) -> Result<(), StitcherError> {
    let mut compositor = Compositor::from_file(&args.map)?;
    let (left, right) = args.frames.load()?;
    let now = std::time::Instant::now();
    let pano = compositor.compose(&left, &right)?;
    tracing::info!("composited {}x{} in {:?}", pano.cols(), pano.rows(), now.elapsed());
    utils::imwrite(&args.output, &pano)
}

fn main() -> Result<(), StitcherError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let now = std::time::Instant::now();
    match &cli.command {
        Commands::Calibrate(args) => run_calibrate(args)?,
        Commands::Compose(args) => run_compose(args)?,
    }
    tracing::info!("done in {:?}", now.elapsed());
    Ok(())
}
