// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

use libstitcher::opencv::imgcodecs;
use libstitcher::prelude::*;
use libstitcher::utils;
use rayon::prelude::*;
use std::path;

/// Returns paths to all jpg, jpeg, tif and png files in a single directory (non-recursive), sorted
pub fn collect_image_files(path: &path::Path) -> Result<Vec<path::PathBuf>, StitcherError> {
    let mut files: Vec<_> = std::fs::read_dir(path)?
        .flatten()
        .map(|f| f.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_uppercase())
                .is_some_and(|e| matches!(e.as_str(), "JPG" | "JPEG" | "TIF" | "PNG"))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Stitches the first two images found in the directory given as argument
/// (default "demos/images"), writes the panorama and the stitching map, then replays the
/// map on the same pair and reports how long each mode took.
fn main() -> Result<(), StitcherError> {
    let dir = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "demos/images".to_string());
    let files = collect_image_files(path::Path::new(&dir))?;
    if files.len() < 2 {
        return Err(StitcherError::InputError(format!(
            "need two images in {dir:?}, found {}",
            files.len()
        )));
    }
    println!("left: {:?} right: {:?}", files[0], files[1]);

    let now = std::time::Instant::now();
    let mut frames = files[..2]
        .par_iter()
        .map(|f| utils::imread(f, imgcodecs::IMREAD_COLOR))
        .collect::<Result<Vec<_>, StitcherError>>()?;
    println!("Loaded frames in {:?}", now.elapsed());
    let right = frames.pop().ok_or_else(|| StitcherError::InputError("no frames".into()))?;
    let left = frames.pop().ok_or_else(|| StitcherError::InputError("no frames".into()))?;

    let now = std::time::Instant::now();
    let calibration = calibrate(&left, &right, &StitchConfig::default())?;
    println!("Calibrated in {:?}", now.elapsed());
    println!("{:#?}", calibration.timing);
    println!(
        "crop: {:?}, bundle adjustment rms {:.3} -> {:.3}",
        calibration.crop,
        calibration.adjust_report.initial_rms,
        calibration.adjust_report.final_rms
    );
    utils::imwrite("calibration.jpg", &calibration.panorama)?;

    let Some(map) = calibration.stitching_map else {
        return Ok(());
    };
    map.save("result.mat")?;

    let mut compositor = Compositor::from_file("result.mat")?;
    let now = std::time::Instant::now();
    let mut pano = libstitcher::opencv::core::Mat::default();
    for _ in 0..10 {
        pano = compositor.compose(&left, &right)?;
    }
    println!("Composited 10 frame pairs in {:?}", now.elapsed());
    utils::imwrite("composited.jpg", &pano)
}
