// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! The calibration driver.
//!
//! Runs on three resolutions, each bounded by a megapixel budget of [`StitchConfig`]:
//! * work: feature detection, matching and camera registration,
//! * seam: warping and seam estimation,
//! * compose: the final warp and blend.
//!
//! Camera parameters are estimated at work resolution and rescaled for the other two.

use crate::StitcherError;
use crate::adjuster::{self, AdjustReport, AdjusterOptions};
use crate::blender::{Blender, MultiBandBlender, OverwriteBlender};
use crate::camera::{CameraParams, CameraRig, Estimated, WaveCorrected};
use crate::config::{BlendKind, SeamFinderKind, StitchConfig};
use crate::crop::{self, CropRect};
use crate::features;
use crate::frame;
use crate::seam;
use crate::stitching_map::StitchingMap;
use crate::utils;
use crate::warper::{CylindricalWarper, WarpMaps};
use opencv::core::{Mat, Point, Size, Vec2f, Vec3b};
use opencv::{core, prelude::*};
use rayon::prelude::*;
use std::time::{Duration, Instant};

/// Wall clock time spent in each calibration stage
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Timing {
    pub find_features: Duration,
    pub registration: Duration,
    pub find_seams: Duration,
    pub compose: Duration,
    pub generate_map: Duration,
    pub total: Duration,
}

impl Timing {
    fn log(&self) {
        tracing::info!(
            "timing: features {:?}, registration {:?}, seams {:?}, compose {:?}, map {:?}, total {:?}",
            self.find_features,
            self.registration,
            self.find_seams,
            self.compose,
            self.generate_map,
            self.total
        );
    }
}

/// Resolution scale factors of one calibration run, relative to the input frames
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scales {
    pub work: f64,
    pub seam: f64,
    pub compose: f64,
}

impl Scales {
    pub fn new(config: &StitchConfig, frame_size: Size) -> Self {
        let area = frame_size.area();
        Self {
            work: utils::scale_for_megapix(config.work_megapix, area),
            seam: utils::scale_for_megapix(config.seam_megapix, area),
            compose: utils::scale_for_megapix(config.compose_megapix, area),
        }
    }
}

/// Everything a calibration run produces
pub struct Calibration {
    /// Final camera parameters at work resolution
    pub cameras: [CameraParams; 2],
    pub scales: Scales,
    pub adjust_report: AdjustReport,
    /// The output rectangle in panorama coordinates
    pub crop: CropRect,
    /// The cropped panorama
    pub panorama: Mat,
    /// The whole blended panorama and its `CV_8U` coverage mask
    pub full_panorama: Mat,
    pub coverage_mask: Mat,
    /// Present when [`StitchConfig::generate_map`] is set
    pub stitching_map: Option<StitchingMap>,
    pub timing: Timing,
}

/// Synthetic `CV_32FC2` image whose pixel (x, y) holds (x + `offset_x`, y).
/// ```
/// # use libstitcher::{pipeline::coordinate_grid, opencv::core::{Size, Vec2f}};
/// # use libstitcher::opencv::prelude::*;
/// let grid = coordinate_grid(Size::new(4, 3), 100).unwrap();
/// assert_eq!(grid.at_2d::<Vec2f>(2, 1).unwrap().0, [101.0, 2.0]);
/// ```
pub fn coordinate_grid(size: Size, offset_x: i32) -> Result<Mat, StitcherError> {
    let mut grid = utils::zeros(size.height, size.width, core::CV_32FC2)?;
    let w = size.width as usize;
    grid.data_typed_mut::<Vec2f>()?
        .par_chunks_exact_mut(w)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.iter_mut().enumerate() {
                *px = core::VecN([(x as i32 + offset_x) as f32, y as f32]);
            }
        });
    Ok(grid)
}

/// Feature detection and registration at work resolution
fn register(
    sources: [&Mat; 2],
    scales: &Scales,
    config: &StitchConfig,
    timing: &mut Timing,
) -> Result<(CameraRig<WaveCorrected>, AdjustReport), StitcherError> {
    let t = Instant::now();
    let mut feature_sets = Vec::with_capacity(2);
    for (i, src) in sources.iter().enumerate() {
        let img = utils::scale_image(src, scales.work)?;
        let f = features::find_features(&img)?;
        tracing::info!("image #{i}: {} features at {}x{}", f.len(), img.cols(), img.rows());
        feature_sets.push(f);
    }
    timing.find_features = t.elapsed();

    let t = Instant::now();
    let matches =
        features::match_pair(&feature_sets[0], &feature_sets[1], config.match_confidence)?;
    // a pair below the confidence gate does not belong to the same panorama
    if matches.confidence < config.adjuster_confidence {
        return Err(StitcherError::MatchError(format!(
            "pair confidence {:.3} is below {}: {} inliers of {} matches",
            matches.confidence,
            config.adjuster_confidence,
            matches.num_inliers,
            matches.matches.len()
        )));
    }
    let rig = CameraRig::<Estimated>::estimate(
        [feature_sets[0].image_size, feature_sets[1].image_size],
        &matches.homography,
    )?;
    let observations =
        adjuster::inlier_observations(&feature_sets[0], &feature_sets[1], &matches)?;
    let (rig, report) = rig.adjust(
        &observations,
        matches.confidence,
        &AdjusterOptions::from(config),
    )?;
    let rig = rig.wave_correct();
    for (i, cam) in rig.cameras().iter().enumerate() {
        tracing::info!(
            "camera #{i}: focal {:.2} aspect {:.4} principal point ({:.1}, {:.1})",
            cam.focal,
            cam.aspect,
            cam.ppx,
            cam.ppy
        );
    }
    timing.registration = t.elapsed();
    Ok((rig, report))
}

/// Warps both sources at seam resolution and splits their overlap.
/// Returns the seam masks in warped seam-resolution coordinates.
fn find_seams(
    sources: [&Mat; 2],
    cameras: &[CameraParams; 2],
    warped_image_scale: f64,
    scales: &Scales,
    kind: SeamFinderKind,
) -> Result<[Mat; 2], StitcherError> {
    let ratio = scales.seam / scales.work;
    let warper = CylindricalWarper::new(warped_image_scale * ratio);
    let mut images = [Mat::default(), Mat::default()];
    let mut masks = [Mat::default(), Mat::default()];
    let mut corners = [Point::default(); 2];
    for i in 0..2 {
        let img = utils::scale_image(sources[i], scales.seam)?;
        let maps = warper.build_maps(img.size()?, &cameras[i].scaled(ratio))?;
        images[i] = maps.warp_image(&img)?;
        masks[i] = maps.warp_full_mask(img.size()?)?;
        corners[i] = maps.corner();
    }
    kind.finder().find(&images, &corners, &mut masks)?;
    Ok(masks)
}

/// Warp geometry and final masks at compose resolution, shared by pixel and coordinate
/// compositing so both outputs are registered to each other.
struct ComposeGeometry {
    size: Size,
    maps: [WarpMaps; 2],
    masks: [Mat; 2],
}

impl ComposeGeometry {
    fn new(
        frame_size: Size,
        cameras: &[CameraParams; 2],
        warped_image_scale: f64,
        scales: &Scales,
        seam_masks: [Mat; 2],
    ) -> Result<Self, StitcherError> {
        let ratio = scales.compose / scales.work;
        let warper = CylindricalWarper::new(warped_image_scale * ratio);
        let size = Size::new(
            (frame_size.width as f64 * scales.compose).round() as i32,
            (frame_size.height as f64 * scales.compose).round() as i32,
        );
        let maps = [
            warper.build_maps(size, &cameras[0].scaled(ratio))?,
            warper.build_maps(size, &cameras[1].scaled(ratio))?,
        ];
        let mut masks = [Mat::default(), Mat::default()];
        for (i, seam_mask) in seam_masks.into_iter().enumerate() {
            let warped_mask = maps[i].warp_full_mask(size)?;
            masks[i] = seam::upscale_seam_mask(&seam_mask, &warped_mask)?;
        }
        Ok(Self { size, maps, masks })
    }

    fn corners(&self) -> [Point; 2] {
        [self.maps[0].corner(), self.maps[1].corner()]
    }

    fn sizes(&self) -> [Size; 2] {
        [self.maps[0].size(), self.maps[1].size()]
    }

    /// Warps `images` (already at compose resolution) and feeds them to `blender`
    fn compose(
        &self,
        blender: &mut dyn Blender,
        images: [&Mat; 2],
    ) -> Result<(Mat, Mat), StitcherError> {
        blender.prepare(&self.corners(), &self.sizes())?;
        for i in 0..2 {
            let warped = self.maps[i].warp_image(images[i])?;
            blender.feed(&warped, &self.masks[i], self.maps[i].corner())?;
        }
        blender.blend()
    }
}

/// Runs the whole calibration on a pair of equally sized BGR frames, `left` being the
/// reference view.
///
/// Fails with [`StitcherError::MatchError`] when the frames don't share enough content,
/// [`StitcherError::RegistrationError`] when the camera refinement fails and
/// [`StitcherError::CropError`] when the panorama can't hold the requested output.
pub fn calibrate(
    left: &Mat,
    right: &Mat,
    config: &StitchConfig,
) -> Result<Calibration, StitcherError> {
    let start = Instant::now();
    config.validate()?;
    frame::check_same_frames(left, right)?;
    if left.typ() != core::CV_8UC3 {
        return Err(StitcherError::InputError(format!(
            "expected CV_8UC3 BGR frames, got type {}",
            left.typ()
        )));
    }
    let frame_size = left.size()?;
    let scales = Scales::new(config, frame_size);
    tracing::info!(
        "calibrating {}x{} frames, scales: work {:.3} seam {:.3} compose {:.3}",
        frame_size.width,
        frame_size.height,
        scales.work,
        scales.seam,
        scales.compose
    );
    let sources = [left, right];
    let mut timing = Timing::default();

    let (rig, adjust_report) = register(sources, &scales, config, &mut timing)?;
    let warped_image_scale = rig.median_focal();
    let cameras = rig.into_cameras();

    let t = Instant::now();
    let seam_masks = find_seams(
        sources,
        &cameras,
        warped_image_scale,
        &scales,
        config.seam_finder,
    )?;
    timing.find_seams = t.elapsed();

    let t = Instant::now();
    let geometry = ComposeGeometry::new(
        frame_size,
        &cameras,
        warped_image_scale,
        &scales,
        seam_masks,
    )?;
    let (full_panorama, coverage_mask) = {
        let images = [
            utils::scale_image(left, scales.compose)?,
            utils::scale_image(right, scales.compose)?,
        ];
        let mut blender: Box<dyn Blender> = match config.blend {
            BlendKind::Overwrite => Box::new(OverwriteBlender::for_images()),
            BlendKind::MultiBand(bands) => Box::new(MultiBandBlender::new(bands)),
        };
        geometry.compose(blender.as_mut(), [&images[0], &images[1]])?
    };
    tracing::info!(
        "panorama {}x{} from {}x{} inputs",
        full_panorama.cols(),
        full_panorama.rows(),
        geometry.size.width,
        geometry.size.height
    );
    timing.compose = t.elapsed();

    let crop = crop::select(&coverage_mask, config)?;
    let panorama = utils::crop_typed::<Vec3b>(&full_panorama, crop.into())?;
    tracing::info!("output crop {crop:?}");

    let stitching_map = if config.generate_map {
        let t = Instant::now();
        let grids = [
            utils::scale_image(&coordinate_grid(frame_size, 0)?, scales.compose)?,
            utils::scale_image(
                &coordinate_grid(frame_size, frame_size.width)?,
                scales.compose,
            )?,
        ];
        let mut blender = OverwriteBlender::for_coordinates();
        let (coordinates, _) = geometry.compose(&mut blender, [&grids[0], &grids[1]])?;
        drop(grids);
        let map = StitchingMap::from_coordinate_map(frame_size, &coordinates, crop)?;
        timing.generate_map = t.elapsed();
        Some(map)
    } else {
        None
    };
    drop(geometry);

    timing.total = start.elapsed();
    timing.log();
    Ok(Calibration {
        cameras,
        scales,
        adjust_report,
        crop,
        panorama,
        full_panorama,
        coverage_mask,
        stitching_map,
        timing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_follow_the_budgets() {
        let config = StitchConfig::default();
        let s = Scales::new(&config, Size::new(2880, 1620));
        approx::assert_abs_diff_eq!(s.work * s.work * 2880.0 * 1620.0, 0.6e6, epsilon = 1.0);
        approx::assert_abs_diff_eq!(s.seam * s.seam * 2880.0 * 1620.0, 0.1e6, epsilon = 1.0);
        assert_eq!(s.compose, 1.0);
        // small frames are never upscaled
        let s = Scales::new(&config, Size::new(320, 180));
        assert_eq!(s.work, 1.0);
    }

    #[test]
    fn grid_rows_hold_their_coordinates() {
        let grid = coordinate_grid(Size::new(7, 5), 7).unwrap();
        assert_eq!(grid.typ(), core::CV_32FC2);
        let px = grid.data_typed::<Vec2f>().unwrap();
        assert_eq!(px[0].0, [7.0, 0.0]);
        assert_eq!(px[7 * 5 - 1].0, [13.0, 4.0]);
    }

    #[test]
    fn mismatched_frames_are_rejected() {
        let a = utils::zeros(10, 20, core::CV_8UC3).unwrap();
        let b = utils::zeros(10, 21, core::CV_8UC3).unwrap();
        assert!(matches!(
            calibrate(&a, &b, &StitchConfig::default()),
            Err(StitcherError::InputError(_))
        ));
    }
}
