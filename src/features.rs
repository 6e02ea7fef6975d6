// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Key-point detection and pairwise matching.

use crate::StitcherError;
use crate::utils;
use nalgebra::Matrix3;
use opencv::core::{DMatch, KeyPoint, Mat, Point2f, Vector};
use opencv::{calib3d, core, features2d, prelude::*};
use ordered_float::OrderedFloat;
use std::collections::HashSet;

/// Fewer correspondences (or inliers) than this can't support a homography.
pub const MIN_MATCHES: usize = 6;
/// Maximum number of ORB key-points kept per image.
pub const MAX_FEATURES: i32 = 1500;
/// RANSAC reprojection threshold in working-resolution pixels.
pub const RANSAC_REPROJ_THRESHOLD: f64 = 3.0;

/// Key-points and their descriptors, row `i` of `descriptors` belongs to `keypoints[i]`.
#[derive(Debug)]
pub struct FeatureSet {
    pub keypoints: Vector<KeyPoint>,
    pub descriptors: Mat,
    pub image_size: core::Size,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Key-point location relative to the image centre
    fn centred(&self, idx: i32) -> Result<Point2f, StitcherError> {
        let pt = self.keypoints.get(idx as usize)?.pt();
        Ok(Point2f::new(
            pt.x - self.image_size.width as f32 * 0.5,
            pt.y - self.image_size.height as f32 * 0.5,
        ))
    }
}

/// Correspondences between image 0 (`query_idx`) and image 1 (`train_idx`).
#[derive(Debug, Clone)]
pub struct MatchSet {
    pub matches: Vec<DMatch>,
    /// RANSAC verdict per entry of `matches`
    pub inlier_mask: Vec<bool>,
    pub num_inliers: usize,
    /// Maps image-centred points of image 0 onto image-centred points of image 1.
    pub homography: Matrix3<f64>,
    /// `num_inliers / (8 + 0.3 * matches)`
    pub confidence: f64,
}

impl MatchSet {
    pub fn inliers(&self) -> impl Iterator<Item = &DMatch> {
        self.matches
            .iter()
            .zip(self.inlier_mask.iter())
            .filter_map(|(m, &inlier)| inlier.then_some(m))
    }
}

/// Pair confidence as a function of inlier and match counts
/// ```
/// # use libstitcher::features::pair_confidence;
/// assert!((pair_confidence(40, 60) - 40.0 / 26.0).abs() < 1e-12);
/// assert_eq!(pair_confidence(0, 100), 0.0);
/// ```
pub fn pair_confidence(num_inliers: usize, num_matches: usize) -> f64 {
    num_inliers as f64 / (8.0 + 0.3 * num_matches as f64)
}

/// Homography of two views of the same scene from the same direction
fn is_identity(h: &Matrix3<f64>) -> bool {
    let h = h / h[(2, 2)];
    let linear = (h.fixed_view::<2, 2>(0, 0) - nalgebra::Matrix2::identity()).amax();
    let shift = h[(0, 2)].abs().max(h[(1, 2)].abs());
    linear < 1e-3 && shift < 0.5 && h[(2, 0)].abs().max(h[(2, 1)].abs()) < 1e-6
}

/// Detects ORB key-points and descriptors on a BGR or grey image.
pub fn find_features(img: &Mat) -> Result<FeatureSet, StitcherError> {
    if img.empty() {
        return Err(StitcherError::InputError(
            "can't detect features on an empty image".to_string(),
        ));
    }
    let grey = utils::to_grey(img)?;
    let (keypoints, descriptors) = utils::orb_detect_and_compute(&grey, MAX_FEATURES)?;
    Ok(FeatureSet {
        keypoints,
        descriptors,
        image_size: img.size()?,
    })
}

/// Best-of-two-nearest matching with Hamming distance. A candidate survives when
/// `best < (1 - match_confidence) * second_best`.
fn best_of_two_nearest(
    query: &Mat,
    train: &Mat,
    match_confidence: f32,
) -> Result<Vec<DMatch>, StitcherError> {
    let mut matcher = features2d::BFMatcher::create(core::NORM_HAMMING, false)?; // false for knn_match
    matcher.add(train)?;
    let mut knn_matches = Vector::<Vector<DMatch>>::new();
    matcher.knn_match(query, &mut knn_matches, 2, &Mat::default(), false)?;

    let ratio = 1.0 - match_confidence;
    let mut rv = Vec::with_capacity(knn_matches.len());
    for m in knn_matches.iter() {
        if m.len() != 2 {
            continue;
        }
        let (m0, m1) = (m.get(0)?, m.get(1)?);
        if m0.distance < ratio * m1.distance {
            rv.push(m0);
        }
    }
    Ok(rv)
}

/// Matches two feature sets in both directions and verifies the result with a RANSAC
/// homography. Every failure to find a usable correspondence is a
/// [`StitcherError::MatchError`].
pub fn match_pair(
    f0: &FeatureSet,
    f1: &FeatureSet,
    match_confidence: f32,
) -> Result<MatchSet, StitcherError> {
    if f0.len() < MIN_MATCHES || f1.len() < MIN_MATCHES {
        return Err(StitcherError::MatchError(format!(
            "too few key-points: {} and {}",
            f0.len(),
            f1.len()
        )));
    }

    let mut matches = best_of_two_nearest(&f0.descriptors, &f1.descriptors, match_confidence)?;
    let mut seen: HashSet<(i32, i32)> =
        matches.iter().map(|m| (m.query_idx, m.train_idx)).collect();
    for m in best_of_two_nearest(&f1.descriptors, &f0.descriptors, match_confidence)? {
        // reverse direction, query is image 1
        if seen.insert((m.train_idx, m.query_idx)) {
            matches.push(DMatch {
                query_idx: m.train_idx,
                train_idx: m.query_idx,
                ..m
            });
        }
    }
    matches.sort_by_key(|m| OrderedFloat(m.distance));
    tracing::info!("{} matches passed the ratio test", matches.len());
    if matches.len() < MIN_MATCHES {
        return Err(StitcherError::MatchError(format!(
            "only {} confident correspondences, at least {MIN_MATCHES} needed",
            matches.len()
        )));
    }

    let src: Vec<Point2f> = matches
        .iter()
        .map(|m| f0.centred(m.query_idx))
        .collect::<Result<_, _>>()?;
    let dst: Vec<Point2f> = matches
        .iter()
        .map(|m| f1.centred(m.train_idx))
        .collect::<Result<_, _>>()?;

    let mut ransac_mask = Mat::default();
    let h = calib3d::find_homography(
        &utils::points_mat(&src)?,
        &utils::points_mat(&dst)?,
        &mut ransac_mask,
        calib3d::RANSAC,
        RANSAC_REPROJ_THRESHOLD,
    )?;
    if h.empty() || ransac_mask.empty() {
        return Err(StitcherError::MatchError(
            "no homography between the images".to_string(),
        ));
    }
    let inlier_mask: Vec<bool> = ransac_mask
        .data_typed::<u8>()?
        .iter()
        .map(|&v| v != 0)
        .collect();
    let num_inliers = inlier_mask.iter().filter(|&&v| v).count();
    if num_inliers < MIN_MATCHES {
        return Err(StitcherError::MatchError(format!(
            "only {num_inliers} of {} matches are homography inliers",
            matches.len()
        )));
    }

    // least squares re-fit on the inliers only
    let (src_in, dst_in): (Vec<Point2f>, Vec<Point2f>) = src
        .iter()
        .zip(dst.iter())
        .zip(inlier_mask.iter())
        .filter_map(|((s, d), &inlier)| inlier.then_some((*s, *d)))
        .unzip();
    let refined = calib3d::find_homography(
        &utils::points_mat(&src_in)?,
        &utils::points_mat(&dst_in)?,
        &mut Mat::default(),
        0,
        RANSAC_REPROJ_THRESHOLD,
    )?;
    let h = if refined.empty() { h } else { refined };
    let homography = utils::mat_to_matrix3(&h)?;
    if !homography.iter().all(|v| v.is_finite()) || homography.determinant().abs() < 1e-6 {
        return Err(StitcherError::MatchError(
            "degenerate homography between the images".to_string(),
        ));
    }
    if is_identity(&homography) {
        return Err(StitcherError::MatchError(
            "both views show the scene from the same direction".to_string(),
        ));
    }

    let confidence = pair_confidence(num_inliers, matches.len());
    tracing::info!(
        "{num_inliers} inliers of {} matches, pair confidence {confidence:.3}",
        matches.len()
    );
    Ok(MatchSet {
        matches,
        inlier_mask,
        num_inliers,
        homography,
        confidence,
    })
}
