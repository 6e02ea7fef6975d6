// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Camera model and the estimation state machine of the two-camera rig.
//!
//! A [`CameraRig`] can only move forward: it is created as [`Estimated`] from a pairwise
//! homography, refined into [`Adjusted`] by bundle adjustment and finally levelled into
//! [`WaveCorrected`]. The rotation of a camera maps its local rays `K⁻¹·p` into the
//! common frame, camera 0 starts out as the identity.

use crate::StitcherError;
use crate::adjuster::{self, AdjustReport, AdjusterOptions, Observation};
use nalgebra::{Matrix3, Rotation3, SymmetricEigen, Vector3};
use opencv::core;
use std::marker::PhantomData;

/// Intrinsics and orientation of one camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraParams {
    pub focal: f64,
    /// `fy / fx`
    pub aspect: f64,
    pub ppx: f64,
    pub ppy: f64,
    pub rotation: Matrix3<f64>,
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            focal: 1.0,
            aspect: 1.0,
            ppx: 0.0,
            ppy: 0.0,
            rotation: Matrix3::identity(),
        }
    }
}

impl CameraParams {
    /// The intrinsics matrix
    /// ```
    /// # use libstitcher::camera::CameraParams;
    /// let cam = CameraParams { focal: 500.0, aspect: 1.0, ppx: 320.0, ppy: 180.0, ..Default::default() };
    /// let k = cam.k();
    /// assert_eq!(k[(0, 0)], 500.0);
    /// assert_eq!(k[(1, 2)], 180.0);
    /// ```
    pub fn k(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.focal,
            0.0,
            self.ppx,
            0.0,
            self.focal * self.aspect,
            self.ppy,
            0.0,
            0.0,
            1.0,
        )
    }

    /// The same camera seen at a different image resolution
    pub fn scaled(&self, scale: f64) -> Self {
        Self {
            focal: self.focal * scale,
            ppx: self.ppx * scale,
            ppy: self.ppy * scale,
            ..*self
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.focal.is_finite()
            && self.focal > 0.0
            && self.aspect.is_finite()
            && self.aspect > 0.0
            && self.ppx.is_finite()
            && self.ppy.is_finite()
            && self.rotation.iter().all(|v| v.is_finite())
    }
}

/// Initial guess derived from the pairwise homography
#[derive(Debug, Clone, Copy)]
pub struct Estimated;
/// Refined by bundle adjustment
#[derive(Debug, Clone, Copy)]
pub struct Adjusted;
/// Horizon levelled, terminal state
#[derive(Debug, Clone, Copy)]
pub struct WaveCorrected;

/// The two cameras in one of the estimation states.
#[derive(Debug, Clone)]
pub struct CameraRig<S> {
    cameras: [CameraParams; 2],
    _state: PhantomData<S>,
}

impl<S> CameraRig<S> {
    fn with_cameras(cameras: [CameraParams; 2]) -> Self {
        Self {
            cameras,
            _state: PhantomData,
        }
    }

    pub fn cameras(&self) -> &[CameraParams; 2] {
        &self.cameras
    }

    pub fn into_cameras(self) -> [CameraParams; 2] {
        self.cameras
    }

    /// Median focal length of the rig, used as the warping scale.
    pub fn median_focal(&self) -> f64 {
        (self.cameras[0].focal + self.cameras[1].focal) * 0.5
    }
}

impl CameraRig<Estimated> {
    /// Derives both cameras from `homography`, which maps image-centred points of
    /// image 0 onto image-centred points of image 1.
    pub fn estimate(
        image_sizes: [core::Size; 2],
        homography: &Matrix3<f64>,
    ) -> Result<Self, StitcherError> {
        let h_inv = homography.try_inverse().ok_or_else(|| {
            StitcherError::RegistrationError("the pairwise homography is singular".to_string())
        })?;

        let mut candidates = Vec::with_capacity(2);
        for h in [homography, &h_inv] {
            if let (Some(f0), Some(f1)) = focals_from_homography(h) {
                candidates.push((f0 * f1).sqrt());
            }
        }
        let focal = if candidates.is_empty() {
            let sum: i32 = image_sizes.iter().map(|s| s.width + s.height).sum();
            let fallback = sum as f64 / image_sizes.len() as f64;
            tracing::warn!("can't estimate focal length from the homography, using {fallback}");
            fallback
        } else {
            candidates.iter().sum::<f64>() / candidates.len() as f64
        };

        // principal points are at the origin of the centred coordinates
        let k = Matrix3::new(focal, 0.0, 0.0, 0.0, focal, 0.0, 0.0, 0.0, 1.0);
        let k_inv = k.try_inverse().ok_or_else(|| {
            StitcherError::RegistrationError(format!("degenerate focal length {focal}"))
        })?;
        let r1 = orthonormalize(&(k_inv * h_inv * k));

        let cameras = [0_usize, 1].map(|i| CameraParams {
            focal,
            aspect: 1.0,
            ppx: image_sizes[i].width as f64 * 0.5,
            ppy: image_sizes[i].height as f64 * 0.5,
            rotation: if i == 0 { Matrix3::identity() } else { r1 },
        });
        if !cameras.iter().all(CameraParams::is_valid) {
            return Err(StitcherError::RegistrationError(format!(
                "camera estimation produced invalid parameters {cameras:?}"
            )));
        }
        tracing::info!(
            "estimated focal {focal:.2}, yaw between cameras {:.2} deg",
            Rotation3::from_matrix_unchecked(r1).angle().to_degrees()
        );
        Ok(Self::with_cameras(cameras))
    }

    /// Bundle adjustment, see [`adjuster::bundle_adjust()`]
    pub fn adjust(
        self,
        observations: &[Observation],
        pair_confidence: f64,
        options: &AdjusterOptions,
    ) -> Result<(CameraRig<Adjusted>, AdjustReport), StitcherError> {
        let (cameras, report) =
            adjuster::bundle_adjust(&self.cameras, observations, pair_confidence, options)?;
        Ok((CameraRig::with_cameras(cameras), report))
    }
}

impl CameraRig<Adjusted> {
    /// Levels the horizon, see [`wave_correct()`]
    pub fn wave_correct(self) -> CameraRig<WaveCorrected> {
        let mut rotations = self.cameras.map(|c| c.rotation);
        wave_correct(&mut rotations);
        let mut cameras = self.cameras;
        for (cam, r) in cameras.iter_mut().zip(rotations) {
            cam.rotation = r;
        }
        CameraRig::with_cameras(cameras)
    }
}

/// Focal length candidates of the two images related by the homography `h`.
///
/// Both squared-focal formulas are evaluated for each image and the one with the
/// better conditioned denominator wins. Candidates that are not finite and positive are
/// skipped, so a pure yaw (where one denominator vanishes) still yields a value.
pub fn focals_from_homography(h: &Matrix3<f64>) -> (Option<f64>, Option<f64>) {
    let h = [
        h[(0, 0)],
        h[(0, 1)],
        h[(0, 2)],
        h[(1, 0)],
        h[(1, 1)],
        h[(1, 2)],
        h[(2, 0)],
        h[(2, 1)],
        h[(2, 2)],
    ];
    let pick = |(n1, d1): (f64, f64), (n2, d2): (f64, f64)| {
        [(n1 / d1, d1), (n2 / d2, d2)]
            .into_iter()
            .filter(|(v, _)| v.is_finite() && *v > 0.0)
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .map(|(v, _)| v.sqrt())
    };

    let f1 = pick(
        (-(h[0] * h[1] + h[3] * h[4]), h[6] * h[7]),
        (
            h[0] * h[0] + h[3] * h[3] - h[1] * h[1] - h[4] * h[4],
            (h[7] - h[6]) * (h[7] + h[6]),
        ),
    );
    let f0 = pick(
        (-h[2] * h[5], h[0] * h[3] + h[1] * h[4]),
        (
            h[5] * h[5] - h[2] * h[2],
            h[0] * h[0] + h[1] * h[1] - h[3] * h[3] - h[4] * h[4],
        ),
    );
    (f0, f1)
}

/// Nearest rotation matrix in the Frobenius sense
pub fn orthonormalize(m: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = m.svd(true, true);
    match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => {
            let r = u * v_t;
            if r.determinant() < 0.0 { -r } else { r }
        }
        _ => *m,
    }
}

/// Horizontal wave correction.
///
/// Finds the common up direction of the cameras (the direction their x axes are most
/// perpendicular to) and rotates every camera so it becomes the y axis. Applying it to
/// already corrected rotations leaves them unchanged.
pub fn wave_correct(rotations: &mut [Matrix3<f64>]) {
    if rotations.len() < 2 {
        return;
    }
    let moment = rotations.iter().fold(Matrix3::<f64>::zeros(), |acc, r| {
        let x = r.column(0);
        acc + x * x.transpose()
    });
    let eigen = SymmetricEigen::new(moment);
    let mut rg1: Vector3<f64> = eigen.eigenvectors.column(eigen.eigenvalues.imin()).into_owned();

    let img_k: Vector3<f64> = rotations.iter().map(|r| r.column(2).into_owned()).sum();
    let mut rg0 = rg1.cross(&img_k);
    let norm = rg0.norm();
    if norm <= f64::MIN_POSITIVE {
        tracing::warn!("wave correction skipped, degenerate camera directions");
        return;
    }
    rg0 /= norm;
    let rg2 = rg0.cross(&rg1);

    let conf: f64 = rotations.iter().map(|r| rg0.dot(&r.column(0))).sum();
    if conf < 0.0 {
        rg0 = -rg0;
        rg1 = -rg1;
    }
    let correction = Matrix3::from_rows(&[rg0.transpose(), rg1.transpose(), rg2.transpose()]);
    for r in rotations.iter_mut() {
        *r = orthonormalize(&(correction * *r));
    }
}
