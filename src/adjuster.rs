// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Bundle adjustment of the two-camera rig.
//!
//! Minimizes the symmetric reprojection error of the inlier correspondences:
//!
//! ```text
//! E = Σ ||p1 - π(H01·p0)||² + ||p0 - π(H10·p1)||²,   Hij = Kj·Rjᵀ·Ri·Ki⁻¹
//! ```
//!
//! with a Levenberg–Marquardt loop solving
//!
//! ```text
//! (JᵀJ + λ·diag(JᵀJ))·δ = -Jᵀr
//! ```
//!
//! The rotation of camera 0 is the fixed reference. The intrinsics of both cameras
//! follow the [`RefineMask`], the rotation of camera 1 (as a rotation vector) is always
//! refined. The Jacobian is evaluated numerically.

use crate::StitcherError;
use crate::camera::{CameraParams, orthonormalize};
use crate::config::{RefineMask, StitchConfig};
use crate::features::{FeatureSet, MatchSet};
use nalgebra::{DMatrix, DVector, Matrix3, Rotation3, Vector2, Vector3};
use opencv::prelude::*;

/// A correspondence in working-resolution pixels: (image 0, image 1).
pub type Observation = (Vector2<f64>, Vector2<f64>);

#[derive(Debug, Clone, Copy)]
pub struct AdjusterOptions {
    /// Pairs less confident than this are not adjusted.
    pub confidence_threshold: f64,
    pub refine_mask: RefineMask,
    pub max_iterations: usize,
    /// Convergence threshold on the relative change of the squared error.
    pub function_tolerance: f64,
    /// Convergence threshold on the relative parameter change.
    pub param_tolerance: f64,
    /// Convergence threshold on the gradient norm.
    pub gradient_tolerance: f64,
}

impl Default for AdjusterOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            refine_mask: RefineMask::default(),
            max_iterations: 100,
            function_tolerance: 1e-6,
            param_tolerance: 1e-8,
            gradient_tolerance: 1e-10,
        }
    }
}

impl From<&StitchConfig> for AdjusterOptions {
    fn from(config: &StitchConfig) -> Self {
        Self {
            confidence_threshold: config.adjuster_confidence,
            refine_mask: config.refine_mask,
            max_iterations: config.max_adjuster_iterations,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdjustReport {
    pub iterations: usize,
    /// RMS reprojection error (pixels) before and after refinement
    pub initial_rms: f64,
    pub final_rms: f64,
}

/// Collects the RANSAC inliers of `matches` as pixel correspondences.
pub fn inlier_observations(
    f0: &FeatureSet,
    f1: &FeatureSet,
    matches: &MatchSet,
) -> Result<Vec<Observation>, StitcherError> {
    matches
        .inliers()
        .map(|m| {
            let p0 = f0.keypoints.get(m.query_idx as usize)?.pt();
            let p1 = f1.keypoints.get(m.train_idx as usize)?.pt();
            Ok((
                Vector2::new(p0.x as f64, p0.y as f64),
                Vector2::new(p1.x as f64, p1.y as f64),
            ))
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
enum Param {
    Focal(usize),
    Ppx(usize),
    Ppy(usize),
    Aspect(usize),
    Rotation(usize),
}

struct Problem<'a> {
    base: [CameraParams; 2],
    layout: Vec<Param>,
    observations: &'a [Observation],
}

impl<'a> Problem<'a> {
    fn new(base: &[CameraParams; 2], observations: &'a [Observation], mask: RefineMask) -> Self {
        let mut layout = Vec::with_capacity(11);
        for cam in 0..2 {
            if mask.focal {
                layout.push(Param::Focal(cam));
            }
            if mask.ppx {
                layout.push(Param::Ppx(cam));
            }
            if mask.ppy {
                layout.push(Param::Ppy(cam));
            }
            if mask.aspect {
                layout.push(Param::Aspect(cam));
            }
        }
        layout.extend((0..3).map(Param::Rotation));
        Self {
            base: *base,
            layout,
            observations,
        }
    }

    fn params(&self) -> DVector<f64> {
        let rvec = Rotation3::from_matrix_unchecked(
            self.base[0].rotation.transpose() * self.base[1].rotation,
        )
        .scaled_axis();
        DVector::from_iterator(
            self.layout.len(),
            self.layout.iter().map(|p| match *p {
                Param::Focal(c) => self.base[c].focal,
                Param::Ppx(c) => self.base[c].ppx,
                Param::Ppy(c) => self.base[c].ppy,
                Param::Aspect(c) => self.base[c].aspect,
                Param::Rotation(axis) => rvec[axis],
            }),
        )
    }

    fn cameras(&self, x: &DVector<f64>) -> [CameraParams; 2] {
        let mut cameras = self.base;
        let mut rvec = Vector3::zeros();
        for (p, &v) in self.layout.iter().zip(x.iter()) {
            match *p {
                Param::Focal(c) => cameras[c].focal = v,
                Param::Ppx(c) => cameras[c].ppx = v,
                Param::Ppy(c) => cameras[c].ppy = v,
                Param::Aspect(c) => cameras[c].aspect = v,
                Param::Rotation(axis) => rvec[axis] = v,
            }
        }
        cameras[1].rotation = self.base[0].rotation * Rotation3::new(rvec).into_inner();
        cameras
    }

    fn residuals(&self, x: &DVector<f64>) -> DVector<f64> {
        let [c0, c1] = self.cameras(x);
        let mut r = DVector::zeros(self.observations.len() * 4);
        let (Some(k0_inv), Some(k1_inv)) = (c0.k().try_inverse(), c1.k().try_inverse()) else {
            r.fill(f64::INFINITY);
            return r;
        };
        let rel = c1.rotation.transpose() * c0.rotation;
        let h01 = c1.k() * rel * k0_inv;
        let h10 = c0.k() * rel.transpose() * k1_inv;
        for (i, (p0, p1)) in self.observations.iter().enumerate() {
            let e01 = project(&h01, p0) - p1;
            let e10 = project(&h10, p1) - p0;
            r[i * 4] = e01.x;
            r[i * 4 + 1] = e01.y;
            r[i * 4 + 2] = e10.x;
            r[i * 4 + 3] = e10.y;
        }
        r
    }

    /// Central differences
    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        let mut j = DMatrix::zeros(self.observations.len() * 4, x.len());
        let mut probe = x.clone();
        for col in 0..x.len() {
            let step = 1e-6 * x[col].abs().max(1.0);
            probe[col] = x[col] + step;
            let plus = self.residuals(&probe);
            probe[col] = x[col] - step;
            let minus = self.residuals(&probe);
            probe[col] = x[col];
            j.set_column(col, &((plus - minus) / (2.0 * step)));
        }
        j
    }
}

fn project(h: &Matrix3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
    let q = h * Vector3::new(p.x, p.y, 1.0);
    Vector2::new(q.x / q.z, q.y / q.z)
}

/// Reprojection error (pixels) under which the cameras explain the observations exactly
const EXACT_FIT_RMS: f64 = 1e-8;

fn rms(residuals: &DVector<f64>) -> f64 {
    let n = (residuals.len() / 2).max(1);
    (residuals.norm_squared() / n as f64).sqrt()
}

/// Refines `cameras` against the pixel correspondences in `observations`.
///
/// Fails with [`StitcherError::RegistrationError`] when the pair is not confident enough,
/// when there are too few observations, when no tolerance of `options` is reached within
/// `max_iterations`, or when the refinement ends in an invalid camera.
pub fn bundle_adjust(
    cameras: &[CameraParams; 2],
    observations: &[Observation],
    pair_confidence: f64,
    options: &AdjusterOptions,
) -> Result<([CameraParams; 2], AdjustReport), StitcherError> {
    if pair_confidence < options.confidence_threshold {
        return Err(StitcherError::RegistrationError(format!(
            "pair confidence {pair_confidence:.3} is below the threshold {}",
            options.confidence_threshold
        )));
    }
    let problem = Problem::new(cameras, observations, options.refine_mask);
    // every observation contributes four residuals
    if observations.len() * 4 < problem.layout.len() {
        return Err(StitcherError::RegistrationError(format!(
            "{} correspondences can't constrain {} parameters",
            observations.len(),
            problem.layout.len()
        )));
    }

    let mut current = problem.params();
    let mut residuals = problem.residuals(&current);
    let initial_rms = rms(&residuals);
    if !initial_rms.is_finite() {
        return Err(StitcherError::RegistrationError(
            "initial cameras give a non-finite reprojection error".to_string(),
        ));
    }

    let mut lambda = 1e-3; // Initial damping
    let lambda_up = 10.0;
    let lambda_down = 0.1;
    let min_lambda = 1e-10;
    let max_lambda = 1e10;
    let mut iterations = 0;
    let mut converged = false;

    for iter in 0..options.max_iterations {
        iterations = iter + 1;
        if rms(&residuals) < EXACT_FIT_RMS {
            converged = true;
            break;
        }
        let jacobian = problem.jacobian(&current);
        let gradient = jacobian.transpose() * &residuals;
        if gradient.norm() < options.gradient_tolerance {
            converged = true;
            break;
        }
        let jtj = jacobian.transpose() * &jacobian;

        let mut damped = jtj.clone();
        for i in 0..damped.nrows() {
            damped[(i, i)] += lambda * jtj[(i, i)].max(1e-6);
        }
        let Some(delta) = damped.lu().solve(&(-&gradient)) else {
            return Err(StitcherError::RegistrationError(format!(
                "singular normal equations at iteration {iterations}"
            )));
        };
        if delta.norm() < options.param_tolerance * (current.norm() + options.param_tolerance) {
            converged = true;
            break;
        }

        let trial = &current + &delta;
        let trial_residuals = problem.residuals(&trial);
        let error = residuals.norm_squared();
        let trial_error = trial_residuals.norm_squared();
        let improved = trial_error.is_finite() && trial_error < error;
        let settled = trial_error.is_finite()
            && (error - trial_error).abs() <= options.function_tolerance * error;
        if improved {
            current = trial;
            residuals = trial_residuals;
            lambda = (lambda * lambda_down).max(min_lambda);
        } else {
            lambda = (lambda * lambda_up).min(max_lambda);
        }
        tracing::debug!(
            "iteration {iterations}: rms {:.4}, lambda {lambda:e}",
            rms(&residuals)
        );
        if settled {
            converged = true;
            break;
        }
        if lambda >= max_lambda {
            return Err(StitcherError::RegistrationError(format!(
                "no downhill step at iteration {iterations}, rms {:.4} px",
                rms(&residuals)
            )));
        }
    }
    if !converged {
        return Err(StitcherError::RegistrationError(format!(
            "no convergence in {} iterations, rms {initial_rms:.3} -> {:.3} px",
            options.max_iterations,
            rms(&residuals)
        )));
    }

    let mut refined = problem.cameras(&current);
    for cam in refined.iter_mut() {
        cam.rotation = orthonormalize(&cam.rotation);
    }
    let final_rms = rms(&residuals);
    if !final_rms.is_finite() || !refined.iter().all(CameraParams::is_valid) {
        return Err(StitcherError::RegistrationError(format!(
            "bundle adjustment diverged: {refined:?}"
        )));
    }
    tracing::info!(
        "bundle adjustment: {iterations} iterations, rms {initial_rms:.3} -> {final_rms:.3} px, focal {:.2} / {:.2}",
        refined[0].focal,
        refined[1].focal
    );
    Ok((
        refined,
        AdjustReport {
            iterations,
            initial_rms,
            final_rms,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn truth() -> [CameraParams; 2] {
        let base = CameraParams {
            focal: 500.0,
            aspect: 1.0,
            ppx: 320.0,
            ppy: 180.0,
            rotation: Matrix3::identity(),
        };
        [
            base,
            CameraParams {
                rotation: Rotation3::from_euler_angles(0.01, 0.45, 0.0).into_inner(),
                ..base
            },
        ]
    }

    /// Correspondences seen by both cameras on a grid of world directions
    fn observations(cameras: &[CameraParams; 2]) -> Vec<Observation> {
        let mut rv = Vec::new();
        for i in 0..12 {
            for j in 0..8 {
                let yaw = 0.05 + 0.03 * i as f64;
                let pitch = -0.25 + 0.06 * j as f64;
                let dir = Vector3::new(yaw.sin(), pitch.tan(), yaw.cos());
                let pix: Vec<Vector2<f64>> = cameras
                    .iter()
                    .map(|c| {
                        let q = c.k() * c.rotation.transpose() * dir;
                        Vector2::new(q.x / q.z, q.y / q.z)
                    })
                    .collect();
                rv.push((pix[0], pix[1]));
            }
        }
        rv
    }

    #[test]
    fn recovers_perturbed_cameras() {
        let truth = truth();
        let obs = observations(&truth);
        let mut start = truth;
        start[0].focal = 470.0;
        start[1].focal = 470.0;
        start[1].rotation = Rotation3::from_euler_angles(0.0, 0.42, 0.01).into_inner();
        let options = AdjusterOptions {
            refine_mask: RefineMask {
                focal: true,
                ppx: false,
                ppy: false,
                aspect: false,
            },
            ..Default::default()
        };
        let (refined, report) = bundle_adjust(&start, &obs, 1.5, &options).unwrap();
        assert!(report.final_rms < 1e-3, "{report:?}");
        assert!(report.final_rms < report.initial_rms);
        assert_abs_diff_eq!(refined[0].focal, 500.0, epsilon = 0.1);
        assert_abs_diff_eq!(refined[1].rotation, truth[1].rotation, epsilon = 1e-4);
        assert_abs_diff_eq!(refined[0].rotation, Matrix3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn full_refinement_reduces_error() {
        let truth = truth();
        let obs = observations(&truth);
        let mut start = truth;
        start[1].focal = 520.0;
        start[0].ppx = 310.0;
        let (_, report) = bundle_adjust(&start, &obs, 1.5, &AdjusterOptions::default()).unwrap();
        assert!(report.final_rms < 0.1, "{report:?}");
    }

    #[test]
    fn unfinished_refinement_is_rejected() {
        let truth = truth();
        let obs = observations(&truth);
        let mut start = truth;
        start[1].focal = 470.0;
        start[1].rotation = Rotation3::from_euler_angles(0.0, 0.42, 0.01).into_inner();
        let options = AdjusterOptions {
            max_iterations: 1,
            ..Default::default()
        };
        assert!(matches!(
            bundle_adjust(&start, &obs, 1.5, &options),
            Err(StitcherError::RegistrationError(_))
        ));
        // the same start converges when given room
        assert!(bundle_adjust(&start, &obs, 1.5, &AdjusterOptions::default()).is_ok());
    }

    #[test]
    fn exact_cameras_converge_at_once() {
        let truth = truth();
        let obs = observations(&truth);
        let options = AdjusterOptions {
            max_iterations: 1,
            ..Default::default()
        };
        let (refined, report) = bundle_adjust(&truth, &obs, 1.5, &options).unwrap();
        assert_eq!(report.iterations, 1);
        assert_abs_diff_eq!(refined[1].rotation, truth[1].rotation, epsilon = 1e-9);
    }

    #[test]
    fn low_confidence_is_rejected() {
        let truth = truth();
        let obs = observations(&truth);
        assert!(matches!(
            bundle_adjust(&truth, &obs, 0.3, &AdjusterOptions::default()),
            Err(StitcherError::RegistrationError(_))
        ));
        assert!(matches!(
            bundle_adjust(&truth, &obs[..1], 1.5, &AdjusterOptions::default()),
            Err(StitcherError::RegistrationError(_))
        ));
    }
}
