// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Synthetic two camera rig looking at a textured cylinder around it.

#![allow(dead_code)]

use libstitcher::opencv::core::{self, Mat, Vec3b};
use libstitcher::opencv::prelude::*;
use nalgebra::{Rotation3, Vector3};
use rand::{Rng, SeedableRng, rngs::StdRng};

pub const WIDTH: i32 = 640;
pub const HEIGHT: i32 = 360;
pub const FOCAL: f64 = 500.0;
/// Each camera is turned this far away from the rig axis
pub const YAW_DEG: f64 = 15.0;

/// Texture cell sizes (radians on the cylinder) and their weights
const OCTAVES: [(f64, f64); 3] = [(0.09, 0.45), (0.035, 0.35), (0.014, 0.2)];

pub struct Scene {
    palette: Vec<[f64; 3]>,
}

impl Scene {
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let palette = (0..4096)
            .map(|_| {
                [
                    rng.random::<u8>() as f64,
                    rng.random::<u8>() as f64,
                    rng.random::<u8>() as f64,
                ]
            })
            .collect();
        Self { palette }
    }

    /// Blocky multi scale colour at angle `theta` and height `h` on the cylinder
    fn texel(&self, theta: f64, h: f64) -> Vec3b {
        let mut acc = [0.0; 3];
        for (octave, (cell, weight)) in OCTAVES.iter().enumerate() {
            let ix = (theta / cell).floor() as i64;
            let iy = (h / cell).floor() as i64;
            let hash = (ix.wrapping_mul(73_856_093)
                ^ iy.wrapping_mul(19_349_663)
                ^ (octave as i64).wrapping_mul(83_492_791))
            .rem_euclid(self.palette.len() as i64) as usize;
            for (a, c) in acc.iter_mut().zip(self.palette[hash]) {
                *a += c * weight;
            }
        }
        core::VecN(acc.map(|v| v.round().clamp(0.0, 255.0) as u8))
    }

    /// Pinhole view of the scene from a camera turned `yaw_deg` around the vertical axis
    pub fn render(&self, yaw_deg: f64) -> Mat {
        let rotation = Rotation3::from_euler_angles(0.0, yaw_deg.to_radians(), 0.0);
        let mut img =
            Mat::new_rows_cols_with_default(HEIGHT, WIDTH, core::CV_8UC3, core::Scalar::all(0.0))
                .unwrap();
        let (cx, cy) = (WIDTH as f64 * 0.5, HEIGHT as f64 * 0.5);
        for (i, px) in img.data_typed_mut::<Vec3b>().unwrap().iter_mut().enumerate() {
            let x = (i % WIDTH as usize) as f64;
            let y = (i / WIDTH as usize) as f64;
            let ray = rotation * Vector3::new((x - cx) / FOCAL, (y - cy) / FOCAL, 1.0);
            let theta = ray.x.atan2(ray.z);
            let h = ray.y / ray.x.hypot(ray.z);
            *px = self.texel(theta, h);
        }
        img
    }
}

/// Left and right views of the same scene
pub fn view_pair(seed: u64) -> (Mat, Mat) {
    let scene = Scene::new(seed);
    (scene.render(-YAW_DEG), scene.render(YAW_DEG))
}

/// Mean absolute difference per channel of two equally sized `CV_8UC3` images
pub fn mean_abs_diff(a: &Mat, b: &Mat) -> [f64; 3] {
    let mut diff = Mat::default();
    core::absdiff(a, b, &mut diff).unwrap();
    let m = core::mean(&diff, &core::no_array()).unwrap();
    [m[0], m[1], m[2]]
}

/// Path in the temp directory, unique for this process and `name`
pub fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("libstitcher-{}-{name}", std::process::id()))
}
