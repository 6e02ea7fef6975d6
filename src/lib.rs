// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! This library builds a wide-angle panorama out of two overlapping camera views,
//! based on OpenCV <https://crates.io/crates/opencv>, nalgebra and Rayon <https://crates.io/crates/rayon>.
//!
//! It works in two modes:
//! * **calibration** ([`calibrate()`]): feature matching, camera estimation, bundle
//!   adjustment, cylindrical warping, seam finding and blending. Besides the panorama it
//!   can emit a [`StitchingMap`], a per-pixel remap table covering the output crop.
//! * **compositing** ([`Compositor`]): replays a [`StitchingMap`] on new frame pairs with a
//!   single bilinear remap, no geometry is recomputed.
//!
//! ```rust,no_run
//! # use libstitcher::prelude::*;
//! # fn f() -> Result<(), StitcherError> {
//! let left = libstitcher::utils::imread("left.png", opencv::imgcodecs::IMREAD_COLOR)?;
//! let right = libstitcher::utils::imread("right.png", opencv::imgcodecs::IMREAD_COLOR)?;
//! let calibration = calibrate(&left, &right, &StitchConfig::default())?;
//! if let Some(map) = calibration.stitching_map {
//!     map.save("result.mat")?;
//!     let mut compositor = Compositor::new(map)?;
//!     let _pano = compositor.compose(&left, &right)?;
//! }
//! # Ok(())}
//! ```

pub mod adjuster;
pub mod blender;
pub mod camera;
pub mod compositor;
pub mod config;
pub mod crop;
pub mod features;
pub mod frame;
pub mod pipeline;
pub mod seam;
pub mod stitching_map;
pub mod utils;
pub mod warper;

pub use compositor::Compositor;
pub use config::StitchConfig;
pub use opencv;
pub use pipeline::{Calibration, Timing, calibrate};
pub use stitching_map::StitchingMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StitcherError {
    #[error(transparent)]
    OpenCvError(#[from] opencv::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Invalid path encoding {0}")]
    InvalidPathEncoding(PathBuf),
    #[error("Invalid parameter(s) {0}")]
    InvalidParams(String),
    #[error("Invalid input {0}")]
    InputError(String),
    #[error("Matching failed: {0}")]
    MatchError(String),
    #[error("Registration failed: {0}")]
    RegistrationError(String),
    #[error("Cropping failed: {0}")]
    CropError(String),
    #[error("Invalid stitching map: {0}")]
    MapFormatError(String),
    #[error("Internal error {0}")]
    ProcessingError(String),
}

pub mod prelude {
    pub use super::{
        Calibration, Compositor, StitchConfig, StitcherError, StitchingMap, Timing, calibrate,
        config::{BlendKind, CropStrategy, RefineMask, SeamFinderKind},
        crop::CropRect,
        frame::{FrameFormat, FrameGeometry},
    };
}
