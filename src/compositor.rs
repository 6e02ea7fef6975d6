// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Runtime compositing: one bilinear remap per frame pair, driven by a [`StitchingMap`].

use crate::StitcherError;
use crate::frame;
use crate::stitching_map::StitchingMap;
use opencv::core::{Mat, Size};
use opencv::{core, imgproc, prelude::*};

/// Replays a calibration on new frame pairs.
///
/// The remap table and the side by side canvas are allocated once and reused for every
/// call to [`Compositor::compose()`].
pub struct Compositor {
    map: StitchingMap,
    table: Mat,
    canvas: Mat,
}

impl Compositor {
    pub fn new(map: StitchingMap) -> Result<Self, StitcherError> {
        map.validate()?;
        let table = map.to_mat()?;
        Ok(Self {
            map,
            table,
            canvas: Mat::default(),
        })
    }

    /// Loads and validates a map file, see [`StitchingMap::load()`]
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, StitcherError> {
        Self::new(StitchingMap::load(path)?)
    }

    pub fn map(&self) -> &StitchingMap {
        &self.map
    }

    /// Size every input frame must have
    pub fn frame_size(&self) -> Size {
        self.map.frame_size()
    }

    pub fn output_size(&self) -> Size {
        self.map.output_size()
    }

    /// Composites one frame pair. Frames of another size than the calibrated ones are
    /// refused with [`StitcherError::MapFormatError`].
    pub fn compose(&mut self, left: &Mat, right: &Mat) -> Result<Mat, StitcherError> {
        let expected = self.frame_size();
        for (side, f) in [("left", left), ("right", right)] {
            let size = f.size()?;
            if size != expected {
                return Err(StitcherError::MapFormatError(format!(
                    "the map was built for {}x{} frames, the {side} frame is {}x{}",
                    expected.width, expected.height, size.width, size.height
                )));
            }
        }
        frame::concat_frames_into(left, right, &mut self.canvas)?;

        let mut out = Mat::default();
        imgproc::remap(
            &self.canvas,
            &mut out,
            &self.table,
            &core::no_array(),
            imgproc::INTER_LINEAR,
            core::BORDER_CONSTANT,
            core::Scalar::all(0.0),
        )?;
        Ok(out)
    }
}
