// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Raw camera frame loading.

use crate::StitcherError;
use crate::utils;
use opencv::core::{AlgorithmHint, Mat, MatTraitConst, MatTraitManual};
use opencv::{core, imgproc};
use std::path::Path;

/// Pixel layout of a raw frame file.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum FrameFormat {
    /// 4 bytes per pixel, R G B A.
    #[default]
    Rgba,
    /// Planar Y, U, V with 2x2 subsampled chroma.
    I420,
}

impl FrameFormat {
    /// Number of bytes of a `width` x `height` frame
    /// ```
    /// # use libstitcher::prelude::*;
    /// assert_eq!(FrameFormat::Rgba.frame_len(4, 2), 32);
    /// assert_eq!(FrameFormat::I420.frame_len(4, 2), 12);
    /// ```
    pub fn frame_len(self, width: i32, height: i32) -> usize {
        let pixels = width.max(0) as usize * height.max(0) as usize;
        match self {
            FrameFormat::Rgba => pixels * 4,
            FrameFormat::I420 => pixels * 3 / 2,
        }
    }
}

/// Declared size of the raw frames, and the optional working size they are scaled to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: i32,
    pub height: i32,
    pub scaled: Option<(i32, i32)>,
}

impl FrameGeometry {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            scaled: None,
        }
    }

    /// The size the loaded frames end up with. Scaling only applies when it shrinks both
    /// dimensions.
    /// ```
    /// # use libstitcher::prelude::*;
    /// let g = FrameGeometry { width: 2880, height: 1620, scaled: Some((1440, 810)) };
    /// assert_eq!(g.output_size(), (1440, 810));
    /// let g = FrameGeometry { width: 2880, height: 1620, scaled: Some((2880, 810)) };
    /// assert_eq!(g.output_size(), (2880, 1620));
    /// ```
    pub fn output_size(&self) -> (i32, i32) {
        match self.scaled {
            Some((w, h)) if w > 0 && h > 0 && w < self.width && h < self.height => (w, h),
            _ => (self.width, self.height),
        }
    }
}

/// Decodes an in-memory raw frame into a BGR Mat of the geometry's output size.
pub fn decode_raw_frame(
    bytes: &[u8],
    format: FrameFormat,
    geometry: FrameGeometry,
) -> Result<Mat, StitcherError> {
    let FrameGeometry { width, height, .. } = geometry;
    if width <= 0 || height <= 0 {
        return Err(StitcherError::InputError(format!(
            "invalid frame dimension {width}x{height}"
        )));
    }
    if format == FrameFormat::I420 && (width % 2 != 0 || height % 2 != 0) {
        return Err(StitcherError::InputError(format!(
            "I420 frames need even dimensions, got {width}x{height}"
        )));
    }
    let expected = format.frame_len(width, height);
    if bytes.len() < expected {
        return Err(StitcherError::InputError(format!(
            "frame holds {} bytes, a {width}x{height} {format:?} frame needs {expected}",
            bytes.len()
        )));
    }

    let (mut raw, code) = match format {
        FrameFormat::Rgba => (
            utils::zeros(height, width, core::CV_8UC4)?,
            imgproc::COLOR_RGBA2BGR,
        ),
        FrameFormat::I420 => (
            utils::zeros(height * 3 / 2, width, core::CV_8UC1)?,
            imgproc::COLOR_YUV2BGR_IYUV,
        ),
    };
    raw.data_bytes_mut()?.copy_from_slice(&bytes[..expected]);

    let mut converted = Mat::default();
    imgproc::cvt_color(&raw, &mut converted, code, 3, AlgorithmHint::ALGO_HINT_DEFAULT)?;
    drop(raw);

    let (out_w, out_h) = geometry.output_size();
    if (out_w, out_h) == (width, height) {
        return Ok(converted);
    }
    let mut resized = Mat::default();
    imgproc::resize(
        &converted,
        &mut resized,
        core::Size::new(out_w, out_h),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;
    Ok(resized)
}

/// Reads a raw RGBA or I420 frame file, see [`decode_raw_frame()`]
pub fn load_raw_frame<P: AsRef<Path>>(
    path: P,
    format: FrameFormat,
    geometry: FrameGeometry,
) -> Result<Mat, StitcherError> {
    let bytes = std::fs::read(path.as_ref()).map_err(|e| {
        StitcherError::InputError(format!("can't open frame {:?}: {e}", path.as_ref()))
    })?;
    let frame = decode_raw_frame(&bytes, format, geometry)?;
    tracing::info!(
        "{format:?} frame {:?} loaded as {}x{}",
        path.as_ref(),
        frame.cols(),
        frame.rows()
    );
    Ok(frame)
}

/// Places two equally sized frames side by side
pub fn concat_frames(left: &Mat, right: &Mat) -> Result<Mat, StitcherError> {
    let mut canvas = Mat::default();
    concat_frames_into(left, right, &mut canvas)?;
    Ok(canvas)
}

/// Like [`concat_frames()`] but reuses the allocation of `canvas`
pub fn concat_frames_into(left: &Mat, right: &Mat, canvas: &mut Mat) -> Result<(), StitcherError> {
    check_same_frames(left, right)?;
    core::hconcat2(left, right, canvas)?;
    Ok(())
}

pub(crate) fn check_same_frames(left: &Mat, right: &Mat) -> Result<(), StitcherError> {
    if left.empty() || right.empty() {
        return Err(StitcherError::InputError("empty frame".to_string()));
    }
    if left.size()? != right.size()? || left.typ() != right.typ() {
        return Err(StitcherError::InputError(format!(
            "frame mismatch: {}x{} type {} vs {}x{} type {}",
            left.cols(),
            left.rows(),
            left.typ(),
            right.cols(),
            right.rows(),
            right.typ()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::MatExt;

    #[test]
    fn rgba_frame_is_converted_to_bgr() {
        // one red, one green, one blue, one white pixel
        let bytes = [
            255, 0, 0, 255, 0, 255, 0, 255, 0, 0, 255, 255, 255, 255, 255, 255,
        ];
        let frame = decode_raw_frame(&bytes, FrameFormat::Rgba, FrameGeometry::new(2, 2)).unwrap();
        assert_eq!(frame.typ(), core::CV_8UC3);
        let px = frame.pixels::<core::Vec3b>().unwrap();
        assert_eq!(px[0].0, [0, 0, 255]);
        assert_eq!(px[1].0, [0, 255, 0]);
        assert_eq!(px[2].0, [255, 0, 0]);
        assert_eq!(px[3].0, [255, 255, 255]);
    }

    #[test]
    fn short_frames_are_rejected() {
        let bytes = vec![0u8; 10];
        assert!(matches!(
            decode_raw_frame(&bytes, FrameFormat::Rgba, FrameGeometry::new(2, 2)),
            Err(StitcherError::InputError(_))
        ));
        assert!(matches!(
            decode_raw_frame(&bytes, FrameFormat::I420, FrameGeometry::new(0, 2)),
            Err(StitcherError::InputError(_))
        ));
    }

    #[test]
    fn i420_grey_frame() {
        let (w, h) = (8, 4);
        let mut bytes = vec![128u8; FrameFormat::I420.frame_len(w, h)];
        bytes[..(w * h) as usize].fill(200);
        let geometry = FrameGeometry {
            width: w,
            height: h,
            scaled: Some((4, 2)),
        };
        let frame = decode_raw_frame(&bytes, FrameFormat::I420, geometry).unwrap();
        assert_eq!((frame.cols(), frame.rows()), (4, 2));
        for px in frame.pixels::<core::Vec3b>().unwrap() {
            for c in px.0 {
                assert!((c as i32 - 200).abs() <= 2, "{c}");
            }
        }
    }

    #[test]
    fn concat_requires_matching_frames() {
        let a = utils::zeros(4, 6, core::CV_8UC3).unwrap();
        let b = utils::zeros(4, 6, core::CV_8UC3).unwrap();
        let c = utils::zeros(5, 6, core::CV_8UC3).unwrap();
        let canvas = concat_frames(&a, &b).unwrap();
        assert_eq!((canvas.cols(), canvas.rows()), (12, 4));
        assert!(matches!(
            concat_frames(&a, &c),
            Err(StitcherError::InputError(_))
        ));
    }
}
