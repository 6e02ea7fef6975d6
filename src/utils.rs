// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

use super::StitcherError;
use nalgebra::Matrix3;
use opencv::core::{AlgorithmHint, Mat, MatTraitConst, MatTraitConstManual, MatTraitManual};
use opencv::features2d::ORB;
use opencv::prelude::Feature2DTrait;
use opencv::{core, features2d, imgcodecs, imgproc};

/// Extension trait for more ergonomic Mat conversions
pub trait MatExt {
    /// Convert matrix to specified type with scaling
    ///
    /// # Arguments
    /// * `rtype` - OpenCV type constant (e.g., CV_32F, CV_64F)
    fn convert(&self, rtype: i32, alpha: f64, beta: f64) -> Result<Mat, StitcherError>;

    /// Pixel view of a continuous Mat, row major.
    fn pixels<T: core::DataType>(&self) -> Result<&[T], StitcherError>;
}

impl MatExt for Mat {
    fn convert(&self, rtype: i32, alpha: f64, beta: f64) -> Result<Mat, StitcherError> {
        let mut dst = Mat::default();
        self.convert_to(&mut dst, rtype, alpha, beta)?;
        Ok(dst)
    }

    fn pixels<T: core::DataType>(&self) -> Result<&[T], StitcherError> {
        if !self.is_continuous() {
            return Err(StitcherError::ProcessingError(
                "expected a continuous Mat".to_string(),
            ));
        }
        Ok(self.data_typed::<T>()?)
    }
}

/// Safe wrapper around OpenCV's `imread` with proper error handling
///
/// OpenCV's API requires a `&str` path rather than standard Rust `Path` types, and
/// paths might contain non-Unicode characters. Those are reported as
/// `StitcherError::InvalidPathEncoding`, decoding failures (missing file, unsupported
/// format) as `StitcherError::InputError`.
///
/// # Example
/// ```no_run
/// # use libstitcher::{utils::imread, prelude::*, opencv::prelude::*, opencv::imgcodecs };
/// # use std::path::Path;
/// # fn a() -> Result<(),StitcherError> {
/// let img = imread("image.jpg", imgcodecs::IMREAD_COLOR)?;
/// match imread(Path::new("image.png"), imgcodecs::IMREAD_COLOR) {
///     Ok(mat) => /* process image */(),
///     Err(_) => /* handle error */(),
/// }
/// # Ok(()) }
/// ```
#[inline(always)]
pub fn imread<P: AsRef<std::path::Path>>(path: P, flags: i32) -> Result<Mat, StitcherError> {
    let path_str = path
        .as_ref()
        .to_str()
        .ok_or_else(|| StitcherError::InvalidPathEncoding(path.as_ref().to_path_buf()))?;
    let img = imgcodecs::imread(path_str, flags)?;
    if img.empty() {
        return Err(StitcherError::InputError(format!(
            "could not decode image {path_str}"
        )));
    }
    Ok(img)
}

/// Counterpart of [`imread`], writes any 8-bit image OpenCV can encode.
pub fn imwrite<P: AsRef<std::path::Path>>(path: P, img: &Mat) -> Result<(), StitcherError> {
    let path_str = path
        .as_ref()
        .to_str()
        .ok_or_else(|| StitcherError::InvalidPathEncoding(path.as_ref().to_path_buf()))?;
    if !imgcodecs::imwrite(path_str, img, &core::Vector::new())? {
        return Err(StitcherError::ProcessingError(format!(
            "OpenCV refused to write {path_str}"
        )));
    }
    Ok(())
}

/// Converts a BGR image to grey scale, a grey image is returned as a copy.
pub fn to_grey(img: &Mat) -> Result<Mat, StitcherError> {
    if img.channels() == 1 {
        return Ok(img.try_clone()?);
    }
    let mut img_grey = Mat::default();
    imgproc::cvt_color(
        img,
        &mut img_grey,
        imgproc::COLOR_BGR2GRAY,
        0,
        AlgorithmHint::ALGO_HINT_DEFAULT,
    )?;
    Ok(img_grey)
}

/// Does a (key-points, descriptors) tuple of a grey scale Mat, keeping at most
/// `max_features` key-points
pub(crate) fn orb_detect_and_compute(
    img: &Mat,
    max_features: i32,
) -> Result<(core::Vector<core::KeyPoint>, Mat), StitcherError> {
    let mut orb = ORB::create(
        max_features,
        1.2,
        8,
        31,
        0,
        2,
        features2d::ORB_ScoreType::HARRIS_SCORE,
        31,
        20,
    )?;

    let mut kp = core::Vector::<core::KeyPoint>::new();
    let mut des = Mat::default();
    orb.detect_and_compute(img, &Mat::default(), &mut kp, &mut des, false)?;
    Ok((kp, des))
}

/// Scale factor bringing an image of `area` pixels down to roughly `megapix` megapixels.
/// Never upscales; a non-positive budget means native resolution.
/// ```
/// # use libstitcher::utils::scale_for_megapix;
/// assert_eq!(scale_for_megapix(-1.0, 2880 * 1620), 1.0);
/// assert_eq!(scale_for_megapix(10.0, 2880 * 1620), 1.0);
/// let s = scale_for_megapix(0.6, 2880 * 1620);
/// assert!((s * s * 2880.0 * 1620.0 - 0.6e6).abs() < 1.0);
/// ```
pub fn scale_for_megapix(megapix: f64, area: i32) -> f64 {
    if megapix <= 0.0 || area <= 0 {
        return 1.0;
    }
    (megapix * 1e6 / area as f64).sqrt().min(1.0)
}

/// Resizes an image by a uniform scale factor, a unit scale returns a copy.
pub(crate) fn scale_image(img: &Mat, scale: f64) -> Result<Mat, StitcherError> {
    if (scale - 1.0).abs() < f64::EPSILON {
        return Ok(img.try_clone()?);
    }
    let mut resized = Mat::default();
    imgproc::resize(
        img,
        &mut resized,
        core::Size::default(),
        scale,
        scale,
        imgproc::INTER_LINEAR,
    )?;
    Ok(resized)
}

/// Allocates a zero-filled Mat
pub(crate) fn zeros(rows: i32, cols: i32, typ: i32) -> Result<Mat, StitcherError> {
    Ok(Mat::new_rows_cols_with_default(
        rows,
        cols,
        typ,
        core::Scalar::all(0.0),
    )?)
}

/// Copies the `rect` part of a continuous Mat into a new (continuous) Mat of the same type.
/// `rect` must lie inside the source.
pub(crate) fn crop_typed<T: core::DataType + Copy>(
    src: &Mat,
    rect: core::Rect,
) -> Result<Mat, StitcherError> {
    let size = src.size()?;
    if rect.x < 0
        || rect.y < 0
        || rect.width <= 0
        || rect.height <= 0
        || rect.x + rect.width > size.width
        || rect.y + rect.height > size.height
    {
        return Err(StitcherError::ProcessingError(format!(
            "crop {rect:?} is outside of the {}x{} source",
            size.width, size.height
        )));
    }
    let mut dst = zeros(rect.height, rect.width, src.typ())?;
    let src_px = src.pixels::<T>()?;
    let src_w = size.width as usize;
    let (x, w) = (rect.x as usize, rect.width as usize);
    for (row, dst_row) in dst
        .data_typed_mut::<T>()?
        .chunks_exact_mut(w)
        .enumerate()
    {
        let start = (rect.y as usize + row) * src_w + x;
        dst_row.copy_from_slice(&src_px[start..start + w]);
    }
    Ok(dst)
}

/// Intersection of two rectangles, `None` when they don't overlap
/// ```
/// # use libstitcher::{utils::intersect, opencv::core::Rect};
/// let r = intersect(Rect::new(0, 0, 10, 10), Rect::new(5, 2, 10, 3));
/// assert_eq!(r, Some(Rect::new(5, 2, 5, 3)));
/// assert_eq!(intersect(Rect::new(0, 0, 10, 10), Rect::new(10, 0, 5, 5)), None);
/// ```
pub fn intersect(a: core::Rect, b: core::Rect) -> Option<core::Rect> {
    let x0 = a.x.max(b.x);
    let y0 = a.y.max(b.y);
    let x1 = (a.x + a.width).min(b.x + b.width);
    let y1 = (a.y + a.height).min(b.y + b.height);
    (x1 > x0 && y1 > y0).then(|| core::Rect::new(x0, y0, x1 - x0, y1 - y0))
}

/// Smallest rectangle containing both
pub fn union(a: core::Rect, b: core::Rect) -> core::Rect {
    let x0 = a.x.min(b.x);
    let y0 = a.y.min(b.y);
    let x1 = (a.x + a.width).max(b.x + b.width);
    let y1 = (a.y + a.height).max(b.y + b.height);
    core::Rect::new(x0, y0, x1 - x0, y1 - y0)
}

/// Builds a (N, 1) `CV_32FC2` Mat from a list of points
pub(crate) fn points_mat(pts: &[core::Point2f]) -> Result<Mat, StitcherError> {
    Ok(Mat::from_exact_iter(pts.iter().copied())?)
}

/// Reads a 3x3 `CV_64F` Mat into a nalgebra matrix
pub(crate) fn mat_to_matrix3(m: &Mat) -> Result<Matrix3<f64>, StitcherError> {
    if m.rows() != 3 || m.cols() != 3 || m.typ() != core::CV_64F {
        return Err(StitcherError::ProcessingError(format!(
            "expected a 3x3 CV_64F matrix, got {}x{} type {}",
            m.rows(),
            m.cols(),
            m.typ()
        )));
    }
    let mut rv = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            rv[(r, c)] = *m.at_2d::<f64>(r as i32, c as i32)?;
        }
    }
    Ok(rv)
}
