// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Composition of warped, seam-masked images into one canvas.
//!
//! Every blender follows the same protocol: [`Blender::prepare()`] with the corners and
//! sizes of all inputs, one [`Blender::feed()`] per input, then [`Blender::blend()`]
//! which hands back the canvas and its coverage mask. Pixel and coordinate compositing
//! use the same protocol, so fed with the same geometry their outputs line up pixel by
//! pixel.

use crate::StitcherError;
use crate::utils::{self, MatExt};
use opencv::core::{Mat, Point, Rect, Size, Vec2f, Vec3b, Vec3f};
use opencv::{core, imgproc, prelude::*};
use rayon::prelude::*;
use std::marker::PhantomData;

pub trait Blender {
    /// Sets up the canvas to hold every rectangle `(corners[i], sizes[i])`.
    fn prepare(&mut self, corners: &[Point], sizes: &[Size]) -> Result<(), StitcherError>;

    /// Adds the pixels of `img` where `mask` is set. `img` is placed at `corner`.
    fn feed(&mut self, img: &Mat, mask: &Mat, corner: Point) -> Result<(), StitcherError>;

    /// Finishes the canvas, returns it together with its `CV_8U` coverage mask.
    fn blend(&mut self) -> Result<(Mat, Mat), StitcherError>;

    /// Top left corner and size of the canvas, in panorama coordinates.
    fn roi(&self) -> Rect;
}

/// Bounding rectangle of all the inputs
pub fn result_roi(corners: &[Point], sizes: &[Size]) -> Result<Rect, StitcherError> {
    if corners.is_empty() || corners.len() != sizes.len() {
        return Err(StitcherError::InvalidParams(format!(
            "{} corners and {} sizes",
            corners.len(),
            sizes.len()
        )));
    }
    Ok(corners
        .iter()
        .zip(sizes.iter())
        .map(|(c, s)| Rect::from_point_size(*c, *s))
        .reduce(utils::union)
        .unwrap_or_default())
}

/// Copies masked pixels, a later feed wins over an earlier one.
///
/// `T` is the pixel type of the canvas: [`Vec3b`] for images, [`Vec2f`] for coordinate
/// maps. Uncovered canvas pixels keep the background value.
pub struct OverwriteBlender<T> {
    background: core::Scalar,
    roi: Rect,
    dst: Mat,
    dst_mask: Mat,
    _pixel: PhantomData<T>,
}

impl OverwriteBlender<Vec3b> {
    /// Image blender, black background
    pub fn for_images() -> Self {
        Self::new(core::Scalar::all(0.0))
    }
}

impl OverwriteBlender<Vec2f> {
    /// Coordinate blender, uncovered pixels hold (-1, -1)
    pub fn for_coordinates() -> Self {
        Self::new(core::Scalar::new(-1.0, -1.0, 0.0, 0.0))
    }
}

impl<T: core::DataType + Copy + Send + Sync> OverwriteBlender<T> {
    pub fn new(background: core::Scalar) -> Self {
        Self {
            background,
            roi: Rect::default(),
            dst: Mat::default(),
            dst_mask: Mat::default(),
            _pixel: PhantomData,
        }
    }
}

impl<T: core::DataType + Copy + Send + Sync> Blender for OverwriteBlender<T> {
    fn prepare(&mut self, corners: &[Point], sizes: &[Size]) -> Result<(), StitcherError> {
        self.roi = result_roi(corners, sizes)?;
        self.dst = Mat::new_rows_cols_with_default(
            self.roi.height,
            self.roi.width,
            T::opencv_type(),
            self.background,
        )?;
        self.dst_mask = utils::zeros(self.roi.height, self.roi.width, core::CV_8U)?;
        Ok(())
    }

    fn feed(&mut self, img: &Mat, mask: &Mat, corner: Point) -> Result<(), StitcherError> {
        if img.typ() != T::opencv_type() || mask.typ() != core::CV_8U {
            return Err(StitcherError::InvalidParams(format!(
                "blender expects type {} images and CV_8U masks, got {} and {}",
                T::opencv_type(),
                img.typ(),
                mask.typ()
            )));
        }
        let size = img.size()?;
        let placed = Rect::from_point_size(corner, size);
        if mask.size()? != size || utils::intersect(placed, self.roi) != Some(placed) {
            return Err(StitcherError::InvalidParams(format!(
                "{placed:?} does not fit the prepared canvas {:?}",
                self.roi
            )));
        }
        let (w, stride) = (size.width as usize, self.roi.width as usize);
        let (ox, oy) = ((corner.x - self.roi.x) as usize, (corner.y - self.roi.y) as usize);
        let src = img.pixels::<T>()?;
        let src_mask = mask.pixels::<u8>()?;

        self.dst
            .data_typed_mut::<T>()?
            .par_chunks_exact_mut(stride)
            .zip(self.dst_mask.data_typed_mut::<u8>()?.par_chunks_exact_mut(stride))
            .skip(oy)
            .take(size.height as usize)
            .enumerate()
            .for_each(|(row, (dst_row, mask_row))| {
                let src_row = &src[row * w..(row + 1) * w];
                let src_mask_row = &src_mask[row * w..(row + 1) * w];
                for x in 0..w {
                    if src_mask_row[x] != 0 {
                        dst_row[ox + x] = src_row[x];
                        mask_row[ox + x] = 255;
                    }
                }
            });
        Ok(())
    }

    fn blend(&mut self) -> Result<(Mat, Mat), StitcherError> {
        Ok((
            std::mem::take(&mut self.dst),
            std::mem::take(&mut self.dst_mask),
        ))
    }

    fn roi(&self) -> Rect {
        self.roi
    }
}

/// Laplacian pyramid blending of `CV_8UC3` images.
///
/// Each input is split into frequency bands, the bands are blended with Gaussian-smoothed
/// masks, so low frequencies mix over a wide region and fine detail over a narrow one.
pub struct MultiBandBlender {
    requested_bands: u32,
    num_bands: u32,
    final_roi: Rect,
    roi: Rect,
    /// per level: accumulated weighted Laplacian (`CV_32FC3`) and weight sum (`CV_32F`)
    pyramid: Vec<(Mat, Mat)>,
}

const WEIGHT_EPS: f32 = 1e-5;

impl MultiBandBlender {
    pub fn new(num_bands: u32) -> Self {
        Self {
            requested_bands: num_bands.max(1),
            num_bands: 0,
            final_roi: Rect::default(),
            roi: Rect::default(),
            pyramid: Vec::new(),
        }
    }

    pub fn num_bands(&self) -> u32 {
        self.num_bands
    }

    fn laplace_pyramid(img: &Mat, levels: u32) -> Result<Vec<Mat>, StitcherError> {
        let mut gauss = vec![img.convert(core::CV_32F, 1.0, 0.0)?];
        for i in 0..levels as usize {
            let mut down = Mat::default();
            imgproc::pyr_down(&gauss[i], &mut down, Size::default(), core::BORDER_DEFAULT)?;
            gauss.push(down);
        }
        let mut rv = Vec::with_capacity(gauss.len());
        for i in 0..levels as usize {
            let mut up = Mat::default();
            imgproc::pyr_up(&gauss[i + 1], &mut up, gauss[i].size()?, core::BORDER_DEFAULT)?;
            let mut lap = Mat::default();
            core::subtract(&gauss[i], &up, &mut lap, &core::no_array(), -1)?;
            rv.push(lap);
        }
        if let Some(top) = gauss.pop() {
            rv.push(top);
        }
        Ok(rv)
    }
}

fn pad_to_multiple(v: i32, m: i32) -> i32 {
    v + (m - v % m) % m
}

impl Blender for MultiBandBlender {
    fn prepare(&mut self, corners: &[Point], sizes: &[Size]) -> Result<(), StitcherError> {
        let roi = result_roi(corners, sizes)?;
        self.final_roi = roi;
        let max_len = roi.width.max(roi.height).max(2) as f64;
        self.num_bands = self.requested_bands.min(max_len.log2().ceil() as u32);
        let m = 1 << self.num_bands;
        self.roi = Rect::new(
            roi.x,
            roi.y,
            pad_to_multiple(roi.width, m),
            pad_to_multiple(roi.height, m),
        );

        self.pyramid.clear();
        let (mut rows, mut cols) = (self.roi.height, self.roi.width);
        for _ in 0..=self.num_bands {
            self.pyramid.push((
                utils::zeros(rows, cols, core::CV_32FC3)?,
                utils::zeros(rows, cols, core::CV_32F)?,
            ));
            rows = (rows + 1) / 2;
            cols = (cols + 1) / 2;
        }
        tracing::debug!("multi band blender: {} bands over {:?}", self.num_bands, self.roi);
        Ok(())
    }

    fn feed(&mut self, img: &Mat, mask: &Mat, corner: Point) -> Result<(), StitcherError> {
        if img.typ() != core::CV_8UC3 || mask.typ() != core::CV_8U || img.size()? != mask.size()? {
            return Err(StitcherError::InvalidParams(
                "multi band blending needs a CV_8UC3 image with a matching CV_8U mask".to_string(),
            ));
        }
        let m = 1 << self.num_bands;
        let gap = 3 * m;
        let roi_br = (self.roi.x + self.roi.width, self.roi.y + self.roi.height);

        // source window: the image plus a border, aligned to the pyramid
        let mut tl = Point::new(
            self.roi.x.max(corner.x - gap),
            self.roi.y.max(corner.y - gap),
        );
        tl.x = self.roi.x + (((tl.x - self.roi.x) >> self.num_bands) << self.num_bands);
        tl.y = self.roi.y + (((tl.y - self.roi.y) >> self.num_bands) << self.num_bands);
        let br0 = Point::new(
            roi_br.0.min(corner.x + img.cols() + gap),
            roi_br.1.min(corner.y + img.rows() + gap),
        );
        let mut br = Point::new(
            tl.x + pad_to_multiple(br0.x - tl.x, m),
            tl.y + pad_to_multiple(br0.y - tl.y, m),
        );
        let dx = (br.x - roi_br.0).max(0);
        let dy = (br.y - roi_br.1).max(0);
        tl.x -= dx;
        br.x -= dx;
        tl.y -= dy;
        br.y -= dy;

        let top = corner.y - tl.y;
        let left = corner.x - tl.x;
        let bottom = br.y - corner.y - img.rows();
        let right = br.x - corner.x - img.cols();
        if top < 0 || left < 0 || bottom < 0 || right < 0 {
            return Err(StitcherError::InvalidParams(format!(
                "image at {corner:?} does not fit the prepared canvas {:?}",
                self.roi
            )));
        }

        let mut bordered = Mat::default();
        core::copy_make_border(
            img,
            &mut bordered,
            top,
            bottom,
            left,
            right,
            core::BORDER_REFLECT,
            core::Scalar::default(),
        )?;
        let src_pyr = Self::laplace_pyramid(&bordered, self.num_bands)?;
        drop(bordered);

        let weight = mask.convert(core::CV_32F, 1.0 / 255.0, 0.0)?;
        let mut weight_level = Mat::default();
        core::copy_make_border(
            &weight,
            &mut weight_level,
            top,
            bottom,
            left,
            right,
            core::BORDER_CONSTANT,
            core::Scalar::default(),
        )?;

        let (mut x_tl, mut y_tl) = (tl.x - self.roi.x, tl.y - self.roi.y);
        for (level, src) in src_pyr.iter().enumerate() {
            let (dst, dst_weight) = &mut self.pyramid[level];
            let stride = dst.cols() as usize;
            let lw = src.cols() as usize;
            let src_px = src.pixels::<Vec3f>()?;
            let w_px = weight_level.pixels::<f32>()?;
            let (ox, oy) = (x_tl as usize, y_tl as usize);

            dst.data_typed_mut::<Vec3f>()?
                .par_chunks_exact_mut(stride)
                .zip(dst_weight.data_typed_mut::<f32>()?.par_chunks_exact_mut(stride))
                .skip(oy)
                .take(src.rows() as usize)
                .enumerate()
                .for_each(|(row, (dst_row, weight_row))| {
                    for x in 0..lw {
                        let w = w_px[row * lw + x];
                        let s = src_px[row * lw + x];
                        let d = &mut dst_row[ox + x];
                        for c in 0..3 {
                            d[c] += s[c] * w;
                        }
                        weight_row[ox + x] += w;
                    }
                });

            if level < self.num_bands as usize {
                let mut down = Mat::default();
                imgproc::pyr_down(&weight_level, &mut down, Size::default(), core::BORDER_DEFAULT)?;
                weight_level = down;
                x_tl /= 2;
                y_tl /= 2;
            }
        }
        Ok(())
    }

    fn blend(&mut self) -> Result<(Mat, Mat), StitcherError> {
        if self.pyramid.is_empty() {
            return Err(StitcherError::ProcessingError(
                "blend() called before prepare()".to_string(),
            ));
        }
        for (lap, weight) in self.pyramid.iter_mut() {
            let w_px = weight.pixels::<f32>()?;
            lap.data_typed_mut::<Vec3f>()?
                .par_iter_mut()
                .zip(w_px.par_iter())
                .for_each(|(px, &w)| {
                    for c in 0..3 {
                        px[c] /= w + WEIGHT_EPS;
                    }
                });
        }
        // collapse the pyramid, the base level weights decide the coverage
        let mut levels = std::mem::take(&mut self.pyramid);
        let (mut current, mut base_weight) = levels.pop().ok_or_else(|| {
            StitcherError::ProcessingError("empty blending pyramid".to_string())
        })?;
        while let Some((lap, weight)) = levels.pop() {
            let mut up = Mat::default();
            imgproc::pyr_up(&current, &mut up, lap.size()?, core::BORDER_DEFAULT)?;
            let mut sum = Mat::default();
            core::add(&up, &lap, &mut sum, &core::no_array(), -1)?;
            current = sum;
            base_weight = weight;
        }

        let crop = Rect::new(0, 0, self.final_roi.width, self.final_roi.height);
        let pano = utils::crop_typed::<Vec3f>(&current, crop)?;
        let weight = utils::crop_typed::<f32>(&base_weight, crop)?;
        drop(current);

        let mut mask = Mat::default();
        core::compare(
            &weight,
            &core::Scalar::all(WEIGHT_EPS as f64),
            &mut mask,
            core::CMP_GT,
        )?;
        let pano = pano.convert(core::CV_8UC3, 1.0, 0.0)?;
        let mut dst = utils::zeros(pano.rows(), pano.cols(), core::CV_8UC3)?;
        pano.copy_to_masked(&mut dst, &mask)?;
        Ok((dst, mask))
    }

    fn roi(&self) -> Rect {
        self.final_roi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(rows: i32, cols: i32, typ: i32, value: core::Scalar) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, typ, value).unwrap()
    }

    /// 255 for columns in `range`, zero elsewhere
    fn column_mask(rows: i32, cols: i32, range: std::ops::Range<i32>) -> Mat {
        let mut mask = utils::zeros(rows, cols, core::CV_8U).unwrap();
        for y in 0..rows {
            for x in range.clone() {
                *mask.at_2d_mut::<u8>(y, x).unwrap() = 255;
            }
        }
        mask
    }

    #[test]
    fn later_feeds_overwrite() {
        let mut blender = OverwriteBlender::for_images();
        let corners = [Point::new(0, 0), Point::new(2, 0)];
        let sizes = [Size::new(4, 4), Size::new(4, 4)];
        blender.prepare(&corners, &sizes).unwrap();
        assert_eq!(blender.roi(), Rect::new(0, 0, 6, 4));

        let full = column_mask(4, 4, 0..4);
        let a = filled(4, 4, core::CV_8UC3, core::Scalar::all(10.0));
        let b = filled(4, 4, core::CV_8UC3, core::Scalar::all(20.0));
        blender.feed(&a, &full, corners[0]).unwrap();
        blender.feed(&b, &full, corners[1]).unwrap();
        let (pano, mask) = blender.blend().unwrap();
        assert_eq!(pano.at_2d::<Vec3b>(1, 1).unwrap()[0], 10);
        assert_eq!(pano.at_2d::<Vec3b>(1, 2).unwrap()[0], 20);
        assert_eq!(pano.at_2d::<Vec3b>(3, 5).unwrap()[2], 20);
        assert!(mask.pixels::<u8>().unwrap().iter().all(|&m| m == 255));
    }

    #[test]
    fn uncovered_coordinates_are_negative() {
        let mut blender = OverwriteBlender::for_coordinates();
        let corners = [Point::new(-1, -1), Point::new(0, 0)];
        let sizes = [Size::new(2, 2), Size::new(2, 2)];
        blender.prepare(&corners, &sizes).unwrap();
        let coords = filled(2, 2, core::CV_32FC2, core::Scalar::new(7.0, 8.0, 0.0, 0.0));
        blender
            .feed(&coords, &column_mask(2, 2, 0..2), corners[1])
            .unwrap();
        let (map, mask) = blender.blend().unwrap();
        assert_eq!(*map.at_2d::<Vec2f>(0, 0).unwrap(), core::VecN([-1.0f32, -1.0]));
        assert_eq!(*map.at_2d::<Vec2f>(2, 2).unwrap(), core::VecN([7.0f32, 8.0]));
        assert_eq!(*mask.at_2d::<u8>(0, 2).unwrap(), 0);
        assert_eq!(*mask.at_2d::<u8>(1, 1).unwrap(), 255);
    }

    #[test]
    fn feed_outside_the_canvas_is_rejected() {
        let mut blender = OverwriteBlender::for_images();
        blender
            .prepare(&[Point::new(0, 0)], &[Size::new(4, 4)])
            .unwrap();
        let img = filled(4, 4, core::CV_8UC3, core::Scalar::all(1.0));
        let res = blender.feed(&img, &column_mask(4, 4, 0..4), Point::new(1, 0));
        assert!(matches!(res, Err(StitcherError::InvalidParams(_))));
    }

    fn blend_two(bands: u32, left: f64, right: f64) -> (Mat, Mat) {
        let mut blender = MultiBandBlender::new(bands);
        let corners = [Point::new(0, 0), Point::new(24, 0)];
        let sizes = [Size::new(40, 32), Size::new(40, 32)];
        blender.prepare(&corners, &sizes).unwrap();
        let a = filled(32, 40, core::CV_8UC3, core::Scalar::all(left));
        let b = filled(32, 40, core::CV_8UC3, core::Scalar::all(right));
        // seam at panorama column 32
        blender.feed(&a, &column_mask(32, 40, 0..32), corners[0]).unwrap();
        blender.feed(&b, &column_mask(32, 40, 8..40), corners[1]).unwrap();
        blender.blend().unwrap()
    }

    #[test]
    fn multi_band_keeps_flat_colour() {
        let (pano, mask) = blend_two(5, 120.0, 120.0);
        assert_eq!(pano.size().unwrap(), Size::new(64, 32));
        assert!(mask.pixels::<u8>().unwrap().iter().all(|&m| m == 255));
        for px in pano.pixels::<Vec3b>().unwrap() {
            assert!((px[0] as i32 - 120).abs() <= 1, "{px:?}");
        }
    }

    #[test]
    fn multi_band_transition_is_local() {
        let (pano, _) = blend_two(2, 0.0, 200.0);
        for y in [0, 15, 31] {
            assert!(pano.at_2d::<Vec3b>(y, 0).unwrap()[1] < 30);
            assert!(pano.at_2d::<Vec3b>(y, 63).unwrap()[1] > 170);
            let mid = pano.at_2d::<Vec3b>(y, 32).unwrap()[1];
            assert!(mid > 30 && mid < 170, "{mid}");
        }
    }

    #[test]
    fn bands_are_limited_by_the_canvas() {
        let mut blender = MultiBandBlender::new(10);
        blender
            .prepare(&[Point::new(0, 0)], &[Size::new(20, 10)])
            .unwrap();
        assert_eq!(blender.num_bands(), 5);
    }
}
