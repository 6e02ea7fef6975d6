// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Selection of the output rectangle inside the coverage mask of a panorama.
//!
//! Both algorithms start from the outer contour of the mask. [`rect_within_mask()`]
//! greedily pulls the four sides of the contour's bounding box inwards until every side
//! lies on covered pixels. [`aspect_rect_within_mask()`] then grows a rectangle of fixed
//! aspect ratio around the centre of that result.

use crate::StitcherError;
use crate::config::{CropStrategy, StitchConfig};
use crate::utils::MatExt;
use opencv::core::{Mat, Point, Rect, Vector};
use opencv::{core, imgproc, prelude::*};

/// Half of the vertical growth per step of the aspect constrained search
const GROWTH_HALF_STEP: i32 = 9;

/// Axis aligned rectangle in panorama pixels
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CropRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl CropRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    /// Width / height
    pub fn aspect(&self) -> f64 {
        self.width as f64 / self.height as f64
    }

    /// True when the rectangle lies inside a `width` x `height` image
    pub fn fits_in(&self, width: i32, height: i32) -> bool {
        !self.is_empty()
            && self.x >= 0
            && self.y >= 0
            && self.x + self.width <= width
            && self.y + self.height <= height
    }
}

impl From<Rect> for CropRect {
    fn from(r: Rect) -> Self {
        Self::new(r.x, r.y, r.width, r.height)
    }
}

impl From<CropRect> for Rect {
    fn from(r: CropRect) -> Self {
        Rect::new(r.x, r.y, r.width, r.height)
    }
}

/// Read only view of a `CV_8U` mask, pixels outside of the image count as uncovered
struct MaskView<'a> {
    px: &'a [u8],
    cols: i32,
    rows: i32,
}

impl<'a> MaskView<'a> {
    fn new(mask: &'a Mat) -> Result<Self, StitcherError> {
        if mask.typ() != core::CV_8U || mask.empty() {
            return Err(StitcherError::CropError(format!(
                "expected a non-empty CV_8U coverage mask, got type {}",
                mask.typ()
            )));
        }
        Ok(Self {
            px: mask.pixels::<u8>()?,
            cols: mask.cols(),
            rows: mask.rows(),
        })
    }

    #[inline]
    fn covered(&self, x: i32, y: i32) -> bool {
        x >= 0
            && y >= 0
            && x < self.cols
            && y < self.rows
            && self.px[(y * self.cols + x) as usize] != 0
    }

    /// Covered pixels of column `x` in the rows `[y0, y1)`
    fn count_column(&self, x: i32, y0: i32, y1: i32) -> i32 {
        (y0..y1).filter(|&y| self.covered(x, y)).count() as i32
    }

    /// Covered pixels of row `y` in the columns `[x0, x1)`
    fn count_row(&self, y: i32, x0: i32, x1: i32) -> i32 {
        (x0..x1).filter(|&x| self.covered(x, y)).count() as i32
    }

    /// Every pixel on the border of `r` is covered
    fn edges_full(&self, r: &CropRect) -> bool {
        if r.is_empty() {
            return false;
        }
        let (x1, y1) = (r.x + r.width - 1, r.y + r.height - 1);
        self.count_row(r.y, r.x, x1 + 1) == r.width
            && self.count_row(y1, r.x, x1 + 1) == r.width
            && self.count_column(r.x, r.y, y1 + 1) == r.height
            && self.count_column(x1, r.y, y1 + 1) == r.height
    }
}

/// Outer contour of the mask, sorted along both axes
struct Boundary {
    by_x: Vec<Point>,
    by_y: Vec<Point>,
}

impl Boundary {
    fn new(mask: &Mat) -> Result<Self, StitcherError> {
        let mut contours = Vector::<Vector<Point>>::new();
        imgproc::find_contours(
            mask,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_SIMPLE,
            Point::new(0, 0),
        )?;
        if contours.len() > 1 {
            tracing::warn!(
                "coverage mask has {} separate regions, using the largest",
                contours.len()
            );
        }
        let mut largest: Option<(f64, Vector<Point>)> = None;
        for contour in contours {
            let area = imgproc::contour_area(&contour, false)?;
            if largest.as_ref().is_none_or(|(a, _)| area > *a) {
                largest = Some((area, contour));
            }
        }
        match largest {
            Some((_, c)) if c.len() >= 2 => Ok(Self::from_points(c.to_vec())),
            _ => Err(StitcherError::CropError(
                "coverage mask has no usable region".to_string(),
            )),
        }
    }

    fn from_points(points: Vec<Point>) -> Self {
        let mut by_x = points.clone();
        by_x.sort_by_key(|p| p.x);
        let mut by_y = points;
        by_y.sort_by_key(|p| p.y);
        Self { by_x, by_y }
    }

    fn bounds(&self) -> (i32, i32, i32, i32) {
        (
            self.by_x[0].x,
            self.by_x[self.by_x.len() - 1].x,
            self.by_y[0].y,
            self.by_y[self.by_y.len() - 1].y,
        )
    }
}

/// The greedy shrinking loop over an already extracted boundary.
fn shrink_to_mask(view: &MaskView, boundary: &Boundary) -> Result<CropRect, StitcherError> {
    let (mut min_x, mut max_x) = (0, boundary.by_x.len() - 1);
    let (mut min_y, mut max_y) = (0, boundary.by_y.len() - 1);
    let mut rect = CropRect::default();
    let mut iterations = 0_usize;

    while min_x < max_x && min_y < max_y {
        iterations += 1;
        let x = boundary.by_x[min_x].x;
        let x_max = boundary.by_x[max_x].x;
        let y = boundary.by_y[min_y].y;
        let y_max = boundary.by_y[max_y].y;

        let left = view.count_column(x, y, y_max);
        let right = view.count_column(x_max, y, y_max);
        let top = view.count_row(y, x, x_max);
        let bottom = view.count_row(y_max, x, x_max);

        let (width, height) = (x_max - x, y_max - y);
        rect = CropRect::new(x, y, width, height);

        let rows_full = top == bottom && top == width;
        let columns_full = left == right && left == height;
        if rows_full && columns_full {
            tracing::debug!("inscribed rectangle {rect:?} after {iterations} steps");
            if rect.is_empty() {
                return Err(StitcherError::CropError(format!(
                    "coverage collapses to the empty rectangle {rect:?}"
                )));
            }
            break;
        }

        // normalised deficits, the side with the worst one moves to the next contour
        // point. On ties the later side in (left, right, top, bottom) order moves.
        let left_d = (height - left) as f32 / height as f32;
        let right_d = (height - right) as f32 / height as f32;
        let top_d = (width - top) as f32 / width as f32;
        let bottom_d = (width - bottom) as f32 / width as f32;

        if left_d > right_d && left_d > top_d && left_d > bottom_d {
            min_x += 1;
        } else if right_d > top_d && right_d > bottom_d {
            max_x -= 1;
        } else if top_d > bottom_d {
            min_y += 1;
        } else {
            max_y -= 1;
        }
    }

    // also reached when the index ranges collapsed before all four sides were covered
    if !rect.is_empty() && view.edges_full(&rect) {
        Ok(rect)
    } else {
        Err(StitcherError::CropError(format!(
            "no inscribed rectangle found, last candidate {rect:?}"
        )))
    }
}

/// Largest axis aligned rectangle, found greedily, whose sides all lie on covered
/// pixels of `mask`. Expects a single convex-ish region, as produced by stitching.
pub fn rect_within_mask(mask: &Mat) -> Result<CropRect, StitcherError> {
    let view = MaskView::new(mask)?;
    let boundary = Boundary::new(mask)?;
    shrink_to_mask(&view, &boundary)
}

/// Trims `rect` symmetrically so that `width / height == ratio`
/// ```
/// # use libstitcher::crop::{CropRect, crop_to_aspect_ratio};
/// let r = crop_to_aspect_ratio(CropRect::new(0, 0, 400, 100), 2.0);
/// assert_eq!(r, CropRect::new(100, 0, 200, 100));
/// let r = crop_to_aspect_ratio(CropRect::new(10, 10, 100, 100), 2.0);
/// assert_eq!(r, CropRect::new(10, 35, 100, 50));
/// ```
pub fn crop_to_aspect_ratio(rect: CropRect, ratio: f64) -> CropRect {
    let mut out = rect;
    if rect.is_empty() || !(ratio.is_finite() && ratio > 0.0) {
        return out;
    }
    let in_ratio = rect.aspect();
    if in_ratio > ratio {
        let width_diff = rect.width - (rect.height as f64 * ratio) as i32;
        out.x += width_diff / 2;
        out.width -= width_diff;
    } else if in_ratio < ratio {
        let height_diff = rect.height - (rect.width as f64 / ratio) as i32;
        out.y += height_diff / 2;
        out.height -= height_diff;
    }
    out
}

/// Rectangle of aspect `ratio` grown around the centre of [`rect_within_mask()`].
///
/// The height grows by 18 pixels per step and the width is `round(height * ratio)`, so
/// the aspect of the result is off by at most `0.5 / height`. A step is kept when it lies
/// strictly inside the contour bounds and all its sides are covered. The search succeeds when the
/// next step would exceed `max_width` x `max_height`, any other stop means the panorama
/// can't hold the requested output and is reported as [`StitcherError::CropError`].
pub fn aspect_rect_within_mask(
    mask: &Mat,
    ratio: f64,
    max_width: i32,
    max_height: i32,
) -> Result<CropRect, StitcherError> {
    if !(ratio.is_finite() && ratio > 0.0) || max_width <= 0 || max_height <= 0 {
        return Err(StitcherError::InvalidParams(format!(
            "aspect {ratio} and size cap {max_width}x{max_height} must be positive"
        )));
    }
    let view = MaskView::new(mask)?;
    let boundary = Boundary::new(mask)?;
    let inner = shrink_to_mask(&view, &boundary)?;
    let (cx, cy) = (inner.x + inner.width / 2, inner.y + inner.height / 2);
    let (min_x, max_x, min_y, max_y) = boundary.bounds();

    let mut best: Option<CropRect> = None;
    for step in 1.. {
        let height = 2 * GROWTH_HALF_STEP * step;
        let width = (height as f64 * ratio).round() as i32;
        if width > max_width || height > max_height {
            break;
        }
        let candidate = CropRect::new(cx - width / 2, cy - height / 2, width, height);
        let inside = candidate.x > min_x.max(0)
            && candidate.x + candidate.width < max_x
            && candidate.y > min_y.max(0)
            && candidate.y + candidate.height < max_y;
        if !inside || !view.edges_full(&candidate) {
            return Err(StitcherError::CropError(format!(
                "panorama coverage {inner:?} can't hold a {max_width}x{max_height} output of aspect {ratio:.3}, stopped at {}",
                best.map_or_else(|| "the first step".to_string(), |b| format!("{b:?}"))
            )));
        }
        best = Some(candidate);
    }
    let best = best.ok_or_else(|| {
        StitcherError::CropError(format!(
            "size cap {max_width}x{max_height} is below the smallest step of aspect {ratio:.3}"
        ))
    })?;
    tracing::info!("aspect constrained crop {best:?} inside {inner:?}");
    Ok(best)
}

/// Runs the crop strategy of `config` on `mask`
pub fn select(mask: &Mat, config: &StitchConfig) -> Result<CropRect, StitcherError> {
    let crop = match config.crop {
        CropStrategy::MaxInscribed => rect_within_mask(mask)?,
        CropStrategy::MaxInscribedAspect => {
            let r = crop_to_aspect_ratio(rect_within_mask(mask)?, config.target_aspect);
            if r.is_empty() {
                return Err(StitcherError::CropError(format!(
                    "aspect {} leaves nothing of the inscribed rectangle",
                    config.target_aspect
                )));
            }
            r
        }
        CropStrategy::AspectConstrained => aspect_rect_within_mask(
            mask,
            config.target_aspect,
            config.target_width,
            config.target_height,
        )?,
    };
    if !crop.fits_in(mask.cols(), mask.rows()) {
        return Err(StitcherError::CropError(format!(
            "{crop:?} is outside of the {}x{} panorama",
            mask.cols(),
            mask.rows()
        )));
    }
    Ok(crop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils;

    fn rect_mask(cols: i32, rows: i32, r: Rect) -> Mat {
        let mut mask = utils::zeros(rows, cols, core::CV_8U).unwrap();
        imgproc::rectangle(
            &mut mask,
            r,
            core::Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        mask
    }

    fn ellipse_mask(cols: i32, rows: i32) -> Mat {
        let mut mask = utils::zeros(rows, cols, core::CV_8U).unwrap();
        imgproc::ellipse(
            &mut mask,
            Point::new(cols / 2, rows / 2),
            core::Size::new(cols / 2 - 10, rows / 2 - 10),
            0.0,
            0.0,
            360.0,
            core::Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        mask
    }

    #[test]
    fn rectangle_mask_is_its_own_crop() {
        let mask = rect_mask(200, 100, Rect::new(20, 10, 150, 70));
        let r = rect_within_mask(&mask).unwrap();
        let view = MaskView::new(&mask).unwrap();
        assert!(view.edges_full(&r));
        // the far contour column and row are not part of the result
        assert_eq!(r, CropRect::new(20, 10, 149, 69));
    }

    /// 101x51 block at (10, 10) without its 10x6 bottom left corner
    fn notched_mask() -> Mat {
        let mut mask = rect_mask(200, 100, Rect::new(10, 10, 101, 51));
        for y in 55..=60 {
            for x in 10..=19 {
                *mask.at_2d_mut::<u8>(y, x).unwrap() = 0;
            }
        }
        mask
    }

    fn boundary(points: &[(i32, i32)]) -> Boundary {
        Boundary::from_points(points.iter().map(|&(x, y)| Point::new(x, y)).collect())
    }

    #[test]
    fn tied_deficits_move_the_later_side() {
        let mask = notched_mask();
        let view = MaskView::new(&mask).unwrap();
        let outline = boundary(&[
            (10, 10),
            (110, 10),
            (110, 60),
            (20, 60),
            (20, 55),
            (19, 54),
            (10, 54),
        ]);
        // left misses 5 of 50 rows, bottom 10 of 100 columns: bottom gives way
        let r = shrink_to_mask(&view, &outline).unwrap();
        assert_eq!(r, CropRect::new(10, 10, 100, 44));
        assert!(view.edges_full(&r));
    }

    #[test]
    fn uncovered_pixels_on_the_result_edges_fail() {
        let mut mask = rect_mask(200, 100, Rect::new(10, 10, 101, 51));
        // the sides counted by the search stay covered, the last column of the result doesn't
        for y in 30..=40 {
            *mask.at_2d_mut::<u8>(y, 109).unwrap() = 0;
        }
        let view = MaskView::new(&mask).unwrap();
        let outline = boundary(&[(10, 10), (110, 10), (110, 60), (10, 60)]);
        assert!(matches!(
            shrink_to_mask(&view, &outline),
            Err(StitcherError::CropError(_))
        ));
    }

    #[test]
    fn ellipse_crop_has_covered_edges() {
        let mask = ellipse_mask(400, 200);
        let r = rect_within_mask(&mask).unwrap();
        let view = MaskView::new(&mask).unwrap();
        assert!(view.edges_full(&r), "{r:?}");
        // an inscribed rectangle of an ellipse covers at most 2/pi of it
        let ellipse_area = std::f64::consts::PI * 191.0 * 91.0;
        assert!((r.area() as f64) <= 2.0 / std::f64::consts::PI * ellipse_area);
        assert!((r.area() as f64) > 0.25 * ellipse_area, "{r:?}");
    }

    #[test]
    fn aspect_crop_honours_ratio_and_cap() {
        let mask = rect_mask(800, 300, Rect::new(5, 5, 790, 290));
        let r = aspect_rect_within_mask(&mask, 2.0, 400, 200).unwrap();
        assert!(r.width <= 400 && r.height <= 200);
        approx::assert_abs_diff_eq!(r.aspect(), 2.0, epsilon = 1e-9);
        assert_eq!(r.height, 198);
        assert!(MaskView::new(&mask).unwrap().edges_full(&r));
    }

    #[test]
    fn aspect_crop_inside_an_ellipse() {
        let mask = ellipse_mask(600, 300);
        let r = aspect_rect_within_mask(&mask, 16.0 / 9.0, 288, 162).unwrap();
        assert_eq!(r.height, 162);
        assert_eq!(r.width, 288);
        assert!(MaskView::new(&mask).unwrap().edges_full(&r));
    }

    #[test]
    fn rounded_width_stays_close_to_the_ratio() {
        let mask = rect_mask(900, 300, Rect::new(5, 5, 890, 290));
        let ratio = 2.35;
        let r = aspect_rect_within_mask(&mask, ratio, 600, 270).unwrap();
        assert_eq!(r.height, 252);
        assert_eq!(r.width, 592);
        assert!((r.aspect() - ratio).abs() <= 0.5 / r.height as f64);
    }

    #[test]
    fn unreachable_size_is_an_error() {
        let mask = rect_mask(300, 100, Rect::new(5, 5, 290, 90));
        let res = aspect_rect_within_mask(&mask, 3.0, 3000, 1000);
        assert!(matches!(res, Err(StitcherError::CropError(_))));
    }

    #[test]
    fn empty_mask_is_an_error() {
        let mask = utils::zeros(50, 50, core::CV_8U).unwrap();
        assert!(matches!(
            rect_within_mask(&mask),
            Err(StitcherError::CropError(_))
        ));
    }

    #[test]
    fn largest_region_wins() {
        let mut mask = rect_mask(300, 100, Rect::new(150, 10, 140, 80));
        for y in 10..20 {
            for x in 10..20 {
                *mask.at_2d_mut::<u8>(y, x).unwrap() = 255;
            }
        }
        let r = rect_within_mask(&mask).unwrap();
        assert!(r.x >= 150, "{r:?}");
    }

    #[test]
    fn select_applies_the_strategy() {
        let mask = rect_mask(500, 200, Rect::new(0, 0, 500, 200));
        let config = StitchConfig {
            crop: CropStrategy::MaxInscribedAspect,
            target_aspect: 1.0,
            ..Default::default()
        };
        let r = select(&mask, &config).unwrap();
        assert_eq!(r.width, r.height);
        assert!(r.fits_in(500, 200));
    }
}
