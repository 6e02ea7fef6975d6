// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Seam estimation between the two warped images.
//!
//! Both finders look at the overlap of the two warped rectangles (plus a small gap) and
//! decide for every pixel covered by both images which one keeps it. The masks are
//! edited in place, afterwards each panorama pixel is claimed by at most one image.

use crate::StitcherError;
use crate::config::SeamFinderKind;
use crate::utils::{self, MatExt};
use opencv::core::{Mat, Point, Rect, Size, Vec3b};
use opencv::{core, imgproc, prelude::*};
use std::collections::VecDeque;

/// Pixels of context kept around the overlap rectangle.
const GAP: i32 = 10;

/// Splits the overlap of two warped images between them.
pub trait SeamFinder {
    /// `images` are warped `CV_8UC3` images placed at `corners`, `masks` are their
    /// `CV_8U` coverage masks which get trimmed to the seam.
    fn find(
        &self,
        images: &[Mat; 2],
        corners: &[Point; 2],
        masks: &mut [Mat; 2],
    ) -> Result<(), StitcherError>;
}

impl SeamFinderKind {
    pub fn finder(self) -> Box<dyn SeamFinder> {
        match self {
            SeamFinderKind::GraphCut => Box::new(GraphCutSeamFinder::default()),
            SeamFinderKind::Voronoi => Box::new(VoronoiSeamFinder),
        }
    }
}

/// The overlap window of the two images, with both coverage masks sampled into it.
struct Window {
    roi: Rect,
    covered: [Vec<bool>; 2],
}

impl Window {
    fn new(corners: &[Point; 2], masks: &[Mat; 2]) -> Result<Option<Self>, StitcherError> {
        let r0 = Rect::from_point_size(corners[0], masks[0].size()?);
        let r1 = Rect::from_point_size(corners[1], masks[1].size()?);
        let Some(overlap) = utils::intersect(r0, r1) else {
            return Ok(None);
        };
        let roi = Rect::new(
            overlap.x - GAP,
            overlap.y - GAP,
            overlap.width + 2 * GAP,
            overlap.height + 2 * GAP,
        );
        let covered = [
            sample(&masks[0], corners[0], roi, |m: &u8| *m != 0, false)?,
            sample(&masks[1], corners[1], roi, |m: &u8| *m != 0, false)?,
        ];
        Ok(Some(Self { roi, covered }))
    }

    fn len(&self) -> usize {
        (self.roi.width * self.roi.height) as usize
    }

    fn both(&self, idx: usize) -> bool {
        self.covered[0][idx] && self.covered[1][idx]
    }

    /// Clears the losing mask on every doubly covered pixel. `keeps_first[i]` tells
    /// whether window pixel `i` goes to image 0.
    fn apply(
        &self,
        keeps_first: &[bool],
        corners: &[Point; 2],
        masks: &mut [Mat; 2],
    ) -> Result<(), StitcherError> {
        let w = self.roi.width;
        for (idx, &first) in keeps_first.iter().enumerate() {
            if !self.both(idx) {
                continue;
            }
            let loser = if first { 1 } else { 0 };
            let gx = self.roi.x + idx as i32 % w;
            let gy = self.roi.y + idx as i32 / w;
            *masks[loser].at_2d_mut::<u8>(gy - corners[loser].y, gx - corners[loser].x)? = 0;
        }
        Ok(())
    }
}

/// Copies the `roi` (panorama coordinates) part of an image placed at `corner`,
/// pixels outside of the image become `outside`.
fn sample<T: core::DataType, U: Clone>(
    img: &Mat,
    corner: Point,
    roi: Rect,
    f: impl Fn(&T) -> U,
    outside: U,
) -> Result<Vec<U>, StitcherError> {
    let size = img.size()?;
    let px = img.pixels::<T>()?;
    let mut rv = vec![outside; (roi.width * roi.height) as usize];
    for y in 0..roi.height {
        let sy = roi.y + y - corner.y;
        if sy < 0 || sy >= size.height {
            continue;
        }
        for x in 0..roi.width {
            let sx = roi.x + x - corner.x;
            if sx < 0 || sx >= size.width {
                continue;
            }
            rv[(y * roi.width + x) as usize] = f(&px[(sy * size.width + sx) as usize]);
        }
    }
    Ok(rv)
}

/// Every doubly covered pixel goes to the image whose exclusive region is closest (L1).
#[derive(Debug, Default, Clone, Copy)]
pub struct VoronoiSeamFinder;

impl VoronoiSeamFinder {
    fn distance_to_unique(
        window: &Window,
        idx: usize,
    ) -> Result<Vec<f32>, StitcherError> {
        let other = 1 - idx;
        // zero where the pixel is exclusively covered by `idx`
        let mut not_unique = utils::zeros(window.roi.height, window.roi.width, core::CV_8U)?;
        for (i, px) in not_unique.data_typed_mut::<u8>()?.iter_mut().enumerate() {
            let unique = window.covered[idx][i] && !window.covered[other][i];
            *px = if unique { 0 } else { 255 };
        }
        let mut dist = Mat::default();
        imgproc::distance_transform(
            &not_unique,
            &mut dist,
            imgproc::DIST_L1,
            imgproc::DIST_MASK_3,
            core::CV_32F,
        )?;
        Ok(dist.pixels::<f32>()?.to_vec())
    }
}

impl SeamFinder for VoronoiSeamFinder {
    fn find(
        &self,
        _images: &[Mat; 2],
        corners: &[Point; 2],
        masks: &mut [Mat; 2],
    ) -> Result<(), StitcherError> {
        let Some(window) = Window::new(corners, masks)? else {
            return Ok(());
        };
        let d0 = Self::distance_to_unique(&window, 0)?;
        let d1 = Self::distance_to_unique(&window, 1)?;
        let keeps_first: Vec<bool> = d0.iter().zip(d1.iter()).map(|(a, b)| a < b).collect();
        window.apply(&keeps_first, corners, masks)
    }
}

/// Minimum cut through the overlap. Cutting between two neighbours costs the colour
/// difference of the images on both of them, so the seam avoids places where the
/// images disagree.
#[derive(Debug, Clone, Copy)]
pub struct GraphCutSeamFinder {
    /// Binds exclusively covered pixels to their own image
    pub terminal_cost: f64,
    /// Added to the cost of cutting next to a pixel missing in one of the images
    pub bad_region_penalty: f64,
}

impl Default for GraphCutSeamFinder {
    fn default() -> Self {
        Self {
            terminal_cost: 10000.0,
            bad_region_penalty: 1000.0,
        }
    }
}

impl SeamFinder for GraphCutSeamFinder {
    fn find(
        &self,
        images: &[Mat; 2],
        corners: &[Point; 2],
        masks: &mut [Mat; 2],
    ) -> Result<(), StitcherError> {
        for (img, mask) in images.iter().zip(masks.iter()) {
            if img.typ() != core::CV_8UC3 || img.size()? != mask.size()? {
                return Err(StitcherError::InvalidParams(
                    "graph cut seams need CV_8UC3 images matching their masks".to_string(),
                ));
            }
        }
        let Some(window) = Window::new(corners, masks)? else {
            return Ok(());
        };
        let to_rgb = |p: &Vec3b| [p[0] as f32 / 255.0, p[1] as f32 / 255.0, p[2] as f32 / 255.0];
        let colours = [
            sample(&images[0], corners[0], window.roi, to_rgb, [0.0; 3])?,
            sample(&images[1], corners[1], window.roi, to_rgb, [0.0; 3])?,
        ];

        let (w, h) = (window.roi.width as usize, window.roi.height as usize);
        let source = window.len();
        let sink = source + 1;
        let mut graph = FlowGraph::new(window.len() + 2);

        for idx in 0..window.len() {
            let to_source = if window.covered[0][idx] { self.terminal_cost } else { 0.0 };
            let to_sink = if window.covered[1][idx] { self.terminal_cost } else { 0.0 };
            let net = to_source - to_sink;
            if net > 0.0 {
                graph.add_edge(source, idx, net, 0.0);
            } else if net < 0.0 {
                graph.add_edge(idx, sink, -net, 0.0);
            }
        }

        let weight_eps = 1.0;
        let diff = |i: usize| {
            let (a, b) = (colours[0][i], colours[1][i]);
            (0..3).map(|c| (a[c] - b[c]) * (a[c] - b[c])).sum::<f32>() as f64
        };
        let fully_covered = |i: usize| window.both(i);
        for y in 0..h {
            for x in 0..w {
                let v = y * w + x;
                for n in [(x + 1 < w).then_some(v + 1), (y + 1 < h).then_some(v + w)]
                    .into_iter()
                    .flatten()
                {
                    let mut weight = diff(v) + diff(n) + weight_eps;
                    if !fully_covered(v) || !fully_covered(n) {
                        weight += self.bad_region_penalty;
                    }
                    graph.add_edge(v, n, weight, weight);
                }
            }
        }

        let flow = graph.max_flow(source, sink);
        let keeps_first = graph.source_side(source);
        tracing::debug!(
            "graph cut over {}x{} window, flow {flow:.1}",
            window.roi.width,
            window.roi.height
        );
        window.apply(&keeps_first[..window.len()], corners, masks)
    }
}

/// Flow network solved with Dinic's algorithm.
struct FlowGraph {
    head: Vec<Option<usize>>,
    next: Vec<Option<usize>>,
    to: Vec<usize>,
    cap: Vec<f64>,
    level: Vec<u32>,
    cursor: Vec<Option<usize>>,
}

const FLOW_EPS: f64 = 1e-9;
const UNREACHED: u32 = u32::MAX;

impl FlowGraph {
    fn new(nodes: usize) -> Self {
        Self {
            head: vec![None; nodes],
            next: Vec::new(),
            to: Vec::new(),
            cap: Vec::new(),
            level: vec![UNREACHED; nodes],
            cursor: vec![None; nodes],
        }
    }

    /// Adds the arc `from → to` and its twin `to → from`. The twin of arc `e` is `e ^ 1`.
    fn add_edge(&mut self, from: usize, to: usize, cap: f64, rev_cap: f64) {
        for (a, b, c) in [(from, to, cap), (to, from, rev_cap)] {
            self.next.push(self.head[a]);
            self.head[a] = Some(self.to.len());
            self.to.push(b);
            self.cap.push(c);
        }
    }

    fn bfs(&mut self, source: usize) {
        self.level.fill(UNREACHED);
        self.level[source] = 0;
        let mut queue = VecDeque::from([source]);
        while let Some(v) = queue.pop_front() {
            let mut e = self.head[v];
            while let Some(edge) = e {
                let u = self.to[edge];
                if self.cap[edge] > FLOW_EPS && self.level[u] == UNREACHED {
                    self.level[u] = self.level[v] + 1;
                    queue.push_back(u);
                }
                e = self.next[edge];
            }
        }
    }

    /// Pushes a blocking flow along the current level graph
    fn blocking_flow(&mut self, source: usize, sink: usize) -> f64 {
        let mut total = 0.0;
        let mut path: Vec<usize> = Vec::new();
        let mut v = source;
        loop {
            if v == sink {
                let pushed = path
                    .iter()
                    .map(|&e| self.cap[e])
                    .fold(f64::INFINITY, f64::min);
                for &e in &path {
                    self.cap[e] -= pushed;
                    self.cap[e ^ 1] += pushed;
                }
                total += pushed;
                // retreat to the tail of the first saturated arc
                let saturated = path
                    .iter()
                    .position(|&e| self.cap[e] <= FLOW_EPS)
                    .unwrap_or(0);
                path.truncate(saturated);
                v = path.last().map_or(source, |&e| self.to[e]);
                continue;
            }

            let mut advanced = false;
            while let Some(edge) = self.cursor[v] {
                let u = self.to[edge];
                if self.cap[edge] > FLOW_EPS && self.level[u] == self.level[v] + 1 {
                    path.push(edge);
                    v = u;
                    advanced = true;
                    break;
                }
                self.cursor[v] = self.next[edge];
            }
            if advanced {
                continue;
            }
            // dead end
            if v == source {
                break;
            }
            self.level[v] = UNREACHED;
            let Some(edge) = path.pop() else {
                break;
            };
            v = self.to[edge ^ 1];
            self.cursor[v] = self.next[edge];
        }
        total
    }

    fn max_flow(&mut self, source: usize, sink: usize) -> f64 {
        let mut flow = 0.0;
        loop {
            self.bfs(source);
            if self.level[sink] == UNREACHED {
                return flow;
            }
            self.cursor.clone_from(&self.head);
            flow += self.blocking_flow(source, sink);
        }
    }

    /// Nodes reachable from `source` in the residual network
    fn source_side(&mut self, source: usize) -> Vec<bool> {
        self.bfs(source);
        self.level.iter().map(|&l| l != UNREACHED).collect()
    }
}

/// Brings a seam-resolution mask to the composition resolution: dilate, resize, then keep
/// only what the full resolution warp actually covers.
pub fn upscale_seam_mask(seam_mask: &Mat, warped_mask: &Mat) -> Result<Mat, StitcherError> {
    let mut dilated = Mat::default();
    imgproc::dilate(
        seam_mask,
        &mut dilated,
        &Mat::default(),
        Point::new(-1, -1),
        1,
        core::BORDER_CONSTANT,
        imgproc::morphology_default_border_value()?,
    )?;
    let mut resized = Mat::default();
    let size: Size = warped_mask.size()?;
    imgproc::resize(
        &dilated,
        &mut resized,
        size,
        0.0,
        0.0,
        imgproc::INTER_LINEAR_EXACT,
    )?;
    let mut rv = Mat::default();
    core::bitwise_and(&resized, warped_mask, &mut rv, &core::no_array())?;
    Ok(rv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(rows: i32, cols: i32, typ: i32, value: f64) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, typ, core::Scalar::all(value)).unwrap()
    }

    fn count(mask: &Mat) -> usize {
        mask.pixels::<u8>().unwrap().iter().filter(|&&v| v != 0).count()
    }

    /// Two 40x30 images overlapping by 20 columns
    fn setup() -> ([Point; 2], [Mat; 2]) {
        let corners = [Point::new(0, 0), Point::new(20, 0)];
        let masks = [
            filled(30, 40, core::CV_8U, 255.0),
            filled(30, 40, core::CV_8U, 255.0),
        ];
        (corners, masks)
    }

    fn assert_partition(corners: &[Point; 2], masks: &[Mat; 2]) {
        // every overlap pixel claimed exactly once
        for y in 0..30 {
            for x in 20..40 {
                let a = *masks[0].at_2d::<u8>(y, x - corners[0].x).unwrap() != 0;
                let b = *masks[1].at_2d::<u8>(y, x - corners[1].x).unwrap() != 0;
                assert!(a ^ b, "pixel {x},{y}");
            }
        }
        assert_eq!(count(&masks[0]) + count(&masks[1]), 60 * 30);
    }

    #[test]
    fn voronoi_splits_down_the_middle() {
        let (corners, mut masks) = setup();
        let images = [
            filled(30, 40, core::CV_8UC3, 0.0),
            filled(30, 40, core::CV_8UC3, 0.0),
        ];
        VoronoiSeamFinder.find(&images, &corners, &mut masks).unwrap();
        assert_partition(&corners, &masks);
        let left = count(&masks[0]) as i64;
        assert!((left - 30 * 30).abs() <= 30, "{left}");
    }

    #[test]
    fn graph_cut_follows_the_agreeing_column() {
        let (corners, mut masks) = setup();
        // the images only agree on panorama columns 27 and 28
        let mut images = [
            filled(30, 40, core::CV_8UC3, 20.0),
            filled(30, 40, core::CV_8UC3, 230.0),
        ];
        for y in 0..30 {
            for x in [27, 28] {
                *images[0].at_2d_mut::<Vec3b>(y, x).unwrap() = core::VecN([128, 128, 128]);
                *images[1].at_2d_mut::<Vec3b>(y, x - 20).unwrap() = core::VecN([128, 128, 128]);
            }
        }
        GraphCutSeamFinder::default()
            .find(&images, &corners, &mut masks)
            .unwrap();
        assert_partition(&corners, &masks);
        for y in 0..30 {
            for x in 20..40 {
                let keeps_left = *masks[0].at_2d::<u8>(y, x).unwrap() != 0;
                assert_eq!(keeps_left, x <= 27, "pixel {x},{y}");
            }
        }
    }

    #[test]
    fn disjoint_images_are_untouched() {
        let corners = [Point::new(0, 0), Point::new(100, 0)];
        let mut masks = [
            filled(10, 10, core::CV_8U, 255.0),
            filled(10, 10, core::CV_8U, 255.0),
        ];
        let images = [
            filled(10, 10, core::CV_8UC3, 0.0),
            filled(10, 10, core::CV_8UC3, 0.0),
        ];
        GraphCutSeamFinder::default()
            .find(&images, &corners, &mut masks)
            .unwrap();
        assert_eq!(count(&masks[0]) + count(&masks[1]), 200);
    }

    #[test]
    fn max_flow_of_a_small_network() {
        // classic 4 node example, min cut 5
        let mut g = FlowGraph::new(4);
        g.add_edge(0, 1, 3.0, 0.0);
        g.add_edge(0, 2, 2.0, 0.0);
        g.add_edge(1, 2, 5.0, 0.0);
        g.add_edge(1, 3, 2.0, 0.0);
        g.add_edge(2, 3, 3.0, 0.0);
        approx::assert_abs_diff_eq!(g.max_flow(0, 3), 5.0);
        let side = g.source_side(0);
        assert!(side[0] && !side[3]);
    }

    #[test]
    fn upscaled_mask_stays_inside_the_warp() {
        let mut small = filled(10, 10, core::CV_8U, 0.0);
        for y in 0..10 {
            for x in 0..5 {
                *small.at_2d_mut::<u8>(y, x).unwrap() = 255;
            }
        }
        let mut warped = filled(40, 40, core::CV_8U, 255.0);
        *warped.at_2d_mut::<u8>(0, 0).unwrap() = 0;
        let up = upscale_seam_mask(&small, &warped).unwrap();
        assert_eq!(up.size().unwrap(), Size::new(40, 40));
        assert_eq!(*up.at_2d::<u8>(0, 0).unwrap(), 0);
        assert_ne!(*up.at_2d::<u8>(20, 20).unwrap(), 0);
        // dilation pushed the edge right of the plain 2x scaled boundary (column 20)
        assert_ne!(*up.at_2d::<u8>(20, 22).unwrap(), 0);
        assert_eq!(*up.at_2d::<u8>(20, 35).unwrap(), 0);
    }
}
