// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Cylindrical projection of camera images onto the shared panorama surface.

use crate::StitcherError;
use crate::camera::CameraParams;
use crate::utils;
use nalgebra::{Matrix3, Vector3};
use opencv::core::{Mat, Point, Rect, Size, Vec2f};
use opencv::{core, imgproc, prelude::*};
use rayon::prelude::*;

/// Projects rays onto a vertical cylinder of radius `scale` around the rig.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CylindricalWarper {
    scale: f64,
}

/// Pre-computed inverse mapping of one camera: the destination rectangle in panorama
/// coordinates and, for each of its pixels, the source pixel it samples.
pub struct WarpMaps {
    pub roi: Rect,
    /// `CV_32FC2`, (-1, -1) where the cylinder point is behind the camera.
    map: Mat,
}

impl CylindricalWarper {
    pub fn new(scale: f64) -> Self {
        Self { scale }
    }

    /// Source pixel → cylinder coordinates
    /// ```
    /// # use libstitcher::{camera::CameraParams, warper::CylindricalWarper};
    /// let cam = CameraParams { focal: 400.0, ppx: 200.0, ppy: 100.0, ..Default::default() };
    /// let warper = CylindricalWarper::new(400.0);
    /// // the principal point lands on the origin
    /// let (u, v) = warper.map_forward(&cam, 200.0, 100.0).unwrap();
    /// assert!(u.abs() < 1e-9 && v.abs() < 1e-9);
    /// ```
    pub fn map_forward(&self, cam: &CameraParams, x: f64, y: f64) -> Option<(f64, f64)> {
        let r_kinv = cam.rotation * cam.k().try_inverse()?;
        Some(self.forward(&r_kinv, x, y))
    }

    fn forward(&self, r_kinv: &Matrix3<f64>, x: f64, y: f64) -> (f64, f64) {
        let ray = r_kinv * Vector3::new(x, y, 1.0);
        let u = self.scale * ray.x.atan2(ray.z);
        let v = self.scale * ray.y / (ray.x * ray.x + ray.z * ray.z).sqrt();
        (u, v)
    }

    /// Cylinder coordinates → source pixel, `None` behind the camera
    pub fn map_backward(&self, cam: &CameraParams, u: f64, v: f64) -> Option<(f64, f64)> {
        let k_rinv = cam.k() * cam.rotation.transpose();
        self.backward(&k_rinv, u, v)
    }

    fn backward(&self, k_rinv: &Matrix3<f64>, u: f64, v: f64) -> Option<(f64, f64)> {
        let u = u / self.scale;
        let v = v / self.scale;
        let p = k_rinv * Vector3::new(u.sin(), v, u.cos());
        (p.z > 0.0).then(|| (p.x / p.z, p.y / p.z))
    }

    /// Bounding rectangle, in panorama coordinates, of the warped `src_size` image.
    /// Found by projecting the image border.
    pub fn warp_roi(&self, src_size: Size, cam: &CameraParams) -> Result<Rect, StitcherError> {
        if src_size.width <= 0 || src_size.height <= 0 {
            return Err(StitcherError::InvalidParams(format!(
                "can't warp a {}x{} image",
                src_size.width, src_size.height
            )));
        }
        let r_kinv = cam.rotation
            * cam.k().try_inverse().ok_or_else(|| {
                StitcherError::RegistrationError(format!("singular intrinsics {cam:?}"))
            })?;

        let (w, h) = (src_size.width as f64, src_size.height as f64);
        let mut tl = (f64::MAX, f64::MAX);
        let mut br = (f64::MIN, f64::MIN);
        let mut update = |x: f64, y: f64| {
            let (u, v) = self.forward(&r_kinv, x, y);
            tl = (tl.0.min(u), tl.1.min(v));
            br = (br.0.max(u), br.1.max(v));
        };
        for x in 0..src_size.width {
            update(x as f64, 0.0);
            update(x as f64, h - 1.0);
        }
        for y in 0..src_size.height {
            update(0.0, y as f64);
            update(w - 1.0, y as f64);
        }
        if !(tl.0.is_finite() && tl.1.is_finite() && br.0.is_finite() && br.1.is_finite()) {
            return Err(StitcherError::RegistrationError(format!(
                "camera {cam:?} projects outside of the cylinder"
            )));
        }
        let (x0, y0) = (tl.0.floor() as i32, tl.1.floor() as i32);
        let (x1, y1) = (br.0.floor() as i32, br.1.floor() as i32);
        Ok(Rect::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1))
    }

    /// Builds the inverse map of one camera. Rows are filled in parallel.
    pub fn build_maps(
        &self,
        src_size: Size,
        cam: &CameraParams,
    ) -> Result<WarpMaps, StitcherError> {
        let roi = self.warp_roi(src_size, cam)?;
        let k_rinv = cam.k() * cam.rotation.transpose();
        let mut map = utils::zeros(roi.height, roi.width, core::CV_32FC2)?;
        map.data_typed_mut::<Vec2f>()?
            .par_chunks_mut(roi.width as usize)
            .enumerate()
            .for_each(|(row, pixels)| {
                let v = (roi.y + row as i32) as f64;
                for (col, px) in pixels.iter_mut().enumerate() {
                    let u = (roi.x + col as i32) as f64;
                    *px = match self.backward(&k_rinv, u, v) {
                        Some((x, y)) => core::VecN([x as f32, y as f32]),
                        None => core::VecN([-1.0, -1.0]),
                    };
                }
            });
        Ok(WarpMaps { roi, map })
    }
}

impl WarpMaps {
    pub fn corner(&self) -> Point {
        self.roi.tl()
    }

    pub fn size(&self) -> Size {
        self.roi.size()
    }

    pub fn remap(
        &self,
        src: &Mat,
        interpolation: i32,
        border_mode: i32,
    ) -> Result<Mat, StitcherError> {
        let mut dst = Mat::default();
        imgproc::remap(
            src,
            &mut dst,
            &self.map,
            &core::no_array(),
            interpolation,
            border_mode,
            core::Scalar::all(0.0),
        )?;
        Ok(dst)
    }

    /// Bilinear, reflected border
    pub fn warp_image(&self, src: &Mat) -> Result<Mat, StitcherError> {
        self.remap(src, imgproc::INTER_LINEAR, core::BORDER_REFLECT)
    }

    /// Coverage mask of a `src_size` image: nearest neighbour, zero outside
    pub fn warp_full_mask(&self, src_size: Size) -> Result<Mat, StitcherError> {
        let mask = Mat::new_size_with_default(src_size, core::CV_8U, core::Scalar::all(255.0))?;
        self.remap(&mask, imgproc::INTER_NEAREST, core::BORDER_CONSTANT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::MatExt;
    use nalgebra::Rotation3;

    fn camera(yaw: f64) -> CameraParams {
        CameraParams {
            focal: 300.0,
            aspect: 1.0,
            ppx: 160.0,
            ppy: 90.0,
            rotation: Rotation3::from_euler_angles(0.0, yaw, 0.0).into_inner(),
        }
    }

    #[test]
    fn forward_and_backward_agree() {
        let warper = CylindricalWarper::new(300.0);
        let cam = camera(0.3);
        for (x, y) in [(0.0, 0.0), (160.0, 90.0), (319.0, 179.0), (12.5, 150.25)] {
            let (u, v) = warper.map_forward(&cam, x, y).unwrap();
            let (bx, by) = warper.map_backward(&cam, u, v).unwrap();
            approx::assert_abs_diff_eq!(bx, x, epsilon = 1e-6);
            approx::assert_abs_diff_eq!(by, y, epsilon = 1e-6);
        }
        // opposite side of the cylinder
        let (u, v) = warper.map_forward(&cam, 160.0, 90.0).unwrap();
        assert!(warper.map_backward(&cam, u + 300.0 * std::f64::consts::PI, v).is_none());
    }

    #[test]
    fn yaw_shifts_the_roi() {
        let warper = CylindricalWarper::new(300.0);
        let size = Size::new(320, 180);
        let roi0 = warper.warp_roi(size, &camera(0.0)).unwrap();
        let roi1 = warper.warp_roi(size, &camera(0.4)).unwrap();
        // symmetric about the optical axis
        assert!((roi0.x + roi0.width / 2).abs() <= 1);
        assert!((roi0.width - roi1.width).abs() <= 1);
        assert!((roi1.x - roi0.x - 120).abs() <= 1, "{roi0:?} {roi1:?}");
    }

    #[test]
    fn warped_mask_covers_the_projection() {
        let warper = CylindricalWarper::new(300.0);
        let size = Size::new(320, 180);
        let maps = warper.build_maps(size, &camera(0.2)).unwrap();
        let mask = maps.warp_full_mask(size).unwrap();
        assert_eq!(mask.size().unwrap(), maps.size());
        let px = mask.pixels::<u8>().unwrap();
        let w = maps.size().width as usize;
        let h = maps.size().height as usize;
        // centre is covered, the corners of the bounding box are not (cylinder bulge)
        assert_eq!(px[(h / 2) * w + w / 2], 255);
        assert_eq!(px[0], 0);
        let covered = px.iter().filter(|&&v| v == 255).count();
        // a cylinder of radius f shrinks a 320 px wide view by about 12%
        assert!(covered as f64 > 0.8 * (320.0 * 180.0));
    }
}
