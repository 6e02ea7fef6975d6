// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Calibration tunables.

use crate::StitcherError;
use std::path::Path;

/// Seam estimation strategy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SeamFinderKind {
    /// Minimum colour-discontinuity cut through the overlap.
    #[default]
    GraphCut,
    /// Every overlap pixel goes to the closest exclusive region.
    Voronoi,
}

/// Pixel blender used when composing the panorama.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum BlendKind {
    /// Seam-masked pixels are copied as they are. This is what the stitching map replays.
    #[default]
    Overwrite,
    /// Laplacian pyramid blending with the given number of bands.
    MultiBand(u32),
}

/// How the output rectangle is picked inside the panorama coverage.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CropStrategy {
    /// The largest axis aligned rectangle inside the coverage mask.
    MaxInscribed,
    /// [`CropStrategy::MaxInscribed`] trimmed to the target aspect ratio.
    MaxInscribedAspect,
    /// A rectangle of the target aspect ratio grown to the target size.
    #[default]
    AspectConstrained,
}

/// Intrinsic parameters the bundle adjuster is allowed to vary.
/// The relative rotation is always refined.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RefineMask {
    pub focal: bool,
    pub ppx: bool,
    pub ppy: bool,
    pub aspect: bool,
}

impl Default for RefineMask {
    fn default() -> Self {
        Self {
            focal: true,
            ppx: true,
            ppy: true,
            aspect: true,
        }
    }
}

/// Parameters for a calibration run.
///
/// The defaults are tuned for a pair of 2880x1620 frames and a 3840x1080 output.
/// ```
/// # use libstitcher::prelude::*;
/// let config = StitchConfig {
///     seam_finder: SeamFinderKind::Voronoi,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// assert_eq!(config.match_confidence, 0.54);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct StitchConfig {
    /// Resolution budget (megapixels) for feature detection, matching and registration.
    /// A non-positive value means native resolution.
    pub work_megapix: f64,
    /// Resolution budget (megapixels) for seam estimation.
    pub seam_megapix: f64,
    /// Resolution budget (megapixels) for composition. Non-positive means native resolution.
    pub compose_megapix: f64,
    /// Match quality in `0..1`: a match is kept when `best < (1 - match_confidence) * second_best`.
    pub match_confidence: f32,
    /// Minimum pair confidence the bundle adjuster accepts.
    pub adjuster_confidence: f64,
    /// Output aspect ratio, width / height.
    pub target_aspect: f64,
    pub target_width: i32,
    pub target_height: i32,
    pub crop: CropStrategy,
    pub seam_finder: SeamFinderKind,
    pub blend: BlendKind,
    pub refine_mask: RefineMask,
    pub max_adjuster_iterations: usize,
    /// Produce a [`crate::StitchingMap`] next to the panorama.
    pub generate_map: bool,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            work_megapix: 0.6,
            seam_megapix: 0.1,
            compose_megapix: -1.0,
            match_confidence: 0.54,
            adjuster_confidence: 0.7,
            target_aspect: 32.0 / 9.0,
            target_width: 3840,
            target_height: 1080,
            crop: CropStrategy::default(),
            seam_finder: SeamFinderKind::default(),
            blend: BlendKind::default(),
            refine_mask: RefineMask::default(),
            max_adjuster_iterations: 100,
            generate_map: true,
        }
    }
}

impl StitchConfig {
    pub fn validate(&self) -> Result<(), StitcherError> {
        let budgets = [
            ("work_megapix", self.work_megapix),
            ("seam_megapix", self.seam_megapix),
            ("compose_megapix", self.compose_megapix),
        ];
        if let Some((name, v)) = budgets.iter().find(|(_, v)| !v.is_finite()) {
            return Err(StitcherError::InvalidParams(format!("{name} = {v}")));
        }
        if !(0.0..1.0).contains(&self.match_confidence) {
            return Err(StitcherError::InvalidParams(format!(
                "match_confidence must be in [0, 1): {}",
                self.match_confidence
            )));
        }
        if !(self.adjuster_confidence.is_finite() && self.adjuster_confidence >= 0.0) {
            return Err(StitcherError::InvalidParams(format!(
                "adjuster_confidence = {}",
                self.adjuster_confidence
            )));
        }
        if !(self.target_aspect.is_finite() && self.target_aspect > 0.0) {
            return Err(StitcherError::InvalidParams(format!(
                "target_aspect = {}",
                self.target_aspect
            )));
        }
        if self.target_width <= 0 || self.target_height <= 0 {
            return Err(StitcherError::InvalidParams(format!(
                "target size {}x{}",
                self.target_width, self.target_height
            )));
        }
        if let BlendKind::MultiBand(bands) = self.blend {
            if bands == 0 || bands > 10 {
                return Err(StitcherError::InvalidParams(format!(
                    "multi band blender needs 1..=10 bands, got {bands}"
                )));
            }
        }
        if self.max_adjuster_iterations == 0 {
            return Err(StitcherError::InvalidParams(
                "max_adjuster_iterations must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Applies a tuning file. Each line holds a `name value` pair, recognized names are
    /// `work_megapix`, `seam_megapix`, `compose_megapix`, `conf_thresh` and `match_conf`.
    /// Values are clamped to at most 1.0, anything else is skipped.
    pub fn apply_conf_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), StitcherError> {
        let text = std::fs::read_to_string(path)?;
        self.apply_conf_str(&text);
        Ok(())
    }

    /// ```
    /// # use libstitcher::prelude::*;
    /// let mut config = StitchConfig::default();
    /// config.apply_conf_str("work_megapix 0.3\nmatch_conf 0.65\nconf_thresh 2.0\nbogus 1\n");
    /// assert_eq!(config.work_megapix, 0.3);
    /// assert_eq!(config.match_confidence, 0.65);
    /// assert_eq!(config.adjuster_confidence, 1.0);
    /// ```
    pub fn apply_conf_str(&mut self, text: &str) {
        for line in text.lines() {
            let mut tokens = line.split_whitespace();
            let (Some(name), Some(value)) = (tokens.next(), tokens.next()) else {
                continue;
            };
            let Ok(value) = value.parse::<f64>() else {
                tracing::debug!("ignoring tuning line {line:?}");
                continue;
            };
            let value = value.min(1.0);
            match name {
                "work_megapix" => self.work_megapix = value,
                "seam_megapix" => self.seam_megapix = value,
                "compose_megapix" => self.compose_megapix = value,
                "conf_thresh" => self.adjuster_confidence = value,
                "match_conf" => self.match_confidence = value as f32,
                _ => tracing::debug!("ignoring unknown tuning key {name}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(StitchConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let bad = [
            StitchConfig {
                match_confidence: 1.5,
                ..Default::default()
            },
            StitchConfig {
                target_aspect: 0.0,
                ..Default::default()
            },
            StitchConfig {
                work_megapix: f64::NAN,
                ..Default::default()
            },
            StitchConfig {
                blend: BlendKind::MultiBand(0),
                ..Default::default()
            },
            StitchConfig {
                target_height: -4,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(
                config.validate(),
                Err(StitcherError::InvalidParams(_))
            ));
        }
    }

    #[test]
    fn conf_file_overrides_and_clamps() {
        let dir = std::env::temp_dir().join("libstitcher_conf_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stitch.conf");
        std::fs::write(&path, "seam_megapix 0.05\ncompose_megapix 3.0\n\n# comment\n").unwrap();

        let mut config = StitchConfig::default();
        config.apply_conf_file(&path).unwrap();
        assert_eq!(config.seam_megapix, 0.05);
        assert_eq!(config.compose_megapix, 1.0);
        assert_eq!(config.work_megapix, 0.6);

        assert!(matches!(
            config.apply_conf_file(dir.join("missing.conf")),
            Err(StitcherError::IoError(_))
        ));
    }
}
