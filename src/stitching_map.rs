// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! The persisted result of a calibration: where every output pixel comes from.
//!
//! File layout, all fields little-endian:
//!
//! | bytes | field |
//! |---|---|
//! | 4 | `i32` canvas width (both frames side by side) |
//! | 4 | `i32` canvas height |
//! | 4 | `i32` OpenCV pixel type tag, always `CV_32FC2` |
//! | 16 | `i32` crop x, y, width, height |
//! | 8 · crop width · crop height | `(f32 x, f32 y)` row major, source position in the canvas |

use crate::StitcherError;
use crate::crop::CropRect;
use crate::utils;
use opencv::core::{Mat, Size, Vec2f};
use opencv::{core, prelude::*};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Tag stored in the header, the OpenCV type of the coordinate table
pub const MAP_PIXEL_TYPE: i32 = core::CV_32FC2;

const HEADER_FIELDS: usize = 7;

#[derive(Debug, Clone, PartialEq)]
pub struct StitchingMap {
    /// Size of the concatenated input canvas, twice the frame width
    pub width: i32,
    pub height: i32,
    pub pixel_type: i32,
    /// Output rectangle in panorama coordinates
    pub crop: CropRect,
    /// One source position per output pixel, `crop.width * crop.height` entries
    pub coords: Vec<[f32; 2]>,
}

impl StitchingMap {
    pub fn new(
        width: i32,
        height: i32,
        crop: CropRect,
        coords: Vec<[f32; 2]>,
    ) -> Result<Self, StitcherError> {
        let map = Self {
            width,
            height,
            pixel_type: MAP_PIXEL_TYPE,
            crop,
            coords,
        };
        map.validate()?;
        Ok(map)
    }

    /// Cuts `crop` out of a blended `CV_32FC2` coordinate panorama.
    /// `frame_size` is the size of one input frame.
    pub fn from_coordinate_map(
        frame_size: Size,
        coordinate_map: &Mat,
        crop: CropRect,
    ) -> Result<Self, StitcherError> {
        if coordinate_map.typ() != MAP_PIXEL_TYPE {
            return Err(StitcherError::ProcessingError(format!(
                "coordinate maps are CV_32FC2, got type {}",
                coordinate_map.typ()
            )));
        }
        let cropped = utils::crop_typed::<Vec2f>(coordinate_map, crop.into())?;
        let coords = cropped
            .data_typed::<Vec2f>()?
            .iter()
            .map(|v| [v[0], v[1]])
            .collect();
        Self::new(frame_size.width * 2, frame_size.height, crop, coords)
    }

    /// Size of one of the two input frames
    pub fn frame_size(&self) -> Size {
        Size::new(self.width / 2, self.height)
    }

    /// Size of the composited output
    pub fn output_size(&self) -> Size {
        Size::new(self.crop.width, self.crop.height)
    }

    /// Checks the header and every coordinate, [`StitcherError::MapFormatError`] on the
    /// first violation.
    pub fn validate(&self) -> Result<(), StitcherError> {
        Self::validate_header(self.width, self.height, self.pixel_type, &self.crop)?;
        let expected = self.crop.area() as usize;
        if self.coords.len() != expected {
            return Err(StitcherError::MapFormatError(format!(
                "crop {:?} needs {expected} coordinates, the map holds {}",
                self.crop,
                self.coords.len()
            )));
        }
        let (w, h) = (self.width as f32, self.height as f32);
        // (-1, -1) marks output pixels without a source
        if let Some((i, c)) = self.coords.iter().enumerate().find(|(_, c)| {
            !(c[0].is_finite() && c[1].is_finite())
                || c[0] < -1.0
                || c[1] < -1.0
                || c[0] > w
                || c[1] > h
        }) {
            return Err(StitcherError::MapFormatError(format!(
                "coordinate #{i} {c:?} is outside of the {}x{} canvas",
                self.width, self.height
            )));
        }
        Ok(())
    }

    fn validate_header(
        width: i32,
        height: i32,
        pixel_type: i32,
        crop: &CropRect,
    ) -> Result<(), StitcherError> {
        if pixel_type != MAP_PIXEL_TYPE {
            return Err(StitcherError::MapFormatError(format!(
                "unsupported pixel type tag {pixel_type}, expected {MAP_PIXEL_TYPE}"
            )));
        }
        if width <= 0 || height <= 0 || width % 2 != 0 {
            return Err(StitcherError::MapFormatError(format!(
                "invalid canvas size {width}x{height}"
            )));
        }
        if crop.is_empty() || crop.x < 0 || crop.y < 0 {
            return Err(StitcherError::MapFormatError(format!(
                "invalid crop rectangle {crop:?}"
            )));
        }
        // an output can't hold more pixels than the two frames together
        if crop.area() > width as i64 * height as i64 {
            return Err(StitcherError::MapFormatError(format!(
                "crop {crop:?} is larger than the {width}x{height} canvas"
            )));
        }
        Ok(())
    }

    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), StitcherError> {
        let mut writer = BufWriter::new(writer);
        for v in [
            self.width,
            self.height,
            self.pixel_type,
            self.crop.x,
            self.crop.y,
            self.crop.width,
            self.crop.height,
        ] {
            writer.write_all(&v.to_le_bytes())?;
        }
        for c in &self.coords {
            writer.write_all(&c[0].to_le_bytes())?;
            writer.write_all(&c[1].to_le_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads and validates a map. The stream must end right after the last coordinate.
    pub fn read_from<R: Read>(reader: R) -> Result<Self, StitcherError> {
        let mut reader = BufReader::new(reader);
        let mut header = [0_u8; HEADER_FIELDS * 4];
        read_exact_or(&mut reader, &mut header, "header")?;
        let mut fields = header
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]));
        let mut next = || fields.next().unwrap_or_default();
        let (width, height, pixel_type) = (next(), next(), next());
        let crop = CropRect::new(next(), next(), next(), next());
        Self::validate_header(width, height, pixel_type, &crop)?;

        let expected = (crop.area() as u64).checked_mul(8).ok_or_else(|| {
            StitcherError::MapFormatError(format!("crop {crop:?} is too large"))
        })?;
        // grows with the bytes actually present, never with the header's claim
        let mut payload = Vec::new();
        (&mut reader).take(expected).read_to_end(&mut payload)?;
        if (payload.len() as u64) < expected {
            return Err(StitcherError::MapFormatError(format!(
                "truncated coordinate table, {} of {expected} bytes",
                payload.len()
            )));
        }
        let mut extra = [0_u8; 1];
        if reader.read(&mut extra)? != 0 {
            return Err(StitcherError::MapFormatError(
                "trailing bytes after the coordinate table".to_string(),
            ));
        }
        let coords = payload
            .chunks_exact(8)
            .map(|b| {
                [
                    f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                    f32::from_le_bytes([b[4], b[5], b[6], b[7]]),
                ]
            })
            .collect();
        let map = Self {
            width,
            height,
            pixel_type,
            crop,
            coords,
        };
        map.validate()?;
        Ok(map)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), StitcherError> {
        self.write_to(File::create(path.as_ref())?)?;
        tracing::info!(
            "stitching map {:?} written: canvas {}x{}, crop {:?}",
            path.as_ref(),
            self.width,
            self.height,
            self.crop
        );
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StitcherError> {
        let map = Self::read_from(File::open(path.as_ref())?)?;
        tracing::info!(
            "stitching map {:?} loaded: canvas {}x{}, crop {:?}",
            path.as_ref(),
            map.width,
            map.height,
            map.crop
        );
        Ok(map)
    }

    /// The coordinate table as a `CV_32FC2` Mat of the output size, ready for `remap`
    pub fn to_mat(&self) -> Result<Mat, StitcherError> {
        let mut table = utils::zeros(self.crop.height, self.crop.width, MAP_PIXEL_TYPE)?;
        for (dst, src) in table
            .data_typed_mut::<Vec2f>()?
            .iter_mut()
            .zip(self.coords.iter())
        {
            *dst = core::VecN(*src);
        }
        Ok(table)
    }
}

fn read_exact_or<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<(), StitcherError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            StitcherError::MapFormatError(format!("truncated {what}"))
        }
        _ => StitcherError::IoError(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StitchingMap {
        let crop = CropRect::new(3, 1, 4, 2);
        let coords = (0..8).map(|i| [i as f32 * 1.5, 0.25 * i as f32]).collect();
        StitchingMap::new(20, 6, crop, coords).unwrap()
    }

    fn encoded(map: &StitchingMap) -> Vec<u8> {
        let mut bytes = Vec::new();
        map.write_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn header_layout() {
        let bytes = encoded(&sample());
        assert_eq!(bytes.len(), 28 + 8 * 8);
        assert_eq!(&bytes[0..4], &20_i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &core::CV_32FC2.to_le_bytes());
        assert_eq!(&bytes[24..28], &2_i32.to_le_bytes());
        assert_eq!(&bytes[40..44], &0.25_f32.to_le_bytes());
    }

    #[test]
    fn reads_back_what_was_written() {
        let map = sample();
        let decoded = StitchingMap::read_from(encoded(&map).as_slice()).unwrap();
        assert_eq!(decoded, map);
        assert_eq!(decoded.frame_size(), Size::new(10, 6));
        let table = decoded.to_mat().unwrap();
        assert_eq!(table.size().unwrap(), Size::new(4, 2));
        assert_eq!(table.at_2d::<Vec2f>(1, 3).unwrap()[0], 10.5);
    }

    #[test]
    fn truncated_and_padded_maps_fail() {
        let bytes = encoded(&sample());
        for len in [0, 10, 28, bytes.len() - 1] {
            let res = StitchingMap::read_from(&bytes[..len]);
            assert!(matches!(res, Err(StitcherError::MapFormatError(_))), "{len}");
        }
        let mut padded = bytes.clone();
        padded.push(0);
        assert!(matches!(
            StitchingMap::read_from(padded.as_slice()),
            Err(StitcherError::MapFormatError(_))
        ));
    }

    #[test]
    fn bad_header_fails() {
        let mut bytes = encoded(&sample());
        bytes[8..12].copy_from_slice(&core::CV_8UC3.to_le_bytes());
        assert!(matches!(
            StitchingMap::read_from(bytes.as_slice()),
            Err(StitcherError::MapFormatError(_))
        ));

        let mut bytes = encoded(&sample());
        // crop width so large the payload would exceed the canvas
        bytes[20..24].copy_from_slice(&i32::MAX.to_le_bytes());
        assert!(matches!(
            StitchingMap::read_from(bytes.as_slice()),
            Err(StitcherError::MapFormatError(_))
        ));
    }

    #[test]
    fn oversized_header_without_payload_fails() {
        // header only, claiming a 2e9 x 2e9 canvas with a 1e9 x 1e9 crop
        let mut bytes = Vec::new();
        for v in [
            2_000_000_000,
            2_000_000_000,
            core::CV_32FC2,
            0,
            0,
            1_000_000_000,
            1_000_000_000,
        ] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        assert!(matches!(
            StitchingMap::read_from(bytes.as_slice()),
            Err(StitcherError::MapFormatError(_))
        ));
        // a few coordinates short of a large crop
        bytes[20..24].copy_from_slice(&46340_i32.to_le_bytes());
        bytes[24..28].copy_from_slice(&46340_i32.to_le_bytes());
        bytes.extend_from_slice(&[0_u8; 64]);
        assert!(matches!(
            StitchingMap::read_from(bytes.as_slice()),
            Err(StitcherError::MapFormatError(_))
        ));
    }

    #[test]
    fn coordinates_outside_the_canvas_fail() {
        let crop = CropRect::new(0, 0, 1, 1);
        assert!(StitchingMap::new(20, 6, crop, vec![[-1.0, -1.0]]).is_ok());
        for bad in [[25.0, 1.0], [1.0, f32::NAN], [-3.0, 0.0]] {
            assert!(matches!(
                StitchingMap::new(20, 6, crop, vec![bad]),
                Err(StitcherError::MapFormatError(_))
            ));
        }
        assert!(StitchingMap::new(20, 6, crop, vec![]).is_err());
    }
}
