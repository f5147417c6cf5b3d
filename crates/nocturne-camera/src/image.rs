// Frame-level processing helpers.

use serde::Serialize;

use nocturne_types::{EngineError, Result};

use crate::frame::{CameraFrame, ImageFormat};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FrameStatistics {
    pub min: u16,
    pub max: u16,
    pub mean: f64,
    pub stddev: f64,
}

pub struct ImageProcessor;

impl ImageProcessor {
    /// Pixel statistics for a RAW8 or RAW16 frame.
    pub fn statistics(frame: &CameraFrame) -> Result<FrameStatistics> {
        let values: Vec<u16> = match frame.format {
            ImageFormat::Raw8 => frame.data.iter().map(|&b| u16::from(b)).collect(),
            ImageFormat::Raw16 => frame
                .data
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
            ImageFormat::Rgb24 => {
                return Err(EngineError::Validation(
                    "statistics are only defined for RAW frames".into(),
                ))
            }
        };
        if values.is_empty() {
            return Ok(FrameStatistics::default());
        }

        let mut min = u16::MAX;
        let mut max = 0u16;
        let mut sum = 0u64;
        for &v in &values {
            min = min.min(v);
            max = max.max(v);
            sum += u64::from(v);
        }
        let mean = sum as f64 / values.len() as f64;
        let variance = values
            .iter()
            .map(|&v| (f64::from(v) - mean).powi(2))
            .sum::<f64>()
            / values.len() as f64;

        Ok(FrameStatistics {
            min,
            max,
            mean,
            stddev: variance.sqrt(),
        })
    }

    /// Expands a RAW8 frame to RAW16, scaling into the full 16-bit range.
    pub fn expand_to_16bit(frame: &CameraFrame) -> Result<CameraFrame> {
        if frame.format != ImageFormat::Raw8 {
            return Err(EngineError::Validation(
                "expand_to_16bit expects a RAW8 frame".into(),
            ));
        }
        let mut data = Vec::with_capacity(frame.data.len() * 2);
        for &b in &frame.data {
            let v = u16::from(b) << 8 | u16::from(b);
            data.extend_from_slice(&v.to_le_bytes());
        }
        Ok(CameraFrame {
            format: ImageFormat::Raw16,
            data,
            ..frame.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn raw8_frame(data: Vec<u8>) -> CameraFrame {
        CameraFrame {
            width: data.len() as u32,
            height: 1,
            binning: 1,
            format: ImageFormat::Raw8,
            is_dark: false,
            exposure_secs: 1.0,
            captured_at: Utc::now(),
            data,
        }
    }

    #[test]
    fn statistics_over_known_pixels() {
        let frame = raw8_frame(vec![0, 100, 200]);
        let stats = ImageProcessor::statistics(&frame).unwrap();
        assert_eq!(stats.min, 0);
        assert_eq!(stats.max, 200);
        assert!((stats.mean - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn expansion_scales_full_range() {
        let frame = raw8_frame(vec![0, 255]);
        let wide = ImageProcessor::expand_to_16bit(&frame).unwrap();
        assert_eq!(wide.format, ImageFormat::Raw16);
        assert_eq!(wide.data.len(), 4);
        let last = u16::from_le_bytes([wide.data[2], wide.data[3]]);
        assert_eq!(last, u16::MAX);
    }

    #[test]
    fn rgb_statistics_rejected() {
        let mut frame = raw8_frame(vec![1, 2, 3]);
        frame.format = ImageFormat::Rgb24;
        assert!(ImageProcessor::statistics(&frame).is_err());
    }
}
