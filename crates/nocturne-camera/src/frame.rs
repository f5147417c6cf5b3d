// Camera frame model shared by the exposure and video pipelines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pixel formats the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageFormat {
    Raw8,
    #[default]
    Raw16,
    Rgb24,
}

impl ImageFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ImageFormat::Raw8 => 1,
            ImageFormat::Raw16 => 2,
            ImageFormat::Rgb24 => 3,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RAW8" => Some(ImageFormat::Raw8),
            "RAW16" => Some(ImageFormat::Raw16),
            "RGB24" => Some(ImageFormat::Rgb24),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Raw8 => "RAW8",
            ImageFormat::Raw16 => "RAW16",
            ImageFormat::Rgb24 => "RGB24",
        }
    }
}

/// One captured frame.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    pub width: u32,
    pub height: u32,
    pub binning: u32,
    pub format: ImageFormat,
    pub is_dark: bool,
    /// Exposure duration in seconds.
    pub exposure_secs: f64,
    pub captured_at: DateTime<Utc>,
    pub data: Vec<u8>,
}

impl CameraFrame {
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing() {
        assert_eq!(ImageFormat::parse("RAW8"), Some(ImageFormat::Raw8));
        assert_eq!(ImageFormat::parse("RGB24"), Some(ImageFormat::Rgb24));
        assert_eq!(ImageFormat::parse("FITS"), None);
        assert_eq!(ImageFormat::Raw16.bytes_per_pixel(), 2);
    }
}
