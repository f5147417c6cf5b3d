// Vendor SDK contract.
//
// The engine never links a vendor SDK directly; it talks to this trait. Each
// call returns a structured status so the hardware facade can translate
// driver failures into the engine error taxonomy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::ImageFormat;

/// Structured driver status codes, mirroring what vendor SDKs report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverCode {
    InvalidId,
    InvalidControl,
    InvalidValue,
    NotOpened,
    NotInitialized,
    Closed,
    Removed,
    Timeout,
    Busy,
    GeneralError,
}

#[derive(Debug, Clone, Error)]
#[error("{code:?}: {message}")]
pub struct DriverError {
    pub code: DriverCode,
    pub message: String,
}

impl DriverError {
    pub fn new(code: DriverCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Camera properties reported at enumeration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraInfo {
    pub id: i32,
    pub name: String,
    pub serial_number: String,
    pub max_width: u32,
    pub max_height: u32,
    pub is_color: bool,
    pub bit_depth: u8,
    pub has_cooler: bool,
    pub has_st4_port: bool,
}

/// Typed control channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Gain,
    Offset,
    /// Exposure time in microseconds.
    Exposure,
    /// Sensor temperature readout in tenths of a degree Celsius (read-only).
    Temperature,
    /// Cooling setpoint in degrees Celsius.
    TargetTemperature,
    /// Cooler drive power, 0-100.
    CoolerPower,
    /// Cooler enable switch, 0 or 1.
    CoolerOn,
    Flip,
    BandwidthOverload,
    HighSpeedMode,
}

/// Capability record for one control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlCaps {
    pub control: ControlKind,
    pub name: String,
    pub description: String,
    pub min: i64,
    pub max: i64,
    pub default: i64,
    pub is_auto_supported: bool,
    pub is_writable: bool,
}

/// ROI plus binning and pixel format, set as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiFormat {
    pub start_x: u32,
    pub start_y: u32,
    pub width: u32,
    pub height: u32,
    pub binning: u32,
    pub format: ImageFormat,
}

/// Hardware-reported exposure progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureHwStatus {
    Idle,
    Working,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuideDirection {
    North,
    South,
    East,
    West,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPin {
    Output1,
    Output2,
}

/// The abstract device SDK the hardware facade drives.
#[async_trait]
pub trait CameraDriver: Send + Sync {
    async fn enumerate(&self) -> DriverResult<Vec<CameraInfo>>;
    async fn open(&self, id: i32) -> DriverResult<()>;
    async fn init(&self, id: i32) -> DriverResult<()>;
    async fn close(&self, id: i32) -> DriverResult<()>;

    async fn control_caps(&self, id: i32) -> DriverResult<Vec<ControlCaps>>;
    async fn set_control_value(
        &self,
        id: i32,
        control: ControlKind,
        value: i64,
        auto: bool,
    ) -> DriverResult<()>;
    /// Returns `(value, is_auto)`.
    async fn get_control_value(&self, id: i32, control: ControlKind) -> DriverResult<(i64, bool)>;

    async fn set_roi_format(&self, id: i32, roi: RoiFormat) -> DriverResult<()>;
    async fn get_roi_format(&self, id: i32) -> DriverResult<RoiFormat>;

    async fn start_exposure(&self, id: i32, is_dark: bool) -> DriverResult<()>;
    async fn stop_exposure(&self, id: i32) -> DriverResult<()>;
    async fn exposure_status(&self, id: i32) -> DriverResult<ExposureHwStatus>;
    async fn image_data(&self, id: i32, len: usize) -> DriverResult<Vec<u8>>;

    async fn start_video_capture(&self, id: i32) -> DriverResult<()>;
    async fn stop_video_capture(&self, id: i32) -> DriverResult<()>;
    /// Blocks up to `wait_ms` for the next frame.
    async fn video_data(&self, id: i32, len: usize, wait_ms: u32) -> DriverResult<Vec<u8>>;

    async fn pulse_guide_on(&self, id: i32, direction: GuideDirection) -> DriverResult<()>;
    async fn pulse_guide_off(&self, id: i32, direction: GuideDirection) -> DriverResult<()>;

    async fn serial_number(&self, id: i32) -> DriverResult<String>;
    async fn send_soft_trigger(&self, id: i32, start: bool) -> DriverResult<()>;
    async fn set_trigger_output(
        &self,
        id: i32,
        pin: TriggerPin,
        high: bool,
        delay_us: i64,
    ) -> DriverResult<()>;

    fn sdk_version(&self) -> String;
}
