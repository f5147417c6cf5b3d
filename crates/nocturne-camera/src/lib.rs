pub mod controller;
pub mod cooling;
pub mod driver;
pub mod exposure;
pub mod frame;
pub mod hardware;
pub mod image;
pub mod properties;
pub mod sim;
pub mod video;

pub use controller::{CameraController, CameraStateSnapshot};
pub use cooling::{CoolerState, CoolingSettings, PidParams, TemperatureController};
pub use driver::{
    CameraDriver, CameraInfo, ControlCaps, ControlKind, DriverCode, DriverError, ExposureHwStatus,
    GuideDirection, RoiFormat, TriggerPin,
};
pub use exposure::{ExposureManager, ExposureResult, ExposureSettings, ExposureState};
pub use frame::{CameraFrame, ImageFormat};
pub use hardware::HardwareInterface;
pub use image::{FrameStatistics, ImageProcessor};
pub use properties::PropertyManager;
pub use sim::SimulatedCamera;
pub use video::{DropPolicy, VideoManager, VideoSettings, VideoState, VideoStatistics};
