// Thread-safe facade over the camera driver.
//
// Scoped locks: an SDK lifecycle lock, a connection lock, and a control-caps
// lock. Callers never see raw driver codes; failures are translated into the
// engine taxonomy and the last error string is retained for diagnostics.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use nocturne_types::{EngineError, Result};

use crate::driver::{
    CameraDriver, CameraInfo, ControlCaps, ControlKind, DriverCode, DriverError, ExposureHwStatus,
    GuideDirection, RoiFormat, TriggerPin,
};

#[derive(Default)]
struct SdkState {
    initialized: bool,
}

#[derive(Default)]
struct ConnectionState {
    connected: bool,
    camera_id: i32,
    device_name: String,
    info: Option<CameraInfo>,
}

pub struct HardwareInterface {
    driver: Arc<dyn CameraDriver>,
    sdk: Mutex<SdkState>,
    connection: RwLock<ConnectionState>,
    caps: RwLock<Vec<ControlCaps>>,
    last_error: StdMutex<String>,
}

impl HardwareInterface {
    pub fn new(driver: Arc<dyn CameraDriver>) -> Self {
        Self {
            driver,
            sdk: Mutex::new(SdkState::default()),
            connection: RwLock::new(ConnectionState::default()),
            caps: RwLock::new(Vec::new()),
            last_error: StdMutex::new(String::new()),
        }
    }

    // ------------------------------------------------------------------
    // SDK lifecycle
    // ------------------------------------------------------------------

    pub async fn initialize(&self) -> Result<()> {
        let mut sdk = self.sdk.lock().await;
        if sdk.initialized {
            return Ok(());
        }
        sdk.initialized = true;
        info!(version = %self.driver.sdk_version(), "camera SDK initialized");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        if self.is_connected().await {
            self.disconnect().await?;
        }
        let mut sdk = self.sdk.lock().await;
        sdk.initialized = false;
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.sdk.lock().await.initialized
    }

    async fn require_initialized(&self) -> Result<()> {
        if !self.is_initialized().await {
            return Err(EngineError::Resource("camera SDK not initialized".into()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    pub async fn enumerate_devices(&self) -> Result<Vec<CameraInfo>> {
        self.require_initialized().await?;
        self.driver
            .enumerate()
            .await
            .map_err(|e| self.translate("enumerate", e))
    }

    /// Opens the named device. One device may be open per interface.
    pub async fn connect(&self, device_name: &str) -> Result<()> {
        self.require_initialized().await?;
        let mut connection = self.connection.write().await;
        if connection.connected {
            return Err(EngineError::InvalidOperation(format!(
                "already connected to {}",
                connection.device_name
            )));
        }
        let devices = self
            .driver
            .enumerate()
            .await
            .map_err(|e| self.translate("enumerate", e))?;
        let info = devices
            .into_iter()
            .find(|d| d.name == device_name)
            .ok_or_else(|| EngineError::NotFound(format!("camera '{device_name}'")))?;

        self.driver
            .open(info.id)
            .await
            .map_err(|e| self.translate("open", e))?;
        if let Err(e) = self.driver.init(info.id).await {
            // roll the open back so the device is not left half-claimed
            let _ = self.driver.close(info.id).await;
            return Err(self.translate("init", e));
        }
        let caps = self
            .driver
            .control_caps(info.id)
            .await
            .map_err(|e| self.translate("control_caps", e))?;

        *self.caps.write().await = caps;
        connection.connected = true;
        connection.camera_id = info.id;
        connection.device_name = info.name.clone();
        connection.info = Some(info);
        info!(device = %device_name, "camera connected");
        Ok(())
    }

    /// Connects to the first enumerated device.
    pub async fn connect_first(&self) -> Result<String> {
        let devices = self.enumerate_devices().await?;
        let first = devices
            .first()
            .ok_or_else(|| EngineError::Resource("no cameras found".into()))?;
        let name = first.name.clone();
        self.connect(&name).await?;
        Ok(name)
    }

    pub async fn disconnect(&self) -> Result<()> {
        let mut connection = self.connection.write().await;
        if !connection.connected {
            return Ok(());
        }
        let id = connection.camera_id;
        connection.connected = false;
        connection.info = None;
        connection.device_name.clear();
        self.caps.write().await.clear();
        self.driver
            .close(id)
            .await
            .map_err(|e| self.translate("close", e))?;
        debug!(camera = id, "camera disconnected");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.connected
    }

    pub async fn device_name(&self) -> Option<String> {
        let connection = self.connection.read().await;
        connection.connected.then(|| connection.device_name.clone())
    }

    pub async fn camera_info(&self) -> Option<CameraInfo> {
        self.connection.read().await.info.clone()
    }

    async fn require_camera(&self) -> Result<i32> {
        let connection = self.connection.read().await;
        if !connection.connected {
            return Err(EngineError::Resource("camera not connected".into()));
        }
        Ok(connection.camera_id)
    }

    // ------------------------------------------------------------------
    // Controls
    // ------------------------------------------------------------------

    pub async fn control_caps(&self) -> Vec<ControlCaps> {
        self.caps.read().await.clone()
    }

    pub async fn has_control(&self, control: ControlKind) -> bool {
        self.caps.read().await.iter().any(|c| c.control == control)
    }

    pub async fn set_control(&self, control: ControlKind, value: i64, auto: bool) -> Result<()> {
        let id = self.require_camera().await?;
        self.driver
            .set_control_value(id, control, value, auto)
            .await
            .map_err(|e| self.translate("set_control", e))
    }

    pub async fn get_control(&self, control: ControlKind) -> Result<(i64, bool)> {
        let id = self.require_camera().await?;
        self.driver
            .get_control_value(id, control)
            .await
            .map_err(|e| self.translate("get_control", e))
    }

    pub async fn set_roi(&self, roi: RoiFormat) -> Result<()> {
        let id = self.require_camera().await?;
        self.driver
            .set_roi_format(id, roi)
            .await
            .map_err(|e| self.translate("set_roi", e))
    }

    pub async fn get_roi(&self) -> Result<RoiFormat> {
        let id = self.require_camera().await?;
        self.driver
            .get_roi_format(id)
            .await
            .map_err(|e| self.translate("get_roi", e))
    }

    // ------------------------------------------------------------------
    // Exposure / video / guiding
    // ------------------------------------------------------------------

    pub async fn start_exposure(&self, is_dark: bool) -> Result<()> {
        let id = self.require_camera().await?;
        self.driver
            .start_exposure(id, is_dark)
            .await
            .map_err(|e| self.translate("start_exposure", e))
    }

    pub async fn stop_exposure(&self) -> Result<()> {
        let id = self.require_camera().await?;
        self.driver
            .stop_exposure(id)
            .await
            .map_err(|e| self.translate("stop_exposure", e))
    }

    pub async fn exposure_status(&self) -> Result<ExposureHwStatus> {
        let id = self.require_camera().await?;
        self.driver
            .exposure_status(id)
            .await
            .map_err(|e| self.translate("exposure_status", e))
    }

    pub async fn image_data(&self, len: usize) -> Result<Vec<u8>> {
        let id = self.require_camera().await?;
        self.driver
            .image_data(id, len)
            .await
            .map_err(|e| self.translate("image_data", e))
    }

    pub async fn start_video_capture(&self) -> Result<()> {
        let id = self.require_camera().await?;
        self.driver
            .start_video_capture(id)
            .await
            .map_err(|e| self.translate("start_video_capture", e))
    }

    pub async fn stop_video_capture(&self) -> Result<()> {
        let id = self.require_camera().await?;
        self.driver
            .stop_video_capture(id)
            .await
            .map_err(|e| self.translate("stop_video_capture", e))
    }

    pub async fn video_data(&self, len: usize, wait_ms: u32) -> Result<Vec<u8>> {
        let id = self.require_camera().await?;
        self.driver
            .video_data(id, len, wait_ms)
            .await
            .map_err(|e| self.translate("video_data", e))
    }

    /// Fires an ST4 pulse for `duration_ms`.
    pub async fn pulse_guide(&self, direction: GuideDirection, duration_ms: u32) -> Result<()> {
        let id = self.require_camera().await?;
        self.driver
            .pulse_guide_on(id, direction)
            .await
            .map_err(|e| self.translate("pulse_guide_on", e))?;
        tokio::time::sleep(std::time::Duration::from_millis(u64::from(duration_ms))).await;
        self.driver
            .pulse_guide_off(id, direction)
            .await
            .map_err(|e| self.translate("pulse_guide_off", e))
    }

    pub async fn serial_number(&self) -> Result<String> {
        let id = self.require_camera().await?;
        self.driver
            .serial_number(id)
            .await
            .map_err(|e| self.translate("serial_number", e))
    }

    pub async fn send_soft_trigger(&self, start: bool) -> Result<()> {
        let id = self.require_camera().await?;
        self.driver
            .send_soft_trigger(id, start)
            .await
            .map_err(|e| self.translate("send_soft_trigger", e))
    }

    pub async fn set_trigger_output(
        &self,
        pin: TriggerPin,
        high: bool,
        delay_us: i64,
    ) -> Result<()> {
        let id = self.require_camera().await?;
        self.driver
            .set_trigger_output(id, pin, high, delay_us)
            .await
            .map_err(|e| self.translate("set_trigger_output", e))
    }

    pub fn sdk_version(&self) -> String {
        self.driver.sdk_version()
    }

    pub fn last_error(&self) -> String {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn translate(&self, operation: &str, error: DriverError) -> EngineError {
        let message = format!("{operation}: {error}");
        warn!(%message, "driver call failed");
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = message.clone();
        match error.code {
            DriverCode::Timeout => EngineError::Timeout(message),
            DriverCode::NotOpened | DriverCode::NotInitialized | DriverCode::Closed => {
                EngineError::Resource(message)
            }
            _ => EngineError::Device(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedCamera;

    async fn connected_interface() -> HardwareInterface {
        let hw = HardwareInterface::new(Arc::new(SimulatedCamera::new(2)));
        hw.initialize().await.unwrap();
        hw.connect("Nocturne Sim 0").await.unwrap();
        hw
    }

    #[tokio::test]
    async fn sdk_must_be_initialized_before_enumeration() {
        let hw = HardwareInterface::new(Arc::new(SimulatedCamera::new(1)));
        let err = hw.enumerate_devices().await.unwrap_err();
        assert_eq!(err.kind(), "resource");
    }

    #[tokio::test]
    async fn only_one_device_open_per_interface() {
        let hw = connected_interface().await;
        let err = hw.connect("Nocturne Sim 1").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_operation");
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let hw = HardwareInterface::new(Arc::new(SimulatedCamera::new(1)));
        hw.initialize().await.unwrap();
        let err = hw.connect("ZWO ASI2600MM").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn control_roundtrip_is_a_noop() {
        let hw = connected_interface().await;
        let (gain, auto) = hw.get_control(ControlKind::Gain).await.unwrap();
        hw.set_control(ControlKind::Gain, gain, auto).await.unwrap();
        assert_eq!(hw.get_control(ControlKind::Gain).await.unwrap(), (gain, auto));
    }

    #[tokio::test]
    async fn driver_failures_record_last_error() {
        let hw = connected_interface().await;
        let err = hw.image_data(16).await.unwrap_err();
        assert_eq!(err.kind(), "device");
        assert!(hw.last_error().contains("image_data"));
    }

    #[tokio::test]
    async fn disconnect_clears_caps_and_is_idempotent() {
        let hw = connected_interface().await;
        assert!(hw.has_control(ControlKind::Gain).await);
        hw.disconnect().await.unwrap();
        assert!(!hw.has_control(ControlKind::Gain).await);
        hw.disconnect().await.unwrap();
    }
}
