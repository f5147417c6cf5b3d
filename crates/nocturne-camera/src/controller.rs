// Camera controller: one coherent device facade over the hardware interface
// and its single-responsibility sub-components.
//
// The controller is the ownership root: every sub-component shares the same
// `Arc<HardwareInterface>` and none of them holds a reference back to the
// controller.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use nocturne_types::Result;

use crate::cooling::{CoolerState, TemperatureController};
use crate::driver::{CameraDriver, CameraInfo, ControlKind, RoiFormat};
use crate::exposure::{ExposureManager, ExposureState};
use crate::hardware::HardwareInterface;
use crate::properties::PropertyManager;
use crate::video::{VideoManager, VideoState};

/// Point-in-time view of the whole camera state machine.
#[derive(Debug, Clone, Serialize)]
pub struct CameraStateSnapshot {
    pub device: Option<String>,
    pub connected: bool,
    pub exposure_state: ExposureState,
    pub cooler_state: CoolerState,
    pub video_state: VideoState,
    pub gain: Option<i64>,
    pub offset: Option<i64>,
    pub temperature: Option<f64>,
    pub cooler_power: Option<f64>,
    pub roi: Option<RoiFormat>,
}

pub struct CameraController {
    hardware: Arc<HardwareInterface>,
    properties: PropertyManager,
    exposure: ExposureManager,
    cooling: TemperatureController,
    video: VideoManager,
}

impl CameraController {
    pub fn new(driver: Arc<dyn CameraDriver>) -> Self {
        let hardware = Arc::new(HardwareInterface::new(driver));
        Self {
            properties: PropertyManager::new(hardware.clone()),
            exposure: ExposureManager::new(hardware.clone()),
            cooling: TemperatureController::new(hardware.clone()),
            video: VideoManager::new(hardware.clone()),
            hardware,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Initializes the SDK and connects the named device (or the first one
    /// found when `device_name` is None).
    pub async fn connect(&self, device_name: Option<&str>) -> Result<String> {
        self.hardware.initialize().await?;
        let name = match device_name {
            Some(name) => {
                self.hardware.connect(name).await?;
                name.to_string()
            }
            None => self.hardware.connect_first().await?,
        };
        Ok(name)
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.exposure.abort_exposure();
        self.exposure.wait().await;
        self.video.stop_video().await?;
        self.cooling.stop_cooling().await?;
        self.hardware.disconnect().await
    }

    /// Tears the device down completely. Safe to call repeatedly and after a
    /// partial initialization; a disconnected controller is a no-op.
    pub async fn destroy(&self) -> Result<()> {
        if self.hardware.is_connected().await {
            self.disconnect().await?;
        }
        self.hardware.shutdown().await?;
        info!("camera controller destroyed");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.hardware.is_connected().await
    }

    pub async fn device_name(&self) -> Option<String> {
        self.hardware.device_name().await
    }

    pub async fn camera_info(&self) -> Option<CameraInfo> {
        self.hardware.camera_info().await
    }

    // ------------------------------------------------------------------
    // Sub-components
    // ------------------------------------------------------------------

    pub fn hardware(&self) -> &Arc<HardwareInterface> {
        &self.hardware
    }

    pub fn properties(&self) -> &PropertyManager {
        &self.properties
    }

    pub fn exposure(&self) -> &ExposureManager {
        &self.exposure
    }

    pub fn cooling(&self) -> &TemperatureController {
        &self.cooling
    }

    pub fn video(&self) -> &VideoManager {
        &self.video
    }

    // ------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------

    pub async fn snapshot(&self) -> CameraStateSnapshot {
        let connected = self.hardware.is_connected().await;
        let (gain, offset, temperature, roi) = if connected {
            (
                self.properties.gain().await.ok(),
                self.properties.offset().await.ok(),
                self.properties.temperature().await.ok(),
                self.properties.roi().await.ok(),
            )
        } else {
            (None, None, None, None)
        };
        CameraStateSnapshot {
            device: self.hardware.device_name().await,
            connected,
            exposure_state: self.exposure.state(),
            cooler_state: self.cooling.state(),
            video_state: self.video.state(),
            gain,
            offset,
            temperature,
            cooler_power: connected.then(|| self.cooling.current_info().cooler_power),
            roi,
        }
    }

    /// Convenience used by tasks: true when neither an exposure nor video is
    /// active.
    pub async fn is_quiet(&self) -> bool {
        !self.exposure.is_exposing() && self.video.state() == VideoState::Idle
    }

    pub async fn sensor_temperature(&self) -> Result<f64> {
        self.properties.temperature().await
    }

    pub async fn set_gain_offset(&self, gain: i64, offset: i64) -> Result<()> {
        self.properties.set_gain(gain).await?;
        self.properties.set_offset(offset).await
    }

    pub async fn has_cooler(&self) -> bool {
        self.hardware.has_control(ControlKind::CoolerOn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exposure::ExposureSettings;
    use crate::frame::ImageFormat;
    use crate::sim::SimulatedCamera;

    fn controller() -> CameraController {
        CameraController::new(Arc::new(SimulatedCamera::new(1)))
    }

    #[tokio::test]
    async fn connect_snapshot_disconnect() {
        let camera = controller();
        let name = camera.connect(None).await.unwrap();
        assert_eq!(name, "Nocturne Sim 0");

        let snapshot = camera.snapshot().await;
        assert!(snapshot.connected);
        assert_eq!(snapshot.exposure_state, ExposureState::Idle);
        assert_eq!(snapshot.cooler_state, CoolerState::Off);
        assert_eq!(snapshot.video_state, VideoState::Idle);
        assert!(snapshot.gain.is_some());

        camera.disconnect().await.unwrap();
        assert!(!camera.is_connected().await);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let camera = controller();
        camera.connect(None).await.unwrap();
        camera.destroy().await.unwrap();
        camera.destroy().await.unwrap();
        assert!(!camera.is_connected().await);
    }

    #[tokio::test]
    async fn destroy_after_partial_init_is_a_noop() {
        let camera = controller();
        // never connected
        camera.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn exposure_through_controller() {
        let camera = controller();
        camera.connect(None).await.unwrap();
        camera
            .exposure()
            .start_exposure(ExposureSettings {
                duration_secs: 0.05,
                width: 32,
                height: 32,
                format: ImageFormat::Raw8,
                ..ExposureSettings::default()
            })
            .await
            .unwrap();
        let result = camera.exposure().wait().await;
        assert!(result.success);
        assert!(camera.is_quiet().await);
        camera.destroy().await.unwrap();
    }
}
