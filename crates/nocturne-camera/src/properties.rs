// Typed property access over the hardware facade.

use std::sync::Arc;

use nocturne_types::{EngineError, Result};

use crate::driver::{ControlCaps, ControlKind, RoiFormat};
use crate::hardware::HardwareInterface;

pub struct PropertyManager {
    hardware: Arc<HardwareInterface>,
}

impl PropertyManager {
    pub fn new(hardware: Arc<HardwareInterface>) -> Self {
        Self { hardware }
    }

    pub async fn capability(&self, control: ControlKind) -> Option<ControlCaps> {
        self.hardware
            .control_caps()
            .await
            .into_iter()
            .find(|c| c.control == control)
    }

    /// Validates a value against the device's reported range before writing.
    async fn set_checked(&self, control: ControlKind, value: i64) -> Result<()> {
        if let Some(caps) = self.capability(control).await {
            if !caps.is_writable {
                return Err(EngineError::Validation(format!(
                    "{} is read-only",
                    caps.name
                )));
            }
            if value < caps.min || value > caps.max {
                return Err(EngineError::Validation(format!(
                    "{} value {} outside [{}, {}]",
                    caps.name, value, caps.min, caps.max
                )));
            }
        }
        self.hardware.set_control(control, value, false).await
    }

    pub async fn gain(&self) -> Result<i64> {
        Ok(self.hardware.get_control(ControlKind::Gain).await?.0)
    }

    pub async fn set_gain(&self, value: i64) -> Result<()> {
        self.set_checked(ControlKind::Gain, value).await
    }

    pub async fn offset(&self) -> Result<i64> {
        Ok(self.hardware.get_control(ControlKind::Offset).await?.0)
    }

    pub async fn set_offset(&self, value: i64) -> Result<()> {
        self.set_checked(ControlKind::Offset, value).await
    }

    pub async fn exposure_micros(&self) -> Result<i64> {
        Ok(self.hardware.get_control(ControlKind::Exposure).await?.0)
    }

    pub async fn set_exposure_micros(&self, value: i64) -> Result<()> {
        self.set_checked(ControlKind::Exposure, value).await
    }

    /// Sensor temperature in degrees Celsius.
    pub async fn temperature(&self) -> Result<f64> {
        let (tenths, _) = self.hardware.get_control(ControlKind::Temperature).await?;
        Ok(tenths as f64 / 10.0)
    }

    pub async fn target_temperature(&self) -> Result<i64> {
        Ok(self
            .hardware
            .get_control(ControlKind::TargetTemperature)
            .await?
            .0)
    }

    pub async fn set_target_temperature(&self, celsius: i64) -> Result<()> {
        self.set_checked(ControlKind::TargetTemperature, celsius).await
    }

    pub async fn cooler_power(&self) -> Result<i64> {
        Ok(self.hardware.get_control(ControlKind::CoolerPower).await?.0)
    }

    pub async fn set_cooler_power(&self, percent: i64) -> Result<()> {
        self.set_checked(ControlKind::CoolerPower, percent).await
    }

    pub async fn cooler_enabled(&self) -> Result<bool> {
        Ok(self.hardware.get_control(ControlKind::CoolerOn).await?.0 != 0)
    }

    pub async fn set_cooler_enabled(&self, enabled: bool) -> Result<()> {
        self.set_checked(ControlKind::CoolerOn, i64::from(enabled))
            .await
    }

    pub async fn roi(&self) -> Result<RoiFormat> {
        self.hardware.get_roi().await
    }

    pub async fn set_roi(&self, roi: RoiFormat) -> Result<()> {
        if roi.binning == 0 || roi.binning > 8 {
            return Err(EngineError::Validation(format!(
                "binning {} outside [1, 8]",
                roi.binning
            )));
        }
        self.hardware.set_roi(roi).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ImageFormat;
    use crate::sim::SimulatedCamera;

    async fn manager() -> PropertyManager {
        let hw = Arc::new(HardwareInterface::new(Arc::new(SimulatedCamera::new(1))));
        hw.initialize().await.unwrap();
        hw.connect_first().await.unwrap();
        PropertyManager::new(hw)
    }

    #[tokio::test]
    async fn gain_roundtrip() {
        let props = manager().await;
        props.set_gain(250).await.unwrap();
        assert_eq!(props.gain().await.unwrap(), 250);
    }

    #[tokio::test]
    async fn out_of_range_values_rejected() {
        let props = manager().await;
        assert!(props.set_gain(100_000).await.is_err());
        assert!(props.set_cooler_power(150).await.is_err());
    }

    #[tokio::test]
    async fn roi_binning_bounds() {
        let props = manager().await;
        let roi = RoiFormat {
            start_x: 0,
            start_y: 0,
            width: 640,
            height: 480,
            binning: 9,
            format: ImageFormat::Raw16,
        };
        assert!(props.set_roi(roi).await.is_err());
        let roi = RoiFormat { binning: 2, ..roi };
        props.set_roi(roi).await.unwrap();
        assert_eq!(props.roi().await.unwrap(), roi);
    }
}
