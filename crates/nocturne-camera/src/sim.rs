// Simulated camera driver.
//
// Stands in for a vendor SDK: deterministic frames, a first-order thermal
// model for the cooler, and failure/latency injection hooks for tests. This
// is also what the `simulate` CLI subcommand runs against.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::driver::{
    CameraDriver, CameraInfo, ControlCaps, ControlKind, DriverCode, DriverError, DriverResult,
    ExposureHwStatus, GuideDirection, RoiFormat, TriggerPin,
};
use crate::frame::ImageFormat;

const AMBIENT_TEMP_C: f64 = 25.0;
/// Fraction of the remaining temperature delta closed per second while driven.
const COOLING_RATE_PER_SEC: f64 = 0.8;

struct ExposureJob {
    started: Instant,
    duration: Duration,
    is_dark: bool,
    fail: bool,
}

struct SimDevice {
    info: CameraInfo,
    opened: bool,
    initialized: bool,
    controls: HashMap<ControlKind, (i64, bool)>,
    roi: RoiFormat,
    exposure: Option<ExposureJob>,
    video_running: bool,
    frame_counter: u64,
    // thermal model state
    temperature_c: f64,
    last_thermal_update: Instant,
}

impl SimDevice {
    fn new(id: i32) -> Self {
        let mut controls = HashMap::new();
        controls.insert(ControlKind::Gain, (100, false));
        controls.insert(ControlKind::Offset, (10, false));
        controls.insert(ControlKind::Exposure, (1_000_000, false));
        controls.insert(ControlKind::TargetTemperature, (0, false));
        controls.insert(ControlKind::CoolerPower, (0, false));
        controls.insert(ControlKind::CoolerOn, (0, false));
        controls.insert(ControlKind::Flip, (0, false));
        controls.insert(ControlKind::BandwidthOverload, (50, false));
        controls.insert(ControlKind::HighSpeedMode, (0, false));
        Self {
            info: CameraInfo {
                id,
                name: format!("Nocturne Sim {id}"),
                serial_number: format!("SIM{id:06}"),
                max_width: 1920,
                max_height: 1080,
                is_color: false,
                bit_depth: 16,
                has_cooler: true,
                has_st4_port: true,
            },
            opened: false,
            initialized: false,
            controls,
            roi: RoiFormat {
                start_x: 0,
                start_y: 0,
                width: 1920,
                height: 1080,
                binning: 1,
                format: ImageFormat::Raw16,
            },
            exposure: None,
            video_running: false,
            frame_counter: 0,
            temperature_c: AMBIENT_TEMP_C,
            last_thermal_update: Instant::now(),
        }
    }

    fn update_thermal_model(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_thermal_update).as_secs_f64();
        self.last_thermal_update = now;
        if dt <= 0.0 {
            return;
        }
        let cooler_on = self.controls.get(&ControlKind::CoolerOn).map(|c| c.0) == Some(1);
        let power = self
            .controls
            .get(&ControlKind::CoolerPower)
            .map(|c| c.0)
            .unwrap_or(0) as f64;
        let setpoint = if cooler_on && power > 0.0 {
            self.controls
                .get(&ControlKind::TargetTemperature)
                .map(|c| c.0)
                .unwrap_or(0) as f64
        } else {
            AMBIENT_TEMP_C
        };
        let rate = if cooler_on && power > 0.0 {
            COOLING_RATE_PER_SEC
        } else {
            COOLING_RATE_PER_SEC * 0.5
        };
        let step = (rate * dt).min(1.0);
        self.temperature_c += (setpoint - self.temperature_c) * step;
    }

    fn frame_bytes(&mut self, len: usize) -> Vec<u8> {
        self.frame_counter = self.frame_counter.wrapping_add(1);
        let seed = self.frame_counter;
        let mut data = vec![0u8; len];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = ((i as u64).wrapping_mul(31).wrapping_add(seed * 7) & 0xFF) as u8;
        }
        data
    }
}

/// In-process camera driver used by tests and the simulate command.
pub struct SimulatedCamera {
    devices: Mutex<HashMap<i32, SimDevice>>,
    /// Number of upcoming exposures forced to fail.
    fail_exposures: AtomicU32,
    exposure_latency: Mutex<Duration>,
}

impl SimulatedCamera {
    pub fn new(device_count: u32) -> Self {
        let mut devices = HashMap::new();
        for id in 0..device_count as i32 {
            devices.insert(id, SimDevice::new(id));
        }
        Self {
            devices: Mutex::new(devices),
            fail_exposures: AtomicU32::new(0),
            exposure_latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Forces the next `count` exposures to report a hardware failure.
    pub fn fail_next_exposures(&self, count: u32) {
        self.fail_exposures.store(count, Ordering::SeqCst);
    }

    /// Extra latency added to every exposure, on top of its duration.
    pub async fn set_exposure_latency(&self, latency: Duration) {
        *self.exposure_latency.lock().await = latency;
    }

    fn take_failure(&self) -> bool {
        self.fail_exposures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn with_device<T>(
        &self,
        id: i32,
        require_init: bool,
        f: impl FnOnce(&mut SimDevice) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let mut devices = self.devices.lock().await;
        let device = devices
            .get_mut(&id)
            .ok_or_else(|| DriverError::new(DriverCode::InvalidId, format!("no camera {id}")))?;
        if require_init && !device.opened {
            return Err(DriverError::new(
                DriverCode::NotOpened,
                format!("camera {id} is not open"),
            ));
        }
        if require_init && !device.initialized {
            return Err(DriverError::new(
                DriverCode::NotInitialized,
                format!("camera {id} is not initialized"),
            ));
        }
        f(device)
    }
}

#[async_trait]
impl CameraDriver for SimulatedCamera {
    async fn enumerate(&self) -> DriverResult<Vec<CameraInfo>> {
        let devices = self.devices.lock().await;
        let mut infos: Vec<CameraInfo> = devices.values().map(|d| d.info.clone()).collect();
        infos.sort_by_key(|i| i.id);
        Ok(infos)
    }

    async fn open(&self, id: i32) -> DriverResult<()> {
        self.with_device(id, false, |d| {
            d.opened = true;
            Ok(())
        })
        .await
    }

    async fn init(&self, id: i32) -> DriverResult<()> {
        self.with_device(id, false, |d| {
            if !d.opened {
                return Err(DriverError::new(
                    DriverCode::NotOpened,
                    format!("camera {id} is not open"),
                ));
            }
            d.initialized = true;
            Ok(())
        })
        .await
    }

    async fn close(&self, id: i32) -> DriverResult<()> {
        self.with_device(id, false, |d| {
            d.opened = false;
            d.initialized = false;
            d.exposure = None;
            d.video_running = false;
            Ok(())
        })
        .await
    }

    async fn control_caps(&self, id: i32) -> DriverResult<Vec<ControlCaps>> {
        self.with_device(id, true, |_| {
            Ok(vec![
                caps(ControlKind::Gain, "Gain", 0, 600, 100, true),
                caps(ControlKind::Offset, "Offset", 0, 100, 10, false),
                caps(ControlKind::Exposure, "Exposure", 32, 2_000_000_000, 1_000_000, true),
                caps(ControlKind::Temperature, "Temperature", -500, 500, 250, false),
                caps(ControlKind::TargetTemperature, "TargetTemp", -40, 30, 0, false),
                caps(ControlKind::CoolerPower, "CoolerPower", 0, 100, 0, false),
                caps(ControlKind::CoolerOn, "CoolerOn", 0, 1, 0, false),
                caps(ControlKind::Flip, "Flip", 0, 3, 0, false),
                caps(ControlKind::BandwidthOverload, "Bandwidth", 40, 100, 50, true),
                caps(ControlKind::HighSpeedMode, "HighSpeed", 0, 1, 0, false),
            ])
        })
        .await
    }

    async fn set_control_value(
        &self,
        id: i32,
        control: ControlKind,
        value: i64,
        auto: bool,
    ) -> DriverResult<()> {
        self.with_device(id, true, |d| {
            if control == ControlKind::Temperature {
                return Err(DriverError::new(
                    DriverCode::InvalidControl,
                    "temperature is read-only",
                ));
            }
            d.controls.insert(control, (value, auto));
            Ok(())
        })
        .await
    }

    async fn get_control_value(&self, id: i32, control: ControlKind) -> DriverResult<(i64, bool)> {
        self.with_device(id, true, |d| {
            if control == ControlKind::Temperature {
                d.update_thermal_model();
                return Ok(((d.temperature_c * 10.0).round() as i64, false));
            }
            d.controls.get(&control).copied().ok_or_else(|| {
                DriverError::new(DriverCode::InvalidControl, format!("{control:?} unsupported"))
            })
        })
        .await
    }

    async fn set_roi_format(&self, id: i32, roi: RoiFormat) -> DriverResult<()> {
        self.with_device(id, true, |d| {
            if roi.width > d.info.max_width || roi.height > d.info.max_height {
                return Err(DriverError::new(
                    DriverCode::InvalidValue,
                    "ROI exceeds sensor size",
                ));
            }
            d.roi = roi;
            Ok(())
        })
        .await
    }

    async fn get_roi_format(&self, id: i32) -> DriverResult<RoiFormat> {
        self.with_device(id, true, |d| Ok(d.roi)).await
    }

    async fn start_exposure(&self, id: i32, is_dark: bool) -> DriverResult<()> {
        let latency = *self.exposure_latency.lock().await;
        let fail = self.take_failure();
        self.with_device(id, true, |d| {
            if d.exposure.is_some() {
                return Err(DriverError::new(DriverCode::Busy, "exposure in progress"));
            }
            if d.video_running {
                return Err(DriverError::new(DriverCode::Busy, "video capture active"));
            }
            let micros = d
                .controls
                .get(&ControlKind::Exposure)
                .map(|c| c.0)
                .unwrap_or(1_000_000)
                .max(0) as u64;
            d.exposure = Some(ExposureJob {
                started: Instant::now(),
                duration: Duration::from_micros(micros) + latency,
                is_dark,
                fail,
            });
            Ok(())
        })
        .await
    }

    async fn stop_exposure(&self, id: i32) -> DriverResult<()> {
        self.with_device(id, true, |d| {
            d.exposure = None;
            Ok(())
        })
        .await
    }

    async fn exposure_status(&self, id: i32) -> DriverResult<ExposureHwStatus> {
        self.with_device(id, true, |d| {
            Ok(match &d.exposure {
                None => ExposureHwStatus::Idle,
                Some(job) if job.started.elapsed() < job.duration => ExposureHwStatus::Working,
                Some(job) if job.fail => ExposureHwStatus::Failed,
                Some(_) => ExposureHwStatus::Success,
            })
        })
        .await
    }

    async fn image_data(&self, id: i32, len: usize) -> DriverResult<Vec<u8>> {
        self.with_device(id, true, |d| {
            let job = d.exposure.take().ok_or_else(|| {
                DriverError::new(DriverCode::GeneralError, "no exposure to download")
            })?;
            if job.started.elapsed() < job.duration {
                d.exposure = Some(job);
                return Err(DriverError::new(DriverCode::Busy, "exposure still running"));
            }
            if job.fail {
                return Err(DriverError::new(
                    DriverCode::GeneralError,
                    "exposure failed on device",
                ));
            }
            let mut data = d.frame_bytes(len);
            if job.is_dark {
                // dark frames carry only noise
                for byte in &mut data {
                    *byte &= 0x0F;
                }
            }
            Ok(data)
        })
        .await
    }

    async fn start_video_capture(&self, id: i32) -> DriverResult<()> {
        self.with_device(id, true, |d| {
            if d.exposure.is_some() {
                return Err(DriverError::new(DriverCode::Busy, "exposure in progress"));
            }
            d.video_running = true;
            Ok(())
        })
        .await
    }

    async fn stop_video_capture(&self, id: i32) -> DriverResult<()> {
        self.with_device(id, true, |d| {
            d.video_running = false;
            Ok(())
        })
        .await
    }

    async fn video_data(&self, id: i32, len: usize, wait_ms: u32) -> DriverResult<Vec<u8>> {
        let frame_interval = self
            .with_device(id, true, |d| {
                if !d.video_running {
                    return Err(DriverError::new(
                        DriverCode::GeneralError,
                        "video capture is not running",
                    ));
                }
                let micros = d
                    .controls
                    .get(&ControlKind::Exposure)
                    .map(|c| c.0)
                    .unwrap_or(33_000)
                    .max(1_000) as u64;
                Ok(Duration::from_micros(micros))
            })
            .await?;

        let wait = Duration::from_millis(u64::from(wait_ms));
        if frame_interval > wait {
            tokio::time::sleep(wait).await;
            return Err(DriverError::new(DriverCode::Timeout, "no frame within wait"));
        }
        tokio::time::sleep(frame_interval).await;
        self.with_device(id, true, |d| {
            if !d.video_running {
                return Err(DriverError::new(
                    DriverCode::GeneralError,
                    "video capture stopped",
                ));
            }
            Ok(d.frame_bytes(len))
        })
        .await
    }

    async fn pulse_guide_on(&self, id: i32, _direction: GuideDirection) -> DriverResult<()> {
        self.with_device(id, true, |_| Ok(())).await
    }

    async fn pulse_guide_off(&self, id: i32, _direction: GuideDirection) -> DriverResult<()> {
        self.with_device(id, true, |_| Ok(())).await
    }

    async fn serial_number(&self, id: i32) -> DriverResult<String> {
        self.with_device(id, false, |d| Ok(d.info.serial_number.clone()))
            .await
    }

    async fn send_soft_trigger(&self, id: i32, _start: bool) -> DriverResult<()> {
        self.with_device(id, true, |_| Ok(())).await
    }

    async fn set_trigger_output(
        &self,
        id: i32,
        _pin: TriggerPin,
        _high: bool,
        _delay_us: i64,
    ) -> DriverResult<()> {
        self.with_device(id, true, |_| Ok(())).await
    }

    fn sdk_version(&self) -> String {
        "nocturne-sim 1.2.0".to_string()
    }
}

fn caps(
    control: ControlKind,
    name: &str,
    min: i64,
    max: i64,
    default: i64,
    auto: bool,
) -> ControlCaps {
    ControlCaps {
        control,
        name: name.to_string(),
        description: format!("{name} control"),
        min,
        max,
        default,
        is_auto_supported: auto,
        is_writable: control != ControlKind::Temperature,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_init_lifecycle_is_enforced() {
        let sim = SimulatedCamera::new(1);
        let err = sim.control_caps(0).await.unwrap_err();
        assert_eq!(err.code, DriverCode::NotOpened);

        sim.open(0).await.unwrap();
        let err = sim.control_caps(0).await.unwrap_err();
        assert_eq!(err.code, DriverCode::NotInitialized);

        sim.init(0).await.unwrap();
        assert!(!sim.control_caps(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exposure_completes_and_downloads() {
        let sim = SimulatedCamera::new(1);
        sim.open(0).await.unwrap();
        sim.init(0).await.unwrap();
        sim.set_control_value(0, ControlKind::Exposure, 20_000, false)
            .await
            .unwrap();
        sim.start_exposure(0, false).await.unwrap();
        assert_eq!(
            sim.exposure_status(0).await.unwrap(),
            ExposureHwStatus::Working
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(
            sim.exposure_status(0).await.unwrap(),
            ExposureHwStatus::Success
        );
        let data = sim.image_data(0, 64).await.unwrap();
        assert_eq!(data.len(), 64);
        assert_eq!(sim.exposure_status(0).await.unwrap(), ExposureHwStatus::Idle);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_failed_status() {
        let sim = SimulatedCamera::new(1);
        sim.open(0).await.unwrap();
        sim.init(0).await.unwrap();
        sim.set_control_value(0, ControlKind::Exposure, 1_000, false)
            .await
            .unwrap();
        sim.fail_next_exposures(1);

        sim.start_exposure(0, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            sim.exposure_status(0).await.unwrap(),
            ExposureHwStatus::Failed
        );
        sim.stop_exposure(0).await.unwrap();

        // next exposure succeeds again
        sim.start_exposure(0, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            sim.exposure_status(0).await.unwrap(),
            ExposureHwStatus::Success
        );
    }

    #[tokio::test]
    async fn cooler_drives_temperature_toward_setpoint() {
        let sim = SimulatedCamera::new(1);
        sim.open(0).await.unwrap();
        sim.init(0).await.unwrap();
        let (start, _) = sim
            .get_control_value(0, ControlKind::Temperature)
            .await
            .unwrap();
        sim.set_control_value(0, ControlKind::TargetTemperature, -10, false)
            .await
            .unwrap();
        sim.set_control_value(0, ControlKind::CoolerOn, 1, false)
            .await
            .unwrap();
        sim.set_control_value(0, ControlKind::CoolerPower, 100, false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let (cooled, _) = sim
            .get_control_value(0, ControlKind::Temperature)
            .await
            .unwrap();
        assert!(cooled < start, "temperature should fall: {start} -> {cooled}");
    }

    #[tokio::test]
    async fn video_and_exposure_are_mutually_exclusive() {
        let sim = SimulatedCamera::new(1);
        sim.open(0).await.unwrap();
        sim.init(0).await.unwrap();
        sim.start_video_capture(0).await.unwrap();
        let err = sim.start_exposure(0, false).await.unwrap_err();
        assert_eq!(err.code, DriverCode::Busy);
        sim.stop_video_capture(0).await.unwrap();
        sim.start_exposure(0, false).await.unwrap();
    }
}
