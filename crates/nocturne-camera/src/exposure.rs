// Exposure pipeline: drives a single exposure from settings to delivered
// frame on a dedicated worker task.

use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nocturne_types::{EngineError, Result};

use crate::driver::{ControlKind, ExposureHwStatus, RoiFormat};
use crate::frame::{CameraFrame, ImageFormat};
use crate::hardware::HardwareInterface;

/// Hard ceiling added to the exposure duration before the worker gives up.
const EXPOSURE_GUARD: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureState {
    Idle,
    Preparing,
    Exposing,
    Downloading,
    Complete,
    Aborted,
    Error,
}

impl ExposureState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExposureState::Idle => "idle",
            ExposureState::Preparing => "preparing",
            ExposureState::Exposing => "exposing",
            ExposureState::Downloading => "downloading",
            ExposureState::Complete => "complete",
            ExposureState::Aborted => "aborted",
            ExposureState::Error => "error",
        }
    }

    fn is_busy(self) -> bool {
        matches!(
            self,
            ExposureState::Preparing | ExposureState::Exposing | ExposureState::Downloading
        )
    }
}

#[derive(Debug, Clone)]
pub struct ExposureSettings {
    /// Exposure duration in seconds.
    pub duration_secs: f64,
    /// 0 means full frame.
    pub width: u32,
    pub height: u32,
    pub start_x: u32,
    pub start_y: u32,
    pub binning: u32,
    pub format: ImageFormat,
    pub is_dark: bool,
}

impl Default for ExposureSettings {
    fn default() -> Self {
        Self {
            duration_secs: 1.0,
            width: 0,
            height: 0,
            start_x: 0,
            start_y: 0,
            binning: 1,
            format: ImageFormat::Raw16,
            is_dark: false,
        }
    }
}

impl ExposureSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.duration_secs > 0.0 && self.duration_secs <= 3600.0) {
            return Err(EngineError::Validation(format!(
                "exposure duration {} outside (0, 3600]",
                self.duration_secs
            )));
        }
        if self.binning < 1 || self.binning > 8 {
            return Err(EngineError::Validation(format!(
                "binning {} outside [1, 8]",
                self.binning
            )));
        }
        Ok(())
    }
}

/// Outcome of the last exposure attempt.
#[derive(Debug, Clone, Default)]
pub struct ExposureResult {
    pub success: bool,
    pub frame: Option<Arc<CameraFrame>>,
    pub actual_duration_secs: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_message: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExposureStats {
    pub completed: u32,
    pub aborted: u32,
    pub failed: u32,
    pub total_exposure_secs: f64,
}

pub type ExposureCallback = Arc<dyn Fn(&ExposureResult) + Send + Sync>;
/// `(progress_percent, remaining_secs)`
pub type ProgressCallback = Arc<dyn Fn(f64, f64) + Send + Sync>;

#[derive(Debug, Clone)]
struct ExposureConfig {
    max_retries: u32,
    retry_delay: Duration,
    progress_interval: Duration,
    global_timeout: Option<Duration>,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            progress_interval: Duration::from_millis(500),
            global_timeout: None,
        }
    }
}

struct Current {
    settings: ExposureSettings,
    started: Option<Instant>,
}

struct ExposureInner {
    hardware: Arc<HardwareInterface>,
    state: StdRwLock<ExposureState>,
    current: StdRwLock<Current>,
    last_result: StdRwLock<ExposureResult>,
    stats: StdRwLock<ExposureStats>,
    config: StdRwLock<ExposureConfig>,
    cancel: StdMutex<CancellationToken>,
    completion_cb: StdMutex<Option<ExposureCallback>>,
    progress_cb: StdMutex<Option<ProgressCallback>>,
}

pub struct ExposureManager {
    inner: Arc<ExposureInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ExposureManager {
    pub fn new(hardware: Arc<HardwareInterface>) -> Self {
        Self {
            inner: Arc::new(ExposureInner {
                hardware,
                state: StdRwLock::new(ExposureState::Idle),
                current: StdRwLock::new(Current {
                    settings: ExposureSettings::default(),
                    started: None,
                }),
                last_result: StdRwLock::new(ExposureResult::default()),
                stats: StdRwLock::new(ExposureStats::default()),
                config: StdRwLock::new(ExposureConfig::default()),
                cancel: StdMutex::new(CancellationToken::new()),
                completion_cb: StdMutex::new(None),
                progress_cb: StdMutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    /// Validates the settings and launches the exposure worker. Fails when an
    /// exposure is already in flight.
    pub async fn start_exposure(&self, settings: ExposureSettings) -> Result<()> {
        settings.validate()?;
        {
            let state = self.inner.state();
            if state.is_busy() {
                return Err(EngineError::InvalidOperation(format!(
                    "exposure already in progress (state {})",
                    state.as_str()
                )));
            }
        }

        let token = CancellationToken::new();
        *self.inner.cancel.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        {
            let mut current = self.inner.current.write().unwrap_or_else(|e| e.into_inner());
            current.settings = settings.clone();
            current.started = None;
        }
        self.inner.set_state(ExposureState::Preparing);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            inner.run(settings, token).await;
        });

        let mut worker = self.worker.lock().await;
        if let Some(previous) = worker.replace(handle) {
            // previous worker has finished; reap it quietly
            let _ = previous.await;
        }
        Ok(())
    }

    /// Requests an abort. The worker stops the hardware and transitions the
    /// state machine to Aborted.
    pub fn abort_exposure(&self) {
        if self.inner.state().is_busy() {
            self.inner
                .cancel
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .cancel();
        }
    }

    /// Waits for the in-flight exposure (if any) and returns the last result.
    pub async fn wait(&self) -> ExposureResult {
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.last_result()
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn state(&self) -> ExposureState {
        self.inner.state()
    }

    pub fn state_string(&self) -> String {
        self.inner.state().as_str().to_string()
    }

    pub fn is_exposing(&self) -> bool {
        self.inner.state().is_busy()
    }

    /// Progress percentage: scaled to 95 while exposing, 95 during download,
    /// 100 once complete or aborted.
    pub fn progress(&self) -> f64 {
        match self.inner.state() {
            ExposureState::Idle | ExposureState::Preparing => 0.0,
            ExposureState::Exposing => {
                let current = self.inner.current.read().unwrap_or_else(|e| e.into_inner());
                let duration = current.settings.duration_secs.max(f64::EPSILON);
                let elapsed = current
                    .started
                    .map(|s| s.elapsed().as_secs_f64())
                    .unwrap_or(0.0);
                (elapsed / duration * 95.0).min(95.0)
            }
            ExposureState::Downloading => 95.0,
            ExposureState::Complete | ExposureState::Aborted | ExposureState::Error => 100.0,
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        let current = self.inner.current.read().unwrap_or_else(|e| e.into_inner());
        current
            .started
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn remaining_secs(&self) -> f64 {
        let current = self.inner.current.read().unwrap_or_else(|e| e.into_inner());
        let elapsed = current
            .started
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        (current.settings.duration_secs - elapsed).max(0.0)
    }

    pub fn last_result(&self) -> ExposureResult {
        self.inner
            .last_result
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn statistics(&self) -> ExposureStats {
        *self.inner.stats.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn reset_statistics(&self) {
        *self.inner.stats.write().unwrap_or_else(|e| e.into_inner()) =
            ExposureStats::default();
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    pub fn set_completion_callback(&self, callback: ExposureCallback) {
        *self
            .inner
            .completion_cb
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        *self
            .inner
            .progress_cb
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    pub fn set_max_retries(&self, retries: u32) {
        self.inner
            .config
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .max_retries = retries;
    }

    pub fn set_retry_delay(&self, delay: Duration) {
        self.inner
            .config
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retry_delay = delay;
    }

    pub fn set_progress_interval(&self, interval: Duration) {
        self.inner
            .config
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .progress_interval = interval;
    }

    pub fn set_global_timeout(&self, timeout: Option<Duration>) {
        self.inner
            .config
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .global_timeout = timeout;
    }
}

impl ExposureInner {
    fn state(&self) -> ExposureState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ExposureState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn config(&self) -> ExposureConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn run(self: &Arc<Self>, settings: ExposureSettings, cancel: CancellationToken) {
        let config = self.config();
        let started_at = Utc::now();
        let mut attempt: u32 = 0;

        loop {
            match self.run_once(&settings, &cancel).await {
                Ok(frame) => {
                    let actual = self.take_elapsed();
                    self.set_state(ExposureState::Complete);
                    {
                        let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
                        stats.completed += 1;
                        stats.total_exposure_secs += settings.duration_secs;
                    }
                    self.finish(ExposureResult {
                        success: true,
                        frame: Some(Arc::new(frame)),
                        actual_duration_secs: actual,
                        started_at: Some(started_at),
                        ended_at: Some(Utc::now()),
                        error_message: String::new(),
                    });
                    return;
                }
                Err(EngineError::Aborted(message)) => {
                    let _ = self.hardware.stop_exposure().await;
                    self.set_state(ExposureState::Aborted);
                    self.stats.write().unwrap_or_else(|e| e.into_inner()).aborted += 1;
                    self.finish(ExposureResult {
                        success: false,
                        frame: None,
                        actual_duration_secs: self.take_elapsed(),
                        started_at: Some(started_at),
                        ended_at: Some(Utc::now()),
                        error_message: message,
                    });
                    return;
                }
                Err(EngineError::Device(message)) if attempt < config.max_retries => {
                    attempt += 1;
                    warn!(attempt, %message, "exposure failed, retrying");
                    let _ = self.hardware.stop_exposure().await;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.set_state(ExposureState::Aborted);
                            self.stats.write().unwrap_or_else(|e| e.into_inner()).aborted += 1;
                            self.finish(ExposureResult {
                                success: false,
                                frame: None,
                                actual_duration_secs: 0.0,
                                started_at: Some(started_at),
                                ended_at: Some(Utc::now()),
                                error_message: "aborted during retry backoff".to_string(),
                            });
                            return;
                        }
                        _ = tokio::time::sleep(config.retry_delay) => {}
                    }
                    self.set_state(ExposureState::Preparing);
                }
                Err(error) => {
                    let _ = self.hardware.stop_exposure().await;
                    self.set_state(ExposureState::Error);
                    self.stats.write().unwrap_or_else(|e| e.into_inner()).failed += 1;
                    self.finish(ExposureResult {
                        success: false,
                        frame: None,
                        actual_duration_secs: self.take_elapsed(),
                        started_at: Some(started_at),
                        ended_at: Some(Utc::now()),
                        error_message: error.to_string(),
                    });
                    return;
                }
            }
        }
    }

    async fn run_once(
        self: &Arc<Self>,
        settings: &ExposureSettings,
        cancel: &CancellationToken,
    ) -> Result<CameraFrame> {
        let config = self.config();

        // Preparing: push ROI and exposure time to the device.
        let info = self
            .hardware
            .camera_info()
            .await
            .ok_or_else(|| EngineError::Resource("camera not connected".into()))?;
        let width = if settings.width == 0 {
            info.max_width / settings.binning
        } else {
            settings.width
        };
        let height = if settings.height == 0 {
            info.max_height / settings.binning
        } else {
            settings.height
        };
        let roi = RoiFormat {
            start_x: settings.start_x,
            start_y: settings.start_y,
            width,
            height,
            binning: settings.binning,
            format: settings.format,
        };
        self.hardware.set_roi(roi).await?;
        let micros = (settings.duration_secs * 1_000_000.0).round() as i64;
        self.hardware
            .set_control(ControlKind::Exposure, micros, false)
            .await?;

        if cancel.is_cancelled() {
            return Err(EngineError::Aborted("exposure aborted".into()));
        }

        // Preparing -> Exposing only once the hardware accepted the start.
        self.hardware.start_exposure(settings.is_dark).await?;
        self.set_state(ExposureState::Exposing);
        {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            current.started = Some(Instant::now());
        }

        let duration = Duration::from_secs_f64(settings.duration_secs);
        let mut deadline = duration + EXPOSURE_GUARD;
        if let Some(global) = config.global_timeout {
            deadline = deadline.min(global);
        }
        let begun = Instant::now();
        let mut last_progress = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Aborted("exposure aborted".into()));
            }
            if begun.elapsed() > deadline {
                return Err(EngineError::Timeout(format!(
                    "exposure exceeded {:.1}s guard",
                    deadline.as_secs_f64()
                )));
            }

            match self.hardware.exposure_status().await? {
                ExposureHwStatus::Working => {
                    if last_progress.elapsed() >= config.progress_interval {
                        last_progress = Instant::now();
                        let callback = self
                            .progress_cb
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .clone();
                        if let Some(callback) = callback {
                            let elapsed = begun.elapsed().as_secs_f64();
                            let progress =
                                (elapsed / settings.duration_secs.max(f64::EPSILON) * 95.0)
                                    .min(95.0);
                            let remaining = (settings.duration_secs - elapsed).max(0.0);
                            callback(progress, remaining);
                        }
                    }
                }
                ExposureHwStatus::Success => break,
                ExposureHwStatus::Failed => {
                    return Err(EngineError::Device(format!(
                        "exposure failed: {}",
                        self.hardware.last_error()
                    )));
                }
                ExposureHwStatus::Idle => {
                    return Err(EngineError::Device(
                        "device dropped the exposure unexpectedly".into(),
                    ));
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        // Downloading -> Complete only if the readout succeeds.
        self.set_state(ExposureState::Downloading);
        let len = width as usize * height as usize * settings.format.bytes_per_pixel();
        let data = self.hardware.image_data(len).await?;
        debug!(bytes = data.len(), "exposure downloaded");
        Ok(CameraFrame {
            width,
            height,
            binning: settings.binning,
            format: settings.format,
            is_dark: settings.is_dark,
            exposure_secs: settings.duration_secs,
            captured_at: Utc::now(),
            data,
        })
    }

    fn take_elapsed(&self) -> f64 {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        current
            .started
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    fn finish(&self, result: ExposureResult) {
        *self.last_result.write().unwrap_or_else(|e| e.into_inner()) = result.clone();
        let callback = self
            .completion_cb
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(&result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedCamera;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn setup() -> (Arc<SimulatedCamera>, ExposureManager) {
        let sim = Arc::new(SimulatedCamera::new(1));
        let hw = Arc::new(HardwareInterface::new(sim.clone()));
        hw.initialize().await.unwrap();
        hw.connect_first().await.unwrap();
        (sim, ExposureManager::new(hw))
    }

    fn quick_settings() -> ExposureSettings {
        ExposureSettings {
            duration_secs: 0.05,
            width: 64,
            height: 48,
            binning: 1,
            format: ImageFormat::Raw8,
            ..ExposureSettings::default()
        }
    }

    #[tokio::test]
    async fn exposure_completes_with_frame() {
        let (_sim, manager) = setup().await;
        manager.start_exposure(quick_settings()).await.unwrap();
        let result = manager.wait().await;
        assert!(result.success, "error: {}", result.error_message);
        let frame = result.frame.unwrap();
        assert_eq!(frame.data.len(), 64 * 48);
        assert_eq!(manager.state(), ExposureState::Complete);
        assert_eq!(manager.progress(), 100.0);
        assert_eq!(manager.statistics().completed, 1);
    }

    #[tokio::test]
    async fn invalid_settings_rejected() {
        let (_sim, manager) = setup().await;
        let mut settings = quick_settings();
        settings.duration_secs = 0.0;
        assert!(manager.start_exposure(settings).await.is_err());
        let mut settings = quick_settings();
        settings.duration_secs = 4000.0;
        assert!(manager.start_exposure(settings).await.is_err());
        let mut settings = quick_settings();
        settings.binning = 16;
        assert!(manager.start_exposure(settings).await.is_err());
    }

    #[tokio::test]
    async fn second_start_while_busy_fails() {
        let (_sim, manager) = setup().await;
        let mut settings = quick_settings();
        settings.duration_secs = 0.5;
        manager.start_exposure(settings.clone()).await.unwrap();
        let err = manager.start_exposure(settings).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_operation");
        manager.abort_exposure();
        manager.wait().await;
    }

    #[tokio::test]
    async fn abort_moves_to_aborted() {
        let (_sim, manager) = setup().await;
        let mut settings = quick_settings();
        settings.duration_secs = 5.0;
        manager.start_exposure(settings).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        manager.abort_exposure();
        let result = manager.wait().await;
        assert!(!result.success);
        assert_eq!(manager.state(), ExposureState::Aborted);
        assert_eq!(manager.statistics().aborted, 1);
        assert_eq!(manager.progress(), 100.0);
    }

    #[tokio::test]
    async fn device_failures_retry_then_succeed() {
        let (sim, manager) = setup().await;
        manager.set_retry_delay(Duration::from_millis(10));
        sim.fail_next_exposures(2);
        manager.start_exposure(quick_settings()).await.unwrap();
        let result = manager.wait().await;
        assert!(result.success, "error: {}", result.error_message);
        assert_eq!(manager.statistics().completed, 1);
    }

    #[tokio::test]
    async fn retries_exhausted_end_in_error() {
        let (sim, manager) = setup().await;
        manager.set_retry_delay(Duration::from_millis(5));
        manager.set_max_retries(1);
        sim.fail_next_exposures(5);
        manager.start_exposure(quick_settings()).await.unwrap();
        let result = manager.wait().await;
        assert!(!result.success);
        assert_eq!(manager.state(), ExposureState::Error);
        assert!(result.error_message.contains("exposure failed"));
    }

    #[tokio::test]
    async fn progress_callback_fires() {
        let (_sim, manager) = setup().await;
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        manager.set_progress_interval(Duration::from_millis(20));
        manager.set_progress_callback(Arc::new(move |progress, _remaining| {
            assert!((0.0..=95.0).contains(&progress));
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        let mut settings = quick_settings();
        settings.duration_secs = 0.2;
        manager.start_exposure(settings).await.unwrap();
        manager.wait().await;
        assert!(calls.load(Ordering::SeqCst) > 0);
    }
}
