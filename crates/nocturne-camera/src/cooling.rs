// Thermoelectric cooler control: a discrete PID loop plus temperature
// telemetry with a bounded history window.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nocturne_types::{EngineError, Result};

use crate::driver::ControlKind;
use crate::hardware::HardwareInterface;

const CONTROL_INTERVAL: Duration = Duration::from_millis(500);
/// Window for the stability (standard deviation) metric.
const STABILITY_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoolerState {
    Off,
    Starting,
    Cooling,
    Stabilizing,
    Stable,
    Stopping,
    Error,
}

#[derive(Debug, Clone)]
pub struct CoolingSettings {
    pub target_temperature: f64,
    /// Maximum cooler drive, percent.
    pub max_cooler_power: f64,
    /// Band around the target that counts as "at temperature".
    pub tolerance: f64,
    /// How long the temperature must hold inside the band to become Stable.
    pub stabilization_time: Duration,
    pub timeout: Duration,
}

impl Default for CoolingSettings {
    fn default() -> Self {
        Self {
            target_temperature: -10.0,
            max_cooler_power: 100.0,
            tolerance: 0.5,
            stabilization_time: Duration::from_secs(30),
            timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PidParams {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub integral_windup: f64,
}

impl Default for PidParams {
    fn default() -> Self {
        Self {
            kp: 1.0,
            ki: 0.1,
            kd: 0.05,
            integral_windup: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TemperatureSample {
    pub temperature: f64,
    pub cooler_power: f64,
    pub at: DateTime<Utc>,
    monotonic: Instant,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TemperatureInfo {
    pub current_temperature: f64,
    pub target_temperature: f64,
    pub cooler_power: f64,
    pub cooler_enabled: bool,
    pub has_reached_target: bool,
    pub timestamp: DateTime<Utc>,
}

pub type CoolerStateCallback = Arc<dyn Fn(CoolerState, &str) + Send + Sync>;

#[derive(Default)]
struct PidMemory {
    integral: f64,
    previous_error: f64,
    last_update: Option<Instant>,
}

struct CoolingInner {
    hardware: Arc<HardwareInterface>,
    state: StdRwLock<CoolerState>,
    settings: StdRwLock<CoolingSettings>,
    pid_params: StdRwLock<PidParams>,
    pid: StdMutex<PidMemory>,
    history: StdMutex<VecDeque<TemperatureSample>>,
    monitoring_interval: StdRwLock<Duration>,
    history_duration: StdRwLock<Duration>,
    current: StdRwLock<TemperatureInfo>,
    started: StdMutex<Option<Instant>>,
    stable_since: StdMutex<Option<Instant>>,
    state_cb: StdMutex<Option<CoolerStateCallback>>,
}

pub struct TemperatureController {
    inner: Arc<CoolingInner>,
    cancel: StdMutex<CancellationToken>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TemperatureController {
    pub fn new(hardware: Arc<HardwareInterface>) -> Self {
        Self {
            inner: Arc::new(CoolingInner {
                hardware,
                state: StdRwLock::new(CoolerState::Off),
                settings: StdRwLock::new(CoolingSettings::default()),
                pid_params: StdRwLock::new(PidParams::default()),
                pid: StdMutex::new(PidMemory::default()),
                history: StdMutex::new(VecDeque::new()),
                monitoring_interval: StdRwLock::new(Duration::from_secs(1)),
                history_duration: StdRwLock::new(Duration::from_secs(3600)),
                current: StdRwLock::new(TemperatureInfo {
                    current_temperature: 25.0,
                    target_temperature: -10.0,
                    cooler_power: 0.0,
                    cooler_enabled: false,
                    has_reached_target: false,
                    timestamp: Utc::now(),
                }),
                started: StdMutex::new(None),
                stable_since: StdMutex::new(None),
                state_cb: StdMutex::new(None),
            }),
            cancel: StdMutex::new(CancellationToken::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    pub async fn start_cooling(&self, target_temperature: f64) -> Result<()> {
        let settings = CoolingSettings {
            target_temperature,
            ..self.inner.settings()
        };
        self.start_cooling_with(settings).await
    }

    pub async fn start_cooling_with(&self, settings: CoolingSettings) -> Result<()> {
        if self.state() != CoolerState::Off {
            return Err(EngineError::InvalidOperation(format!(
                "cooler is not off (state {:?})",
                self.state()
            )));
        }

        self.inner
            .hardware
            .set_control(
                ControlKind::TargetTemperature,
                settings.target_temperature.round() as i64,
                false,
            )
            .await?;
        self.inner
            .hardware
            .set_control(ControlKind::CoolerOn, 1, false)
            .await?;

        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(|e| e.into_inner()) = settings;
        *self.inner.pid.lock().unwrap_or_else(|e| e.into_inner()) = PidMemory::default();
        *self.inner.started.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        *self
            .inner
            .stable_since
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        self.inner.set_state(CoolerState::Starting, "cooling requested");

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();

        let monitor = {
            let inner = self.inner.clone();
            let token = token.clone();
            tokio::spawn(async move { inner.monitoring_worker(token).await })
        };
        let control = {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.control_worker(token).await })
        };

        let mut workers = self.workers.lock().await;
        workers.clear();
        workers.push(monitor);
        workers.push(control);
        Ok(())
    }

    /// Disables the cooler and releases the worker tasks. Power is zeroed
    /// before the workers exit.
    pub async fn stop_cooling(&self) -> Result<()> {
        if self.state() == CoolerState::Off {
            return Ok(());
        }
        self.inner.set_state(CoolerState::Stopping, "stop requested");
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        let _ = self
            .inner
            .hardware
            .set_control(ControlKind::CoolerPower, 0, false)
            .await;
        let _ = self
            .inner
            .hardware
            .set_control(ControlKind::CoolerOn, 0, false)
            .await;
        self.inner.set_state(CoolerState::Off, "cooler off");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------

    pub fn state(&self) -> CoolerState {
        *self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_info(&self) -> TemperatureInfo {
        *self.inner.current.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_temperature(&self) -> f64 {
        self.current_info().current_temperature
    }

    pub fn has_reached_target(&self) -> bool {
        self.current_info().has_reached_target
    }

    /// Standard deviation of the samples within the last five minutes.
    pub fn temperature_stability(&self) -> f64 {
        let history = self.inner.history.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = Instant::now()
            .checked_sub(STABILITY_WINDOW)
            .unwrap_or_else(Instant::now);
        let recent: Vec<f64> = history
            .iter()
            .filter(|s| s.monotonic >= cutoff)
            .map(|s| s.temperature)
            .collect();
        if recent.len() < 2 {
            return 0.0;
        }
        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        let variance =
            recent.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / recent.len() as f64;
        variance.sqrt()
    }

    pub fn temperature_history(&self, duration: Duration) -> Vec<TemperatureSample> {
        let history = self.inner.history.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = Instant::now().checked_sub(duration).unwrap_or_else(Instant::now);
        history
            .iter()
            .filter(|s| s.monotonic >= cutoff)
            .copied()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    pub fn settings(&self) -> CoolingSettings {
        self.inner.settings()
    }

    pub fn set_pid_params(&self, params: PidParams) {
        *self
            .inner
            .pid_params
            .write()
            .unwrap_or_else(|e| e.into_inner()) = params;
    }

    pub fn set_monitoring_interval(&self, interval: Duration) {
        *self
            .inner
            .monitoring_interval
            .write()
            .unwrap_or_else(|e| e.into_inner()) = interval;
    }

    pub fn set_history_duration(&self, duration: Duration) {
        *self
            .inner
            .history_duration
            .write()
            .unwrap_or_else(|e| e.into_inner()) = duration;
    }

    pub fn set_state_callback(&self, callback: CoolerStateCallback) {
        *self
            .inner
            .state_cb
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }
}

impl CoolingInner {
    fn settings(&self) -> CoolingSettings {
        self.settings.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn state(&self) -> CoolerState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: CoolerState, reason: &str) {
        {
            let mut current = self.state.write().unwrap_or_else(|e| e.into_inner());
            if *current == state {
                return;
            }
            debug!(from = ?*current, to = ?state, reason, "cooler state change");
            *current = state;
        }
        let callback = self
            .state_cb
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(state, reason);
        }
    }

    async fn monitoring_worker(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let interval = *self
                .monitoring_interval
                .read()
                .unwrap_or_else(|e| e.into_inner());
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.hardware.get_control(ControlKind::Temperature).await {
                Ok((tenths, _)) => {
                    let temperature = tenths as f64 / 10.0;
                    let settings = self.settings();
                    let power = {
                        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
                        current.cooler_power
                    };
                    {
                        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
                        current.current_temperature = temperature;
                        current.target_temperature = settings.target_temperature;
                        current.cooler_enabled = true;
                        current.has_reached_target =
                            (temperature - settings.target_temperature).abs()
                                <= settings.tolerance;
                        current.timestamp = Utc::now();
                    }
                    self.push_sample(temperature, power);
                }
                Err(e) => {
                    // keep sampling; the sensor may come back
                    warn!(error = %e, "temperature read failed");
                    self.set_state(CoolerState::Error, "temperature sensor read failed");
                }
            }
        }
    }

    fn push_sample(&self, temperature: f64, cooler_power: f64) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(TemperatureSample {
            temperature,
            cooler_power,
            at: Utc::now(),
            monotonic: Instant::now(),
        });
        let window = *self
            .history_duration
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let cutoff = Instant::now().checked_sub(window);
        if let Some(cutoff) = cutoff {
            while history
                .front()
                .is_some_and(|s| s.monotonic < cutoff)
            {
                history.pop_front();
            }
        }
    }

    async fn control_worker(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(CONTROL_INTERVAL) => {}
            }

            if self.state() == CoolerState::Starting {
                self.set_state(CoolerState::Cooling, "workers running");
            }
            if self.state() == CoolerState::Error {
                continue;
            }

            let settings = self.settings();
            let current_temp = {
                let current = self.current.read().unwrap_or_else(|e| e.into_inner());
                current.current_temperature
            };

            let output = self.pid_output(settings.target_temperature, current_temp);
            // The PID output is signed (e = target - current); the cooler
            // drive opposes it, clamped to [0, max power].
            let drive = (-output).clamp(0.0, settings.max_cooler_power);
            if let Err(e) = self
                .hardware
                .set_control(ControlKind::CoolerPower, drive.round() as i64, false)
                .await
            {
                warn!(error = %e, "failed to apply cooler power");
                self.set_state(CoolerState::Error, "failed to apply cooler power");
                continue;
            }
            {
                let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
                current.cooler_power = drive;
            }

            self.update_stability(current_temp, &settings);
            self.check_timeout(&settings);
        }
    }

    fn pid_output(&self, target: f64, current: f64) -> f64 {
        let params = *self
            .pid_params
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let mut pid = self.pid.lock().unwrap_or_else(|e| e.into_inner());

        let error = target - current;
        let now = Instant::now();
        let Some(last) = pid.last_update else {
            pid.last_update = Some(now);
            pid.previous_error = error;
            return 0.0;
        };
        let dt = now.duration_since(last).as_secs_f64();
        if dt <= 0.0 {
            return 0.0;
        }

        let proportional = params.kp * error;
        pid.integral =
            (pid.integral + error * dt).clamp(-params.integral_windup, params.integral_windup);
        let integral = params.ki * pid.integral;
        let derivative = params.kd * (error - pid.previous_error) / dt;

        pid.previous_error = error;
        pid.last_update = Some(now);
        proportional + integral + derivative
    }

    fn update_stability(&self, current_temp: f64, settings: &CoolingSettings) {
        let at_target =
            (current_temp - settings.target_temperature).abs() <= settings.tolerance;
        let state = self.state();
        let mut stable_since = self.stable_since.lock().unwrap_or_else(|e| e.into_inner());

        if at_target {
            match state {
                CoolerState::Cooling => {
                    *stable_since = Some(Instant::now());
                    self.set_state(CoolerState::Stabilizing, "inside tolerance band");
                }
                CoolerState::Stabilizing => {
                    if stable_since
                        .map(|s| s.elapsed() >= settings.stabilization_time)
                        .unwrap_or(false)
                    {
                        self.set_state(CoolerState::Stable, "held inside tolerance");
                    }
                }
                _ => {}
            }
        } else if matches!(state, CoolerState::Stabilizing | CoolerState::Stable) {
            *stable_since = None;
            self.set_state(CoolerState::Cooling, "drifted out of tolerance");
        }
    }

    fn check_timeout(&self, settings: &CoolingSettings) {
        if matches!(self.state(), CoolerState::Cooling | CoolerState::Stabilizing) {
            let started = self.started.lock().unwrap_or_else(|e| e.into_inner());
            if started
                .map(|s| s.elapsed() >= settings.timeout)
                .unwrap_or(false)
            {
                self.set_state(CoolerState::Error, "cooling timeout exceeded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedCamera;

    async fn controller() -> TemperatureController {
        let hw = Arc::new(HardwareInterface::new(Arc::new(SimulatedCamera::new(1))));
        hw.initialize().await.unwrap();
        hw.connect_first().await.unwrap();
        let controller = TemperatureController::new(hw);
        controller.set_monitoring_interval(Duration::from_millis(20));
        controller
    }

    #[tokio::test]
    async fn start_requires_off_state() {
        let cooler = controller().await;
        cooler.start_cooling(-5.0).await.unwrap();
        let err = cooler.start_cooling(-5.0).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_operation");
        cooler.stop_cooling().await.unwrap();
    }

    #[tokio::test]
    async fn cooling_reaches_and_stabilizes() {
        let cooler = controller().await;
        let settings = CoolingSettings {
            target_temperature: 20.0,
            tolerance: 1.5,
            stabilization_time: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
            ..CoolingSettings::default()
        };
        cooler.start_cooling_with(settings).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(20);
        while cooler.state() != CoolerState::Stable && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(cooler.state(), CoolerState::Stable);
        assert!(cooler.has_reached_target());
        cooler.stop_cooling().await.unwrap();
        assert_eq!(cooler.state(), CoolerState::Off);
    }

    #[tokio::test]
    async fn history_window_evicts_old_samples() {
        let cooler = controller().await;
        cooler.set_history_duration(Duration::from_millis(120));
        cooler.start_cooling(0.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        let len = cooler.history_len();
        // ~20ms sampling with a 120ms window keeps roughly six samples
        assert!(len > 0 && len <= 10, "history length {len}");
        cooler.stop_cooling().await.unwrap();
    }

    #[tokio::test]
    async fn timeout_transitions_to_error() {
        let cooler = controller().await;
        let settings = CoolingSettings {
            target_temperature: -35.0,
            tolerance: 0.1,
            stabilization_time: Duration::from_secs(60),
            timeout: Duration::from_millis(400),
            ..CoolingSettings::default()
        };
        cooler.start_cooling_with(settings).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cooler.state(), CoolerState::Error);
        cooler.stop_cooling().await.unwrap();
    }

    #[tokio::test]
    async fn stop_zeroes_power() {
        let cooler = controller().await;
        cooler.start_cooling(10.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        cooler.stop_cooling().await.unwrap();
        assert_eq!(cooler.state(), CoolerState::Off);
    }
}
