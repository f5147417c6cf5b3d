// Process-wide task factory and device lookup.
//
// Task actions never receive device handles directly; they resolve cameras
// through the device registry at execution time. Both registries are global
// with an explicit reset for tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tracing::info;

use nocturne_camera::{CameraController, ExposureSettings, ImageFormat};
use nocturne_types::{EngineError, Result};

use crate::task::{Task, TaskAction};

// ============================================================================
// Device registry
// ============================================================================

pub struct DeviceRegistry {
    cameras: StdRwLock<HashMap<String, Arc<CameraController>>>,
    default_camera: StdRwLock<Option<String>>,
}

static DEVICES: Lazy<DeviceRegistry> = Lazy::new(|| DeviceRegistry {
    cameras: StdRwLock::new(HashMap::new()),
    default_camera: StdRwLock::new(None),
});

impl DeviceRegistry {
    pub fn global() -> &'static DeviceRegistry {
        &DEVICES
    }

    pub fn register_camera(&self, name: &str, camera: Arc<CameraController>) {
        let mut cameras = self.cameras.write().unwrap_or_else(|e| e.into_inner());
        cameras.insert(name.to_string(), camera);
        let mut default = self
            .default_camera
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if default.is_none() {
            *default = Some(name.to_string());
        }
        info!(device = name, "camera registered");
    }

    pub fn set_default_camera(&self, name: &str) -> Result<()> {
        let cameras = self.cameras.read().unwrap_or_else(|e| e.into_inner());
        if !cameras.contains_key(name) {
            return Err(EngineError::NotFound(format!("camera '{name}'")));
        }
        *self
            .default_camera
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(name.to_string());
        Ok(())
    }

    pub fn camera(&self, name: &str) -> Result<Arc<CameraController>> {
        self.cameras
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("camera '{name}'")))
    }

    pub fn default_camera(&self) -> Result<Arc<CameraController>> {
        let name = self
            .default_camera
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| EngineError::Resource("no camera registered".into()))?;
        self.camera(&name)
    }

    fn resolve(&self, params: &Value) -> Result<Arc<CameraController>> {
        match params.get("camera").and_then(Value::as_str) {
            Some(name) => self.camera(name),
            None => self.default_camera(),
        }
    }

    /// Drops every registered device. For tests.
    pub fn reset(&self) {
        self.cameras
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self
            .default_camera
            .write()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }
}

// ============================================================================
// Typed task parameters
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExposureTaskParams {
    pub exposure_secs: f64,
    pub frame_type: String,
    pub binning: u32,
    pub gain: i64,
    pub offset: i64,
}

impl ExposureTaskParams {
    pub fn parse(params: &Value) -> Result<Self> {
        let exposure_secs = params
            .get("exposure")
            .and_then(Value::as_f64)
            .ok_or_else(|| EngineError::Validation("'exposure' must be a number".into()))?;
        if !(exposure_secs > 0.0 && exposure_secs <= 3600.0) {
            return Err(EngineError::Validation(format!(
                "'exposure' {exposure_secs} outside (0, 3600]"
            )));
        }
        let frame_type = params
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("light")
            .to_string();
        if !matches!(frame_type.as_str(), "light" | "dark" | "bias" | "flat") {
            return Err(EngineError::Validation(format!(
                "'type' must be light|dark|bias|flat, got '{frame_type}'"
            )));
        }
        let binning = params.get("binning").and_then(Value::as_u64).unwrap_or(1) as u32;
        if !(1..=8).contains(&binning) {
            return Err(EngineError::Validation(format!(
                "'binning' {binning} outside [1, 8]"
            )));
        }
        let gain = params.get("gain").and_then(Value::as_i64).unwrap_or(0);
        let offset = params.get("offset").and_then(Value::as_i64).unwrap_or(10);
        Ok(Self {
            exposure_secs,
            frame_type,
            binning,
            gain,
            offset,
        })
    }

    fn is_dark(&self) -> bool {
        matches!(self.frame_type.as_str(), "dark" | "bias")
    }

    fn settings(&self) -> ExposureSettings {
        ExposureSettings {
            duration_secs: self.exposure_secs,
            binning: self.binning,
            is_dark: self.is_dark(),
            format: ImageFormat::Raw16,
            ..ExposureSettings::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoolingTaskParams {
    pub temperature: f64,
}

impl CoolingTaskParams {
    pub fn parse(params: &Value) -> Result<Self> {
        let temperature = params
            .get("temperature")
            .and_then(Value::as_f64)
            .ok_or_else(|| EngineError::Validation("'temperature' must be a number".into()))?;
        if !(-60.0..=40.0).contains(&temperature) {
            return Err(EngineError::Validation(format!(
                "'temperature' {temperature} outside [-60, 40]"
            )));
        }
        Ok(Self { temperature })
    }
}

#[derive(Debug, Clone)]
pub struct DelayTaskParams {
    pub seconds: f64,
}

impl DelayTaskParams {
    pub fn parse(params: &Value) -> Result<Self> {
        let seconds = params
            .get("seconds")
            .and_then(Value::as_f64)
            .ok_or_else(|| EngineError::Validation("'seconds' must be a number".into()))?;
        if !(0.0..=86_400.0).contains(&seconds) {
            return Err(EngineError::Validation(format!(
                "'seconds' {seconds} outside [0, 86400]"
            )));
        }
        Ok(Self { seconds })
    }
}

// ============================================================================
// Task factory
// ============================================================================

#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub task_type: String,
    pub description: String,
    pub category: String,
}

type ParamValidator = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;
type ActionBuilder = Arc<dyn Fn() -> TaskAction + Send + Sync>;

struct Registration {
    info: TaskInfo,
    validator: ParamValidator,
    builder: ActionBuilder,
}

pub struct TaskFactory {
    types: StdRwLock<HashMap<String, Registration>>,
}

static FACTORY: Lazy<TaskFactory> = Lazy::new(|| TaskFactory {
    types: StdRwLock::new(HashMap::new()),
});

impl TaskFactory {
    pub fn global() -> &'static TaskFactory {
        &FACTORY
    }

    pub fn register(
        &self,
        info: TaskInfo,
        validator: ParamValidator,
        builder: ActionBuilder,
    ) -> Result<()> {
        if info.task_type.trim().is_empty() {
            return Err(EngineError::Validation("task type cannot be empty".into()));
        }
        let mut types = self.types.write().unwrap_or_else(|e| e.into_inner());
        types.insert(
            info.task_type.clone(),
            Registration {
                info,
                validator,
                builder,
            },
        );
        Ok(())
    }

    pub fn is_registered(&self, task_type: &str) -> bool {
        self.types
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .types
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn by_category(&self) -> HashMap<String, Vec<TaskInfo>> {
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        let mut grouped: HashMap<String, Vec<TaskInfo>> = HashMap::new();
        for registration in types.values() {
            grouped
                .entry(registration.info.category.clone())
                .or_default()
                .push(registration.info.clone());
        }
        grouped
    }

    /// Validates a parameter tree against the registered type without
    /// building a task.
    pub fn validate_params(&self, task_type: &str, params: &Value) -> Result<()> {
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        let registration = types.get(task_type).ok_or_else(|| {
            EngineError::Validation(format!("unknown task type '{task_type}'"))
        })?;
        (registration.validator)(params)
    }

    /// Creates a task instance with its initial configuration validated.
    pub fn create(&self, task_type: &str, name: &str, config: Value) -> Result<Task> {
        let (action, validator) = {
            let types = self.types.read().unwrap_or_else(|e| e.into_inner());
            let registration = types.get(task_type).ok_or_else(|| {
                EngineError::Validation(format!("unknown task type '{task_type}'"))
            })?;
            ((registration.builder)(), registration.validator.clone())
        };
        // an empty config defers to target-level parameter injection, so
        // only a populated tree is validated here
        let should_validate = match &config {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            _ => true,
        };
        if should_validate {
            validator(&config)?;
        }
        let mut task = Task::new(name, task_type, action);
        task.set_params(config);
        Ok(task)
    }

    /// Clears every registration. For tests.
    pub fn reset(&self) {
        self.types
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

// ============================================================================
// Built-in task types
// ============================================================================

/// Registers the built-in camera and utility task types. Idempotent.
pub fn register_builtin_tasks() -> Result<()> {
    let factory = TaskFactory::global();

    factory.register(
        TaskInfo {
            task_type: "TakeExposure".to_string(),
            description: "Capture a single frame".to_string(),
            category: "Camera".to_string(),
        },
        Arc::new(|params| ExposureTaskParams::parse(params).map(|_| ())),
        Arc::new(|| -> TaskAction {
            Arc::new(|params: Value| {
                Box::pin(async move {
                    let typed = ExposureTaskParams::parse(&params)?;
                    let camera = DeviceRegistry::global().resolve(&params)?;
                    run_exposure(&camera, &typed).await?;
                    Ok(json!({"completed": 1}))
                })
            })
        }),
    )?;

    factory.register(
        TaskInfo {
            task_type: "TakeManyExposure".to_string(),
            description: "Capture a series of identical frames".to_string(),
            category: "Camera".to_string(),
        },
        Arc::new(|params| {
            ExposureTaskParams::parse(params)?;
            parse_count(params)?;
            Ok(())
        }),
        Arc::new(|| -> TaskAction {
            Arc::new(|params: Value| {
                Box::pin(async move {
                    let typed = ExposureTaskParams::parse(&params)?;
                    let count = parse_count(&params)?;
                    let camera = DeviceRegistry::global().resolve(&params)?;
                    for _ in 0..count {
                        run_exposure(&camera, &typed).await?;
                    }
                    Ok(json!({"completed": count}))
                })
            })
        }),
    )?;

    factory.register(
        TaskInfo {
            task_type: "StartCooling".to_string(),
            description: "Begin cooling toward a setpoint".to_string(),
            category: "Camera".to_string(),
        },
        Arc::new(|params| CoolingTaskParams::parse(params).map(|_| ())),
        Arc::new(|| -> TaskAction {
            Arc::new(|params: Value| {
                Box::pin(async move {
                    let typed = CoolingTaskParams::parse(&params)?;
                    let camera = DeviceRegistry::global().resolve(&params)?;
                    camera.cooling().start_cooling(typed.temperature).await?;
                    Ok(json!({"target": typed.temperature}))
                })
            })
        }),
    )?;

    factory.register(
        TaskInfo {
            task_type: "StopCooling".to_string(),
            description: "Disable the cooler".to_string(),
            category: "Camera".to_string(),
        },
        Arc::new(|_params| Ok(())),
        Arc::new(|| -> TaskAction {
            Arc::new(|params: Value| {
                Box::pin(async move {
                    let camera = DeviceRegistry::global().resolve(&params)?;
                    camera.cooling().stop_cooling().await?;
                    Ok(Value::Null)
                })
            })
        }),
    )?;

    factory.register(
        TaskInfo {
            task_type: "Delay".to_string(),
            description: "Wait for a fixed duration".to_string(),
            category: "Utility".to_string(),
        },
        Arc::new(|params| DelayTaskParams::parse(params).map(|_| ())),
        Arc::new(|| -> TaskAction {
            Arc::new(|params: Value| {
                Box::pin(async move {
                    let typed = DelayTaskParams::parse(&params)?;
                    tokio::time::sleep(Duration::from_secs_f64(typed.seconds)).await;
                    Ok(Value::Null)
                })
            })
        }),
    )?;

    Ok(())
}

fn parse_count(params: &Value) -> Result<u64> {
    let count = params
        .get("count")
        .and_then(Value::as_u64)
        .ok_or_else(|| EngineError::Validation("'count' must be a positive integer".into()))?;
    if count == 0 || count > 10_000 {
        return Err(EngineError::Validation(format!(
            "'count' {count} outside [1, 10000]"
        )));
    }
    Ok(count)
}

async fn run_exposure(camera: &CameraController, typed: &ExposureTaskParams) -> Result<()> {
    camera.set_gain_offset(typed.gain, typed.offset).await?;
    camera.exposure().start_exposure(typed.settings()).await?;
    let result = camera.exposure().wait().await;
    if result.success {
        Ok(())
    } else {
        Err(EngineError::Device(format!(
            "exposure failed: {}",
            result.error_message
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposure_params_validate_bounds() {
        assert!(ExposureTaskParams::parse(&json!({"exposure": 0.5})).is_ok());
        assert!(ExposureTaskParams::parse(&json!({"exposure": 0.0})).is_err());
        assert!(ExposureTaskParams::parse(&json!({"exposure": 5000.0})).is_err());
        assert!(ExposureTaskParams::parse(&json!({"exposure": 1.0, "binning": 12})).is_err());
        assert!(ExposureTaskParams::parse(&json!({"exposure": 1.0, "type": "mosaic"})).is_err());
        let typed =
            ExposureTaskParams::parse(&json!({"exposure": 1.0, "type": "bias"})).unwrap();
        assert!(typed.is_dark());
    }

    #[test]
    fn delay_params_validate() {
        assert!(DelayTaskParams::parse(&json!({"seconds": 1.5})).is_ok());
        assert!(DelayTaskParams::parse(&json!({"seconds": -1.0})).is_err());
        assert!(DelayTaskParams::parse(&json!({})).is_err());
    }

    #[test]
    fn count_bounds() {
        assert!(parse_count(&json!({"count": 3})).is_ok());
        assert!(parse_count(&json!({"count": 0})).is_err());
        assert!(parse_count(&json!({"count": 99999})).is_err());
    }
}
