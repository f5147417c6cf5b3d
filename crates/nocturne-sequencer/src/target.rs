// A target: an ordered container of tasks with task groups, an intra-target
// dependency DAG, cooldown handling, and astronomical metadata.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use nocturne_types::{
    Coordinates, EngineError, ExposurePlan, HorizontalCoordinates, MeridianFlipInfo,
    ObservabilityWindow, Result, TargetAstroConfig, TargetStatus, TaskStatus,
};

use crate::task::{execute_with_retries, Task};
use crate::task_manager::{TaskManager, TaskOrderKey};

pub type TargetStartCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type TargetEndCallback = Arc<dyn Fn(&str, TargetStatus) + Send + Sync>;
pub type TargetErrorCallback = Arc<dyn Fn(&str, &EngineError) + Send + Sync>;

/// Task lifecycle notification delivered to the owning sequencer.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Started(Value),
    Ended(TaskStatus),
}

pub type TaskEventCallback = Arc<dyn Fn(&str, &str, TaskEvent) + Send + Sync>;

#[derive(Default)]
struct TargetCallbacks {
    on_start: Option<TargetStartCallback>,
    on_end: Option<TargetEndCallback>,
    on_error: Option<TargetErrorCallback>,
    on_task_event: Option<TaskEventCallback>,
}

struct TargetState {
    status: TargetStatus,
    completed_tasks: usize,
    total_tasks: usize,
    error: Option<String>,
    warnings: Vec<String>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct TargetConfig {
    cooldown: Duration,
    max_retries: u32,
    enabled: bool,
}

struct ParamsState {
    /// Applied to every task in the target.
    shared: Value,
    /// Per-task overrides, highest precedence.
    per_task: HashMap<Uuid, Value>,
}

struct TargetInner {
    name: String,
    uuid: Uuid,
    state: StdRwLock<TargetState>,
    config: StdRwLock<TargetConfig>,
    tasks: Mutex<Vec<Task>>,
    groups: StdRwLock<HashMap<String, Vec<Uuid>>>,
    deps: StdRwLock<HashMap<Uuid, Vec<Uuid>>>,
    params: StdRwLock<ParamsState>,
    astro: StdRwLock<TargetAstroConfig>,
    paused: AtomicBool,
    pause_notify: Notify,
    abort: StdMutex<CancellationToken>,
    callbacks: StdMutex<TargetCallbacks>,
    records: TaskManager,
}

/// Cloning a `Target` clones a handle to the same target.
#[derive(Clone)]
pub struct Target {
    inner: Arc<TargetInner>,
}

impl Target {
    pub fn new(name: impl Into<String>, cooldown: Duration, max_retries: u32) -> Self {
        Self {
            inner: Arc::new(TargetInner {
                name: name.into(),
                uuid: Uuid::new_v4(),
                state: StdRwLock::new(TargetState {
                    status: TargetStatus::Pending,
                    completed_tasks: 0,
                    total_tasks: 0,
                    error: None,
                    warnings: Vec::new(),
                    started_at: None,
                    ended_at: None,
                }),
                config: StdRwLock::new(TargetConfig {
                    cooldown,
                    max_retries,
                    enabled: true,
                }),
                tasks: Mutex::new(Vec::new()),
                groups: StdRwLock::new(HashMap::new()),
                deps: StdRwLock::new(HashMap::new()),
                params: StdRwLock::new(ParamsState {
                    shared: Value::Object(serde_json::Map::new()),
                    per_task: HashMap::new(),
                }),
                astro: StdRwLock::new(TargetAstroConfig::default()),
                paused: AtomicBool::new(false),
                pause_notify: Notify::new(),
                abort: StdMutex::new(CancellationToken::new()),
                callbacks: StdMutex::new(TargetCallbacks::default()),
                records: TaskManager::new(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Identity and simple accessors
    // ------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn status(&self) -> TargetStatus {
        self.inner.state.read().unwrap_or_else(|e| e.into_inner()).status
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .error
            .clone()
    }

    /// Drains accumulated warnings (retry notes and the like).
    pub fn take_warnings(&self) -> Vec<String> {
        std::mem::take(
            &mut self
                .inner
                .state
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .warnings,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.inner
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner
            .config
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .enabled = enabled;
    }

    pub fn cooldown(&self) -> Duration {
        self.inner
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .cooldown
    }

    pub fn set_cooldown(&self, cooldown: Duration) {
        self.inner
            .config
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .cooldown = cooldown;
    }

    pub fn max_retries(&self) -> u32 {
        self.inner
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .max_retries
    }

    pub fn set_max_retries(&self, retries: u32) {
        self.inner
            .config
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .max_retries = retries;
    }

    pub fn progress(&self) -> f64 {
        let state = self.inner.state.read().unwrap_or_else(|e| e.into_inner());
        if state.total_tasks == 0 {
            return match state.status {
                TargetStatus::Completed | TargetStatus::Skipped => 100.0,
                _ => 0.0,
            };
        }
        state.completed_tasks as f64 / state.total_tasks as f64 * 100.0
    }

    pub fn records(&self) -> &TaskManager {
        &self.inner.records
    }

    // ------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------

    pub fn set_on_start(&self, callback: TargetStartCallback) {
        self.callbacks_mut(|c| c.on_start = Some(callback));
    }

    pub fn set_on_end(&self, callback: TargetEndCallback) {
        self.callbacks_mut(|c| c.on_end = Some(callback));
    }

    pub fn set_on_error(&self, callback: TargetErrorCallback) {
        self.callbacks_mut(|c| c.on_error = Some(callback));
    }

    pub fn set_task_event_callback(&self, callback: TaskEventCallback) {
        self.callbacks_mut(|c| c.on_task_event = Some(callback));
    }

    fn callbacks_mut(&self, f: impl FnOnce(&mut TargetCallbacks)) {
        let mut callbacks = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        f(&mut callbacks);
    }

    fn fire_start(&self) {
        let cb = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_start
            .clone();
        if let Some(cb) = cb {
            cb(&self.inner.name);
        }
    }

    fn fire_end(&self, status: TargetStatus) {
        let cb = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_end
            .clone();
        if let Some(cb) = cb {
            cb(&self.inner.name, status);
        }
    }

    fn fire_error(&self, error: &EngineError) {
        let cb = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_error
            .clone();
        if let Some(cb) = cb {
            cb(&self.inner.name, error);
        }
    }

    fn fire_task_event(&self, task: &str, event: TaskEvent) {
        let cb = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_task_event
            .clone();
        if let Some(cb) = cb {
            cb(&self.inner.name, task, event);
        }
    }

    // ------------------------------------------------------------------
    // Task management
    // ------------------------------------------------------------------

    pub async fn add_task(&self, task: Task) -> Uuid {
        let id = task.id;
        self.inner.tasks.lock().await.push(task);
        self.inner
            .state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .total_tasks += 1;
        id
    }

    pub async fn task_count(&self) -> usize {
        self.inner.tasks.lock().await.len()
    }

    pub async fn task_id_by_name(&self, name: &str) -> Option<Uuid> {
        self.inner
            .tasks
            .lock()
            .await
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.id)
    }

    /// Snapshot of task metadata for serialization and inspection.
    pub async fn tasks_snapshot(&self) -> Vec<Task> {
        self.inner.tasks.lock().await.clone()
    }

    pub fn set_task_params(&self, task_id: Uuid, params: Value) {
        self.inner
            .params
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .per_task
            .insert(task_id, params);
    }

    pub fn task_params(&self, task_id: Uuid) -> Option<Value> {
        self.inner
            .params
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .per_task
            .get(&task_id)
            .cloned()
    }

    /// Parameters applied to every task in the target.
    pub fn set_params(&self, params: Value) {
        self.inner
            .params
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .shared = params;
    }

    pub fn params(&self) -> Value {
        self.inner
            .params
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .shared
            .clone()
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    pub fn create_task_group(&self, group: &str) {
        self.inner
            .groups
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(group.to_string())
            .or_default();
    }

    pub fn add_task_to_group(&self, group: &str, task_id: Uuid) -> Result<()> {
        let mut groups = self.inner.groups.write().unwrap_or_else(|e| e.into_inner());
        let members = groups
            .get_mut(group)
            .ok_or_else(|| EngineError::NotFound(format!("task group '{group}'")))?;
        if !members.contains(&task_id) {
            members.push(task_id);
        }
        Ok(())
    }

    pub fn remove_task_from_group(&self, group: &str, task_id: Uuid) -> Result<()> {
        let mut groups = self.inner.groups.write().unwrap_or_else(|e| e.into_inner());
        let members = groups
            .get_mut(group)
            .ok_or_else(|| EngineError::NotFound(format!("task group '{group}'")))?;
        members.retain(|id| *id != task_id);
        Ok(())
    }

    pub fn task_group(&self, group: &str) -> Option<Vec<Uuid>> {
        self.inner
            .groups
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(group)
            .cloned()
    }

    // ------------------------------------------------------------------
    // Dependencies
    // ------------------------------------------------------------------

    /// Declares `task` to run only after `depends_on`. Rejected when it would
    /// close a cycle.
    pub async fn add_task_dependency(&self, task: Uuid, depends_on: Uuid) -> Result<()> {
        {
            let tasks = self.inner.tasks.lock().await;
            let known: HashSet<Uuid> = tasks.iter().map(|t| t.id).collect();
            if !known.contains(&task) || !known.contains(&depends_on) {
                return Err(EngineError::Dependency(
                    "both tasks must belong to this target".to_string(),
                ));
            }
        }
        let mut deps = self.inner.deps.write().unwrap_or_else(|e| e.into_inner());
        if TaskManager::would_create_cycle(&deps, task, depends_on) {
            return Err(EngineError::Dependency(format!(
                "dependency {task} -> {depends_on} would create a cycle"
            )));
        }
        let entry = deps.entry(task).or_default();
        if !entry.contains(&depends_on) {
            entry.push(depends_on);
        }
        Ok(())
    }

    pub fn remove_task_dependency(&self, task: Uuid, depends_on: Uuid) {
        let mut deps = self.inner.deps.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = deps.get_mut(&task) {
            entry.retain(|id| *id != depends_on);
            if entry.is_empty() {
                deps.remove(&task);
            }
        }
    }

    pub fn task_dependencies(&self, task: Uuid) -> Vec<Uuid> {
        self.inner
            .deps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task)
            .cloned()
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Execution control
    // ------------------------------------------------------------------

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
        if state.status == TargetStatus::InProgress {
            state.status = TargetStatus::Paused;
        }
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        {
            let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
            if state.status == TargetStatus::Paused {
                state.status = TargetStatus::InProgress;
            }
        }
        self.inner.pause_notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn abort(&self) {
        self.inner
            .abort
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner
            .abort
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_cancelled()
    }

    /// Marks a failed or aborted target Pending again for a fresh run.
    pub async fn reset_for_retry(&self) {
        {
            let mut tasks = self.inner.tasks.lock().await;
            for task in tasks.iter_mut() {
                task.reset();
            }
        }
        {
            let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
            state.status = TargetStatus::Pending;
            state.completed_tasks = 0;
            state.error = None;
            state.started_at = None;
            state.ended_at = None;
        }
        self.inner.paused.store(false, Ordering::SeqCst);
        *self.inner.abort.lock().unwrap_or_else(|e| e.into_inner()) = CancellationToken::new();
        self.inner.records.reset();
    }

    pub fn mark_skipped(&self) {
        let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
        state.status = TargetStatus::Skipped;
        state.ended_at = Some(Utc::now());
    }

    pub fn mark_failed(&self, reason: &str) {
        let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
        state.status = TargetStatus::Failed;
        state.error = Some(reason.to_string());
        state.ended_at = Some(Utc::now());
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Runs every task in dependency order. Returns the terminal status.
    pub async fn execute(&self) -> Result<TargetStatus> {
        self.execute_filtered(None).await
    }

    /// Runs only the named group, respecting its internal dependencies.
    pub async fn execute_group(&self, group: &str) -> Result<TargetStatus> {
        let members = self
            .task_group(group)
            .ok_or_else(|| EngineError::NotFound(format!("task group '{group}'")))?;
        self.execute_filtered(Some(members.into_iter().collect()))
            .await
    }

    async fn execute_filtered(&self, filter: Option<HashSet<Uuid>>) -> Result<TargetStatus> {
        if !self.is_enabled() {
            self.set_status(TargetStatus::Skipped);
            self.fire_end(TargetStatus::Skipped);
            return Ok(TargetStatus::Skipped);
        }

        let abort = self
            .inner
            .abort
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        {
            let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
            state.status = TargetStatus::InProgress;
            state.started_at = Some(Utc::now());
            state.ended_at = None;
        }
        self.fire_start();

        let mut tasks = self.inner.tasks.lock().await;
        let order = {
            let deps = self.inner.deps.read().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<TaskOrderKey> = tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| filter.as_ref().map(|f| f.contains(&t.id)).unwrap_or(true))
                .map(|(i, t)| TaskOrderKey {
                    id: t.id,
                    priority: t.priority,
                    insertion: i,
                })
                .collect();
            // within a group, only edges between members apply
            let scoped: HashMap<Uuid, Vec<Uuid>> = match &filter {
                None => deps.clone(),
                Some(members) => deps
                    .iter()
                    .filter(|(task, _)| members.contains(task))
                    .map(|(task, preds)| {
                        (
                            *task,
                            preds
                                .iter()
                                .filter(|p| members.contains(p))
                                .copied()
                                .collect(),
                        )
                    })
                    .collect(),
            };
            TaskManager::execution_order(&keys, &scoped)?
        };

        let total = order.len();
        let cooldown = self.cooldown();
        let target_retries = self.max_retries();

        for (position, task_id) in order.iter().enumerate() {
            if self.hold_at_safe_point(&abort).await {
                self.set_status(TargetStatus::Aborted);
                self.fire_end(TargetStatus::Aborted);
                return Ok(TargetStatus::Aborted);
            }

            let idx = tasks
                .iter()
                .position(|t| t.id == *task_id)
                .ok_or_else(|| EngineError::Dependency("ordered task disappeared".into()))?;

            // every in-edge must have completed
            let preds = self.task_dependencies(*task_id);
            if let Some(blocker) = preds.iter().find(|p| {
                tasks
                    .iter()
                    .find(|t| t.id == **p)
                    .map(|t| t.status() != TaskStatus::Completed)
                    .unwrap_or(true)
            }) {
                let blocked_name = tasks[idx].name.clone();
                let error = EngineError::Dependency(format!(
                    "task '{blocked_name}' prerequisite {blocker} has not completed"
                ));
                self.finish_failed(&blocked_name, error.to_string());
                self.fire_error(&error);
                self.fire_end(TargetStatus::Failed);
                return Ok(TargetStatus::Failed);
            }

            let merged = {
                let params = self.inner.params.read().unwrap_or_else(|e| e.into_inner());
                let mut merged = tasks[idx].params.clone();
                merge_objects(&mut merged, &params.shared);
                if let Some(overrides) = params.per_task.get(task_id) {
                    merge_objects(&mut merged, overrides);
                }
                merged
            };

            // a task with no retry policy of its own inherits the target's
            if tasks[idx].max_retries == 0 && target_retries > 0 {
                tasks[idx].set_retry_policy(target_retries);
            }

            let task_name = tasks[idx].name.clone();
            let task_type = tasks[idx].task_type.clone();
            self.inner.records.record_start(*task_id, &task_name);
            self.fire_task_event(&task_name, TaskEvent::Started(merged.clone()));

            let target_name = self.inner.name.clone();
            let warn_sink = &self.inner.state;
            let outcome = execute_with_retries(&mut tasks[idx], merged, Some(&abort), |task, attempt, error| {
                warn!(
                    target = %target_name,
                    task = %task.name,
                    attempt,
                    error = %error,
                    "task attempt failed, retrying"
                );
                warn_sink
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .warnings
                    .push(format!(
                        "task '{}' in target '{}' retried after failure (attempt {} of {}): {}",
                        task.name,
                        target_name,
                        attempt,
                        task.max_retries + 1,
                        error
                    ));
            })
            .await;

            match outcome {
                Ok(result) => {
                    self.inner
                        .records
                        .record_end(*task_id, TaskStatus::Completed, None);
                    self.fire_task_event(&task_name, TaskEvent::Ended(TaskStatus::Completed));
                    {
                        let mut state =
                            self.inner.state.write().unwrap_or_else(|e| e.into_inner());
                        state.completed_tasks += 1;
                    }
                    self.note_completed_exposures(&task_type, &result);
                }
                Err(EngineError::Aborted(_)) => {
                    self.inner.records.record_end(
                        *task_id,
                        TaskStatus::Failed,
                        Some("aborted".to_string()),
                    );
                    self.fire_task_event(&task_name, TaskEvent::Ended(TaskStatus::Failed));
                    self.set_status(TargetStatus::Aborted);
                    self.fire_end(TargetStatus::Aborted);
                    return Ok(TargetStatus::Aborted);
                }
                Err(error) => {
                    self.inner.records.record_end(
                        *task_id,
                        TaskStatus::Failed,
                        Some(error.to_string()),
                    );
                    self.fire_task_event(&task_name, TaskEvent::Ended(TaskStatus::Failed));
                    self.finish_failed(&task_name, error.to_string());
                    self.fire_error(&error);
                    self.fire_end(TargetStatus::Failed);
                    return Ok(TargetStatus::Failed);
                }
            }

            // cooldown between consecutive tasks, skipped after abort
            let last = position + 1 == total;
            if !last && !cooldown.is_zero() {
                tokio::select! {
                    _ = abort.cancelled() => {
                        self.set_status(TargetStatus::Aborted);
                        self.fire_end(TargetStatus::Aborted);
                        return Ok(TargetStatus::Aborted);
                    }
                    _ = tokio::time::sleep(cooldown) => {}
                }
            }
        }

        {
            let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
            state.status = TargetStatus::Completed;
            state.ended_at = Some(Utc::now());
        }
        debug!(target = %self.inner.name, "target completed");
        self.fire_end(TargetStatus::Completed);
        Ok(TargetStatus::Completed)
    }

    /// Parks while paused; returns true if aborted.
    async fn hold_at_safe_point(&self, abort: &CancellationToken) -> bool {
        loop {
            if abort.is_cancelled() {
                return true;
            }
            if !self.inner.paused.load(Ordering::SeqCst) {
                return false;
            }
            tokio::select! {
                _ = abort.cancelled() => return true,
                _ = self.inner.pause_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }

    fn set_status(&self, status: TargetStatus) {
        let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
        state.status = status;
        if status.is_terminal() {
            state.ended_at = Some(Utc::now());
        }
    }

    fn finish_failed(&self, task_name: &str, error: String) {
        let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
        state.status = TargetStatus::Failed;
        state.error = Some(format!("task '{task_name}' failed: {error}"));
        state.ended_at = Some(Utc::now());
    }

    fn note_completed_exposures(&self, task_type: &str, result: &Value) {
        if task_type != "TakeExposure" && task_type != "TakeManyExposure" {
            return;
        }
        let count = result
            .get("completed")
            .and_then(Value::as_u64)
            .unwrap_or(1);
        let mut astro = self.inner.astro.write().unwrap_or_else(|e| e.into_inner());
        for _ in 0..count {
            if let Some(plan) = astro.current_plan_mut() {
                plan.record_completed();
            }
        }
    }

    // ------------------------------------------------------------------
    // Astronomy
    // ------------------------------------------------------------------

    pub fn astro_config(&self) -> TargetAstroConfig {
        self.inner.astro.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_astro_config(&self, config: TargetAstroConfig) {
        *self.inner.astro.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    pub fn set_coordinates(&self, coordinates: Coordinates) {
        self.inner
            .astro
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .coordinates = coordinates;
    }

    pub fn coordinates(&self) -> Coordinates {
        self.inner
            .astro
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .coordinates
    }

    pub fn add_exposure_plan(&self, plan: ExposurePlan) {
        self.inner
            .astro
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .exposure_plans
            .push(plan);
    }

    pub fn remove_exposure_plan(&self, filter: &str) -> bool {
        let mut astro = self.inner.astro.write().unwrap_or_else(|e| e.into_inner());
        let before = astro.exposure_plans.len();
        astro.exposure_plans.retain(|p| p.filter != filter);
        let removed = astro.exposure_plans.len() != before;
        if removed {
            astro.current_plan_index = astro.current_plan_index.min(astro.exposure_plans.len());
        }
        removed
    }

    pub fn current_exposure_plan(&self) -> Option<ExposurePlan> {
        self.inner
            .astro
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .current_plan()
            .cloned()
    }

    pub fn advance_exposure_plan(&self) -> bool {
        self.inner
            .astro
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .advance_plan()
    }

    pub fn record_completed_exposure(&self) {
        let mut astro = self.inner.astro.write().unwrap_or_else(|e| e.into_inner());
        if let Some(plan) = astro.current_plan_mut() {
            plan.record_completed();
        }
    }

    pub fn set_observability_window(&self, window: ObservabilityWindow) {
        self.inner
            .astro
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .observability_window = Some(window);
    }

    pub fn update_horizontal_coordinates(&self, coordinates: HorizontalCoordinates) {
        self.inner
            .astro
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .horizontal = coordinates;
    }

    pub fn update_meridian_flip_info(&self, info: MeridianFlipInfo) {
        self.inner
            .astro
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .meridian = info;
    }

    /// Observable right now: inside the window (when one is set) and above
    /// the minimum altitude. `fallback_min_altitude` applies when the target
    /// itself has no constraint.
    pub fn is_observable_at(&self, now: DateTime<Utc>, fallback_min_altitude: f64) -> bool {
        let astro = self.inner.astro.read().unwrap_or_else(|e| e.into_inner());
        if let Some(window) = &astro.observability_window {
            if !window.contains(now) {
                return false;
            }
        }
        let min_altitude = if astro.min_altitude > 0.0 {
            astro.min_altitude
        } else {
            fallback_min_altitude
        };
        astro.horizontal.altitude >= min_altitude
    }

    pub fn is_observable(&self) -> bool {
        self.is_observable_at(Utc::now(), 0.0)
    }

    pub fn current_altitude(&self) -> f64 {
        self.inner
            .astro
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .horizontal
            .altitude
    }

    pub fn needs_meridian_flip(&self) -> bool {
        let astro = self.inner.astro.read().unwrap_or_else(|e| e.into_inner());
        astro.meridian.needs_flip && !astro.meridian.flip_completed
    }

    pub fn mark_meridian_flip_completed(&self) {
        let mut astro = self.inner.astro.write().unwrap_or_else(|e| e.into_inner());
        astro.meridian.flip_completed = true;
        astro.meridian.needs_flip = false;
    }

    pub fn remaining_exposure_secs(&self) -> f64 {
        self.inner
            .astro
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .remaining_exposure_secs()
    }

    pub fn exposure_progress(&self) -> f64 {
        self.inner
            .astro
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .exposure_progress()
    }

    pub fn exposure_plans_complete(&self) -> bool {
        self.inner
            .astro
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .plans_complete()
    }

    pub fn priority(&self) -> i32 {
        self.inner
            .astro
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .priority
    }

    pub fn set_priority(&self, priority: i32) {
        self.inner
            .astro
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .priority = priority.clamp(1, 10);
    }
}

/// Deep object merge: `overlay` keys win, nested objects merge recursively.
fn merge_objects(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_objects(existing, value);
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            if !overlay_value.is_null() {
                *base_slot = overlay_value.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskAction;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn noop_action() -> TaskAction {
        Arc::new(|_params| Box::pin(async { Ok(Value::Null) }))
    }

    fn recording_action(log: Arc<StdMutex<Vec<String>>>, label: &str) -> TaskAction {
        let label = label.to_string();
        Arc::new(move |_params| {
            let log = log.clone();
            let label = label.clone();
            Box::pin(async move {
                log.lock().unwrap().push(label);
                Ok(Value::Null)
            })
        })
    }

    #[tokio::test]
    async fn disabled_target_reports_skipped() {
        let target = Target::new("M81", Duration::ZERO, 0);
        target.add_task(Task::new("t", "test", noop_action())).await;
        target.set_enabled(false);
        let status = target.execute().await.unwrap();
        assert_eq!(status, TargetStatus::Skipped);
        assert_eq!(target.progress(), 0.0);
    }

    #[tokio::test]
    async fn tasks_run_in_dependency_order() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let target = Target::new("M42", Duration::ZERO, 0);
        let first = target
            .add_task(Task::new("first", "test", recording_action(log.clone(), "first")))
            .await;
        let second = target
            .add_task(Task::new("second", "test", recording_action(log.clone(), "second")))
            .await;
        // declare "first" to run after "second"
        target.add_task_dependency(first, second).await.unwrap();

        let status = target.execute().await.unwrap();
        assert_eq!(status, TargetStatus::Completed);
        assert_eq!(*log.lock().unwrap(), vec!["second", "first"]);
        assert_eq!(target.progress(), 100.0);
    }

    #[tokio::test]
    async fn cycle_rejected_at_mutation_time() {
        let target = Target::new("M1", Duration::ZERO, 0);
        let a = target.add_task(Task::new("a", "test", noop_action())).await;
        let b = target.add_task(Task::new("b", "test", noop_action())).await;
        target.add_task_dependency(a, b).await.unwrap();
        let err = target.add_task_dependency(b, a).await.unwrap_err();
        assert_eq!(err.kind(), "dependency");
    }

    #[tokio::test]
    async fn failing_task_fails_target_and_collects_retry_warnings() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let action: TaskAction = Arc::new(move |_params| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::Execution("always broken".into()))
            })
        });
        let target = Target::new("M27", Duration::ZERO, 2);
        target.add_task(Task::new("broken", "test", action)).await;

        let status = target.execute().await.unwrap();
        assert_eq!(status, TargetStatus::Failed);
        // initial attempt + 2 inherited retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let warnings = target.take_warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("retried"));
        assert!(target.error_message().unwrap().contains("broken"));
    }

    #[tokio::test]
    async fn group_execution_runs_only_members() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let target = Target::new("M31", Duration::ZERO, 0);
        let a = target
            .add_task(Task::new("a", "test", recording_action(log.clone(), "a")))
            .await;
        let _b = target
            .add_task(Task::new("b", "test", recording_action(log.clone(), "b")))
            .await;
        target.create_task_group("calibration");
        target.add_task_to_group("calibration", a).unwrap();

        let status = target.execute_group("calibration").await.unwrap();
        assert_eq!(status, TargetStatus::Completed);
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn abort_stops_between_tasks() {
        let target = Target::new("M33", Duration::from_millis(200), 0);
        let slow: TaskAction = Arc::new(|_params| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(Value::Null)
            })
        });
        target.add_task(Task::new("one", "test", slow.clone())).await;
        target.add_task(Task::new("two", "test", slow)).await;

        let runner = target.clone();
        let handle = tokio::spawn(async move { runner.execute().await });
        tokio::time::sleep(Duration::from_millis(60)).await;
        target.abort();
        let status = handle.await.unwrap().unwrap();
        assert_eq!(status, TargetStatus::Aborted);
    }

    #[tokio::test]
    async fn pause_holds_then_resume_finishes() {
        let target = Target::new("M45", Duration::ZERO, 0);
        let quick: TaskAction = Arc::new(|_params| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Value::Null)
            })
        });
        target.add_task(Task::new("one", "test", quick.clone())).await;
        target.add_task(Task::new("two", "test", quick)).await;

        target.pause();
        let runner = target.clone();
        let handle = tokio::spawn(async move { runner.execute().await });
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(target.is_paused());
        target.resume();
        let status = handle.await.unwrap().unwrap();
        assert_eq!(status, TargetStatus::Completed);
    }

    #[tokio::test]
    async fn per_task_params_override_shared_params() {
        let seen = Arc::new(StdMutex::new(json!(null)));
        let sink = seen.clone();
        let action: TaskAction = Arc::new(move |params| {
            let sink = sink.clone();
            Box::pin(async move {
                *sink.lock().unwrap() = params;
                Ok(Value::Null)
            })
        });
        let target = Target::new("M51", Duration::ZERO, 0);
        let mut task = Task::new("exp", "test", action);
        task.set_params(json!({"gain": 10, "offset": 5}));
        let id = target.add_task(task).await;
        target.set_params(json!({"gain": 100}));
        target.set_task_params(id, json!({"gain": 200}));

        target.execute().await.unwrap();
        let params = seen.lock().unwrap().clone();
        assert_eq!(params["gain"], 200);
        assert_eq!(params["offset"], 5);
    }

    #[tokio::test]
    async fn exposure_bookkeeping_updates_plan() {
        let target = Target::new("M101", Duration::ZERO, 0);
        target.add_exposure_plan(ExposurePlan::new("L", 60.0, 3));
        let action: TaskAction =
            Arc::new(|_params| Box::pin(async { Ok(json!({"completed": 2})) }));
        target
            .add_task(Task::new("many", "TakeManyExposure", action))
            .await;
        target.execute().await.unwrap();
        let plan = target.current_exposure_plan().unwrap();
        assert_eq!(plan.completed_count, 2);
        assert_eq!(target.remaining_exposure_secs(), 60.0);
    }

    #[tokio::test]
    async fn observability_uses_window_and_altitude() {
        let target = Target::new("NGC891", Duration::ZERO, 0);
        let now = Utc::now();
        target.set_observability_window(ObservabilityWindow {
            start: now - chrono::Duration::hours(1),
            end: now + chrono::Duration::hours(1),
            transit: None,
        });
        target.update_horizontal_coordinates(HorizontalCoordinates {
            altitude: 42.0,
            azimuth: 120.0,
        });
        assert!(target.is_observable_at(now, 30.0));
        assert!(!target.is_observable_at(now, 50.0));
        assert!(!target.is_observable_at(now + chrono::Duration::hours(2), 30.0));
    }
}
