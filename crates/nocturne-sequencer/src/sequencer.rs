// The exposure sequence: orchestrates targets under a scheduling strategy,
// an execution strategy, and a recovery strategy, on a dedicated worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use nocturne_template::MacroEngine;
use nocturne_types::{
    EngineError, ExecutionStrategy, ObserverLocation, ProgressReport, RecoveryStrategy, Result,
    SchedulingStrategy, SequenceEvent, SequenceState, TargetStatus, TaskStatus,
};

use crate::events::{CallbackRegistry, EventBus};
use crate::resources::{ResourceLimits, ResourceProbe, SystemResourceProbe};
use crate::scheduler::{TargetEntry, TargetScheduler};
use crate::target::{Target, TaskEvent};

const IDLE_TICK: Duration = Duration::from_millis(20);
const JOIN_TICK: Duration = Duration::from_millis(50);

struct Strategies {
    scheduling: SchedulingStrategy,
    execution: ExecutionStrategy,
    recovery: RecoveryStrategy,
}

struct Limits {
    max_concurrent_targets: usize,
    global_timeout: Option<Duration>,
    target_timeouts: HashMap<String, Duration>,
    resource_limits: ResourceLimits,
}

#[derive(Default)]
struct StatsInner {
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
    per_target_ms: HashMap<String, u64>,
    target_started: HashMap<String, Instant>,
    completed_targets: usize,
    failed_names: Vec<String>,
    warnings: Vec<String>,
    errors: Vec<String>,
    current_target: Option<String>,
    current_task: Option<String>,
    retry_counts: HashMap<String, u32>,
}

struct AstroScheduling {
    observer: Option<ObserverLocation>,
    min_altitude: f64,
}

struct SequenceInner {
    uuid: StdRwLock<Uuid>,
    name: StdRwLock<String>,
    targets: RwLock<Vec<Target>>,
    deps: StdRwLock<HashMap<String, Vec<String>>>,
    strategies: StdRwLock<Strategies>,
    limits: StdRwLock<Limits>,
    alternatives: Mutex<HashMap<String, Target>>,
    stats: StdRwLock<StatsInner>,
    astro: StdRwLock<AstroScheduling>,
    macros: Arc<MacroEngine>,
    events: EventBus,
    callbacks: CallbackRegistry,
    state_tx: watch::Sender<SequenceState>,
    cancel: StdMutex<CancellationToken>,
    /// Set when a Stop recovery halts the run from the inside.
    halt: AtomicBool,
    paused: AtomicBool,
    pause_notify: Notify,
    progress_interval: StdRwLock<Duration>,
    resource_probe: StdRwLock<Arc<dyn ResourceProbe>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Cloning yields another handle onto the same sequence.
#[derive(Clone)]
pub struct ExposureSequence {
    inner: Arc<SequenceInner>,
}

impl std::fmt::Debug for ExposureSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposureSequence")
            .field("uuid", &*self.inner.uuid.read().unwrap())
            .field("name", &*self.inner.name.read().unwrap())
            .finish()
    }
}

impl ExposureSequence {
    pub fn new(name: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(SequenceState::Idle);
        Self {
            inner: Arc::new(SequenceInner {
                uuid: StdRwLock::new(Uuid::new_v4()),
                name: StdRwLock::new(name.into()),
                targets: RwLock::new(Vec::new()),
                deps: StdRwLock::new(HashMap::new()),
                strategies: StdRwLock::new(Strategies {
                    scheduling: SchedulingStrategy::Fifo,
                    execution: ExecutionStrategy::Sequential,
                    recovery: RecoveryStrategy::Stop,
                }),
                limits: StdRwLock::new(Limits {
                    max_concurrent_targets: 1,
                    global_timeout: None,
                    target_timeouts: HashMap::new(),
                    resource_limits: ResourceLimits::default(),
                }),
                alternatives: Mutex::new(HashMap::new()),
                stats: StdRwLock::new(StatsInner::default()),
                astro: StdRwLock::new(AstroScheduling {
                    observer: None,
                    min_altitude: 0.0,
                }),
                macros: Arc::new(MacroEngine::new()),
                events: EventBus::new(),
                callbacks: CallbackRegistry::new(),
                state_tx,
                cancel: StdMutex::new(CancellationToken::new()),
                halt: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                pause_notify: Notify::new(),
                progress_interval: StdRwLock::new(Duration::from_secs(1)),
                resource_probe: StdRwLock::new(Arc::new(SystemResourceProbe)),
                worker: Mutex::new(None),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn uuid(&self) -> Uuid {
        *self.inner.uuid.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_uuid(&self, uuid: Uuid) {
        *self.inner.uuid.write().unwrap_or_else(|e| e.into_inner()) = uuid;
    }

    pub fn name(&self) -> String {
        self.inner
            .name
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.inner.name.write().unwrap_or_else(|e| e.into_inner()) = name.into();
    }

    pub fn state(&self) -> SequenceState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            SequenceState::Running | SequenceState::Paused | SequenceState::Stopping
        )
    }

    pub fn macros(&self) -> &Arc<MacroEngine> {
        &self.inner.macros
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.inner.callbacks
    }

    // ------------------------------------------------------------------
    // Composition
    // ------------------------------------------------------------------

    pub async fn add_target(&self, target: Target) -> Result<()> {
        if self.is_running() {
            return Err(EngineError::InvalidOperation(
                "cannot add targets while the sequence is running".into(),
            ));
        }
        let mut targets = self.inner.targets.write().await;
        if targets.iter().any(|t| t.name() == target.name()) {
            return Err(EngineError::Validation(format!(
                "target '{}' already exists",
                target.name()
            )));
        }
        self.wire_target(&target);
        targets.push(target);
        Ok(())
    }

    fn wire_target(&self, target: &Target) {
        let inner = Arc::downgrade(&self.inner);
        target.set_task_event_callback(Arc::new(move |target_name, task_name, event| {
            let Some(inner) = inner.upgrade() else { return };
            let sequence = ExposureSequence { inner };
            match event {
                TaskEvent::Started(info) => {
                    {
                        let mut stats = sequence
                            .inner
                            .stats
                            .write()
                            .unwrap_or_else(|e| e.into_inner());
                        stats.current_task = Some(task_name.to_string());
                    }
                    sequence.inner.events.publish(SequenceEvent::TaskStarted {
                        target: target_name.to_string(),
                        task: task_name.to_string(),
                        info,
                        timestamp: Utc::now(),
                    });
                    sequence
                        .inner
                        .callbacks
                        .invoke_task_start(target_name, task_name, TaskStatus::InProgress);
                }
                TaskEvent::Ended(status) => {
                    sequence.inner.events.publish(SequenceEvent::TaskEnded {
                        target: target_name.to_string(),
                        task: task_name.to_string(),
                        status,
                        timestamp: Utc::now(),
                    });
                    sequence
                        .inner
                        .callbacks
                        .invoke_task_end(target_name, task_name, status);
                }
            }
        }));
    }

    pub async fn remove_target(&self, name: &str) -> Result<()> {
        if self.is_running() {
            return Err(EngineError::InvalidOperation(
                "cannot remove targets while the sequence is running".into(),
            ));
        }
        let mut targets = self.inner.targets.write().await;
        let before = targets.len();
        targets.retain(|t| t.name() != name);
        if targets.len() == before {
            return Err(EngineError::NotFound(format!("target '{name}'")));
        }
        let mut deps = self.inner.deps.write().unwrap_or_else(|e| e.into_inner());
        deps.remove(name);
        for preds in deps.values_mut() {
            preds.retain(|p| p != name);
        }
        Ok(())
    }

    /// Applies a modifier to the named target under the sequence lock.
    pub async fn modify_target(
        &self,
        name: &str,
        modifier: impl FnOnce(&Target),
    ) -> Result<()> {
        let targets = self.inner.targets.read().await;
        let target = targets
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| EngineError::NotFound(format!("target '{name}'")))?;
        modifier(target);
        Ok(())
    }

    pub async fn target(&self, name: &str) -> Option<Target> {
        self.inner
            .targets
            .read()
            .await
            .iter()
            .find(|t| t.name() == name)
            .cloned()
    }

    pub async fn target_names(&self) -> Vec<String> {
        self.inner
            .targets
            .read()
            .await
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    pub async fn target_status(&self, name: &str) -> Result<TargetStatus> {
        self.target(name)
            .await
            .map(|t| t.status())
            .ok_or_else(|| EngineError::NotFound(format!("target '{name}'")))
    }

    pub async fn target_count(&self) -> usize {
        self.inner.targets.read().await.len()
    }

    /// Overall progress: targets that finished successfully (completed or
    /// skipped) over the total, as a percentage.
    pub async fn progress(&self) -> f64 {
        let targets = self.inner.targets.read().await;
        if targets.is_empty() {
            return 0.0;
        }
        let done = targets
            .iter()
            .filter(|t| {
                matches!(
                    t.status(),
                    TargetStatus::Completed | TargetStatus::Skipped
                )
            })
            .count();
        done as f64 / targets.len() as f64 * 100.0
    }

    // ------------------------------------------------------------------
    // Dependencies and strategies
    // ------------------------------------------------------------------

    /// Declares that `name` runs only after `depends_on` completed. Rejected
    /// before the mutation is visible when it would close a cycle.
    pub async fn add_target_dependency(&self, name: &str, depends_on: &str) -> Result<()> {
        {
            let targets = self.inner.targets.read().await;
            for required in [name, depends_on] {
                if !targets.iter().any(|t| t.name() == required) {
                    return Err(EngineError::NotFound(format!("target '{required}'")));
                }
            }
        }
        let mut deps = self.inner.deps.write().unwrap_or_else(|e| e.into_inner());
        if TargetScheduler::would_create_cycle(&deps, name, depends_on) {
            return Err(EngineError::Validation(format!(
                "dependency {name} -> {depends_on} would create a cycle"
            )));
        }
        let entry = deps.entry(name.to_string()).or_default();
        if !entry.iter().any(|p| p == depends_on) {
            entry.push(depends_on.to_string());
        }
        Ok(())
    }

    pub fn remove_target_dependency(&self, name: &str, depends_on: &str) {
        let mut deps = self.inner.deps.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = deps.get_mut(name) {
            entry.retain(|p| p != depends_on);
            if entry.is_empty() {
                deps.remove(name);
            }
        }
    }

    pub fn target_dependencies(&self, name: &str) -> Vec<String> {
        self.inner
            .deps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_target_ready(&self, name: &str) -> bool {
        let statuses = self.status_map().await;
        let deps = self
            .inner
            .deps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        TargetScheduler::is_ready(name, &statuses, &deps)
    }

    pub fn set_scheduling_strategy(&self, strategy: SchedulingStrategy) {
        self.inner
            .strategies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .scheduling = strategy;
    }

    pub fn scheduling_strategy(&self) -> SchedulingStrategy {
        self.inner
            .strategies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .scheduling
    }

    pub fn set_execution_strategy(&self, strategy: ExecutionStrategy) {
        self.inner
            .strategies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .execution = strategy;
    }

    pub fn execution_strategy(&self) -> ExecutionStrategy {
        self.inner
            .strategies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .execution
    }

    pub fn set_recovery_strategy(&self, strategy: RecoveryStrategy) {
        self.inner
            .strategies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .recovery = strategy;
    }

    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        self.inner
            .strategies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .recovery
    }

    /// Registers a stand-in executed in place of `name` if it terminally
    /// fails under the Alternative recovery strategy.
    pub async fn add_alternative_target(&self, name: &str, alternative: Target) {
        self.inner
            .alternatives
            .lock()
            .await
            .insert(name.to_string(), alternative);
    }

    pub async fn set_target_priority(&self, name: &str, priority: i32) -> Result<()> {
        self.modify_target(name, |t| t.set_priority(priority)).await
    }

    pub fn set_target_timeout(&self, name: &str, timeout: Duration) {
        self.inner
            .limits
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .target_timeouts
            .insert(name.to_string(), timeout);
    }

    pub fn set_global_timeout(&self, timeout: Option<Duration>) {
        self.inner
            .limits
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .global_timeout = timeout;
    }

    pub fn global_timeout(&self) -> Option<Duration> {
        self.inner
            .limits
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .global_timeout
    }

    pub fn set_max_concurrent_targets(&self, max: usize) {
        self.inner
            .limits
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .max_concurrent_targets = max.max(1);
    }

    pub fn max_concurrent_targets(&self) -> usize {
        self.inner
            .limits
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .max_concurrent_targets
    }

    pub fn set_resource_limits(&self, limits: ResourceLimits) {
        self.inner
            .limits
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .resource_limits = limits;
    }

    pub fn set_resource_probe(&self, probe: Arc<dyn ResourceProbe>) {
        *self
            .inner
            .resource_probe
            .write()
            .unwrap_or_else(|e| e.into_inner()) = probe;
    }

    pub fn set_progress_interval(&self, interval: Duration) {
        *self
            .inner
            .progress_interval
            .write()
            .unwrap_or_else(|e| e.into_inner()) = interval;
    }

    // ------------------------------------------------------------------
    // Parameter injection
    // ------------------------------------------------------------------

    pub async fn set_target_params(&self, name: &str, params: Value) -> Result<()> {
        self.modify_target(name, |t| t.set_params(params)).await
    }

    pub async fn set_target_task_params(
        &self,
        name: &str,
        task_id: Uuid,
        params: Value,
    ) -> Result<()> {
        self.modify_target(name, |t| t.set_task_params(task_id, params))
            .await
    }

    // ------------------------------------------------------------------
    // Macros
    // ------------------------------------------------------------------

    pub fn add_macro(&self, name: &str, value: nocturne_template::MacroValue) -> Result<()> {
        self.inner
            .macros
            .add_macro(name, value)
            .map_err(|e| EngineError::Validation(e.to_string()))
    }

    pub fn remove_macro(&self, name: &str) -> Result<()> {
        self.inner
            .macros
            .remove_macro(name)
            .map_err(|e| EngineError::Validation(e.to_string()))
    }

    pub fn list_macros(&self) -> Vec<String> {
        self.inner.macros.list_macros()
    }

    /// Expands macros inside one target's shared and per-task parameters.
    pub async fn process_target_with_macros(&self, name: &str) -> Result<()> {
        let target = self
            .target(name)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("target '{name}'")))?;
        let mut params = target.params();
        self.inner
            .macros
            .process_json(&mut params)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        target.set_params(params);
        for task in target.tasks_snapshot().await {
            if let Some(mut overrides) = target.task_params(task.id) {
                self.inner
                    .macros
                    .process_json(&mut overrides)
                    .map_err(|e| EngineError::Validation(e.to_string()))?;
                target.set_task_params(task.id, overrides);
            }
        }
        Ok(())
    }

    pub async fn process_all_targets_with_macros(&self) -> Result<()> {
        for name in self.target_names().await {
            self.process_target_with_macros(&name).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Astronomy-aware scheduling
    // ------------------------------------------------------------------

    pub fn set_observer_location(&self, location: ObserverLocation) {
        self.inner
            .astro
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .observer = Some(location);
    }

    pub fn observer_location(&self) -> Option<ObserverLocation> {
        self.inner
            .astro
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .observer
    }

    pub fn set_min_altitude(&self, degrees: f64) {
        self.inner
            .astro
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .min_altitude = degrees;
    }

    pub fn min_altitude(&self) -> f64 {
        self.inner
            .astro
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .min_altitude
    }

    /// Reorders targets so observable ones come first, highest first.
    pub async fn sort_targets_by_observability(&self) -> Result<()> {
        if self.is_running() {
            return Err(EngineError::InvalidOperation(
                "cannot reorder targets while the sequence is running".into(),
            ));
        }
        let min_altitude = self.min_altitude();
        let now = Utc::now();
        let mut targets = self.inner.targets.write().await;
        targets.sort_by(|a, b| {
            let a_obs = a.is_observable_at(now, min_altitude);
            let b_obs = b.is_observable_at(now, min_altitude);
            b_obs
                .cmp(&a_obs)
                .then(b.current_altitude().total_cmp(&a.current_altitude()))
        });
        Ok(())
    }

    /// First target that needs a meridian flip, if any.
    pub async fn check_meridian_flips(&self) -> Option<String> {
        self.inner
            .targets
            .read()
            .await
            .iter()
            .find(|t| t.needs_meridian_flip())
            .map(|t| t.name().to_string())
    }

    /// Total remaining exposure time across unfinished, enabled targets.
    pub async fn remaining_exposure_secs(&self) -> f64 {
        self.inner
            .targets
            .read()
            .await
            .iter()
            .filter(|t| t.is_enabled() && !t.status().is_terminal())
            .map(|t| t.remaining_exposure_secs())
            .sum()
    }

    pub async fn can_complete_before_dawn(&self, dawn: DateTime<Utc>) -> bool {
        let available = (dawn - Utc::now()).num_seconds() as f64;
        available >= self.remaining_exposure_secs().await
    }

    /// Greedy prefix of the schedule whose summed remaining exposure time
    /// fits before dawn.
    pub async fn targets_completable_before_dawn(&self, dawn: DateTime<Utc>) -> Vec<String> {
        let mut available = (dawn - Utc::now()).num_seconds() as f64;
        let mut names = Vec::new();
        for target in self.inner.targets.read().await.iter() {
            if !target.is_enabled() || target.status().is_terminal() {
                continue;
            }
            let need = target.remaining_exposure_secs();
            if need <= available {
                available -= need;
                names.push(target.name().to_string());
            }
        }
        names
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    pub async fn to_json(&self) -> Value {
        crate::document::sequence_to_json(self).await
    }

    pub async fn from_json(doc: &Value) -> Result<Self> {
        crate::document::sequence_from_json(doc).await
    }

    /// Writes the sequence document as pretty JSON.
    pub async fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        let doc = self.to_json().await;
        tokio::fs::write(path, serde_json::to_string_pretty(&doc)?).await?;
        Ok(())
    }

    /// Reads a sequence document from a file; validation happens inside
    /// `from_json`.
    pub async fn load_from_file(path: &std::path::Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        let doc: Value = serde_json::from_str(&text)?;
        Self::from_json(&doc).await
    }

    // ------------------------------------------------------------------
    // Execution control
    // ------------------------------------------------------------------

    /// Starts the sequence on a dedicated worker task.
    pub async fn execute_all(&self) -> Result<()> {
        if self.is_running() {
            return Err(EngineError::InvalidOperation(
                "sequence is already running".into(),
            ));
        }
        if self.inner.targets.read().await.is_empty() {
            return Err(EngineError::InvalidOperation(
                "sequence has no targets".into(),
            ));
        }
        {
            // strategy-level validation happens before the worker starts
            let entries = self.order_entries().await;
            let deps = self
                .inner
                .deps
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            TargetScheduler::validate(&entries, &deps)?;
        }

        *self.inner.cancel.lock().unwrap_or_else(|e| e.into_inner()) = CancellationToken::new();
        self.inner.halt.store(false, Ordering::SeqCst);
        self.inner.paused.store(false, Ordering::SeqCst);
        {
            let mut stats = self.inner.stats.write().unwrap_or_else(|e| e.into_inner());
            *stats = StatsInner::default();
            stats.started_at = Some(Instant::now());
        }

        // visible as Running before the worker is scheduled, so waiters never
        // observe a stale terminal state
        self.set_state(SequenceState::Running);
        let sequence = self.clone();
        let handle = tokio::spawn(async move { sequence.run().await });
        let mut worker = self.inner.worker.lock().await;
        if let Some(previous) = worker.replace(handle) {
            let _ = previous.await;
        }
        Ok(())
    }

    /// Requests cooperative termination: running targets stop at their next
    /// safe point, then the sequence transitions to Stopped.
    pub async fn stop(&self) {
        self.inner
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        self.inner.pause_notify.notify_waiters();
        let targets = self.inner.targets.read().await;
        for target in targets.iter() {
            if matches!(
                target.status(),
                TargetStatus::InProgress | TargetStatus::Paused
            ) {
                target.abort();
            }
        }
    }

    pub async fn pause(&self) -> Result<()> {
        if self.state() != SequenceState::Running {
            return Err(EngineError::InvalidOperation(
                "sequence is not running".into(),
            ));
        }
        self.inner.paused.store(true, Ordering::SeqCst);
        for target in self.inner.targets.read().await.iter() {
            if target.status() == TargetStatus::InProgress {
                target.pause();
            }
        }
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        if self.state() != SequenceState::Paused {
            return Err(EngineError::InvalidOperation(
                "sequence is not paused".into(),
            ));
        }
        for target in self.inner.targets.read().await.iter() {
            if target.status() == TargetStatus::Paused {
                target.resume();
            }
        }
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.pause_notify.notify_waiters();
        Ok(())
    }

    /// Resets failed targets to Pending and runs the sequence again when it
    /// is not already running.
    pub async fn retry_failed_targets(&self) -> Result<()> {
        let failed: Vec<Target> = self
            .inner
            .targets
            .read()
            .await
            .iter()
            .filter(|t| t.status() == TargetStatus::Failed)
            .cloned()
            .collect();
        if failed.is_empty() {
            return Ok(());
        }
        for target in &failed {
            target.reset_for_retry().await;
        }
        {
            let mut stats = self.inner.stats.write().unwrap_or_else(|e| e.into_inner());
            stats
                .failed_names
                .retain(|n| !failed.iter().any(|t| t.name() == n));
        }
        if !self.is_running() {
            self.execute_all().await?;
        }
        Ok(())
    }

    pub async fn skip_failed_targets(&self) {
        for target in self.inner.targets.read().await.iter() {
            if target.status() == TargetStatus::Failed {
                target.mark_skipped();
            }
        }
    }

    pub async fn failed_targets(&self) -> Vec<String> {
        self.inner
            .stats
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .failed_names
            .clone()
    }

    /// Waits until the sequence reaches Stopped. `timeout` of None waits
    /// forever. Returns false on timeout.
    pub async fn wait_until_terminal(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.inner.state_tx.subscribe();
        let wait = async {
            loop {
                if *rx.borrow() == SequenceState::Stopped {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        match timeout {
            Some(limit) if !limit.is_zero() => {
                tokio::time::timeout(limit, wait).await.is_ok()
            }
            _ => {
                wait.await;
                true
            }
        }
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn execution_stats(&self) -> Value {
        let stats = self.inner.stats.read().unwrap_or_else(|e| e.into_inner());
        let total_ms: u64 = stats.per_target_ms.values().sum();
        let average_ms = if stats.per_target_ms.is_empty() {
            0
        } else {
            total_ms / stats.per_target_ms.len() as u64
        };
        json!({
            "completedTargets": stats.completed_targets,
            "failedTargets": stats.failed_names,
            "perTargetMs": stats.per_target_ms,
            "averageTargetMs": average_ms,
            "elapsedMs": stats
                .started_at
                .map(|s| {
                    let end = stats.ended_at.unwrap_or_else(Instant::now);
                    end.duration_since(s).as_millis() as u64
                })
                .unwrap_or(0),
            "warnings": stats.warnings,
            "errors": stats.errors,
        })
    }

    pub fn average_execution_time(&self) -> Duration {
        let stats = self.inner.stats.read().unwrap_or_else(|e| e.into_inner());
        if stats.per_target_ms.is_empty() {
            return Duration::ZERO;
        }
        let total: u64 = stats.per_target_ms.values().sum();
        Duration::from_millis(total / stats.per_target_ms.len() as u64)
    }

    pub fn resource_usage(&self) -> Value {
        let probe = self
            .inner
            .resource_probe
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let sample = probe.sample();
        json!({
            "cpuPercent": sample.cpu_percent,
            "memoryBytes": sample.memory_bytes,
        })
    }

    pub fn take_warnings(&self) -> Vec<String> {
        std::mem::take(
            &mut self
                .inner
                .stats
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .warnings,
        )
    }

    pub fn errors(&self) -> Vec<String> {
        self.inner
            .stats
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .errors
            .clone()
    }

    // ------------------------------------------------------------------
    // Worker
    // ------------------------------------------------------------------

    fn set_state(&self, state: SequenceState) {
        let _ = self.inner.state_tx.send(state);
    }

    async fn run(&self) {
        let sequence_id = self.uuid();
        info!(sequence = %sequence_id, name = %self.name(), "sequence started");
        self.inner.events.publish(SequenceEvent::SequenceStarted {
            sequence_id,
            timestamp: Utc::now(),
        });
        self.inner.callbacks.invoke_sequence_start(sequence_id);

        let ticker = self.spawn_progress_ticker();

        if let Err(e) = self.run_loop().await {
            error!(sequence = %sequence_id, error = %e, "sequence loop failed");
            let mut stats = self.inner.stats.write().unwrap_or_else(|e| e.into_inner());
            stats.errors.push(e.to_string());
        }

        ticker.abort();
        self.set_state(SequenceState::Stopping);
        {
            let mut stats = self.inner.stats.write().unwrap_or_else(|e| e.into_inner());
            stats.ended_at = Some(Instant::now());
            stats.current_target = None;
            stats.current_task = None;
        }

        let success = {
            let stats = self.inner.stats.read().unwrap_or_else(|e| e.into_inner());
            stats.failed_names.is_empty() && stats.errors.is_empty()
        };

        // a sequence never ends silently
        self.inner.events.publish(SequenceEvent::SequenceEnded {
            sequence_id,
            success,
            timestamp: Utc::now(),
        });
        self.inner.callbacks.invoke_sequence_end(sequence_id, success);
        self.set_state(SequenceState::Stopped);
        info!(sequence = %sequence_id, success, "sequence ended");
    }

    async fn run_loop(&self) -> Result<()> {
        let cancel = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let deadline = self.global_timeout().map(|d| Instant::now() + d);
        let mut join_set: JoinSet<(String, TargetStatus)> = JoinSet::new();
        // names currently inside the join set; a target's own status update
        // lags its spawn, so readiness must exclude these
        let mut in_flight: std::collections::HashSet<String> = std::collections::HashSet::new();

        loop {
            if cancel.is_cancelled() || self.inner.halt.load(Ordering::SeqCst) {
                self.abort_running().await;
                while let Some(finished) = join_set.join_next().await {
                    if let Some(name) = self.collect_finished(finished).await {
                        in_flight.remove(&name);
                    }
                }
                return Ok(());
            }

            if self.inner.paused.load(Ordering::SeqCst) {
                self.set_state(SequenceState::Paused);
                loop {
                    if cancel.is_cancelled() || !self.inner.paused.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = self.inner.pause_notify.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                }
                if !cancel.is_cancelled() {
                    self.set_state(SequenceState::Running);
                }
                continue;
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    warn!(sequence = %self.uuid(), "global timeout exceeded");
                    self.record_error(EngineError::Timeout(
                        "sequence exceeded its global timeout".into(),
                    ));
                    self.abort_running().await;
                    while let Some(finished) = join_set.join_next().await {
                        if let Some(name) = self.collect_finished(finished).await {
                            in_flight.remove(&name);
                        }
                    }
                    return Ok(());
                }
            }

            // reap finished targets and apply recovery before admitting more
            while let Some(finished) = join_set.try_join_next() {
                if let Some(name) = self.collect_finished(finished).await {
                    in_flight.remove(&name);
                }
            }
            if self.inner.halt.load(Ordering::SeqCst) {
                continue;
            }

            let statuses = self.status_map().await;
            let deps = self
                .inner
                .deps
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();

            if statuses.values().all(|s| s.is_terminal()) && join_set.is_empty() {
                return Ok(());
            }

            let entries = self.order_entries().await;
            let strategies = {
                let s = self
                    .inner
                    .strategies
                    .read()
                    .unwrap_or_else(|e| e.into_inner());
                (s.scheduling, s.execution)
            };
            let order = TargetScheduler::order(strategies.0, &entries, &deps)?;
            let mut ready: Vec<String> = order
                .into_iter()
                .filter(|name| {
                    !in_flight.contains(name)
                        && TargetScheduler::is_ready(name, &statuses, &deps)
                })
                .collect();

            let execution = self.resolve_execution_strategy(strategies.1, ready.len());
            let (slots, respect_resources) = match execution {
                ExecutionStrategy::Sequential => (1usize, false),
                ExecutionStrategy::Parallel => (self.max_concurrent_targets(), true),
                ExecutionStrategy::Adaptive => (self.max_concurrent_targets(), true),
                ExecutionStrategy::Priority => {
                    // admission in descending target priority, bounded to
                    // decisions at target boundaries
                    ready.sort_by_key(|name| {
                        std::cmp::Reverse(
                            entries
                                .iter()
                                .find(|e| &e.name == name)
                                .map(|e| e.priority)
                                .unwrap_or(0),
                        )
                    });
                    (self.max_concurrent_targets(), true)
                }
            };

            let mut admitted = false;
            for name in ready {
                if join_set.len() >= slots {
                    break;
                }
                if respect_resources && !self.resources_allow() {
                    debug!("resource limits reached, deferring admissions");
                    break;
                }
                self.spawn_target(&mut join_set, &name).await?;
                in_flight.insert(name);
                admitted = true;
            }

            if join_set.is_empty() && !admitted {
                // nothing running and nothing to admit: resolve blockage
                let blocked = TargetScheduler::blocked_targets(&statuses, &deps);
                if !blocked.is_empty() {
                    for name in blocked {
                        if let Some(target) = self.target(&name).await {
                            target.mark_skipped();
                            self.push_warning(format!(
                                "target '{name}' skipped: a prerequisite did not complete"
                            ));
                        }
                    }
                    continue;
                }
                let any_paused = statuses.values().any(|s| *s == TargetStatus::Paused);
                if any_paused {
                    tokio::time::sleep(IDLE_TICK).await;
                    continue;
                }
                if statuses.values().all(|s| s.is_terminal()) {
                    return Ok(());
                }
                tokio::time::sleep(IDLE_TICK).await;
                continue;
            }

            if !join_set.is_empty() {
                tokio::select! {
                    finished = join_set.join_next() => {
                        if let Some(finished) = finished {
                            if let Some(name) = self.collect_finished(finished).await {
                                in_flight.remove(&name);
                            }
                        }
                    }
                    _ = tokio::time::sleep(JOIN_TICK) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
    }

    fn resolve_execution_strategy(
        &self,
        configured: ExecutionStrategy,
        ready_count: usize,
    ) -> ExecutionStrategy {
        if configured != ExecutionStrategy::Adaptive {
            return configured;
        }
        // parallelize only when more than one target is ready and the host
        // has headroom
        if ready_count > 1 && self.resources_allow() {
            ExecutionStrategy::Parallel
        } else {
            ExecutionStrategy::Sequential
        }
    }

    fn resources_allow(&self) -> bool {
        let probe = self
            .inner
            .resource_probe
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let limits = self
            .inner
            .limits
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resource_limits;
        probe.sample().within(&limits)
    }

    async fn spawn_target(
        &self,
        join_set: &mut JoinSet<(String, TargetStatus)>,
        name: &str,
    ) -> Result<()> {
        let target = self
            .target(name)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("target '{name}'")))?;
        let timeout = self
            .inner
            .limits
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .target_timeouts
            .get(name)
            .copied();

        {
            let mut stats = self.inner.stats.write().unwrap_or_else(|e| e.into_inner());
            stats.current_target = Some(name.to_string());
            stats.target_started.insert(name.to_string(), Instant::now());
        }
        let sequence_id = self.uuid();
        self.inner.events.publish(SequenceEvent::TargetStarted {
            sequence_id,
            target: name.to_string(),
            timestamp: Utc::now(),
        });
        self.inner
            .callbacks
            .invoke_target_start(sequence_id, name, TargetStatus::InProgress);

        let task_name = name.to_string();
        join_set.spawn(async move {
            let status = match timeout {
                Some(limit) => {
                    let exec = target.execute();
                    tokio::pin!(exec);
                    match tokio::time::timeout(limit, &mut exec).await {
                        Ok(result) => resolve_status(&target, result),
                        Err(_) => {
                            // cooperative: let the target wind down, then
                            // record the timeout as the failure reason
                            target.abort();
                            let _ = exec.await;
                            target.mark_failed("target timeout exceeded");
                            TargetStatus::Failed
                        }
                    }
                }
                None => {
                    let result = target.execute().await;
                    resolve_status(&target, result)
                }
            };
            (task_name, status)
        });
        Ok(())
    }

    /// Returns the finished target's name for in-flight bookkeeping.
    async fn collect_finished(
        &self,
        finished: std::result::Result<(String, TargetStatus), tokio::task::JoinError>,
    ) -> Option<String> {
        let (name, status) = match finished {
            Ok(pair) => pair,
            Err(join_error) => {
                error!(error = %join_error, "target worker join failed");
                self.record_error(EngineError::Execution(format!(
                    "target worker join failed: {join_error}"
                )));
                return None;
            }
        };

        let elapsed_ms = {
            let mut stats = self.inner.stats.write().unwrap_or_else(|e| e.into_inner());
            let elapsed = stats
                .target_started
                .remove(&name)
                .map(|s| s.elapsed().as_millis() as u64)
                .unwrap_or(0);
            stats.per_target_ms.insert(name.clone(), elapsed);
            if stats.current_target.as_deref() == Some(name.as_str()) {
                stats.current_target = None;
            }
            elapsed
        };
        debug!(target = %name, ?status, elapsed_ms, "target finished");

        // pull target-level warnings into the sequence record
        if let Some(target) = self.target(&name).await {
            let warnings = target.take_warnings();
            if !warnings.is_empty() {
                let mut stats = self.inner.stats.write().unwrap_or_else(|e| e.into_inner());
                stats.warnings.extend(warnings);
            }
        }

        match status {
            TargetStatus::Completed => {
                let mut stats = self.inner.stats.write().unwrap_or_else(|e| e.into_inner());
                stats.completed_targets += 1;
            }
            TargetStatus::Failed => {
                self.handle_target_failure(&name).await;
            }
            _ => {}
        }

        let sequence_id = self.uuid();
        let final_status = self
            .target(&name)
            .await
            .map(|t| t.status())
            .unwrap_or(status);
        self.inner.events.publish(SequenceEvent::TargetEnded {
            sequence_id,
            target: name.clone(),
            status: final_status,
            timestamp: Utc::now(),
        });
        self.inner
            .callbacks
            .invoke_target_end(sequence_id, &name, final_status);
        Some(name)
    }

    async fn handle_target_failure(&self, name: &str) {
        let reason = self
            .target(name)
            .await
            .and_then(|t| t.error_message())
            .unwrap_or_else(|| "target failed".to_string());
        let recovery = self.recovery_strategy();
        warn!(target = %name, ?recovery, %reason, "target failed");

        {
            let mut stats = self.inner.stats.write().unwrap_or_else(|e| e.into_inner());
            if !stats.failed_names.iter().any(|n| n == name) {
                stats.failed_names.push(name.to_string());
            }
        }
        let error = EngineError::Execution(reason.clone());
        self.inner.events.publish(SequenceEvent::Error {
            scope: name.to_string(),
            kind: error.kind().to_string(),
            message: reason.clone(),
            timestamp: Utc::now(),
        });
        self.inner.callbacks.invoke_error(name, &error);

        match recovery {
            RecoveryStrategy::Stop => {
                self.inner.halt.store(true, Ordering::SeqCst);
            }
            RecoveryStrategy::Skip => {
                if let Some(target) = self.target(name).await {
                    target.mark_skipped();
                }
            }
            RecoveryStrategy::Retry => {
                let attempts = {
                    let mut stats =
                        self.inner.stats.write().unwrap_or_else(|e| e.into_inner());
                    let entry = stats.retry_counts.entry(name.to_string()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                let budget = self
                    .target(name)
                    .await
                    .map(|t| t.max_retries().max(1))
                    .unwrap_or(1);
                if attempts <= budget {
                    if let Some(target) = self.target(name).await {
                        target.reset_for_retry().await;
                        let mut stats =
                            self.inner.stats.write().unwrap_or_else(|e| e.into_inner());
                        stats.failed_names.retain(|n| n != name);
                        stats.warnings.push(format!(
                            "target '{name}' re-queued after failure (target retry {attempts} of {budget})"
                        ));
                    }
                }
            }
            RecoveryStrategy::Alternative => {
                let alternative = self.inner.alternatives.lock().await.remove(name);
                match alternative {
                    Some(alternative) => {
                        let alt_name = alternative.name().to_string();
                        self.wire_target(&alternative);
                        {
                            let mut targets = self.inner.targets.write().await;
                            if let Some(slot) =
                                targets.iter().position(|t| t.name() == name)
                            {
                                targets[slot] = alternative;
                            } else {
                                targets.push(alternative);
                            }
                        }
                        // the stand-in inherits the failed target's edges
                        {
                            let mut deps =
                                self.inner.deps.write().unwrap_or_else(|e| e.into_inner());
                            if let Some(preds) = deps.remove(name) {
                                deps.insert(alt_name.clone(), preds);
                            }
                            for preds in deps.values_mut() {
                                for pred in preds.iter_mut() {
                                    if pred == name {
                                        *pred = alt_name.clone();
                                    }
                                }
                            }
                        }
                        self.push_warning(format!(
                            "target '{name}' replaced by alternative '{alt_name}'"
                        ));
                    }
                    None => {
                        self.push_warning(format!(
                            "no alternative registered for failed target '{name}'"
                        ));
                    }
                }
            }
        }
    }

    async fn abort_running(&self) {
        for target in self.inner.targets.read().await.iter() {
            if matches!(
                target.status(),
                TargetStatus::InProgress | TargetStatus::Paused
            ) {
                target.abort();
                target.resume();
            }
        }
    }

    fn record_error(&self, error: EngineError) {
        {
            let mut stats = self.inner.stats.write().unwrap_or_else(|e| e.into_inner());
            stats.errors.push(error.to_string());
        }
        let scope = self.uuid().to_string();
        self.inner.events.publish(SequenceEvent::Error {
            scope: scope.clone(),
            kind: error.kind().to_string(),
            message: error.to_string(),
            timestamp: Utc::now(),
        });
        self.inner.callbacks.invoke_error(&scope, &error);
    }

    fn push_warning(&self, warning: String) {
        self.inner
            .stats
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .warnings
            .push(warning);
    }

    async fn status_map(&self) -> HashMap<String, TargetStatus> {
        self.inner
            .targets
            .read()
            .await
            .iter()
            .map(|t| (t.name().to_string(), t.status()))
            .collect()
    }

    async fn order_entries(&self) -> Vec<TargetEntry> {
        self.inner
            .targets
            .read()
            .await
            .iter()
            .enumerate()
            .map(|(insertion, t)| TargetEntry {
                name: t.name().to_string(),
                priority: t.priority(),
                insertion,
            })
            .collect()
    }

    fn spawn_progress_ticker(&self) -> JoinHandle<()> {
        let sequence = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = *sequence
                    .inner
                    .progress_interval
                    .read()
                    .unwrap_or_else(|e| e.into_inner());
                tokio::time::sleep(interval).await;
                if sequence.state() != SequenceState::Running {
                    continue;
                }
                let report = sequence.progress_report().await;
                sequence.inner.events.publish(SequenceEvent::Progress {
                    report: report.clone(),
                    timestamp: Utc::now(),
                });
                sequence.inner.callbacks.invoke_progress(&report);
            }
        })
    }

    pub async fn progress_report(&self) -> ProgressReport {
        let (completed, total) = {
            let targets = self.inner.targets.read().await;
            let completed = targets
                .iter()
                .filter(|t| {
                    matches!(
                        t.status(),
                        TargetStatus::Completed | TargetStatus::Skipped
                    )
                })
                .count();
            (completed, targets.len())
        };
        let stats = self.inner.stats.read().unwrap_or_else(|e| e.into_inner());
        let elapsed = stats
            .started_at
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let estimated_remaining = if stats.per_target_ms.is_empty() || total == completed {
            None
        } else {
            let avg_ms: u64 = stats.per_target_ms.values().sum::<u64>()
                / stats.per_target_ms.len() as u64;
            Some((total - completed) as f64 * avg_ms as f64 / 1000.0)
        };
        ProgressReport {
            sequence_id: self.uuid(),
            state: self.state(),
            progress: if total == 0 {
                0.0
            } else {
                completed as f64 / total as f64 * 100.0
            },
            completed_targets: completed,
            total_targets: total,
            current_target: stats.current_target.clone(),
            current_task: stats.current_task.clone(),
            elapsed_secs: elapsed,
            estimated_remaining_secs: estimated_remaining,
        }
    }
}

fn resolve_status(target: &Target, result: Result<TargetStatus>) -> TargetStatus {
    match result {
        Ok(status) => status,
        Err(e) => {
            target.mark_failed(&e.to_string());
            TargetStatus::Failed
        }
    }
}
