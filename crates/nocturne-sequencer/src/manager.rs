// Sequence manager: facade over the sequencer providing creation, loading,
// template-based generation, validation, execution dispatch, persistence,
// and global macro/template registration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use nocturne_template::{MacroEngine, MacroValue, TaskTemplate, TemplateRegistry};
use nocturne_types::{
    EngineError, ExecutionStrategy, RecoveryStrategy, Result, SchedulingStrategy, TargetStatus,
};

use crate::document;
use crate::factory::TaskFactory;
use crate::sequencer::ExposureSequence;
use crate::store::{SequenceRecord, SequenceStore};

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct SequenceOptions {
    pub validate_on_load: bool,
    pub template_directory: Option<PathBuf>,
    /// None disables persistence.
    pub database_path: Option<PathBuf>,
    pub scheduling_strategy: SchedulingStrategy,
    pub execution_strategy: ExecutionStrategy,
    pub recovery_strategy: RecoveryStrategy,
    pub max_concurrent_targets: usize,
    pub global_timeout: Option<Duration>,
}

impl Default for SequenceOptions {
    fn default() -> Self {
        Self {
            validate_on_load: true,
            template_directory: None,
            database_path: None,
            scheduling_strategy: SchedulingStrategy::Dependencies,
            execution_strategy: ExecutionStrategy::Sequential,
            recovery_strategy: RecoveryStrategy::Retry,
            max_concurrent_targets: 1,
            global_timeout: None,
        }
    }
}

/// Outcome record for one executed sequence.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SequenceResult {
    pub success: bool,
    pub completed_targets: Vec<String>,
    pub failed_targets: Vec<String>,
    pub skipped_targets: Vec<String>,
    pub total_progress: f64,
    pub total_execution: Duration,
    pub execution_stats: Value,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

pub struct SequenceManager {
    options: SequenceOptions,
    store: Option<SequenceStore>,
    templates: TemplateRegistry,
    macros: Arc<MacroEngine>,
    /// Asynchronous executions keyed by a generated execution id.
    executions: Mutex<HashMap<Uuid, ExposureSequence>>,
}

impl SequenceManager {
    pub fn new(options: SequenceOptions) -> Result<Self> {
        let store = match &options.database_path {
            Some(path) => Some(SequenceStore::open(path)?),
            None => None,
        };
        let manager = Self {
            options,
            store,
            templates: TemplateRegistry::new(),
            macros: Arc::new(MacroEngine::new()),
            executions: Mutex::new(HashMap::new()),
        };
        manager.register_built_in_task_templates();
        if let Some(dir) = manager.options.template_directory.clone() {
            match manager.load_templates_from_directory(&dir) {
                Ok(count) => info!(count, dir = %dir.display(), "templates loaded"),
                Err(e) => warn!(error = %e, "template directory load failed"),
            }
        }
        Ok(manager)
    }

    pub fn options(&self) -> &SequenceOptions {
        &self.options
    }

    // ------------------------------------------------------------------
    // Creation and loading
    // ------------------------------------------------------------------

    /// A fresh sequence configured with the manager's defaults.
    pub fn create_sequence(&self, name: &str) -> ExposureSequence {
        let sequence = ExposureSequence::new(name);
        sequence.set_scheduling_strategy(self.options.scheduling_strategy);
        sequence.set_execution_strategy(self.options.execution_strategy);
        sequence.set_recovery_strategy(self.options.recovery_strategy);
        sequence.set_max_concurrent_targets(self.options.max_concurrent_targets);
        sequence.set_global_timeout(self.options.global_timeout);
        sequence
    }

    pub async fn load_sequence_from_file(
        &self,
        path: &Path,
        validate: bool,
    ) -> Result<ExposureSequence> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            EngineError::Resource(format!("cannot read {}: {e}", path.display()))
        })?;
        let doc: Value = serde_json::from_str(&text)?;
        self.create_sequence_from_json(doc, validate).await
    }

    pub async fn create_sequence_from_json(
        &self,
        mut doc: Value,
        validate: bool,
    ) -> Result<ExposureSequence> {
        if validate || self.options.validate_on_load {
            self.validate_sequence_json(&doc)?;
        }
        // global macros expand before construction; document-defined macros
        // are scoped to this load
        self.macros
            .process_json_with_json_macros(&mut doc)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        let sequence = document::sequence_from_json(&doc).await?;
        self.apply_option_defaults(&sequence, &doc);
        Ok(sequence)
    }

    pub async fn create_sequence_from_template(
        &self,
        template_name: &str,
        params: &Value,
    ) -> Result<ExposureSequence> {
        let template = self
            .templates
            .get(template_name)
            .ok_or_else(|| EngineError::NotFound(format!("template '{template_name}'")))?;
        let doc = template
            .instantiate(params, &self.macros)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        self.create_sequence_from_json(doc, true).await
    }

    /// Document fields win; absent fields fall back to manager options.
    fn apply_option_defaults(&self, sequence: &ExposureSequence, doc: &Value) {
        let has = |key: &str| doc.get(key).is_some();
        if !has("schedulingStrategy") {
            sequence.set_scheduling_strategy(self.options.scheduling_strategy);
        }
        if !has("executionStrategy") {
            sequence.set_execution_strategy(self.options.execution_strategy);
        }
        if !has("recoveryStrategy") {
            sequence.set_recovery_strategy(self.options.recovery_strategy);
        }
        if !has("maxConcurrentTargets") {
            sequence.set_max_concurrent_targets(self.options.max_concurrent_targets);
        }
        if !has("globalTimeout") {
            sequence.set_global_timeout(self.options.global_timeout);
        }
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    pub fn validate_sequence_json(&self, doc: &Value) -> Result<()> {
        document::validate_sequence_json(doc)?;
        // structural checks passed; resolve task types against the factory
        let factory = TaskFactory::global();
        if let Some(targets) = doc.get("targets").and_then(Value::as_array) {
            for target in targets {
                let Some(tasks) = target.get("tasks").and_then(Value::as_array) else {
                    continue;
                };
                for task in tasks {
                    if let Some(task_type) = task.get("type").and_then(Value::as_str) {
                        if !factory.is_registered(task_type) {
                            return Err(EngineError::Validation(format!(
                                "unknown task type '{task_type}'"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn save_sequence_to_file(
        &self,
        sequence: &ExposureSequence,
        path: &Path,
    ) -> Result<()> {
        sequence.save_to_file(path).await
    }

    pub async fn validate_sequence_file(&self, path: &Path) -> Result<()> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            EngineError::Resource(format!("cannot read {}: {e}", path.display()))
        })?;
        let doc: Value = serde_json::from_str(&text)?;
        self.validate_sequence_json(&doc)
    }

    // ------------------------------------------------------------------
    // Execution dispatch
    // ------------------------------------------------------------------

    /// Synchronous execution returns the result; asynchronous execution
    /// returns the generated execution id instead.
    pub async fn execute_sequence(
        &self,
        sequence: &ExposureSequence,
        run_async: bool,
    ) -> Result<(Option<SequenceResult>, Option<Uuid>)> {
        sequence.execute_all().await?;
        if run_async {
            let execution_id = Uuid::new_v4();
            self.executions
                .lock()
                .await
                .insert(execution_id, sequence.clone());
            return Ok((None, Some(execution_id)));
        }
        sequence.wait_until_terminal(None).await;
        Ok((Some(self.build_result(sequence).await), None))
    }

    /// Waits for an executing sequence. A zero timeout waits forever.
    pub async fn wait_for_completion(
        &self,
        sequence: &ExposureSequence,
        timeout: Duration,
    ) -> Option<SequenceResult> {
        let limit = if timeout.is_zero() { None } else { Some(timeout) };
        if sequence.wait_until_terminal(limit).await {
            Some(self.build_result(sequence).await)
        } else {
            None
        }
    }

    pub async fn execution(&self, execution_id: Uuid) -> Option<ExposureSequence> {
        self.executions.lock().await.get(&execution_id).cloned()
    }

    pub async fn stop_execution(&self, sequence: &ExposureSequence, graceful: bool) {
        if !graceful {
            warn!(sequence = %sequence.uuid(), "non-graceful stop requested");
        }
        sequence.stop().await;
    }

    pub async fn pause_execution(&self, sequence: &ExposureSequence) -> Result<()> {
        sequence.pause().await
    }

    pub async fn resume_execution(&self, sequence: &ExposureSequence) -> Result<()> {
        sequence.resume().await
    }

    async fn build_result(&self, sequence: &ExposureSequence) -> SequenceResult {
        let mut completed = Vec::new();
        let mut skipped = Vec::new();
        let mut failed = sequence.failed_targets().await;
        for name in sequence.target_names().await {
            match sequence.target_status(&name).await {
                Ok(TargetStatus::Completed) => completed.push(name),
                Ok(TargetStatus::Skipped) => skipped.push(name),
                Ok(TargetStatus::Failed) => {
                    if !failed.iter().any(|f| f == &name) {
                        failed.push(name);
                    }
                }
                _ => {}
            }
        }
        let stats = sequence.execution_stats();
        let total_execution = stats
            .get("elapsedMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO);
        let warnings = sequence.take_warnings();
        let errors = sequence.errors();
        SequenceResult {
            success: failed.is_empty() && errors.is_empty(),
            completed_targets: completed,
            failed_targets: failed,
            skipped_targets: skipped,
            total_progress: sequence.progress().await,
            total_execution,
            execution_stats: stats,
            warnings,
            errors,
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn store(&self) -> Result<&SequenceStore> {
        self.store
            .as_ref()
            .ok_or_else(|| EngineError::Resource("persistence is not configured".into()))
    }

    pub async fn save_to_database(&self, sequence: &ExposureSequence) -> Result<Uuid> {
        let store = self.store()?;
        let doc = document::sequence_to_json(sequence).await;
        let data = serde_json::to_string_pretty(&doc)?;
        let uuid = sequence.uuid();
        store.save(uuid, &sequence.name(), &data).await?;
        info!(sequence = %uuid, "sequence saved");
        Ok(uuid)
    }

    pub async fn load_from_database(&self, uuid: Uuid) -> Result<ExposureSequence> {
        let record = self.store()?.load(uuid).await?;
        let doc: Value = serde_json::from_str(&record.data)?;
        self.create_sequence_from_json(doc, self.options.validate_on_load)
            .await
    }

    pub async fn list_sequences(&self) -> Result<Vec<SequenceRecord>> {
        self.store()?.list().await
    }

    pub async fn delete_from_database(&self, uuid: Uuid) -> Result<bool> {
        self.store()?.delete(uuid).await
    }

    // ------------------------------------------------------------------
    // Templates and macros
    // ------------------------------------------------------------------

    pub fn register_task_template(&self, template: TaskTemplate) {
        self.templates.register(template);
    }

    pub fn register_built_in_task_templates(&self) {
        self.templates.register_builtins();
    }

    pub fn load_templates_from_directory(&self, directory: &Path) -> Result<usize> {
        self.templates
            .load_from_directory(directory)
            .map_err(|e| EngineError::Resource(e.to_string()))
    }

    pub fn list_available_templates(&self) -> Vec<String> {
        self.templates.names()
    }

    pub fn template_info(&self, name: &str) -> Option<TaskTemplate> {
        self.templates.get(name)
    }

    pub fn add_global_macro(&self, name: &str, value: MacroValue) -> Result<()> {
        self.macros
            .add_macro(name, value)
            .map_err(|e| EngineError::Validation(e.to_string()))
    }

    pub fn remove_global_macro(&self, name: &str) -> Result<()> {
        self.macros
            .remove_macro(name)
            .map_err(|e| EngineError::Validation(e.to_string()))
    }

    pub fn list_global_macros(&self) -> Vec<String> {
        self.macros.list_macros()
    }

    pub fn macros(&self) -> &Arc<MacroEngine> {
        &self.macros
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_registers_builtin_templates() {
        let manager = SequenceManager::new(SequenceOptions::default()).unwrap();
        let templates = manager.list_available_templates();
        assert!(templates.contains(&"BasicExposure".to_string()));
        assert!(templates.contains(&"MultipleExposure".to_string()));
    }

    #[test]
    fn created_sequences_inherit_options() {
        let options = SequenceOptions {
            scheduling_strategy: SchedulingStrategy::Priority,
            recovery_strategy: RecoveryStrategy::Skip,
            max_concurrent_targets: 4,
            ..SequenceOptions::default()
        };
        let manager = SequenceManager::new(options).unwrap();
        let sequence = manager.create_sequence("night one");
        assert_eq!(sequence.scheduling_strategy(), SchedulingStrategy::Priority);
        assert_eq!(sequence.recovery_strategy(), RecoveryStrategy::Skip);
        assert_eq!(sequence.max_concurrent_targets(), 4);
    }

    #[tokio::test]
    async fn unknown_task_types_fail_validation() {
        let manager = SequenceManager::new(SequenceOptions::default()).unwrap();
        let doc = serde_json::json!({
            "targets": [
                {"name": "a", "tasks": [{"name": "t", "type": "DoesNotExist", "params": {}}]}
            ]
        });
        let err = manager.validate_sequence_json(&doc).unwrap_err();
        assert!(err.to_string().contains("unknown task type"));
    }

    #[tokio::test]
    async fn persistence_disabled_reports_resource_error() {
        let manager = SequenceManager::new(SequenceOptions::default()).unwrap();
        let sequence = manager.create_sequence("unsaved");
        let err = manager.save_to_database(&sequence).await.unwrap_err();
        assert_eq!(err.kind(), "resource");
    }
}
