// The sequence JSON contract: validation, serialization, and construction of
// sequences and targets from documents.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use nocturne_types::{
    EngineError, ExecutionStrategy, RecoveryStrategy, Result, SchedulingStrategy,
    TargetAstroConfig,
};

use crate::factory::TaskFactory;
use crate::sequencer::ExposureSequence;
use crate::target::Target;

// ============================================================================
// Validation
// ============================================================================

/// Structural validation of a sequence document. Checks only shape; task
/// types are resolved against the factory at construction time.
pub fn validate_sequence_json(doc: &Value) -> Result<()> {
    let root = doc
        .as_object()
        .ok_or_else(|| EngineError::Validation("sequence document must be an object".into()))?;

    let targets = root
        .get("targets")
        .ok_or_else(|| EngineError::Validation("missing targets array".into()))?
        .as_array()
        .ok_or_else(|| EngineError::Validation("missing targets array".into()))?;

    for target in targets {
        let target = target
            .as_object()
            .ok_or_else(|| EngineError::Validation("target without name".into()))?;
        if target.get("name").and_then(Value::as_str).is_none() {
            return Err(EngineError::Validation("target without name".into()));
        }
        if let Some(tasks) = target.get("tasks") {
            let tasks = tasks
                .as_array()
                .ok_or_else(|| EngineError::Validation("tasks must be an array".into()))?;
            for task in tasks {
                let task = task
                    .as_object()
                    .ok_or_else(|| EngineError::Validation("task without name".into()))?;
                if task.get("name").and_then(Value::as_str).is_none() {
                    return Err(EngineError::Validation("task without name".into()));
                }
                if task.get("type").and_then(Value::as_str).is_none() {
                    return Err(EngineError::Validation("task without type".into()));
                }
            }
        }
    }

    if let Some(state) = root.get("state") {
        if !state.is_i64() && !state.is_u64() {
            return Err(EngineError::Validation("state must be an integer".into()));
        }
    }
    if let Some(timeout) = root.get("globalTimeout") {
        if !timeout.is_i64() && !timeout.is_u64() {
            return Err(EngineError::Validation(
                "globalTimeout must be an integer".into(),
            ));
        }
    }
    if let Some(max) = root.get("maxConcurrentTargets") {
        if !max.is_u64() {
            return Err(EngineError::Validation(
                "maxConcurrentTargets must be an unsigned integer".into(),
            ));
        }
    }
    if let Some(deps) = root.get("dependencies") {
        if !deps.is_object() {
            return Err(EngineError::Validation(
                "dependencies must be an object".into(),
            ));
        }
    }
    Ok(())
}

// ============================================================================
// Target documents
// ============================================================================

pub async fn target_to_json(target: &Target) -> Value {
    let tasks = target.tasks_snapshot().await;
    let id_to_name: HashMap<Uuid, String> =
        tasks.iter().map(|t| (t.id, t.name.clone())).collect();

    let task_docs: Vec<Value> = tasks
        .iter()
        .map(|task| {
            let mut doc = Map::new();
            doc.insert("name".into(), json!(task.name));
            doc.insert("type".into(), json!(task.task_type));
            doc.insert("params".into(), task.params.clone());
            if task.priority != 0 {
                doc.insert("priority".into(), json!(task.priority));
            }
            if let Some(timeout) = task.timeout {
                doc.insert("timeout".into(), json!(timeout.as_secs()));
            }
            Value::Object(doc)
        })
        .collect();

    let mut task_deps = Map::new();
    for task in &tasks {
        let preds = target.task_dependencies(task.id);
        if !preds.is_empty() {
            let names: Vec<String> = preds
                .iter()
                .filter_map(|id| id_to_name.get(id).cloned())
                .collect();
            task_deps.insert(task.name.clone(), json!(names));
        }
    }

    let mut doc = Map::new();
    doc.insert("name".into(), json!(target.name()));
    doc.insert("uuid".into(), json!(target.uuid().to_string()));
    doc.insert("enabled".into(), json!(target.is_enabled()));
    doc.insert("priority".into(), json!(target.priority()));
    doc.insert("cooldown".into(), json!(target.cooldown().as_secs()));
    doc.insert("maxRetries".into(), json!(target.max_retries()));
    doc.insert("params".into(), target.params());
    doc.insert("tasks".into(), Value::Array(task_docs));
    if !task_deps.is_empty() {
        doc.insert("taskDependencies".into(), Value::Object(task_deps));
    }
    if let Ok(astro) = serde_json::to_value(target.astro_config()) {
        doc.insert("astro".into(), astro);
    }
    Value::Object(doc)
}

pub async fn target_from_json(doc: &Value) -> Result<Target> {
    let root = doc
        .as_object()
        .ok_or_else(|| EngineError::Validation("target without name".into()))?;
    let name = root
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Validation("target without name".into()))?;

    let cooldown = Duration::from_secs(root.get("cooldown").and_then(Value::as_u64).unwrap_or(0));
    let max_retries = root
        .get("maxRetries")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let target = Target::new(name, cooldown, max_retries);

    if let Some(enabled) = root.get("enabled").and_then(Value::as_bool) {
        target.set_enabled(enabled);
    }
    if let Some(priority) = root.get("priority").and_then(Value::as_i64) {
        target.set_priority(priority as i32);
    }
    if let Some(params) = root.get("params") {
        if !params.is_null() {
            target.set_params(params.clone());
        }
    }
    if let Some(astro) = root.get("astro") {
        let config: TargetAstroConfig = serde_json::from_value(astro.clone())
            .map_err(|e| EngineError::Validation(format!("invalid astro block: {e}")))?;
        target.set_astro_config(config);
    }

    let mut name_to_id: HashMap<String, Uuid> = HashMap::new();
    if let Some(tasks) = root.get("tasks").and_then(Value::as_array) {
        let factory = TaskFactory::global();
        for task_doc in tasks {
            let task_obj = task_doc
                .as_object()
                .ok_or_else(|| EngineError::Validation("task without name".into()))?;
            let task_name = task_obj
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::Validation("task without name".into()))?;
            let task_type = task_obj
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::Validation("task without type".into()))?;
            let params = task_obj
                .get("params")
                .cloned()
                .unwrap_or(Value::Object(Map::new()));

            let mut task = factory.create(task_type, task_name, params)?;
            if let Some(priority) = task_obj.get("priority").and_then(Value::as_i64) {
                task.set_priority(priority as i32);
            }
            if let Some(timeout) = task_obj.get("timeout").and_then(Value::as_u64) {
                task.set_timeout(Duration::from_secs(timeout));
            }
            let id = task.id;
            name_to_id.insert(task_name.to_string(), id);
            target.add_task(task).await;
        }
    }

    if let Some(task_deps) = root.get("taskDependencies").and_then(Value::as_object) {
        for (task_name, preds) in task_deps {
            let Some(&task_id) = name_to_id.get(task_name) else {
                return Err(EngineError::Dependency(format!(
                    "task dependency references unknown task '{task_name}'"
                )));
            };
            for pred in preds.as_array().into_iter().flatten() {
                let pred_name = pred.as_str().ok_or_else(|| {
                    EngineError::Validation("task dependency entries must be strings".into())
                })?;
                let Some(&pred_id) = name_to_id.get(pred_name) else {
                    return Err(EngineError::Dependency(format!(
                        "task dependency references unknown task '{pred_name}'"
                    )));
                };
                target.add_task_dependency(task_id, pred_id).await?;
            }
        }
    }

    Ok(target)
}

// ============================================================================
// Sequence documents
// ============================================================================

pub async fn sequence_to_json(sequence: &ExposureSequence) -> Value {
    let mut targets = Vec::new();
    for name in sequence.target_names().await {
        if let Some(target) = sequence.target(&name).await {
            targets.push(target_to_json(&target).await);
        }
    }

    let mut deps = Map::new();
    for name in sequence.target_names().await {
        let preds = sequence.target_dependencies(&name);
        if !preds.is_empty() {
            deps.insert(name, json!(preds));
        }
    }

    json!({
        "uuid": sequence.uuid().to_string(),
        "name": sequence.name(),
        "state": sequence.state().as_u8(),
        "maxConcurrentTargets": sequence.max_concurrent_targets(),
        "globalTimeout": sequence
            .global_timeout()
            .map(|d| d.as_secs())
            .unwrap_or(0),
        "schedulingStrategy": sequence.scheduling_strategy().as_u8(),
        "executionStrategy": sequence.execution_strategy().as_u8(),
        "recoveryStrategy": sequence.recovery_strategy().as_u8(),
        "dependencies": Value::Object(deps),
        "targets": targets,
    })
}

pub async fn sequence_from_json(doc: &Value) -> Result<ExposureSequence> {
    validate_sequence_json(doc)?;
    let root = doc.as_object().expect("validated above");

    let name = root
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("unnamed sequence");
    let sequence = ExposureSequence::new(name);

    if let Some(uuid) = root.get("uuid").and_then(Value::as_str) {
        let parsed: Uuid = uuid
            .parse()
            .map_err(|_| EngineError::Validation(format!("invalid sequence uuid '{uuid}'")))?;
        sequence.set_uuid(parsed);
    }
    if let Some(max) = root.get("maxConcurrentTargets").and_then(Value::as_u64) {
        sequence.set_max_concurrent_targets(max as usize);
    }
    if let Some(timeout) = root.get("globalTimeout").and_then(Value::as_u64) {
        if timeout > 0 {
            sequence.set_global_timeout(Some(Duration::from_secs(timeout)));
        }
    }
    if let Some(strategy) = root.get("schedulingStrategy").and_then(Value::as_u64) {
        let strategy = SchedulingStrategy::from_u8(strategy as u8).ok_or_else(|| {
            EngineError::Validation(format!("illegal schedulingStrategy {strategy}"))
        })?;
        sequence.set_scheduling_strategy(strategy);
    }
    if let Some(strategy) = root.get("executionStrategy").and_then(Value::as_u64) {
        let strategy = ExecutionStrategy::from_u8(strategy as u8).ok_or_else(|| {
            EngineError::Validation(format!("illegal executionStrategy {strategy}"))
        })?;
        sequence.set_execution_strategy(strategy);
    }
    if let Some(strategy) = root.get("recoveryStrategy").and_then(Value::as_u64) {
        let strategy = RecoveryStrategy::from_u8(strategy as u8).ok_or_else(|| {
            EngineError::Validation(format!("illegal recoveryStrategy {strategy}"))
        })?;
        sequence.set_recovery_strategy(strategy);
    }

    if let Some(targets) = root.get("targets").and_then(Value::as_array) {
        for target_doc in targets {
            sequence.add_target(target_from_json(target_doc).await?).await?;
        }
    }

    if let Some(deps) = root.get("dependencies").and_then(Value::as_object) {
        for (name, preds) in deps {
            for pred in preds.as_array().into_iter().flatten() {
                let pred = pred.as_str().ok_or_else(|| {
                    EngineError::Validation("dependency entries must be strings".into())
                })?;
                sequence.add_target_dependency(name, pred).await?;
            }
        }
    }

    Ok(sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{TaskFactory, TaskInfo};
    use std::sync::Arc;

    fn register_noop_type() {
        let factory = TaskFactory::global();
        if factory.is_registered("Noop") {
            return;
        }
        factory
            .register(
                TaskInfo {
                    task_type: "Noop".to_string(),
                    description: "does nothing".to_string(),
                    category: "Test".to_string(),
                },
                Arc::new(|_params| Ok(())),
                Arc::new(|| Arc::new(|_params| Box::pin(async { Ok(Value::Null) }))),
            )
            .unwrap();
    }

    #[test]
    fn validation_rejects_the_contract_violations() {
        assert!(validate_sequence_json(&json!([])).is_err());
        assert!(validate_sequence_json(&json!({})).is_err());
        assert!(validate_sequence_json(&json!({"targets": "nope"})).is_err());
        assert!(validate_sequence_json(&json!({"targets": [{}]})).is_err());
        assert!(
            validate_sequence_json(&json!({"targets": [{"name": "a", "tasks": [{}]}]})).is_err()
        );
        assert!(validate_sequence_json(
            &json!({"targets": [], "state": "running"})
        )
        .is_err());
        assert!(validate_sequence_json(
            &json!({"targets": [], "globalTimeout": 1.5})
        )
        .is_err());
        assert!(validate_sequence_json(
            &json!({"targets": [], "maxConcurrentTargets": -2})
        )
        .is_err());
        assert!(validate_sequence_json(
            &json!({"targets": [], "dependencies": []})
        )
        .is_err());
        assert!(validate_sequence_json(&json!({"targets": []})).is_ok());
    }

    #[test]
    fn validation_is_idempotent() {
        let doc = json!({"targets": [{"name": "a"}], "state": 0});
        assert!(validate_sequence_json(&doc).is_ok());
        assert!(validate_sequence_json(&doc).is_ok());
    }

    #[tokio::test]
    async fn sequence_roundtrip_preserves_structure() {
        register_noop_type();
        let doc = json!({
            "name": "roundtrip",
            "state": 0,
            "maxConcurrentTargets": 2,
            "globalTimeout": 120,
            "schedulingStrategy": 2,
            "executionStrategy": 0,
            "recoveryStrategy": 1,
            "dependencies": {"second": ["first"]},
            "targets": [
                {
                    "name": "first",
                    "enabled": true,
                    "priority": 7,
                    "cooldown": 3,
                    "maxRetries": 2,
                    "params": {"gain": 100},
                    "tasks": [
                        {"name": "t1", "type": "Noop", "params": {"x": 1}},
                        {"name": "t2", "type": "Noop", "params": {}, "priority": 5, "timeout": 30}
                    ],
                    "taskDependencies": {"t2": ["t1"]}
                },
                {
                    "name": "second",
                    "enabled": false,
                    "priority": 3,
                    "cooldown": 0,
                    "maxRetries": 0,
                    "params": {},
                    "tasks": []
                }
            ]
        });

        let sequence = sequence_from_json(&doc).await.unwrap();
        let exported = sequence_to_json(&sequence).await;

        assert_eq!(exported["name"], "roundtrip");
        assert_eq!(exported["maxConcurrentTargets"], 2);
        assert_eq!(exported["globalTimeout"], 120);
        assert_eq!(exported["schedulingStrategy"], 2);
        assert_eq!(exported["recoveryStrategy"], 1);
        assert_eq!(exported["dependencies"]["second"], json!(["first"]));

        let first = &exported["targets"][0];
        assert_eq!(first["name"], "first");
        assert_eq!(first["priority"], 7);
        assert_eq!(first["cooldown"], 3);
        assert_eq!(first["maxRetries"], 2);
        assert_eq!(first["params"], json!({"gain": 100}));
        assert_eq!(first["tasks"][0]["name"], "t1");
        assert_eq!(first["tasks"][1]["priority"], 5);
        assert_eq!(first["tasks"][1]["timeout"], 30);
        assert_eq!(first["taskDependencies"]["t2"], json!(["t1"]));

        let second = &exported["targets"][1];
        assert_eq!(second["enabled"], false);
    }

    #[tokio::test]
    async fn unknown_task_type_is_a_validation_error() {
        let doc = json!({
            "targets": [
                {"name": "a", "tasks": [{"name": "t", "type": "NotRegistered", "params": {}}]}
            ]
        });
        let err = sequence_from_json(&doc).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn illegal_enum_values_are_rejected() {
        let doc = json!({"targets": [], "schedulingStrategy": 9});
        assert!(sequence_from_json(&doc).await.is_err());
    }
}
