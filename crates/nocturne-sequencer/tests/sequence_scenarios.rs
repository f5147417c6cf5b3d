// End-to-end scenarios: sequences driving the simulated camera through the
// manager facade, plus the save/load round-trip law.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use nocturne_camera::{CameraController, SimulatedCamera};
use nocturne_sequencer::{
    register_builtin_tasks, DeviceRegistry, ExposureSequence, SequenceManager, SequenceOptions,
    Target, Task, TaskAction,
};
use nocturne_types::{
    EngineError, RecoveryStrategy, SchedulingStrategy, TargetStatus,
};

async fn register_sim_camera(key: &str) -> Arc<CameraController> {
    register_builtin_tasks().unwrap();
    let camera = Arc::new(CameraController::new(Arc::new(SimulatedCamera::new(1))));
    camera.connect(None).await.unwrap();
    DeviceRegistry::global().register_camera(key, camera.clone());
    camera
}

fn manager_with(recovery: RecoveryStrategy) -> SequenceManager {
    SequenceManager::new(SequenceOptions {
        scheduling_strategy: SchedulingStrategy::Fifo,
        recovery_strategy: recovery,
        ..SequenceOptions::default()
    })
    .unwrap()
}

async fn succeeding_target(name: &str) -> Target {
    let target = Target::new(name, Duration::ZERO, 0);
    let action: TaskAction = Arc::new(|_params| Box::pin(async { Ok(Value::Null) }));
    target.add_task(Task::new("work", "test", action)).await;
    target
}

async fn failing_target(name: &str) -> Target {
    let target = Target::new(name, Duration::ZERO, 0);
    let action: TaskAction = Arc::new(|_params| {
        Box::pin(async { Err(EngineError::Execution("induced failure".into())) })
    });
    target.add_task(Task::new("broken", "test", action)).await;
    target
}

// ---------------------------------------------------------------------------
// S1 — simple exposure
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s1_single_exposure_completes() {
    let camera = register_sim_camera("cam-s1").await;
    let manager = manager_with(RecoveryStrategy::Stop);
    let factory = nocturne_sequencer::TaskFactory::global();

    let sequence = manager.create_sequence("s1");
    sequence.set_scheduling_strategy(SchedulingStrategy::Fifo);
    let target = Target::new("T1", Duration::ZERO, 0);
    let task = factory
        .create(
            "TakeExposure",
            "E1",
            json!({
                "exposure": 0.5,
                "type": "light",
                "binning": 1,
                "gain": 100,
                "offset": 10,
                "camera": "cam-s1"
            }),
        )
        .unwrap();
    target.add_task(task).await;
    sequence.add_target(target).await.unwrap();

    let (result, _) = manager.execute_sequence(&sequence, false).await.unwrap();
    let result = result.unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.completed_targets, vec!["T1".to_string()]);
    assert!(result.failed_targets.is_empty());
    assert_eq!(result.total_progress, 100.0);
    assert_eq!(camera.exposure().statistics().completed, 1);
}

// ---------------------------------------------------------------------------
// S2 — dependency ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s2_dependency_strategy_orders_targets() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));

    let sequence = ExposureSequence::new("s2");
    sequence.set_scheduling_strategy(SchedulingStrategy::Dependencies);

    // deliberately inserted out of order
    for name in ["T3", "T1", "T2"] {
        let log = order.clone();
        let label = name.to_string();
        let action: TaskAction = Arc::new(move |_params| {
            let log = log.clone();
            let label = label.clone();
            Box::pin(async move {
                log.lock().unwrap().push(label);
                Ok(Value::Null)
            })
        });
        let target = Target::new(name, Duration::ZERO, 0);
        target.add_task(Task::new("work", "test", action)).await;
        sequence.add_target(target).await.unwrap();
    }
    sequence.add_target_dependency("T2", "T1").await.unwrap();
    sequence.add_target_dependency("T3", "T2").await.unwrap();

    sequence.execute_all().await.unwrap();
    assert!(sequence.wait_until_terminal(Some(Duration::from_secs(5))).await);

    assert_eq!(
        *order.lock().unwrap(),
        vec!["T1".to_string(), "T2".to_string(), "T3".to_string()]
    );
}

// ---------------------------------------------------------------------------
// S3 — retry to success
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s3_retry_to_success_carries_warning() {
    let manager = manager_with(RecoveryStrategy::Stop);
    let sequence = manager.create_sequence("s3");
    sequence.set_scheduling_strategy(SchedulingStrategy::Fifo);

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let action: TaskAction = Arc::new(move |_params| {
        let counter = counter.clone();
        Box::pin(async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(EngineError::Execution("transient cloud".into()))
            } else {
                Ok(Value::Null)
            }
        })
    });
    let target = Target::new("flaky", Duration::ZERO, 3);
    target.add_task(Task::new("once-flaky", "test", action)).await;
    sequence.add_target(target).await.unwrap();

    let (result, _) = manager.execute_sequence(&sequence, false).await.unwrap();
    let result = result.unwrap();

    assert!(result.success);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(
        result.warnings.iter().any(|w| w.contains("retried")),
        "warnings: {:?}",
        result.warnings
    );
}

// ---------------------------------------------------------------------------
// S4 / S5 — recovery strategies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s4_stop_recovery_halts_after_failure() {
    let manager = manager_with(RecoveryStrategy::Stop);
    let sequence = manager.create_sequence("s4");
    sequence.set_scheduling_strategy(SchedulingStrategy::Fifo);

    sequence.add_target(succeeding_target("T1").await).await.unwrap();
    sequence.add_target(failing_target("T2").await).await.unwrap();
    sequence.add_target(succeeding_target("T3").await).await.unwrap();

    let (result, _) = manager.execute_sequence(&sequence, false).await.unwrap();
    let result = result.unwrap();

    assert!(!result.success);
    assert_eq!(result.completed_targets, vec!["T1".to_string()]);
    assert_eq!(result.failed_targets, vec!["T2".to_string()]);
    assert_eq!(
        sequence.target_status("T3").await.unwrap(),
        TargetStatus::Pending
    );
}

#[tokio::test]
async fn s5_skip_recovery_continues_past_failure() {
    let manager = manager_with(RecoveryStrategy::Skip);
    let sequence = manager.create_sequence("s5");
    sequence.set_scheduling_strategy(SchedulingStrategy::Fifo);

    sequence.add_target(succeeding_target("T1").await).await.unwrap();
    sequence.add_target(failing_target("T2").await).await.unwrap();
    sequence.add_target(succeeding_target("T3").await).await.unwrap();

    let (result, _) = manager.execute_sequence(&sequence, false).await.unwrap();
    let result = result.unwrap();

    assert!(!result.success);
    assert_eq!(
        result.completed_targets,
        vec!["T1".to_string(), "T3".to_string()]
    );
    assert_eq!(result.failed_targets, vec!["T2".to_string()]);
    assert_eq!(result.total_progress, 100.0);
}

// ---------------------------------------------------------------------------
// S6 — template expansion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s6_basic_exposure_template_expands() {
    register_builtin_tasks().unwrap();
    let manager = manager_with(RecoveryStrategy::Stop);

    let sequence = manager
        .create_sequence_from_template(
            "BasicExposure",
            &json!({
                "targetName": "M42",
                "exposureTime": 30.0,
                "frameType": "light",
                "binning": 1,
                "gain": 100,
                "offset": 10
            }),
        )
        .await
        .unwrap();

    let names = sequence.target_names().await;
    assert_eq!(names, vec!["M42".to_string()]);
    let target = sequence.target("M42").await.unwrap();
    let tasks = target.tasks_snapshot().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_type, "TakeExposure");
    assert_eq!(tasks[0].params["exposure"], json!(30.0));
    assert_eq!(tasks[0].params["type"], "light");
    assert_eq!(tasks[0].params["binning"], json!(1));
    assert_eq!(tasks[0].params["gain"], json!(100));
    assert_eq!(tasks[0].params["offset"], json!(10));
}

// ---------------------------------------------------------------------------
// Round-trip law: save -> load preserves structure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn save_load_roundtrip_preserves_structure() {
    register_builtin_tasks().unwrap();
    let dir = TempDir::new().unwrap();
    let manager = SequenceManager::new(SequenceOptions {
        database_path: Some(dir.path().join("sequences.db")),
        ..SequenceOptions::default()
    })
    .unwrap();

    let sequence = manager.create_sequence("persisted night");
    for name in ["A", "B"] {
        let target = Target::new(name, Duration::from_secs(2), 1);
        target.set_priority(7);
        let factory = nocturne_sequencer::TaskFactory::global();
        let task = factory
            .create("Delay", "wait", json!({"seconds": 1.0}))
            .unwrap();
        target.add_task(task).await;
        sequence.add_target(target).await.unwrap();
    }
    sequence.add_target_dependency("B", "A").await.unwrap();

    let uuid = manager.save_to_database(&sequence).await.unwrap();
    let loaded = manager.load_from_database(uuid).await.unwrap();

    assert_eq!(loaded.uuid(), sequence.uuid());
    assert_eq!(loaded.name(), "persisted night");
    assert_eq!(loaded.target_names().await, sequence.target_names().await);
    assert_eq!(loaded.target_dependencies("B"), vec!["A".to_string()]);

    let original = sequence.target("A").await.unwrap();
    let restored = loaded.target("A").await.unwrap();
    assert_eq!(restored.priority(), original.priority());
    assert_eq!(restored.cooldown(), original.cooldown());
    assert_eq!(restored.max_retries(), original.max_retries());
    let original_tasks = original.tasks_snapshot().await;
    let restored_tasks = restored.tasks_snapshot().await;
    assert_eq!(restored_tasks.len(), original_tasks.len());
    assert_eq!(restored_tasks[0].name, original_tasks[0].name);
    assert_eq!(restored_tasks[0].params, original_tasks[0].params);

    assert!(manager.delete_from_database(uuid).await.unwrap());
}

// ---------------------------------------------------------------------------
// Asynchronous dispatch through the manager
// ---------------------------------------------------------------------------

#[tokio::test]
async fn async_execution_waits_via_manager() {
    let manager = manager_with(RecoveryStrategy::Stop);
    let sequence = manager.create_sequence("async");
    sequence.set_scheduling_strategy(SchedulingStrategy::Fifo);
    sequence.add_target(succeeding_target("only").await).await.unwrap();

    let (result, execution_id) = manager.execute_sequence(&sequence, true).await.unwrap();
    assert!(result.is_none());
    let execution_id = execution_id.unwrap();
    assert!(manager.execution(execution_id).await.is_some());

    let result = manager
        .wait_for_completion(&sequence, Duration::ZERO)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.completed_targets, vec!["only".to_string()]);
}
