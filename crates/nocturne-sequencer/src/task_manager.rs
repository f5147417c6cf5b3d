// Dependency-aware bookkeeping for the tasks inside one target: execution
// records behind a read-write lock and the topological ordering used by the
// target's execution loop.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock as StdRwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use nocturne_types::{EngineError, Result, TaskStatus};

#[derive(Debug, Clone, Serialize)]
pub struct TaskExecutionRecord {
    pub task_id: Uuid,
    pub name: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Ordering input: id, priority, insertion index.
#[derive(Debug, Clone, Copy)]
pub struct TaskOrderKey {
    pub id: Uuid,
    pub priority: i32,
    pub insertion: usize,
}

pub struct TaskManager {
    records: StdRwLock<HashMap<Uuid, TaskExecutionRecord>>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            records: StdRwLock::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Records (reads never block each other)
    // ------------------------------------------------------------------

    pub fn record_start(&self, task_id: Uuid, name: &str) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(task_id).or_insert_with(|| TaskExecutionRecord {
            task_id,
            name: name.to_string(),
            status: TaskStatus::Pending,
            attempts: 0,
            started_at: None,
            ended_at: None,
            error: None,
        });
        record.status = TaskStatus::InProgress;
        record.attempts += 1;
        record.started_at = Some(Utc::now());
        record.ended_at = None;
    }

    pub fn record_end(&self, task_id: Uuid, status: TaskStatus, error: Option<String>) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(&task_id) {
            record.status = status;
            record.ended_at = Some(Utc::now());
            record.error = error;
        }
    }

    pub fn record(&self, task_id: Uuid) -> Option<TaskExecutionRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task_id)
            .cloned()
    }

    pub fn records(&self) -> Vec<TaskExecutionRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn reset(&self) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    // ------------------------------------------------------------------
    // Ordering
    // ------------------------------------------------------------------

    /// Topological order over the dependency edges; ties break by declared
    /// priority (higher first), then insertion order.
    pub fn execution_order(
        keys: &[TaskOrderKey],
        deps: &HashMap<Uuid, Vec<Uuid>>,
    ) -> Result<Vec<Uuid>> {
        let known: HashSet<Uuid> = keys.iter().map(|k| k.id).collect();
        for (task, preds) in deps {
            if !known.contains(task) {
                return Err(EngineError::Dependency(format!(
                    "dependency recorded for unknown task {task}"
                )));
            }
            for pred in preds {
                if !known.contains(pred) {
                    return Err(EngineError::Dependency(format!(
                        "task {task} depends on unknown task {pred}"
                    )));
                }
            }
        }

        let mut remaining: Vec<TaskOrderKey> = keys.to_vec();
        let mut placed: HashSet<Uuid> = HashSet::new();
        let mut order = Vec::with_capacity(keys.len());

        while !remaining.is_empty() {
            // ready = every predecessor already placed
            let mut ready: Vec<TaskOrderKey> = remaining
                .iter()
                .filter(|k| {
                    deps.get(&k.id)
                        .map(|preds| preds.iter().all(|p| placed.contains(p)))
                        .unwrap_or(true)
                })
                .copied()
                .collect();
            if ready.is_empty() {
                return Err(EngineError::Dependency(
                    "cycle detected in task dependencies".to_string(),
                ));
            }
            ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.insertion.cmp(&b.insertion)));
            let next = ready[0];
            placed.insert(next.id);
            order.push(next.id);
            remaining.retain(|k| k.id != next.id);
        }
        Ok(order)
    }

    /// Would adding `task -> depends_on` close a cycle?
    pub fn would_create_cycle(
        deps: &HashMap<Uuid, Vec<Uuid>>,
        task: Uuid,
        depends_on: Uuid,
    ) -> bool {
        if task == depends_on {
            return true;
        }
        // cycle iff `task` is reachable from `depends_on` over existing edges
        let mut stack = vec![depends_on];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == task {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(preds) = deps.get(&current) {
                stack.extend(preds.iter().copied());
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: Uuid, priority: i32, insertion: usize) -> TaskOrderKey {
        TaskOrderKey { id, priority, insertion }
    }

    #[test]
    fn order_respects_dependencies() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let keys = vec![key(a, 0, 0), key(b, 0, 1), key(c, 0, 2)];
        let mut deps = HashMap::new();
        deps.insert(a, vec![c]); // a after c
        let order = TaskManager::execution_order(&keys, &deps).unwrap();
        let pos = |id| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(c) < pos(a));
    }

    #[test]
    fn ties_break_by_priority_then_insertion() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let keys = vec![key(a, 1, 0), key(b, 5, 1), key(c, 5, 2)];
        let order = TaskManager::execution_order(&keys, &HashMap::new()).unwrap();
        assert_eq!(order, vec![b, c, a]);
    }

    #[test]
    fn cycle_is_rejected() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let keys = vec![key(a, 0, 0), key(b, 0, 1)];
        let mut deps = HashMap::new();
        deps.insert(a, vec![b]);
        deps.insert(b, vec![a]);
        let err = TaskManager::execution_order(&keys, &deps).unwrap_err();
        assert_eq!(err.kind(), "dependency");
    }

    #[test]
    fn reachability_check_catches_would_be_cycles() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let mut deps = HashMap::new();
        deps.insert(b, vec![a]); // b depends on a
        deps.insert(c, vec![b]); // c depends on b
        assert!(TaskManager::would_create_cycle(&deps, a, c));
        assert!(TaskManager::would_create_cycle(&deps, a, a));
        assert!(!TaskManager::would_create_cycle(&deps, c, a));
    }

    #[test]
    fn records_track_attempts() {
        let manager = TaskManager::new();
        let id = Uuid::new_v4();
        manager.record_start(id, "focus");
        manager.record_end(id, TaskStatus::Failed, Some("oops".into()));
        manager.record_start(id, "focus");
        manager.record_end(id, TaskStatus::Completed, None);
        let record = manager.record(id).unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.error.is_none());
    }

    #[test]
    fn unknown_dependency_is_reported() {
        let a = Uuid::new_v4();
        let keys = vec![key(a, 0, 0)];
        let mut deps = HashMap::new();
        deps.insert(a, vec![Uuid::new_v4()]);
        assert!(TaskManager::execution_order(&keys, &deps).is_err());
    }
}
