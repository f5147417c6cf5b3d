// Target-level scheduling: strategy ordering, readiness, cycle detection,
// and deadlock checks over the cross-target dependency graph.

use std::collections::{HashMap, HashSet};

use nocturne_types::{EngineError, Result, SchedulingStrategy, TargetStatus};

/// Ordering input per target.
#[derive(Debug, Clone)]
pub struct TargetEntry {
    pub name: String,
    pub priority: i32,
    pub insertion: usize,
}

pub struct TargetScheduler;

impl TargetScheduler {
    /// Orders target names according to the scheduling strategy.
    pub fn order(
        strategy: SchedulingStrategy,
        entries: &[TargetEntry],
        deps: &HashMap<String, Vec<String>>,
    ) -> Result<Vec<String>> {
        match strategy {
            SchedulingStrategy::Fifo => Ok(entries.iter().map(|e| e.name.clone()).collect()),
            SchedulingStrategy::Priority => {
                let mut sorted: Vec<&TargetEntry> = entries.iter().collect();
                sorted.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then(a.insertion.cmp(&b.insertion))
                });
                Ok(sorted.into_iter().map(|e| e.name.clone()).collect())
            }
            SchedulingStrategy::Dependencies => {
                Self::validate(entries, deps)?;
                let mut remaining: Vec<&TargetEntry> = entries.iter().collect();
                let mut placed: HashSet<&str> = HashSet::new();
                let mut order = Vec::with_capacity(entries.len());
                while !remaining.is_empty() {
                    let ready_idx = remaining.iter().position(|e| {
                        deps.get(&e.name)
                            .map(|preds| preds.iter().all(|p| placed.contains(p.as_str())))
                            .unwrap_or(true)
                    });
                    match ready_idx {
                        Some(idx) => {
                            let entry = remaining.remove(idx);
                            placed.insert(entry.name.as_str());
                            order.push(entry.name.clone());
                        }
                        None => {
                            return Err(EngineError::Validation(
                                "cycle detected in target dependencies".to_string(),
                            ))
                        }
                    }
                }
                Ok(order)
            }
        }
    }

    /// Unknown predecessors and cycles are validation errors.
    pub fn validate(
        entries: &[TargetEntry],
        deps: &HashMap<String, Vec<String>>,
    ) -> Result<()> {
        let known: HashSet<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        for (name, preds) in deps {
            if !known.contains(name.as_str()) {
                return Err(EngineError::Dependency(format!(
                    "dependency recorded for unknown target '{name}'"
                )));
            }
            for pred in preds {
                if !known.contains(pred.as_str()) {
                    return Err(EngineError::Dependency(format!(
                        "target '{name}' depends on unknown target '{pred}'"
                    )));
                }
            }
        }
        if Self::find_cycle(deps).is_some() {
            return Err(EngineError::Validation(
                "cycle detected in target dependencies".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns one path of the first cycle found, if any.
    pub fn find_cycle(deps: &HashMap<String, Vec<String>>) -> Option<Vec<String>> {
        fn visit(
            node: &str,
            deps: &HashMap<String, Vec<String>>,
            visiting: &mut Vec<String>,
            done: &mut HashSet<String>,
        ) -> bool {
            if visiting.iter().any(|n| n == node) {
                visiting.push(node.to_string());
                return true;
            }
            if done.contains(node) {
                return false;
            }
            visiting.push(node.to_string());
            if let Some(preds) = deps.get(node) {
                for pred in preds {
                    if visit(pred, deps, visiting, done) {
                        return true;
                    }
                }
            }
            visiting.pop();
            done.insert(node.to_string());
            false
        }

        let mut done = HashSet::new();
        for node in deps.keys() {
            let mut visiting = Vec::new();
            if visit(node, deps, &mut visiting, &mut done) {
                return Some(visiting);
            }
        }
        None
    }

    /// Would adding `target -> depends_on` close a cycle?
    pub fn would_create_cycle(
        deps: &HashMap<String, Vec<String>>,
        target: &str,
        depends_on: &str,
    ) -> bool {
        if target == depends_on {
            return true;
        }
        let mut stack = vec![depends_on.to_string()];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(preds) = deps.get(&current) {
                stack.extend(preds.iter().cloned());
            }
        }
        false
    }

    /// A target is ready when it is pending and every in-edge has completed.
    pub fn is_ready(
        name: &str,
        statuses: &HashMap<String, TargetStatus>,
        deps: &HashMap<String, Vec<String>>,
    ) -> bool {
        if statuses.get(name) != Some(&TargetStatus::Pending) {
            return false;
        }
        deps.get(name)
            .map(|preds| {
                preds
                    .iter()
                    .all(|p| statuses.get(p) == Some(&TargetStatus::Completed))
            })
            .unwrap_or(true)
    }

    /// Pending targets whose predecessors ended in a non-completed terminal
    /// state can never run.
    pub fn blocked_targets(
        statuses: &HashMap<String, TargetStatus>,
        deps: &HashMap<String, Vec<String>>,
    ) -> Vec<String> {
        statuses
            .iter()
            .filter(|(name, status)| {
                **status == TargetStatus::Pending
                    && deps
                        .get(*name)
                        .map(|preds| {
                            preds.iter().any(|p| {
                                statuses
                                    .get(p)
                                    .map(|s| s.is_terminal() && *s != TargetStatus::Completed)
                                    .unwrap_or(false)
                            })
                        })
                        .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, priority: i32, insertion: usize) -> TargetEntry {
        TargetEntry {
            name: name.to_string(),
            priority,
            insertion,
        }
    }

    #[test]
    fn fifo_preserves_insertion_order() {
        let entries = vec![entry("c", 9, 0), entry("a", 1, 1), entry("b", 5, 2)];
        let order =
            TargetScheduler::order(SchedulingStrategy::Fifo, &entries, &HashMap::new()).unwrap();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn priority_sorts_descending_and_is_stable() {
        let entries = vec![entry("a", 5, 0), entry("b", 9, 1), entry("c", 5, 2)];
        let order =
            TargetScheduler::order(SchedulingStrategy::Priority, &entries, &HashMap::new())
                .unwrap();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn dependencies_topologically_sort() {
        let entries = vec![entry("t3", 0, 0), entry("t2", 0, 1), entry("t1", 0, 2)];
        let mut deps = HashMap::new();
        deps.insert("t2".to_string(), vec!["t1".to_string()]);
        deps.insert("t3".to_string(), vec!["t2".to_string()]);
        let order =
            TargetScheduler::order(SchedulingStrategy::Dependencies, &entries, &deps).unwrap();
        assert_eq!(order, vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn dependency_cycle_is_a_validation_error() {
        let entries = vec![entry("a", 0, 0), entry("b", 0, 1)];
        let mut deps = HashMap::new();
        deps.insert("a".to_string(), vec!["b".to_string()]);
        deps.insert("b".to_string(), vec!["a".to_string()]);
        let err =
            TargetScheduler::order(SchedulingStrategy::Dependencies, &entries, &deps).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn readiness_requires_completed_predecessors() {
        let mut statuses = HashMap::new();
        statuses.insert("a".to_string(), TargetStatus::Completed);
        statuses.insert("b".to_string(), TargetStatus::Pending);
        statuses.insert("c".to_string(), TargetStatus::Pending);
        let mut deps = HashMap::new();
        deps.insert("b".to_string(), vec!["a".to_string()]);
        deps.insert("c".to_string(), vec!["b".to_string()]);

        assert!(TargetScheduler::is_ready("b", &statuses, &deps));
        assert!(!TargetScheduler::is_ready("c", &statuses, &deps));
        assert!(!TargetScheduler::is_ready("a", &statuses, &deps));
    }

    #[test]
    fn blocked_targets_detects_failed_predecessors() {
        let mut statuses = HashMap::new();
        statuses.insert("a".to_string(), TargetStatus::Failed);
        statuses.insert("b".to_string(), TargetStatus::Pending);
        let mut deps = HashMap::new();
        deps.insert("b".to_string(), vec!["a".to_string()]);
        assert_eq!(
            TargetScheduler::blocked_targets(&statuses, &deps),
            vec!["b".to_string()]
        );
    }

    #[test]
    fn incremental_cycle_check() {
        let mut deps = HashMap::new();
        deps.insert("b".to_string(), vec!["a".to_string()]);
        assert!(TargetScheduler::would_create_cycle(&deps, "a", "b"));
        assert!(TargetScheduler::would_create_cycle(&deps, "a", "a"));
        assert!(!TargetScheduler::would_create_cycle(&deps, "b", "c"));
    }
}
