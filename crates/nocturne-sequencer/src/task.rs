// The atomic unit of work: a named, parameterized action with status,
// timing, timeout, and retry bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use nocturne_types::{EngineError, Result, TaskStatus};

/// A task action consumes its merged parameter object and produces a result
/// payload. Actions run inside a spawned worker so a panicking action is
/// converted into an `Execution` error instead of unwinding.
pub type TaskAction = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Clone)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub task_type: String,
    action: TaskAction,
    pub params: Value,
    pub status: TaskStatus,
    /// Higher runs first when dependencies allow.
    pub priority: i32,
    pub timeout: Option<Duration>,
    pub max_retries: u32,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("task_type", &self.task_type)
            .field("status", &self.status)
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

impl Task {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>, action: TaskAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            task_type: task_type.into(),
            action,
            params: Value::Object(serde_json::Map::new()),
            status: TaskStatus::Pending,
            priority: 0,
            timeout: None,
            max_retries: 0,
            retry_count: 0,
            started_at: None,
            ended_at: None,
            error_message: None,
        }
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    pub fn set_retry_policy(&mut self, max_retries: u32) {
        self.max_retries = max_retries;
    }

    pub fn set_params(&mut self, params: Value) {
        self.params = params;
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - start).to_std().ok()
    }

    /// Cancels a task that has not started yet. The action is never invoked.
    pub fn cancel(&mut self) -> bool {
        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::Cancelled;
            self.ended_at = Some(Utc::now());
            true
        } else {
            false
        }
    }

    /// Resets the task for a fresh run (target-level retry).
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.retry_count = 0;
        self.started_at = None;
        self.ended_at = None;
        self.error_message = None;
    }

    /// Runs one attempt. On failure the retry count advances while it is
    /// below the maximum, so the count also answers "may the owner retry".
    pub async fn execute(&mut self, params: Value) -> Result<Value> {
        self.execute_cancellable(params, None).await
    }

    /// Like `execute`, but observes an abort token. On abort the spawned
    /// action is left to finish its current hardware call while the task
    /// fails promptly with reason Aborted.
    pub async fn execute_cancellable(
        &mut self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        if self.status == TaskStatus::Cancelled {
            return Err(EngineError::Execution(format!(
                "task '{}' was cancelled",
                self.name
            )));
        }
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
        self.ended_at = None;
        debug!(task = %self.name, r#type = %self.task_type, "task attempt started");

        enum Outcome {
            Joined(std::result::Result<Result<Value>, tokio::task::JoinError>),
            TimedOut,
            Aborted,
        }

        let action = self.action.clone();
        let worker = tokio::spawn(async move { action(params).await });
        let limit = self.timeout;

        let join_fut = async {
            match limit {
                Some(limit) => match tokio::time::timeout(limit, worker).await {
                    Ok(joined) => Outcome::Joined(joined),
                    Err(_) => Outcome::TimedOut,
                },
                None => Outcome::Joined(worker.await),
            }
        };
        let outcome = match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => Outcome::Aborted,
                    outcome = join_fut => outcome,
                }
            }
            None => join_fut.await,
        };

        let result = match outcome {
            Outcome::TimedOut => {
                // the worker is left to finish its current hardware call
                return self.fail(EngineError::Timeout(format!(
                    "task '{}' exceeded {:.1}s",
                    self.name,
                    self.timeout.map(|t| t.as_secs_f64()).unwrap_or(0.0)
                )));
            }
            Outcome::Aborted => {
                self.status = TaskStatus::Failed;
                self.ended_at = Some(Utc::now());
                self.error_message = Some("aborted".to_string());
                return Err(EngineError::Aborted(format!(
                    "task '{}' aborted",
                    self.name
                )));
            }
            Outcome::Joined(Ok(result)) => result,
            Outcome::Joined(Err(join_error)) if join_error.is_panic() => Err(
                EngineError::Execution(format!("task '{}' action panicked", self.name)),
            ),
            Outcome::Joined(Err(_)) => Err(EngineError::Execution(format!(
                "task '{}' worker was cancelled",
                self.name
            ))),
        };

        match result {
            Ok(value) => {
                self.status = TaskStatus::Completed;
                self.ended_at = Some(Utc::now());
                self.error_message = None;
                Ok(value)
            }
            Err(error) => self.fail(error),
        }
    }

    fn fail(&mut self, error: EngineError) -> Result<Value> {
        self.status = TaskStatus::Failed;
        self.ended_at = Some(Utc::now());
        self.error_message = Some(error.to_string());
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
        }
        Err(error)
    }
}

/// Helper that owns the full attempt loop: one initial run plus up to
/// `max_retries` retries. Aborts are not retried. Returns the last error if
/// every attempt failed.
pub async fn execute_with_retries(
    task: &mut Task,
    params: Value,
    cancel: Option<&CancellationToken>,
    mut on_retry: impl FnMut(&Task, u32, &EngineError),
) -> Result<Value> {
    let attempts = task.max_retries + 1;
    let mut last_error = None;
    for attempt in 0..attempts {
        match task.execute_cancellable(params.clone(), cancel).await {
            Ok(value) => return Ok(value),
            Err(error @ EngineError::Aborted(_)) => return Err(error),
            Err(error) => {
                if attempt + 1 < attempts {
                    on_retry(task, attempt + 1, &error);
                }
                last_error = Some(error);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| EngineError::Execution(format!("task '{}' never ran", task.name))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_action(
        counter: Arc<AtomicU32>,
        fail_first: u32,
    ) -> TaskAction {
        Arc::new(move |_params| {
            let counter = counter.clone();
            Box::pin(async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= fail_first {
                    Err(EngineError::Execution(format!("induced failure {n}")))
                } else {
                    Ok(Value::Null)
                }
            })
        })
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut task = Task::new("t", "test", counting_action(calls.clone(), 0));
        task.set_retry_policy(3);
        let value = execute_with_retries(&mut task, Value::Null, None, |_, _, _| {})
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn retry_then_succeed_counts_invocations() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut task = Task::new("t", "test", counting_action(calls.clone(), 1));
        task.set_retry_policy(3);
        execute_with_retries(&mut task, Value::Null, None, |_, _, _| {})
            .await
            .unwrap();
        // invocations = retry_count + 1 with the last one completed
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.status(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn retries_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut task = Task::new("t", "test", counting_action(calls.clone(), 99));
        task.set_retry_policy(2);
        let mut retries_seen = 0;
        let err = execute_with_retries(&mut task, Value::Null, None, |_, _, _| retries_seen += 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "execution");
        assert_eq!(task.status(), TaskStatus::Failed);
        // invocations = retry_count + 1 when terminally failed
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(task.retry_count, 2);
        assert_eq!(retries_seen, 2);
    }

    #[tokio::test]
    async fn timeout_marks_failed_with_timeout_reason() {
        let action: TaskAction = Arc::new(|_params| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            })
        });
        let mut task = Task::new("slow", "test", action);
        task.set_timeout(Duration::from_millis(30));
        let err = task.execute(Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.error_message.as_deref().unwrap_or("").contains("exceeded"));
    }

    #[tokio::test]
    async fn panicking_action_becomes_execution_error() {
        let action: TaskAction = Arc::new(|_params| {
            Box::pin(async {
                panic!("boom");
            })
        });
        let mut task = Task::new("p", "test", action);
        let err = task.execute(Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), "execution");
        assert!(err.to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn cancel_while_pending_skips_action() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut task = Task::new("c", "test", counting_action(calls.clone(), 0));
        assert!(task.cancel());
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert!(task.execute(Value::Null).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
