// Event fan-out: a broadcast bus for structured events plus a registry of
// user callbacks. Callbacks are copied out of the registry before invocation
// so user code runs without holding engine locks.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::broadcast;
use uuid::Uuid;

use nocturne_types::{EngineError, ProgressReport, SequenceEvent, TargetStatus, TaskStatus};

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SequenceEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: SequenceEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub type SequenceStartCallback = Arc<dyn Fn(Uuid) + Send + Sync>;
pub type SequenceEndCallback = Arc<dyn Fn(Uuid, bool) + Send + Sync>;
pub type TargetLifecycleCallback = Arc<dyn Fn(Uuid, &str, TargetStatus) + Send + Sync>;
pub type TaskLifecycleCallback = Arc<dyn Fn(&str, &str, TaskStatus) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&str, &EngineError) + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(&ProgressReport) + Send + Sync>;

#[derive(Default)]
pub struct CallbackRegistry {
    on_sequence_start: StdMutex<Option<SequenceStartCallback>>,
    on_sequence_end: StdMutex<Option<SequenceEndCallback>>,
    on_target_start: StdMutex<Option<TargetLifecycleCallback>>,
    on_target_end: StdMutex<Option<TargetLifecycleCallback>>,
    on_task_start: StdMutex<Option<TaskLifecycleCallback>>,
    on_task_end: StdMutex<Option<TaskLifecycleCallback>>,
    on_error: StdMutex<Option<ErrorCallback>>,
    on_progress: StdMutex<Option<ProgressCallback>>,
}

macro_rules! setter_and_invoke {
    ($set:ident, $invoke:ident, $field:ident, $ty:ty, ($($arg:ident: $arg_ty:ty),*)) => {
        pub fn $set(&self, callback: $ty) {
            *self.$field.lock().unwrap_or_else(|e| e.into_inner()) = Some(callback);
        }

        pub fn $invoke(&self, $($arg: $arg_ty),*) {
            let callback = self.$field.lock().unwrap_or_else(|e| e.into_inner()).clone();
            if let Some(callback) = callback {
                callback($($arg),*);
            }
        }
    };
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    setter_and_invoke!(
        set_on_sequence_start,
        invoke_sequence_start,
        on_sequence_start,
        SequenceStartCallback,
        (sequence_id: Uuid)
    );
    setter_and_invoke!(
        set_on_sequence_end,
        invoke_sequence_end,
        on_sequence_end,
        SequenceEndCallback,
        (sequence_id: Uuid, success: bool)
    );
    setter_and_invoke!(
        set_on_target_start,
        invoke_target_start,
        on_target_start,
        TargetLifecycleCallback,
        (sequence_id: Uuid, target: &str, status: TargetStatus)
    );
    setter_and_invoke!(
        set_on_target_end,
        invoke_target_end,
        on_target_end,
        TargetLifecycleCallback,
        (sequence_id: Uuid, target: &str, status: TargetStatus)
    );
    setter_and_invoke!(
        set_on_task_start,
        invoke_task_start,
        on_task_start,
        TaskLifecycleCallback,
        (target: &str, task: &str, status: TaskStatus)
    );
    setter_and_invoke!(
        set_on_task_end,
        invoke_task_end,
        on_task_end,
        TaskLifecycleCallback,
        (target: &str, task: &str, status: TaskStatus)
    );
    setter_and_invoke!(
        set_on_error,
        invoke_error,
        on_error,
        ErrorCallback,
        (scope: &str, error: &EngineError)
    );
    setter_and_invoke!(
        set_on_progress,
        invoke_progress,
        on_progress,
        ProgressCallback,
        (report: &ProgressReport)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callbacks_can_unregister_themselves_without_deadlock() {
        let registry = Arc::new(CallbackRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let registry_inner = registry.clone();
        let hits_inner = hits.clone();
        registry.set_on_sequence_start(Arc::new(move |_id| {
            hits_inner.fetch_add(1, Ordering::SeqCst);
            // re-registering from inside a callback must not deadlock
            registry_inner.set_on_sequence_start(Arc::new(|_id| {}));
        }));

        registry.invoke_sequence_start(Uuid::new_v4());
        registry.invoke_sequence_start(Uuid::new_v4());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(SequenceEvent::SequenceStarted {
            sequence_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SequenceEvent::SequenceStarted { .. }));
    }
}
