pub mod document;
pub mod events;
pub mod factory;
pub mod manager;
pub mod resources;
pub mod scheduler;
pub mod sequencer;
pub mod store;
pub mod target;
pub mod task;
pub mod task_manager;

pub use document::{sequence_from_json, sequence_to_json, validate_sequence_json};
pub use events::{CallbackRegistry, EventBus};
pub use factory::{register_builtin_tasks, DeviceRegistry, TaskFactory, TaskInfo};
pub use manager::{SequenceManager, SequenceOptions, SequenceResult};
pub use resources::{FixedResourceProbe, ResourceLimits, ResourceProbe, SystemResourceProbe};
pub use scheduler::{TargetEntry, TargetScheduler};
pub use sequencer::ExposureSequence;
pub use store::{SequenceRecord, SequenceStore};
pub use target::{Target, TaskEvent};
pub use task::{Task, TaskAction};
pub use task_manager::{TaskExecutionRecord, TaskManager};
