pub mod astro;
pub mod error;
pub mod event;
pub mod status;

pub use astro::{
    Coordinates, ExposurePlan, HorizontalCoordinates, MeridianFlipInfo, MeridianState,
    ObservabilityWindow, ObserverLocation, TargetAstroConfig,
};
pub use error::{EngineError, Result};
pub use event::{ProgressReport, SequenceEvent};
pub use status::{
    ExecutionStrategy, RecoveryStrategy, SchedulingStrategy, SequenceState, TargetStatus,
    TaskStatus,
};
