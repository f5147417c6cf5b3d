pub mod engine;
pub mod error;
pub mod registry;

pub use engine::{MacroEngine, MacroStats, MacroValue, DEFAULT_MAX_CACHE_SIZE};
pub use error::TemplateError;
pub use registry::{builtin_templates, TaskTemplate, TemplateRegistry};
