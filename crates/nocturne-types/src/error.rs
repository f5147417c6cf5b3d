// Nocturne Error Types
use thiserror::Error;

/// Engine-wide error taxonomy. Every subsystem converts its internal errors
/// into one of these kinds before crossing a crate or worker boundary.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("resource unavailable: {0}")]
    Resource(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("dependency error: {0}")]
    Dependency(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Stable machine-readable kind tag, used in event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Resource(_) => "resource",
            EngineError::Timeout(_) => "timeout",
            EngineError::Device(_) => "device",
            EngineError::Execution(_) => "execution",
            EngineError::Dependency(_) => "dependency",
            EngineError::Persistence(_) => "persistence",
            EngineError::InvalidOperation(_) => "invalid_operation",
            EngineError::NotFound(_) => "not_found",
            EngineError::Aborted(_) => "aborted",
            EngineError::Io(_) => "io",
            EngineError::Json(_) => "serialization",
        }
    }
}

// Event payloads carry errors as plain strings.
impl serde::Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(EngineError::Validation("x".into()).kind(), "validation");
        assert_eq!(EngineError::Device("x".into()).kind(), "device");
        assert_eq!(EngineError::Timeout("x".into()).kind(), "timeout");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: EngineError = io.into();
        assert_eq!(err.kind(), "io");
    }
}
