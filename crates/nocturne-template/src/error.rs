use thiserror::Error;

/// Errors raised by macro expansion and template instantiation.
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("undefined macro: {0}")]
    UndefinedMacro(String),

    #[error("invalid macro arguments: {0}")]
    InvalidMacroArgs(String),

    #[error("macro evaluation failed: {0}")]
    Evaluation(String),

    #[error("recursion limit exceeded: {0}")]
    RecursionLimit(String),

    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("missing template parameter: {0}")]
    MissingParameter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("template JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
