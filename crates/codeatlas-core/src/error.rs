use std::path::PathBuf;
use thiserror::Error;

/// Fatal and structural errors raised by the core pipeline.
///
/// Per-file parse failures are not represented here: they are logged and the
/// file is skipped.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("repository contains no recognizable code components: {path}")]
    EmptyRepository { path: PathBuf },

    #[error("component table is empty")]
    EmptyComponentTable,

    #[error("no leaf components survived filtering")]
    EmptyLeafSet,

    #[error("module tree invariant violated at '{module}': {detail}")]
    TreeInvariantViolation { module: String, detail: String },

    #[error("dependency analysis timed out after {seconds}s")]
    AnalysisTimeout { seconds: u64 },

    #[error("llm failure: {0}")]
    LlmFailure(String),

    #[error("run incomplete: {detail}")]
    Incomplete { detail: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
