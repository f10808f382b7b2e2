use thiserror::Error;

/// Centralized error type for the pipeline stages.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to load '{path}': {reason}")]
    Load { path: String, reason: String },

    #[error("missing required column '{column}' (available: {available})")]
    Schema { column: String, available: String },

    #[error("insufficient data for a forecast: need at least 2 periods, got {found}")]
    InsufficientData { found: usize },

    #[error("population join matched none of the {regions} regions in the notifications")]
    JoinMismatch { regions: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("numerical error: {0}")]
    Numerical(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn load(path: impl AsRef<std::path::Path>, reason: impl ToString) -> Self {
        PipelineError::Load {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn schema(column: &str, headers: &[String]) -> Self {
        PipelineError::Schema {
            column: column.to_string(),
            available: if headers.is_empty() {
                "none".to_string()
            } else {
                headers.join(", ")
            },
        }
    }
}

/// Alias for fallible pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
