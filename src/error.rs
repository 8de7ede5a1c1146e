use thiserror::Error;

/// Store operation errors with contextual information
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store open failed for {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("SQLite error: {operation} failed: {source}")]
    Sqlite {
        operation: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Invalid face identifier: {0}")]
    InvalidFace(String),

    #[error("Serialization failed for {field}: {source}")]
    Serialization {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn sqlite(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| StoreError::Sqlite { operation, source }
    }

    /// Only failing to reach the store at all is worth retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::Open { .. })
    }
}

/// Inference engine errors
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Image decode failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("Inference execution failed: {0}")]
    Execution(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Errors that stop the poll loop
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
