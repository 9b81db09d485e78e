use thiserror::Error;

#[derive(Debug, Error)]
pub enum PicoError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Chunk bookkeeping and the batch system or output directory disagree.
    /// Never recovered from automatically.
    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Batch error: {0}")]
    Batch(String),

    #[error("DAS error: {0}")]
    Das(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Inspect error: {0}")]
    Inspect(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl PicoError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, PicoError::Integrity(_))
    }
}

impl From<std::io::Error> for PicoError {
    fn from(err: std::io::Error) -> Self {
        PicoError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PicoError {
    fn from(err: serde_json::Error) -> Self {
        PicoError::Storage(err.to_string())
    }
}
