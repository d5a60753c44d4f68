// Global error type for definitions, configuration and tensor handling.

#[derive(Debug, thiserror::Error)]
pub enum PipeflowError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("pipeline definition error: {0}")]
    Definition(String),

    #[error("tensor error: {0}")]
    Tensor(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PipeflowError>;
