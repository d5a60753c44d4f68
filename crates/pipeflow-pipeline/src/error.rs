use pipeflow_plugin::PluginError;
use pipeflow_types::PipeflowError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline structure: {0}")]
    Structure(String),

    #[error("node {node}: no session {key}")]
    UnknownSession { node: String, key: String },

    #[error("node {node}: invalid session transition: {from} → {to}")]
    InvalidTransition { node: String, from: String, to: String },

    #[error("node {node}: input {input} (shard {shard}) delivered twice")]
    DuplicateInput { node: String, input: String, shard: usize },

    #[error("request is missing input {0}")]
    MissingRequestInput(String),

    #[error("node {node} did not produce output {output} needed by {consumer}")]
    MissingOutput { node: String, output: String, consumer: String },

    #[error("node {node}: demultiply count mismatch: expected {expected}, got {actual}")]
    DemultiplyCountMismatch { node: String, expected: usize, actual: usize },

    #[error("node {node}: demultiplying zero shards is not supported")]
    DemultiplyZeroShards { node: String },

    #[error("node {node}: {actual} shards exceed the limit of {limit}")]
    DemultiplyLimitExceeded { node: String, actual: usize, limit: usize },

    #[error("node {node}: cannot demultiply: {reason}")]
    Demultiply { node: String, reason: String },

    #[error("session {key}: gather nesting violated: {reason}")]
    GatherNesting { key: String, reason: String },

    #[error("node {node}: cannot gather: {reason}")]
    Gather { node: String, reason: String },

    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("node {node}: inference failed: {reason}")]
    Inference { node: String, reason: String },

    #[error("response output {0} produced more than once")]
    DuplicateResponseOutput(String),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Types(#[from] PipeflowError),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
