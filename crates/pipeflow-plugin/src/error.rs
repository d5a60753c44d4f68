/// Crate-local error type for plugin loading and invocation.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("failed to load library {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("library {library} is missing symbol `{symbol}`")]
    MissingSymbol { library: String, symbol: String },

    #[error("unknown library '{0}'")]
    UnknownLibrary(String),

    #[error("{library}: initialize returned {code}")]
    Initialize { library: String, code: i32 },

    #[error("{library}: deinitialize returned {code}")]
    Deinitialize { library: String, code: i32 },

    #[error("node {node}: execute returned {code}")]
    Execute { node: String, code: i32 },

    #[error("node {node}: {query} returned {code}")]
    Metadata { node: String, query: &'static str, code: i32 },

    #[error("node {node}: corrupted outputs: {reason}")]
    OutputsCorrupted { node: String, reason: String },

    #[error("release of {ptr:#x} returned {code}")]
    Release { ptr: usize, code: i32 },

    #[error("buffer pool: {0}")]
    Pool(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error(transparent)]
    Tensor(#[from] pipeflow_types::PipeflowError),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PluginError>;
