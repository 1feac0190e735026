use thiserror::Error;

/// Top-level error type for the batchflow pipeline.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Accelerator initialization, allocation, copy, invocation or teardown
    /// failure. Partial device state cannot be trusted after one of these.
    #[error("device error: {0}")]
    Device(String),

    #[error("model loading error: {0}")]
    ModelLoad(String),

    #[error("image decode error: {0}")]
    ImageDecode(String),

    /// A blocking queue or pool was closed while the caller waited on it.
    #[error("queue closed")]
    QueueClosed,

    #[error("buffer pool imbalance: {0}")]
    PoolImbalance(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
