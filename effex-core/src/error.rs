use thiserror::Error;

/// All errors produced by effex-core.
#[derive(Debug, Error)]
pub enum EffexError {
    #[error("invalid stream config: {0}")]
    Config(String),

    #[error("illegal lifecycle transition: {0}")]
    State(String),

    #[error("audio stream error: {0}")]
    Stream(String),

    #[error("user callback panicked during dispatch: {0}")]
    CallbackFault(String),

    #[error("task failed: {0}")]
    Task(String),

    #[error("work queue is full — retry or drop")]
    QueueFull,

    #[error("stop() exceeded its bound ({waited_ms} ms) — stream torn down forcibly")]
    ForcedStop { waited_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EffexError>;
