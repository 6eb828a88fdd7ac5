pub type Result<T> = core::result::Result<T, GenqueueError>;

#[derive(thiserror::Error, Debug)]
pub enum GenqueueError {
    #[error("config error: {0}")]
    Config(String),
    #[error("invalid generation config: {0}")]
    InvalidGeneration(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("task queue is full")]
    QueueFull,
    #[error("task queue is shutting down")]
    QueueClosed,
    #[error("task {0} not found")]
    TaskNotFound(String),
    #[error("task {0} is not complete")]
    TaskNotComplete(String),
    #[error("output {0} not found")]
    OutputNotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Message(String),
}

pub mod generation;
pub mod config;
