use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Agent not registered: {0}")]
    AgentNotRegistered(String),

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Checkpoint not found: {task_id}/{checkpoint_id}")]
    CheckpointNotFound {
        task_id: String,
        checkpoint_id: String,
    },

    #[error("State corrupted: {0}")]
    Corruption(String),

    #[error("No recoverable state for task: {0}")]
    NoRecoverableState(String),

    #[error("Unreadable checkpoint manifests: {}", .0.join(", "))]
    ManifestErrors(Vec<String>),

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CoordError>;
