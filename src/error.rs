use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Malformed plan: {0}")]
    MalformedPlan(String),

    #[error("Circular dependency: {cycle}")]
    CircularDependency { cycle: String },

    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    #[error("Tmux error: {0}")]
    Tmux(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Completion error: {0}")]
    Completion(String),

    #[error("Completion binary not found")]
    CompletionBinaryNotFound,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Budget exceeded: spent {spent} of {limit} tokens")]
    BudgetExceeded { spent: u64, limit: u64 },

    #[error("Agent pool is full (max: {max})")]
    AgentPoolFull { max: usize },

    #[error("Agent not found: {id}")]
    AgentNotFound { id: String },

    #[error("Agent already active for task: {task}")]
    AgentAlreadyActive { task: String },
}

pub type Result<T> = std::result::Result<T, Error>;
