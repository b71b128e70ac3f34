use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task already exists: {0}")]
    TaskExists(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Dependency cycle through task: {0}")]
    CycleDetected(String),

    #[error("Dispatch to {agent} failed: {reason}")]
    Dispatch { agent: String, reason: String },

    #[error("Announce to {agent} failed: {reason}")]
    Announce { agent: String, reason: String },

    #[error("State store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, Error>;
