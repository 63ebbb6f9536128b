use thiserror::Error;
use uuid::Uuid;

/// Manager lifecycle and configuration errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Protocol name {0:?} is already registered")]
    DuplicateName(String),

    #[error("Priority {priority} is already used by protocol {existing:?}")]
    DuplicatePriority { priority: i32, existing: String },

    #[error("Manager already started")]
    AlreadyStarted,

    #[error("No protocol initialized successfully")]
    NoProtocolInitialized,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Terminal outcome of a send; transient protocol failures never escape as-is
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("message {id} expired before delivery")]
    Expired { id: Uuid },

    #[error("message {id} already used all {max_retries} attempts")]
    RetriesExhausted { id: Uuid, max_retries: u32 },

    #[error("no protocol available")]
    NoProtocolAvailable,

    #[error("delivery of message {id} failed after {attempts} attempts: {last_error}")]
    DeliveryFailed {
        id: Uuid,
        attempts: u32,
        last_error: String,
    },

    #[error("manager is not running")]
    NotRunning,
}
