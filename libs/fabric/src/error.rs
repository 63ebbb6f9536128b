use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Queue full")]
    QueueFull,

    #[error("{0} timeout exceeded")]
    Timeout(&'static str),

    #[error("Protocol not initialized")]
    NotInitialized,

    #[error("Already listening")]
    AlreadyListening,

    #[error("Listener closed")]
    ListenerClosed,

    #[error("No route to recipient {0:?}")]
    NoRoute(String),

    #[error("Peer rejected message with status {0}")]
    Rejected(u16),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error(transparent)]
    Address(#[from] courier_core::Error),

    #[error("{0}")]
    Custom(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout("Request")
        } else {
            Error::Http(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
