use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
