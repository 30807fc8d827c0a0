// Error types for the OpenVPN auth bridge

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unknown management protocol: {0}")]
    UnknownProtocol(String),

    #[error("Invalid management address: {0}")]
    InvalidAddress(String),

    #[error("Invalid common name mode: {0}")]
    InvalidCommonNameMode(String),
}

pub type Result<T> = std::result::Result<T, Error>;
