// Error types for the management interface client

use thiserror::Error;

use openvpn_auth_common::Error as CommonError;

#[derive(Error, Debug)]
pub enum ManagementError {
    #[error("unable to connect to openvpn management interface: unknown protocol {0}")]
    UnknownProtocol(String),

    #[error("invalid management address: {0}")]
    InvalidAddress(String),

    #[error("unable to connect to openvpn management interface {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("management interface requested a password but none is configured")]
    PasswordRequired,

    #[error("management interface rejected the password: {0}")]
    Authentication(String),

    #[error("error from {command} command: unexpected response: {response}")]
    ErrorResponse { command: String, response: String },

    #[error("unexpected response from {command} command: {response}")]
    UnexpectedResponse { command: String, response: String },

    #[error("unable to parse openvpn management interface version from '{0}'")]
    VersionParse(String),

    #[error(
        "OpenVPN management interface version {found} is not supported, version {required} or higher is required"
    )]
    UnsupportedVersion { found: u32, required: u32 },

    #[error("command error '{0}': timeout waiting for response")]
    Timeout(String),

    #[error("command error '{0}': empty response")]
    EmptyResponse(String),

    #[error("management connection is closed")]
    Closed,

    #[error("management connection is already running")]
    AlreadyConnected,

    #[error("OpenVPN management error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CommonError> for ManagementError {
    fn from(err: CommonError) -> Self {
        match err {
            CommonError::UnknownProtocol(scheme) => ManagementError::UnknownProtocol(scheme),
            other => ManagementError::InvalidAddress(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ManagementError>;

/// First line of a command; the only part that goes into errors and logs.
pub(crate) fn first_line(command: &str) -> &str {
    command.split('\n').next().unwrap_or_default()
}
