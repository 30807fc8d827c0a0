// OpenVPN Auth Bridge - Management Handshake
// Password, hold release and version check before the session loops start

use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use openvpn_auth_common::Secret;

use super::codec::{ManagementCodec, PASSWORD_PROMPT};
use super::error::{ManagementError, Result};
use super::message::Message;
use super::reader::MessageReader;
use super::COMMAND_TIMEOUT;

/// Oldest management interface version with deferred auth support
pub const MIN_MANAGEMENT_VERSION: u32 = 5;

const HOLD_RELEASE: &str = "hold release";
const VERSION: &str = "version";
const VERSION_PREFIX: &str = "OpenVPN Version: ";

/// Drives the handshake on a freshly dialed connection.
///
/// Runs before any session task exists, so it owns both stream halves and
/// reads responses itself. Client blocks that show up meanwhile are kept
/// in `backlog` for the client event consumer.
pub(crate) struct Handshake<'a, R, W> {
    reader: &'a mut MessageReader<R>,
    writer: &'a mut FramedWrite<W, ManagementCodec>,
    backlog: Vec<String>,
}

impl<'a, R, W> Handshake<'a, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        reader: &'a mut MessageReader<R>,
        writer: &'a mut FramedWrite<W, ManagementCodec>,
    ) -> Self {
        Self {
            reader,
            writer,
            backlog: Vec::new(),
        }
    }

    /// Authenticate, release the hold and check the interface version.
    /// Returns the client blocks received along the way.
    pub async fn run(mut self, password: &Secret) -> Result<Vec<String>> {
        self.authenticate(password).await?;
        self.release_hold().await?;
        info!("Connection to OpenVPN management interface established");
        self.check_version().await?;
        Ok(self.backlog)
    }

    async fn authenticate(&mut self, password: &Secret) -> Result<()> {
        let first = match timeout(COMMAND_TIMEOUT, self.reader.next_line()).await {
            Ok(line) => line?,
            Err(_) => return Err(ManagementError::Timeout("password".to_string())),
        };
        let Some(first) = first else {
            return Err(ManagementError::EmptyResponse("password".to_string()));
        };

        if first != PASSWORD_PROMPT {
            if !password.is_empty() {
                debug!("Management interface did not ask for a password");
            }
            self.reader.push_back(first);
            return Ok(());
        }

        if password.is_empty() {
            return Err(ManagementError::PasswordRequired);
        }

        let line = Zeroizing::new(format!("{}\n", password.expose()));
        self.writer.send(line.as_str()).await?;

        let reply = match timeout(COMMAND_TIMEOUT, self.reader.next_line()).await {
            Ok(line) => line?,
            Err(_) => return Err(ManagementError::Timeout("password".to_string())),
        };

        match reply {
            Some(reply) if reply.starts_with("SUCCESS:") => {
                info!("Authenticated to OpenVPN management interface");
                Ok(())
            }
            Some(reply) => {
                warn!("Management interface rejected the password: {}", reply);
                Err(ManagementError::Authentication(reply))
            }
            None => Err(ManagementError::Authentication(
                "connection closed after password".to_string(),
            )),
        }
    }

    async fn release_hold(&mut self) -> Result<()> {
        let response = self.exchange(HOLD_RELEASE).await?;

        if !response.starts_with("SUCCESS:") {
            return Err(ManagementError::ErrorResponse {
                command: HOLD_RELEASE.to_string(),
                response: response.trim_end().to_string(),
            });
        }
        Ok(())
    }

    async fn check_version(&mut self) -> Result<u32> {
        let response = self.exchange(VERSION).await?;
        let version = parse_version_response(&response)?;
        info!("OpenVPN management interface version {}", version);
        Ok(version)
    }

    // One command/response round trip without the session loops
    async fn exchange(&mut self, command: &str) -> Result<String> {
        debug!("Sending management command: {}", command);
        let line = format!("{}\n", command);
        self.writer.send(line.as_str()).await?;

        match timeout(COMMAND_TIMEOUT, self.read_response(command)).await {
            Ok(response) => response,
            Err(_) => Err(ManagementError::Timeout(command.to_string())),
        }
    }

    async fn read_response(&mut self, command: &str) -> Result<String> {
        loop {
            let Some(text) = self.reader.read_message().await? else {
                return Err(ManagementError::EmptyResponse(command.to_string()));
            };

            match Message::classify(text) {
                Message::CommandResponse(response) => return Ok(response),
                Message::ClientEvent(block) => self.backlog.push(block),
                Message::Notification { kind, text } => {
                    debug!("Management notification {}: {}", kind, text.trim_end());
                }
                Message::Banner(text) => info!("{}", text.trim_end()),
                Message::Unrecognized(text) => {
                    warn!("Unrecognized management message: {}", text.trim_end());
                }
            }
        }
    }
}

/// Validate the `version` output and extract the management version.
///
/// The expected shape is three lines plus the trailing newline:
/// `OpenVPN Version: ...`, `Management Version: N`, `END`.
pub fn parse_version_response(response: &str) -> Result<u32> {
    if !response.starts_with(VERSION_PREFIX) {
        return Err(ManagementError::ErrorResponse {
            command: VERSION.to_string(),
            response: response.trim_end().to_string(),
        });
    }

    let parts: Vec<&str> = response.split('\n').collect();
    if parts.len() != 4 {
        return Err(ManagementError::UnexpectedResponse {
            command: VERSION.to_string(),
            response: response.trim_end().to_string(),
        });
    }

    info!("{} - {}", parts[0], parts[1]);

    let line = parts[1].trim_end();
    let digits_start = line
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    let version: u32 = line[digits_start..]
        .parse()
        .map_err(|_| ManagementError::VersionParse(line.to_string()))?;

    if version < MIN_MANAGEMENT_VERSION {
        return Err(ManagementError::UnsupportedVersion {
            found: version,
            required: MIN_MANAGEMENT_VERSION,
        });
    }

    Ok(version)
}
