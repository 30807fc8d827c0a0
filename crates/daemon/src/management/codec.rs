// OpenVPN Auth Bridge - Management Codec
// Line framing for the management interface byte stream

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Prompt the management interface sends, without a newline, when a
/// password is configured on the server side
pub const PASSWORD_PROMPT: &str = "ENTER PASSWORD:";

/// Upper bound for a single line; a peer exceeding it is broken
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Splits the stream into lines and passes commands through verbatim.
///
/// Lines are yielded without their `\n` (and without a trailing `\r`).
/// The password prompt is the one frame not ended by a newline; it is
/// yielded as soon as it is complete at the start of the buffer.
#[derive(Debug, Default)]
pub struct ManagementCodec {
    // Bytes already scanned for a newline
    next_index: usize,
}

impl ManagementCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for ManagementCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if buf.starts_with(PASSWORD_PROMPT.as_bytes()) {
            self.next_index = 0;
            let _ = buf.split_to(PASSWORD_PROMPT.len());
            return Ok(Some(PASSWORD_PROMPT.to_string()));
        }

        match buf[self.next_index..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let newline = self.next_index + offset;
                self.next_index = 0;

                let line = buf.split_to(newline + 1);
                let mut line = &line[..newline];
                if let Some(stripped) = line.strip_suffix(b"\r") {
                    line = stripped;
                }
                Ok(Some(String::from_utf8_lossy(line).into_owned()))
            }
            None => {
                if buf.len() > MAX_LINE_LENGTH {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("management line exceeds {} bytes", MAX_LINE_LENGTH),
                    ));
                }
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }

        // An unterminated tail is still handed out as a final line
        if buf.is_empty() {
            Ok(None)
        } else {
            self.next_index = 0;
            let line = buf.split_to(buf.len());
            Ok(Some(String::from_utf8_lossy(&line).trim_end_matches('\r').to_string()))
        }
    }
}

impl<'a> Encoder<&'a str> for ManagementCodec {
    type Error = std::io::Error;

    fn encode(&mut self, command: &'a str, buf: &mut BytesMut) -> Result<(), Self::Error> {
        buf.extend_from_slice(command.as_bytes());
        Ok(())
    }
}
