// OpenVPN Auth Bridge - Message Reader
// Assembles management interface lines into complete messages

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::debug;

use super::codec::ManagementCodec;
use super::error::first_line;

/// Line prefixes that complete a message.
///
/// Single-line notifications end themselves; multi-line blocks (client
/// environment dumps, command output) run until their explicit terminator.
const TERMINATOR_PREFIXES: &[&str] = &[
    ">CLIENT:ENV,END",
    ">CLIENT:ADDRESS,",
    "END",
    "SUCCESS:",
    "ERROR:",
    ">HOLD:",
    ">INFO:",
    ">NOTIFY:",
    ":OpenVPN",
];

/// Whether `line` is the last line of a message
pub fn is_message_terminator(line: &str) -> bool {
    TERMINATOR_PREFIXES.iter().any(|prefix| line.starts_with(prefix))
}

/// Reads the management stream line by line and groups lines into messages.
///
/// The partially assembled message lives in the reader itself, so a
/// `read_message` future dropped mid-way (e.g. inside `select!`) loses no
/// lines.
pub struct MessageReader<R> {
    frames: FramedRead<R, ManagementCodec>,
    pushed_back: Option<String>,
    buf: String,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            frames: FramedRead::new(inner, ManagementCodec::new()),
            pushed_back: None,
            buf: String::new(),
        }
    }

    /// Next raw line (or the password prompt); `None` on end of stream
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        if let Some(line) = self.pushed_back.take() {
            return Ok(Some(line));
        }
        self.frames.next().await.transpose()
    }

    /// Return a line so the next read yields it again
    pub fn push_back(&mut self, line: String) {
        self.pushed_back = Some(line);
    }

    /// Read one complete message, each line followed by `\n`.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly; an incomplete
    /// trailing message is dropped in that case.
    pub async fn read_message(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let Some(line) = self.next_line().await? else {
                if !self.buf.is_empty() {
                    debug!(
                        "Management stream ended inside a message, dropping {} bytes",
                        self.buf.len()
                    );
                    self.buf.clear();
                }
                return Ok(None);
            };

            self.buf.push_str(&line);
            self.buf.push('\n');

            if is_message_terminator(&line) {
                let message = std::mem::take(&mut self.buf);
                debug!(
                    "Received management message: {} ({} lines)",
                    first_line(&message),
                    message.lines().count()
                );
                return Ok(Some(message));
            }
        }
    }
}
