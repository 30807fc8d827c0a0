// OpenVPN Auth Bridge - Message Classification
// The only place that interprets raw management message prefixes

use std::fmt;

/// Category of an asynchronous `>KEYWORD:` notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    Hold,
    Info,
    Notify,
    Other(String),
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::Hold => write!(f, "HOLD"),
            NotificationKind::Info => write!(f, "INFO"),
            NotificationKind::Notify => write!(f, "NOTIFY"),
            NotificationKind::Other(keyword) => write!(f, "{}", keyword),
        }
    }
}

/// A complete management message, tagged by what it is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Reply to the command currently in flight
    CommandResponse(String),
    /// `>CLIENT:` block, decoded by the client event handler
    ClientEvent(String),
    /// Other `>KEYWORD:` push notification
    Notification { kind: NotificationKind, text: String },
    /// `:OpenVPN` banner line
    Banner(String),
    /// Anything else; logged and dropped
    Unrecognized(String),
}

impl Message {
    pub fn classify(text: String) -> Self {
        if text.starts_with(">CLIENT:") {
            return Message::ClientEvent(text);
        }

        if let Some(rest) = text.strip_prefix('>') {
            let keyword = rest.split(':').next().unwrap_or_default();
            let kind = match keyword {
                "HOLD" => NotificationKind::Hold,
                "INFO" => NotificationKind::Info,
                "NOTIFY" => NotificationKind::Notify,
                other => NotificationKind::Other(other.to_string()),
            };
            return Message::Notification { kind, text };
        }

        if text.starts_with(":OpenVPN") {
            return Message::Banner(text);
        }

        if is_command_response(&text) {
            return Message::CommandResponse(text);
        }

        Message::Unrecognized(text)
    }
}

fn is_command_response(text: &str) -> bool {
    text.starts_with("SUCCESS:")
        || text.starts_with("ERROR:")
        || text.lines().last().is_some_and(|line| line.starts_with("END"))
}
