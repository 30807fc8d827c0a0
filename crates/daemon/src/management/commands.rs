// OpenVPN Auth Bridge - Client Commands
// Formats the client-auth / client-deny / client-pending-auth family

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use openvpn_auth_common::ClientIdentifier;

/// Deny reason for tunnel clients without web based auth support
pub const SSO_NOT_SUPPORTED_REASON: &str =
    "OpenVPN Client does not support SSO authentication via webauth";

/// OpenVPN truncates longer `WEB_AUTH::` URLs in the pending auth push
pub const MAX_PENDING_AUTH_URL_LEN: usize = 245;

/// Accept a client.
///
/// With an auth-token username the accept carries a `push` of the base64
/// encoded name and becomes a multi-line command ending in `END`.
pub fn accept(id: ClientIdentifier, auth_token_user: Option<&str>) -> String {
    match auth_token_user.filter(|name| !name.is_empty()) {
        Some(username) => format!(
            "client-auth {} {}\npush \"auth-token-user {}\"\nEND",
            id.cid,
            id.kid,
            BASE64.encode(username)
        ),
        None => format!("client-auth-nt {} {}", id.cid, id.kid),
    }
}

pub fn deny(id: ClientIdentifier, reason: &str) -> String {
    format!("client-deny {} {} {}", id.cid, id.kid, quote(reason))
}

/// Defer the decision and point the tunnel client at `url`
pub fn pending_auth(id: ClientIdentifier, url: &str, timeout: Duration) -> String {
    format!(
        "client-pending-auth {} {} {} {}",
        id.cid,
        id.kid,
        quote(&format!("WEB_AUTH::{}", url)),
        timeout.as_secs()
    )
}

// Double-quoted management argument with `\` and `"` escaped
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        // Embedded newlines would split the command
        if c == '\n' || c == '\r' {
            quoted.push(' ');
            continue;
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
