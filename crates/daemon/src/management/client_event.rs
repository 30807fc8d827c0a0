// OpenVPN Auth Bridge - Client Events
// Decodes `>CLIENT:` blocks into client session records

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use openvpn_auth_common::{ClientIdentifier, CommonNameMode};

const CLIENT_PREFIX: &str = ">CLIENT:";
const ENV_PREFIX: &str = ">CLIENT:ENV,";
const ENV_END: &str = ">CLIENT:ENV,END";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ClientEventError {
    #[error("client event has no >CLIENT: header")]
    MissingHeader,

    #[error("malformed client event header: {0}")]
    InvalidHeader(String),
}

/// Why OpenVPN sent the client block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientReason {
    Connect,
    Reauth,
    Established,
    Disconnect,
    Address,
    CrResponse,
    Other(String),
}

impl ClientReason {
    fn parse(keyword: &str) -> Self {
        match keyword {
            "CONNECT" => ClientReason::Connect,
            "REAUTH" => ClientReason::Reauth,
            "ESTABLISHED" => ClientReason::Established,
            "DISCONNECT" => ClientReason::Disconnect,
            "ADDRESS" => ClientReason::Address,
            "CR_RESPONSE" => ClientReason::CrResponse,
            other => ClientReason::Other(other.to_string()),
        }
    }

    /// Whether OpenVPN waits for an authentication decision
    pub fn needs_decision(&self) -> bool {
        matches!(self, ClientReason::Connect | ClientReason::Reauth)
    }

    // Events whose header carries a key id after the connection id
    fn has_kid(&self) -> bool {
        matches!(
            self,
            ClientReason::Connect | ClientReason::Reauth | ClientReason::CrResponse
        )
    }
}

impl fmt::Display for ClientReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientReason::Connect => write!(f, "CONNECT"),
            ClientReason::Reauth => write!(f, "REAUTH"),
            ClientReason::Established => write!(f, "ESTABLISHED"),
            ClientReason::Disconnect => write!(f, "DISCONNECT"),
            ClientReason::Address => write!(f, "ADDRESS"),
            ClientReason::CrResponse => write!(f, "CR_RESPONSE"),
            ClientReason::Other(keyword) => write!(f, "{}", keyword),
        }
    }
}

/// One decoded `>CLIENT:` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEvent {
    pub reason: ClientReason,
    pub cid: u64,
    pub kid: Option<u64>,
    /// Header fields after the ids (ADDRESS address, CR_RESPONSE payload)
    pub details: Option<String>,
    /// `ENV,key=value` attributes
    pub env: BTreeMap<String, String>,
}

impl ClientEvent {
    /// Decode a complete client message (header line plus ENV block)
    pub fn parse(message: &str) -> Result<Self, ClientEventError> {
        let mut lines = message.lines();

        let header = lines
            .next()
            .and_then(|line| line.strip_prefix(CLIENT_PREFIX))
            .ok_or(ClientEventError::MissingHeader)?;

        // ADDRESS has no kid, its address and priority stay together as details
        let max_fields = if header.starts_with("ADDRESS") { 3 } else { 4 };
        let mut fields = header.trim().splitn(max_fields, ',');
        let reason = ClientReason::parse(fields.next().unwrap_or_default());

        let cid = parse_id(fields.next(), header)?;
        let kid = if reason.has_kid() {
            Some(parse_id(fields.next(), header)?)
        } else {
            None
        };
        let details = fields.next().map(str::to_string);

        let mut env = BTreeMap::new();
        for line in lines {
            if line.starts_with(ENV_END) {
                break;
            }
            if let Some((key, value)) = line.strip_prefix(ENV_PREFIX).and_then(|kv| kv.split_once('=')) {
                env.insert(key.to_string(), value.to_string());
            }
        }

        Ok(Self {
            reason,
            cid,
            kid,
            details,
            env,
        })
    }

    /// `(cid, kid)` for events that carry a key id
    pub fn identifier(&self) -> Option<ClientIdentifier> {
        self.kid.map(|kid| ClientIdentifier::new(self.cid, kid))
    }

    pub fn common_name(&self) -> &str {
        self.env_value("common_name")
    }

    pub fn iv_sso(&self) -> &str {
        self.env_value("IV_SSO")
    }

    pub fn untrusted_ip(&self) -> Option<&str> {
        self.env
            .get("untrusted_ip")
            .or_else(|| self.env.get("untrusted_ip6"))
            .map(String::as_str)
    }

    /// The tunnel client advertised web based authentication
    pub fn supports_webauth(&self) -> bool {
        self.iv_sso().contains("webauth")
    }

    fn env_value(&self, key: &str) -> &str {
        self.env.get(key).map(String::as_str).unwrap_or_default()
    }

    /// Finalize into the record handed to the authorizer.
    ///
    /// Only events awaiting a decision (CONNECT, REAUTH) produce a record.
    pub fn into_record(self, mode: CommonNameMode) -> Option<ClientRecord> {
        if !self.reason.needs_decision() {
            return None;
        }
        let id = self.identifier()?;
        let common_name = mode.transform(self.common_name());
        let untrusted_ip = self.untrusted_ip().map(str::to_string);
        let iv_sso = self.iv_sso().to_string();

        // The user supplied password never leaves the event handler
        let mut env = self.env;
        env.remove("password");

        Some(ClientRecord {
            id,
            reason: self.reason,
            common_name,
            untrusted_ip,
            iv_sso,
            env,
        })
    }
}

fn parse_id(field: Option<&str>, header: &str) -> Result<u64, ClientEventError> {
    field
        .and_then(|f| f.trim().parse().ok())
        .ok_or_else(|| ClientEventError::InvalidHeader(header.to_string()))
}

/// A finalized client session awaiting an authentication decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub id: ClientIdentifier,
    pub reason: ClientReason,
    /// Common name after applying the configured common name mode
    pub common_name: String,
    pub untrusted_ip: Option<String>,
    pub iv_sso: String,
    pub env: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONNECT_BLOCK: &str = ">CLIENT:CONNECT,7,2\n\
        >CLIENT:ENV,untrusted_ip=192.0.2.10\n\
        >CLIENT:ENV,common_name=alice\n\
        >CLIENT:ENV,IV_SSO=webauth,openurl,crtext\n\
        >CLIENT:ENV,password=a=b\n\
        >CLIENT:ENV,END\n";

    #[test]
    fn test_parse_connect_block() {
        let event = ClientEvent::parse(CONNECT_BLOCK).unwrap();
        assert_eq!(event.reason, ClientReason::Connect);
        assert_eq!(event.identifier(), Some(ClientIdentifier::new(7, 2)));
        assert_eq!(event.common_name(), "alice");
        assert_eq!(event.untrusted_ip(), Some("192.0.2.10"));
        assert!(event.supports_webauth());
        // Values may themselves contain '='
        assert_eq!(event.env.get("password").map(String::as_str), Some("a=b"));
    }

    #[test]
    fn test_parse_reauth_without_sso() {
        let event = ClientEvent::parse(">CLIENT:REAUTH,1,4\n>CLIENT:ENV,common_name=bob\n>CLIENT:ENV,END\n")
            .unwrap();
        assert_eq!(event.reason, ClientReason::Reauth);
        assert_eq!(event.identifier(), Some(ClientIdentifier::new(1, 4)));
        assert_eq!(event.iv_sso(), "");
        assert!(!event.supports_webauth());
    }

    #[test]
    fn test_parse_established_has_no_kid() {
        let event =
            ClientEvent::parse(">CLIENT:ESTABLISHED,9\n>CLIENT:ENV,common_name=carol\n>CLIENT:ENV,END\n")
                .unwrap();
        assert_eq!(event.reason, ClientReason::Established);
        assert_eq!(event.cid, 9);
        assert_eq!(event.identifier(), None);
        assert!(event.into_record(CommonNameMode::Plain).is_none());
    }

    #[test]
    fn test_parse_address_line() {
        let event = ClientEvent::parse(">CLIENT:ADDRESS,3,10.8.0.6,1\n").unwrap();
        assert_eq!(event.reason, ClientReason::Address);
        assert_eq!(event.cid, 3);
        assert_eq!(event.details.as_deref(), Some("10.8.0.6,1"));
    }

    #[test]
    fn test_parse_cr_response() {
        let event = ClientEvent::parse(">CLIENT:CR_RESPONSE,5,1,dGVzdA==\n>CLIENT:ENV,END\n").unwrap();
        assert_eq!(event.reason, ClientReason::CrResponse);
        assert_eq!(event.identifier(), Some(ClientIdentifier::new(5, 1)));
        assert_eq!(event.details.as_deref(), Some("dGVzdA=="));
    }

    #[test]
    fn test_parse_rejects_bad_headers() {
        assert_eq!(
            ClientEvent::parse(">INFO:hello\n"),
            Err(ClientEventError::MissingHeader)
        );
        assert!(matches!(
            ClientEvent::parse(">CLIENT:CONNECT,x,1\n>CLIENT:ENV,END\n"),
            Err(ClientEventError::InvalidHeader(_))
        ));
        assert!(matches!(
            ClientEvent::parse(">CLIENT:CONNECT,1\n>CLIENT:ENV,END\n"),
            Err(ClientEventError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_into_record_applies_common_name_mode() {
        let record = ClientEvent::parse(CONNECT_BLOCK)
            .unwrap()
            .into_record(CommonNameMode::Omit)
            .unwrap();
        assert_eq!(record.id, ClientIdentifier::new(7, 2));
        assert_eq!(record.common_name, "-");
        assert_eq!(record.untrusted_ip.as_deref(), Some("192.0.2.10"));
        assert_eq!(record.env.get("common_name").map(String::as_str), Some("alice"));
        assert!(!record.env.contains_key("password"));
    }
}
