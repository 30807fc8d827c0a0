// OpenVPN Auth Bridge - Authorizer
// Seam between the management client and the external OAuth2 flow

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use openvpn_auth_common::ClientIdentifier;

use crate::management::ClientRecord;

/// Deny reason used by [`RejectAuthorizer`]
pub const NO_AUTHORIZER_REASON: &str = "no authorization provider configured";

#[derive(Error, Debug)]
pub enum AuthorizerError {
    #[error("authorization failed: {0}")]
    Failed(String),

    #[error("management connection is closed")]
    ConnectionClosed,
}

/// What the authorizer wants the tunnel client to see while it decides
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAuth {
    /// Send the client to this URL via `client-pending-auth`
    WebAuth { url: String },
    /// Nothing to send now; the decision arrives later through the ticket
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Approve { username: Option<String> },
    Deny { reason: String },
}

/// A decision for one client session, keyed by its identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthDecision {
    pub id: ClientIdentifier,
    pub verdict: Verdict,
}

/// One-shot handle for deciding a client session.
///
/// Approving or denying consumes the ticket, so a session is decided at
/// most once. The decision travels back to the management client, which
/// issues the matching command.
#[derive(Debug)]
pub struct AuthTicket {
    id: ClientIdentifier,
    decisions: mpsc::UnboundedSender<AuthDecision>,
}

impl AuthTicket {
    pub(crate) fn new(id: ClientIdentifier, decisions: mpsc::UnboundedSender<AuthDecision>) -> Self {
        Self { id, decisions }
    }

    pub fn id(&self) -> ClientIdentifier {
        self.id
    }

    /// Accept the session. `username` is pushed as auth-token user when enabled.
    pub fn approve(self, username: Option<String>) -> Result<(), AuthorizerError> {
        self.decide(Verdict::Approve { username })
    }

    pub fn deny(self, reason: impl Into<String>) -> Result<(), AuthorizerError> {
        self.decide(Verdict::Deny {
            reason: reason.into(),
        })
    }

    fn decide(self, verdict: Verdict) -> Result<(), AuthorizerError> {
        debug!("Decision for client {}: {:?}", self.id, verdict);
        self.decisions
            .send(AuthDecision { id: self.id, verdict })
            .map_err(|_| AuthorizerError::ConnectionClosed)
    }
}

/// External authorization flow for clients that are neither denied for
/// missing SSO support nor on the bypass list.
///
/// `begin` is awaited by the client event consumer, so it should only start
/// the flow and return; the final decision goes through the ticket.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn begin(&self, client: ClientRecord, ticket: AuthTicket)
        -> Result<PendingAuth, AuthorizerError>;
}

/// Denies every client handed to it
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAuthorizer;

#[async_trait]
impl Authorizer for RejectAuthorizer {
    async fn begin(
        &self,
        client: ClientRecord,
        ticket: AuthTicket,
    ) -> Result<PendingAuth, AuthorizerError> {
        debug!(
            "No authorizer configured, rejecting client {} ({})",
            client.id, client.common_name
        );
        ticket.deny(NO_AUTHORIZER_REASON)?;
        Ok(PendingAuth::Detached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::management::ClientReason;

    fn record(cid: u64, kid: u64) -> ClientRecord {
        ClientRecord {
            id: ClientIdentifier::new(cid, kid),
            reason: ClientReason::Connect,
            common_name: "alice".to_string(),
            untrusted_ip: None,
            iv_sso: "webauth".to_string(),
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn test_ticket_approve_sends_decision() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ticket = AuthTicket::new(ClientIdentifier::new(1, 2), tx);
        assert_eq!(ticket.id(), ClientIdentifier::new(1, 2));

        ticket.approve(Some("alice".to_string())).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            AuthDecision {
                id: ClientIdentifier::new(1, 2),
                verdict: Verdict::Approve {
                    username: Some("alice".to_string())
                },
            }
        );
    }

    #[test]
    fn test_ticket_after_connection_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let ticket = AuthTicket::new(ClientIdentifier::new(1, 2), tx);
        assert!(matches!(
            ticket.deny("nope"),
            Err(AuthorizerError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_reject_authorizer_denies() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ticket = AuthTicket::new(ClientIdentifier::new(3, 0), tx);

        let pending = RejectAuthorizer.begin(record(3, 0), ticket).await.unwrap();
        assert_eq!(pending, PendingAuth::Detached);

        let decision = rx.recv().await.unwrap();
        assert_eq!(decision.id, ClientIdentifier::new(3, 0));
        assert_eq!(
            decision.verdict,
            Verdict::Deny {
                reason: NO_AUTHORIZER_REASON.to_string()
            }
        );
    }
}
