// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 OpenVPN Auth Bridge Contributors

// OpenVPN Auth Bridge - Management Client
// Connection lifecycle, command channel and client event handling

mod client_event;
mod codec;
mod commands;
mod error;
mod handshake;
mod message;
mod reader;
mod transport;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use openvpn_auth_common::{ClientIdentifier, ManagementAddr};

use crate::authorizer::{AuthDecision, AuthTicket, Authorizer, PendingAuth, Verdict};
use crate::config::OpenVpnConfig;

pub use client_event::{ClientEvent, ClientEventError, ClientReason, ClientRecord};
pub use codec::{ManagementCodec, PASSWORD_PROMPT};
pub use commands::{MAX_PENDING_AUTH_URL_LEN, SSO_NOT_SUPPORTED_REASON};
pub use error::{ManagementError, Result};
pub use handshake::{parse_version_response, MIN_MANAGEMENT_VERSION};
pub use message::{Message, NotificationKind};
pub use reader::{is_message_terminator, MessageReader};
pub use transport::{dial, ManagementStream};

use error::first_line;
use handshake::Handshake;

/// How long a command waits for its response
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Depth of the outbound command queue
const COMMAND_QUEUE_DEPTH: usize = 10;

/// Deny reason when the external flow could not be started
const AUTH_FAILED_REASON: &str = "internal error";

type FatalSender = mpsc::Sender<Option<ManagementError>>;

/// Client for the OpenVPN management interface.
///
/// Cloning is cheap; all clones drive the same connection. `connect` runs
/// the session and blocks until it ends, while `send_command`,
/// `accept_client`, `deny_client` and `shutdown` may be called from any
/// task in the meantime.
#[derive(Clone)]
pub struct ManagementClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: OpenVpnConfig,
    authorizer: Arc<dyn Authorizer>,
    state: Mutex<ConnState>,
    // Held for a whole command/response exchange
    exchange: tokio::sync::Mutex<()>,
    pending: Mutex<PendingSlot>,
    shutdown_tx: mpsc::Sender<()>,
    // Locked by the running connect call
    shutdown_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

struct ConnState {
    closed: bool,
    commands: Option<mpsc::Sender<String>>,
    cancel: Option<CancellationToken>,
}

/// Single-slot rendezvous for the command in flight.
///
/// `stale` counts responses still owed to commands whose caller gave up;
/// they are discarded on arrival instead of being handed to the next waiter.
/// `discarded` only grows; a caller compares it before and after waiting to
/// tell whether its own response went to pay an older debt.
#[derive(Default)]
struct PendingSlot {
    waiter: Option<oneshot::Sender<String>>,
    stale: usize,
    discarded: u64,
}

impl ManagementClient {
    pub fn new(config: OpenVpnConfig, authorizer: Arc<dyn Authorizer>) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Self {
            inner: Arc::new(Inner {
                config,
                authorizer,
                state: Mutex::new(ConnState {
                    closed: true,
                    commands: None,
                    cancel: None,
                }),
                exchange: tokio::sync::Mutex::new(()),
                pending: Mutex::new(PendingSlot::default()),
                shutdown_tx,
                shutdown_rx: tokio::sync::Mutex::new(shutdown_rx),
            }),
        }
    }

    pub fn config(&self) -> &OpenVpnConfig {
        &self.inner.config
    }

    /// Dial the configured address and run the session until it ends.
    ///
    /// Returns `Ok(())` after `shutdown` or when the server closes the
    /// connection; handshake failures and I/O errors are returned as errors.
    pub async fn connect(&self) -> Result<()> {
        let addr = ManagementAddr::parse(&self.inner.config.addr)?;
        let mut shutdown_rx = self.open_session()?;

        info!("Connecting to OpenVPN management interface at {}", addr);
        let stream = tokio::select! {
            stream = transport::dial(&addr) => match stream {
                Ok(stream) => stream,
                Err(source) => {
                    self.close();
                    return Err(ManagementError::Dial {
                        addr: addr.to_string(),
                        source,
                    });
                }
            },
            _ = shutdown_rx.recv() => {
                info!("Shutdown requested while dialing the management interface");
                self.close();
                return Ok(());
            }
        };

        self.run_session(stream, shutdown_rx).await
    }

    /// Run the session over an already open stream
    pub async fn connect_stream<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shutdown_rx = self.open_session()?;
        self.run_session(stream, shutdown_rx).await
    }

    /// Whether a session is being set up or running
    pub fn is_open(&self) -> bool {
        !self.state().closed
    }

    // Claims the shutdown receiver and marks the client open, so a
    // shutdown from here on reaches the session
    fn open_session(&self) -> Result<tokio::sync::MutexGuard<'_, mpsc::Receiver<()>>> {
        let mut shutdown_rx = self
            .inner
            .shutdown_rx
            .try_lock()
            .map_err(|_| ManagementError::AlreadyConnected)?;
        while shutdown_rx.try_recv().is_ok() {}

        self.state().closed = false;
        Ok(shutdown_rx)
    }

    async fn run_session<S>(
        &self,
        stream: S,
        mut shutdown_rx: tokio::sync::MutexGuard<'_, mpsc::Receiver<()>>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = MessageReader::new(read_half);
        let mut writer = FramedWrite::new(write_half, ManagementCodec::new());

        let handshake = Handshake::new(&mut reader, &mut writer);
        let backlog = tokio::select! {
            result = handshake.run(&self.inner.config.password) => match result {
                Ok(backlog) => backlog,
                Err(err) => {
                    error!("Management interface handshake failed: {}", err);
                    self.close();
                    return Err(err);
                }
            },
            _ = shutdown_rx.recv() => {
                info!("Shutdown requested during management handshake");
                self.close();
                return Ok(());
            }
        };

        let cancel = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::channel::<String>(COMMAND_QUEUE_DEPTH);
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<Option<ManagementError>>(1);
        // Unbounded so the pump never waits on the consumer, which itself
        // waits on responses only the pump can deliver
        let (clients_tx, clients_rx) = mpsc::unbounded_channel::<String>();

        for block in backlog {
            let _ = clients_tx.send(block);
        }

        {
            let mut state = self.state();
            state.commands = Some(commands_tx);
            state.cancel = Some(cancel.clone());
        }

        let writer_task = tokio::spawn(write_loop(writer, commands_rx, fatal_tx.clone(), cancel.clone()));
        let pump_task = tokio::spawn(self.clone().pump(reader, clients_tx, fatal_tx, cancel.clone()));
        let consumer_task = tokio::spawn(self.clone().consume(clients_rx, cancel.clone()));

        let result = tokio::select! {
            fatal = fatal_rx.recv() => match fatal.flatten() {
                Some(err) => {
                    error!("Management connection failed: {}", err);
                    Err(err)
                }
                None => {
                    info!("OpenVPN management interface closed the connection");
                    Ok(())
                }
            },
            _ = shutdown_rx.recv() => {
                info!("Closing OpenVPN management connection");
                Ok(())
            }
        };

        self.close();

        for (name, task) in [("writer", writer_task), ("pump", pump_task), ("consumer", consumer_task)] {
            if let Err(err) = task.await {
                warn!("Management {} task ended abnormally: {}", name, err);
            }
        }

        result
    }

    /// Ask a running `connect` to return. Calling it again, or when no
    /// connection is open, does nothing.
    pub fn shutdown(&self) {
        let state = self.state();
        if state.closed {
            debug!("Management connection already closed, ignoring shutdown");
            return;
        }

        match self.inner.shutdown_tx.try_send(()) {
            Ok(()) => info!("Shutting down OpenVPN management connection"),
            Err(_) => debug!("Shutdown of management connection already requested"),
        }
    }

    fn close(&self) {
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
            }
            state.commands = None;
        }

        // Wakes a caller still waiting for a response
        let mut pending = self.pending();
        pending.waiter = None;
        pending.stale = 0;
        debug!("Management connection closed");
    }

    /// Send one command and wait for its response.
    ///
    /// Commands are serialized: a new one is written only after the
    /// previous response arrived or timed out. An `ERROR:` response is
    /// returned as text and logged.
    pub async fn send_command(&self, command: &str) -> Result<String> {
        let _exchange = self.inner.exchange.lock().await;
        let name = first_line(command).to_string();

        let commands = self.state().commands.clone();
        let Some(commands) = commands else {
            return Err(ManagementError::Closed);
        };

        let (tx, rx) = oneshot::channel();
        let discarded_before = {
            let mut pending = self.pending();
            if pending.waiter.replace(tx).is_some() {
                pending.stale += 1;
            }
            pending.discarded
        };

        debug!("Sending management command: {}", name);
        if commands.send(format!("{}\n", command)).await.is_err() {
            self.pending().waiter = None;
            return Err(ManagementError::Closed);
        }
        drop(commands);

        let response = match timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(ManagementError::EmptyResponse(name)),
            Err(_) => {
                {
                    let mut pending = self.pending();
                    // A response discarded meanwhile settled the older debt
                    // in place of ours, so the count is already even
                    if pending.waiter.take().is_some() && pending.discarded == discarded_before {
                        pending.stale += 1;
                    }
                }
                warn!("No response to management command '{}' within {:?}", name, COMMAND_TIMEOUT);
                return Err(ManagementError::Timeout(name));
            }
        };

        if response.trim().is_empty() {
            return Err(ManagementError::EmptyResponse(name));
        }

        if response.starts_with("ERROR:") {
            warn!("Management command '{}' failed: {}", name, response.trim_end());
        }

        Ok(response)
    }

    /// `send_command` with a formatted command line
    pub fn send_command_fmt(&self, args: fmt::Arguments<'_>) -> impl Future<Output = Result<String>> + '_ {
        let command = args.to_string();
        async move { self.send_command(&command).await }
    }

    /// Accept a client session.
    ///
    /// `username` is pushed as auth-token user when that is enabled.
    pub async fn accept_client(&self, id: ClientIdentifier, username: Option<&str>) -> Result<()> {
        let username = username.filter(|_| self.inner.config.auth_token_user);
        info!("Accepting client {}", id);
        self.send_command(&commands::accept(id, username)).await?;
        Ok(())
    }

    pub async fn deny_client(&self, id: ClientIdentifier, reason: &str) -> Result<()> {
        info!("Denying client {}: {}", id, reason);
        self.send_command(&commands::deny(id, reason)).await?;
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, ConnState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, PendingSlot> {
        self.inner.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn pump<R>(
        self,
        mut reader: MessageReader<R>,
        clients: mpsc::UnboundedSender<String>,
        fatal: FatalSender,
        cancel: CancellationToken,
    ) where
        R: AsyncRead + Unpin,
    {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return,
                message = reader.read_message() => message,
            };

            match message {
                Ok(Some(text)) => self.route(text, &clients),
                Ok(None) => {
                    raise(&fatal, None);
                    return;
                }
                Err(err) => {
                    raise(&fatal, Some(err.into()));
                    return;
                }
            }
        }
    }

    fn route(&self, text: String, clients: &mpsc::UnboundedSender<String>) {
        match Message::classify(text) {
            Message::CommandResponse(response) => self.deliver(response),
            Message::ClientEvent(block) => {
                if clients.send(block).is_err() {
                    debug!("Client event consumer gone, dropping client event");
                }
            }
            Message::Notification { kind, text } => match kind {
                NotificationKind::Hold | NotificationKind::Info => {
                    info!("OpenVPN {}: {}", kind, text.trim_end());
                }
                _ => debug!("OpenVPN {}: {}", kind, text.trim_end()),
            },
            Message::Banner(text) => info!("{}", text.trim_end()),
            Message::Unrecognized(text) => {
                warn!("Unrecognized management message: {}", text.trim_end());
            }
        }
    }

    fn deliver(&self, response: String) {
        let mut pending = self.pending();

        if pending.stale > 0 {
            pending.stale -= 1;
            pending.discarded += 1;
            warn!("Discarding late response to a timed out command: {}", first_line(&response));
            return;
        }

        match pending.waiter.take() {
            Some(waiter) => {
                if waiter.send(response).is_err() {
                    debug!("Command caller went away before its response arrived");
                }
            }
            None => warn!("Received response without a pending command: {}", first_line(&response)),
        }
    }

    async fn consume(self, mut clients: mpsc::UnboundedReceiver<String>, cancel: CancellationToken) {
        let (decisions_tx, mut decisions_rx) = mpsc::unbounded_channel::<AuthDecision>();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                Some(block) = clients.recv() => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = self.handle_client_block(&block, &decisions_tx) => {}
                    }
                }
                Some(decision) = decisions_rx.recv() => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = self.apply_decision(decision) => {}
                    }
                }
            }
        }
    }

    async fn handle_client_block(&self, block: &str, decisions: &mpsc::UnboundedSender<AuthDecision>) {
        let event = match ClientEvent::parse(block) {
            Ok(event) => event,
            Err(err) => {
                warn!("Unable to parse client event: {}", err);
                return;
            }
        };

        if !event.reason.needs_decision() {
            log_client_event(&event);
            return;
        }
        let Some(id) = event.identifier() else {
            return;
        };

        info!(
            "Client {} {} (common name '{}', address {})",
            id,
            event.reason,
            event.common_name(),
            event.untrusted_ip().unwrap_or("unknown")
        );

        if !event.supports_webauth() {
            warn!(
                "Client {} does not support SSO authentication via webauth (IV_SSO='{}')",
                id,
                event.iv_sso()
            );
            self.report(id, self.deny_client(id, SSO_NOT_SUPPORTED_REASON).await);
            return;
        }

        let mode = self.inner.config.common_name.mode;
        if self.inner.config.is_bypassed(event.common_name()) {
            info!("Client {} common name '{}' is on the bypass list", id, event.common_name());
            let username = mode.transform(event.common_name());
            self.report(id, self.accept_client(id, Some(&username)).await);
            return;
        }

        let Some(record) = event.into_record(mode) else {
            return;
        };
        let ticket = AuthTicket::new(id, decisions.clone());

        match self.inner.authorizer.begin(record, ticket).await {
            Ok(PendingAuth::WebAuth { url }) => {
                if url.len() >= MAX_PENDING_AUTH_URL_LEN {
                    warn!(
                        "Web auth URL for client {} is {} bytes, OpenVPN accepts less than {}",
                        id,
                        url.len(),
                        MAX_PENDING_AUTH_URL_LEN
                    );
                    self.report(id, self.deny_client(id, AUTH_FAILED_REASON).await);
                    return;
                }

                let command = commands::pending_auth(id, &url, self.inner.config.auth_pending_timeout());
                self.report(id, self.send_command(&command).await.map(|_| ()));
            }
            Ok(PendingAuth::Detached) => debug!("Client {} handed to authorizer", id),
            Err(err) => {
                error!("Authorizer failed for client {}: {}", id, err);
                self.report(id, self.deny_client(id, AUTH_FAILED_REASON).await);
            }
        }
    }

    async fn apply_decision(&self, decision: AuthDecision) {
        let id = decision.id;
        let result = match decision.verdict {
            Verdict::Approve { username } => self.accept_client(id, username.as_deref()).await,
            Verdict::Deny { reason } => self.deny_client(id, &reason).await,
        };
        self.report(id, result);
    }

    fn report(&self, id: ClientIdentifier, result: Result<()>) {
        if let Err(err) = result {
            error!("Unable to send decision for client {}: {}", id, err);
        }
    }
}

fn log_client_event(event: &ClientEvent) {
    match event.reason {
        ClientReason::Established => info!(
            "Client cid {} established (common name '{}')",
            event.cid,
            event.common_name()
        ),
        ClientReason::Disconnect => info!(
            "Client cid {} disconnected (common name '{}')",
            event.cid,
            event.common_name()
        ),
        ClientReason::Address => debug!(
            "Client cid {} address {}",
            event.cid,
            event.details.as_deref().unwrap_or_default()
        ),
        ClientReason::CrResponse => info!("Ignoring challenge response from client cid {}", event.cid),
        _ => debug!("Ignoring client event {} for cid {}", event.reason, event.cid),
    }
}

// First signal wins; later ones are dropped without blocking
fn raise(fatal: &FatalSender, err: Option<ManagementError>) {
    if fatal.try_send(err).is_err() {
        debug!("Management connection already failing, dropping further error");
    }
}

async fn write_loop<W>(
    mut writer: FramedWrite<W, ManagementCodec>,
    mut commands: mpsc::Receiver<String>,
    fatal: FatalSender,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        if let Err(err) = writer.send(command.as_str()).await {
            raise(&fatal, Some(err.into()));
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use openvpn_auth_common::Secret;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;

    use crate::authorizer::AuthorizerError;

    const VERSION_RESPONSE: &str =
        "OpenVPN Version: OpenVPN 2.6.8 x86_64-pc-linux-gnu\nManagement Version: 5\nEND\n";

    /// Scripted management interface on the far end of a duplex pipe
    struct MockServer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl MockServer {
        async fn send(&mut self, text: &str) {
            self.writer.write_all(text.as_bytes()).await.unwrap();
        }

        async fn read_line(&mut self) -> Option<String> {
            self.lines.next_line().await.unwrap()
        }

        async fn expect(&mut self, line: &str) {
            assert_eq!(self.read_line().await.as_deref(), Some(line));
        }

        async fn expect_silence(&mut self) {
            let next = timeout(Duration::from_secs(1), self.read_line()).await;
            assert!(next.is_err(), "unexpected command: {:?}", next);
        }

        async fn handshake(&mut self) {
            self.send(PASSWORD_PROMPT).await;
            self.expect("secret").await;
            self.send("SUCCESS: password is correct\n").await;
            self.send(">INFO:OpenVPN Management Interface Version 5 -- type 'help' for more info\n")
                .await;
            self.expect("hold release").await;
            self.send("SUCCESS: hold release succeeded\n").await;
            self.expect("version").await;
            self.send(VERSION_RESPONSE).await;
        }
    }

    #[derive(Default)]
    struct RecordingAuthorizer {
        url: Option<String>,
        records: StdMutex<Vec<ClientRecord>>,
        tickets: StdMutex<Vec<AuthTicket>>,
    }

    #[async_trait]
    impl Authorizer for RecordingAuthorizer {
        async fn begin(
            &self,
            client: ClientRecord,
            ticket: AuthTicket,
        ) -> std::result::Result<PendingAuth, AuthorizerError> {
            self.records.lock().unwrap().push(client);
            self.tickets.lock().unwrap().push(ticket);
            Ok(match &self.url {
                Some(url) => PendingAuth::WebAuth { url: url.clone() },
                None => PendingAuth::Detached,
            })
        }
    }

    fn test_config() -> OpenVpnConfig {
        OpenVpnConfig {
            addr: "tcp://127.0.0.1:7505".to_string(),
            password: Secret::new("secret"),
            ..OpenVpnConfig::default()
        }
    }

    fn start(
        config: OpenVpnConfig,
        authorizer: Arc<RecordingAuthorizer>,
    ) -> (ManagementClient, MockServer, JoinHandle<Result<()>>) {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let (read_half, writer) = tokio::io::split(server_end);
        let server = MockServer {
            lines: BufReader::new(read_half).lines(),
            writer,
        };

        let client = ManagementClient::new(config, authorizer);
        let session = client.clone();
        let handle = tokio::spawn(async move { session.connect_stream(client_end).await });
        (client, server, handle)
    }

    fn connect_block(cid: u64, kid: u64, common_name: &str, iv_sso: &str) -> String {
        format!(
            ">CLIENT:CONNECT,{},{}\n\
             >CLIENT:ENV,untrusted_ip=192.0.2.10\n\
             >CLIENT:ENV,common_name={}\n\
             >CLIENT:ENV,IV_SSO={}\n\
             >CLIENT:ENV,password=hunter2\n\
             >CLIENT:ENV,END\n",
            cid, kid, common_name, iv_sso
        )
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let config = OpenVpnConfig {
            addr: "udp://127.0.0.1:1194".to_string(),
            ..OpenVpnConfig::default()
        };
        let client = ManagementClient::new(config, Arc::new(RecordingAuthorizer::default()));

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ManagementError::UnknownProtocol(ref scheme) if scheme == "udp"));
    }

    #[tokio::test]
    async fn test_connect_over_tcp_and_server_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = OpenVpnConfig {
            addr: format!("tcp://127.0.0.1:{}", port),
            ..OpenVpnConfig::default()
        };

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (read_half, mut writer) = socket.split();
            let mut lines = BufReader::new(read_half).lines();
            writer.write_all(b">INFO:OpenVPN Management Interface Version 5\n").await.unwrap();
            assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("hold release"));
            writer.write_all(b"SUCCESS: hold release succeeded\n").await.unwrap();
            assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("version"));
            writer.write_all(VERSION_RESPONSE.as_bytes()).await.unwrap();
        });

        let client = ManagementClient::new(config, Arc::new(RecordingAuthorizer::default()));
        client.connect().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_with_wrong_line_count_fails() {
        let (client, mut server, handle) = start(test_config(), Arc::default());

        server.send(PASSWORD_PROMPT).await;
        server.expect("secret").await;
        server.send("SUCCESS: password is correct\n").await;
        server.expect("hold release").await;
        server.send("SUCCESS: hold release succeeded\n").await;
        server.expect("version").await;
        server.send("OpenVPN Version: OpenVPN 2.6.8\nEND\n").await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ManagementError::UnexpectedResponse { .. }));
        assert!(err.to_string().contains("unexpected response"));

        // The loops never started
        assert!(matches!(
            client.send_command("status").await,
            Err(ManagementError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_management_version_fails() {
        let (_client, mut server, handle) = start(test_config(), Arc::default());

        server.send(PASSWORD_PROMPT).await;
        server.expect("secret").await;
        server.send("SUCCESS: password is correct\n").await;
        server.expect("hold release").await;
        server.send("SUCCESS: hold release succeeded\n").await;
        server.expect("version").await;
        server
            .send("OpenVPN Version: OpenVPN 2.4.0\nManagement Version: 4\nEND\n")
            .await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ManagementError::UnsupportedVersion { found: 4, required: 5 }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_password_fails() {
        let (_client, mut server, handle) = start(test_config(), Arc::default());

        server.send(PASSWORD_PROMPT).await;
        server.expect("secret").await;
        server.send("ERROR: bad password\n").await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ManagementError::Authentication(ref reply) if reply == "ERROR: bad password"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_password_prompt_without_configured_password() {
        let (_client, mut server, handle) = start(OpenVpnConfig::default(), Arc::default());

        server.send(PASSWORD_PROMPT).await;
        assert!(matches!(
            handle.await.unwrap(),
            Err(ManagementError::PasswordRequired)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_release_error_fails() {
        let (_client, mut server, handle) = start(test_config(), Arc::default());

        server.send(PASSWORD_PROMPT).await;
        server.expect("secret").await;
        server.send("SUCCESS: password is correct\n").await;
        server.expect("hold release").await;
        server.send("ERROR: unknown command\n").await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ManagementError::ErrorResponse { ref command, .. } if command == "hold release"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_are_serialized() {
        let (client, mut server, handle) = start(test_config(), Arc::default());
        server.handshake().await;

        let first = tokio::spawn({
            let client = client.clone();
            async move { client.send_command("status").await }
        });
        server.expect("status").await;

        let second = tokio::spawn({
            let client = client.clone();
            async move { client.send_command("pid").await }
        });
        // The second command stays queued while the first is unanswered
        server.expect_silence().await;

        server.send("TITLE,OpenVPN 2.6.8\nEND\n").await;
        server.expect("pid").await;
        server.send("SUCCESS: pid=42\n").await;

        assert_eq!(first.await.unwrap().unwrap(), "TITLE,OpenVPN 2.6.8\nEND\n");
        assert_eq!(second.await.unwrap().unwrap(), "SUCCESS: pid=42\n");

        client.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_response_is_returned_as_text() {
        let (client, mut server, handle) = start(test_config(), Arc::default());
        server.handshake().await;

        let caller = tokio::spawn({
            let client = client.clone();
            async move {
                let response = client.send_command_fmt(format_args!("kill {}", 7));
                response.await
            }
        });
        server.expect("kill 7").await;
        server.send("ERROR: common name '7' not found\n").await;

        assert_eq!(
            caller.await.unwrap().unwrap(),
            "ERROR: common name '7' not found\n"
        );

        client.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_names_first_line_and_connection_survives() {
        let (client, mut server, handle) = start(test_config(), Arc::default());
        server.handshake().await;

        let caller = tokio::spawn({
            let client = client.clone();
            async move { client.send_command("load-stats\nsecond line").await }
        });
        server.expect("load-stats").await;
        server.expect("second line").await;

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, ManagementError::Timeout(ref command) if command == "load-stats"));
        assert_eq!(
            err.to_string(),
            "command error 'load-stats': timeout waiting for response"
        );

        let caller = tokio::spawn({
            let client = client.clone();
            async move { client.send_command("version").await }
        });
        server.expect("version").await;
        // The late answer to load-stats arrives first and is discarded
        server.send("SUCCESS: nclients=0,bytesin=0,bytesout=0\n").await;
        server.send(VERSION_RESPONSE).await;

        assert_eq!(caller.await.unwrap().unwrap(), VERSION_RESPONSE);

        client.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_command_does_not_wedge_connection() {
        let (client, mut server, handle) = start(test_config(), Arc::default());
        server.handshake().await;

        let caller = tokio::spawn({
            let client = client.clone();
            async move { client.send_command("load-stats").await }
        });
        server.expect("load-stats").await;
        // Never answered
        assert!(matches!(
            caller.await.unwrap(),
            Err(ManagementError::Timeout(ref command)) if command == "load-stats"
        ));

        // Its answer cannot be told apart from the next one, which pays the debt
        let caller = tokio::spawn({
            let client = client.clone();
            async move { client.send_command("pid").await }
        });
        server.expect("pid").await;
        server.send("SUCCESS: pid=42\n").await;
        assert!(matches!(
            caller.await.unwrap(),
            Err(ManagementError::Timeout(ref command)) if command == "pid"
        ));

        for (command, reply) in [("status", "SUCCESS: reply 1\n"), ("version", "SUCCESS: reply 2\n")] {
            let caller = tokio::spawn({
                let client = client.clone();
                async move { client.send_command(command).await }
            });
            server.expect(command).await;
            server.send(reply).await;
            assert_eq!(caller.await.unwrap().unwrap(), reply);
        }

        client.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_before_session_starts_is_honored() {
        // Accepted by the kernel backlog but never served
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = OpenVpnConfig {
            addr: format!("tcp://127.0.0.1:{}", port),
            ..OpenVpnConfig::default()
        };

        let client = ManagementClient::new(config, Arc::new(RecordingAuthorizer::default()));
        assert!(!client.is_open());

        let session = client.clone();
        let handle = tokio::spawn(async move { session.connect().await });
        while !client.is_open() {
            tokio::task::yield_now().await;
        }

        client.shutdown();
        handle.await.unwrap().unwrap();
        assert!(!client.is_open());
        drop(listener);
    }

    #[tokio::test]
    async fn test_dial_failure_leaves_client_closed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let config = OpenVpnConfig {
            addr: format!("tcp://127.0.0.1:{}", port),
            ..OpenVpnConfig::default()
        };

        let client = ManagementClient::new(config, Arc::new(RecordingAuthorizer::default()));
        assert!(matches!(client.connect().await, Err(ManagementError::Dial { .. })));
        assert!(!client.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_without_webauth_is_denied_once() {
        let authorizer = Arc::new(RecordingAuthorizer::default());
        let (client, mut server, handle) = start(test_config(), authorizer.clone());
        server.handshake().await;

        server.send(&connect_block(1, 2, "alice", "openurl,crtext")).await;
        server
            .expect("client-deny 1 2 \"OpenVPN Client does not support SSO authentication via webauth\"")
            .await;
        server.send("SUCCESS: client-deny command succeeded\n").await;
        server.expect_silence().await;

        assert!(authorizer.records.lock().unwrap().is_empty());

        client.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bypassed_client_accepted_from_handshake_backlog() {
        let authorizer = Arc::new(RecordingAuthorizer::default());
        let mut config = test_config();
        config.bypass.common_names = vec!["alice".to_string()];
        let (client, mut server, handle) = start(config, authorizer.clone());

        server.send(PASSWORD_PROMPT).await;
        server.expect("secret").await;
        server.send("SUCCESS: password is correct\n").await;
        server.expect("hold release").await;
        server.send("SUCCESS: hold release succeeded\n").await;
        server.expect("version").await;
        // A client connects before the version response
        server.send(&connect_block(0, 1, "alice", "webauth")).await;
        server.send(VERSION_RESPONSE).await;

        server.expect("client-auth 0 1").await;
        server.expect("push \"auth-token-user YWxpY2U=\"").await;
        server.expect("END").await;
        server.send("SUCCESS: client-auth command succeeded\n").await;
        server.expect_silence().await;

        assert!(authorizer.records.lock().unwrap().is_empty());

        client.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bypassed_client_without_auth_token_user() {
        let mut config = test_config();
        config.bypass.common_names = vec!["backup".to_string()];
        config.auth_token_user = false;
        let (client, mut server, handle) = start(config, Arc::default());
        server.handshake().await;

        server.send(&connect_block(4, 0, "backup", "webauth,crtext")).await;
        server.expect("client-auth-nt 4 0").await;
        server.send("SUCCESS: client-auth command succeeded\n").await;

        client.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delegated_client_pending_then_approved() {
        let authorizer = Arc::new(RecordingAuthorizer {
            url: Some("https://sso.example.com/auth?state=xyz".to_string()),
            ..RecordingAuthorizer::default()
        });
        let (client, mut server, handle) = start(test_config(), authorizer.clone());
        server.handshake().await;

        server.send(&connect_block(5, 1, "bob", "webauth,openurl")).await;
        server
            .expect("client-pending-auth 5 1 \"WEB_AUTH::https://sso.example.com/auth?state=xyz\" 180")
            .await;
        server.send("SUCCESS: client-pending-auth command succeeded\n").await;

        {
            let records = authorizer.records.lock().unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].id, ClientIdentifier::new(5, 1));
            assert_eq!(records[0].common_name, "bob");
            assert!(!records[0].env.contains_key("password"));
        }

        let ticket = authorizer.tickets.lock().unwrap().pop().unwrap();
        ticket.approve(Some("bob".to_string())).unwrap();

        server.expect("client-auth 5 1").await;
        server.expect("push \"auth-token-user Ym9i\"").await;
        server.expect("END").await;
        server.send("SUCCESS: client-auth command succeeded\n").await;

        client.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delegated_client_with_long_url_is_denied() {
        let authorizer = Arc::new(RecordingAuthorizer {
            url: Some(format!("https://sso.example.com/{}", "a".repeat(300))),
            ..RecordingAuthorizer::default()
        });
        let (client, mut server, handle) = start(test_config(), authorizer.clone());
        server.handshake().await;

        server.send(&connect_block(6, 3, "carol", "webauth")).await;
        server.expect("client-deny 6 3 \"internal error\"").await;
        server.send("SUCCESS: client-deny command succeeded\n").await;

        client.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_client_events_need_no_decision() {
        let (client, mut server, handle) = start(test_config(), Arc::default());
        server.handshake().await;

        server
            .send(">CLIENT:ESTABLISHED,5\n>CLIENT:ENV,common_name=bob\n>CLIENT:ENV,END\n")
            .await;
        server.send(">CLIENT:ADDRESS,5,10.8.0.6,1\n").await;
        server
            .send(">CLIENT:DISCONNECT,5\n>CLIENT:ENV,common_name=bob\n>CLIENT:ENV,END\n")
            .await;
        server.expect_silence().await;

        client.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_shutdown_closes_once() {
        let (client, mut server, handle) = start(test_config(), Arc::default());
        server.handshake().await;

        let (other_end, _other_server) = tokio::io::duplex(1024);
        assert!(matches!(
            client.connect_stream(other_end).await,
            Err(ManagementError::AlreadyConnected)
        ));

        let a = tokio::spawn({
            let client = client.clone();
            async move { client.shutdown() }
        });
        let b = tokio::spawn({
            let client = client.clone();
            async move { client.shutdown() }
        });
        a.await.unwrap();
        b.await.unwrap();

        handle.await.unwrap().unwrap();

        assert!(matches!(
            client.send_command("status").await,
            Err(ManagementError::Closed)
        ));
        // Closed connection: a further shutdown is a no-op
        client.shutdown();
        assert_eq!(server.read_line().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_ends_session() {
        let (client, mut server, handle) = start(test_config(), Arc::default());
        server.handshake().await;
        drop(server);

        handle.await.unwrap().unwrap();
        assert!(matches!(
            client.send_command("status").await,
            Err(ManagementError::Closed)
        ));
    }
}
