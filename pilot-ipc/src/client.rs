//! Session-side broker connection.
//!
//! A `SessionClient` owns at most one live link to the broker. Each link gets
//! a monotonically increasing id; close events from a superseded link only
//! fail that link's own pending requests and never touch the current one.
//! Reconnection is caller-driven: `try_reconnect`, `ensure_connected`, or
//! implicitly at the start of `request_nonce`.

use crate::error::{ClientError, Result};
use crate::protocol::{BrokerMessage, ClientMessage, DEFAULT_SOCKET_PATH, decode_line, encode_line, lines_codec};
use futures_util::{SinkExt, StreamExt};
use pilot_auth::Decision;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

pub const NONCE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
}

/// A decision routed to this session by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionResponse {
    pub permission_id: String,
    pub response: Decision,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub socket_path: PathBuf,
    pub nonce_timeout: Duration,
    pub register_timeout: Duration,
    /// One extra connect attempt after this delay when the socket is unreachable.
    pub connect_retry: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            nonce_timeout: NONCE_REQUEST_TIMEOUT,
            register_timeout: REGISTER_TIMEOUT,
            connect_retry: None,
        }
    }
}

impl ClientOptions {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }

    pub fn with_nonce_timeout(mut self, timeout: Duration) -> Self {
        self.nonce_timeout = timeout;
        self
    }

    pub fn with_register_timeout(mut self, timeout: Duration) -> Self {
        self.register_timeout = timeout;
        self
    }

    pub fn with_connect_retry(mut self, delay: Option<Duration>) -> Self {
        self.connect_retry = delay;
        self
    }
}

type NonceReply = oneshot::Sender<Result<String>>;

#[derive(Default)]
struct PendingRequests {
    closed: bool,
    by_permission: HashMap<String, NonceReply>,
}

struct Link {
    id: u64,
    outbound: mpsc::UnboundedSender<String>,
    pending: Mutex<PendingRequests>,
    registered: Mutex<Option<oneshot::Sender<()>>>,
    shutdown: CancellationToken,
}

impl Link {
    fn lock_pending(&self) -> MutexGuard<'_, PendingRequests> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send(&self, message: &ClientMessage) -> Result<()> {
        let line = encode_line(message)?;
        self.outbound
            .send(line)
            .map_err(|_| ClientError::ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.lock_pending().closed
    }

    fn ack_registered(&self) {
        let waiter = self
            .registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(waiter) = waiter {
            let _ = waiter.send(());
        }
    }

    fn complete(&self, permission_id: &str, nonce: String) -> bool {
        let waiter = self.lock_pending().by_permission.remove(permission_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(Ok(nonce));
                true
            }
            None => false,
        }
    }

    /// Reject every pending request and refuse new ones.
    fn close(&self, error: ClientError) -> usize {
        self.shutdown.cancel();
        self.registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let drained = {
            let mut pending = self.lock_pending();
            pending.closed = true;
            std::mem::take(&mut pending.by_permission)
        };
        let count = drained.len();
        for (_, waiter) in drained {
            let _ = waiter.send(Err(error.clone()));
        }
        count
    }
}

struct ClientInner {
    options: ClientOptions,
    session_id: Mutex<Option<String>>,
    link: Mutex<Option<Arc<Link>>>,
    next_link_id: AtomicU64,
    state: watch::Sender<ConnectionState>,
    responses: mpsc::UnboundedSender<PermissionResponse>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl ClientInner {
    fn lock_link(&self) -> MutexGuard<'_, Option<Arc<Link>>> {
        self.link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<String>> {
        self.session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_link(&self) -> Option<Arc<Link>> {
        self.lock_link().as_ref().filter(|link| link.is_open()).cloned()
    }

    fn is_current(&self, link: &Link) -> bool {
        self.lock_link()
            .as_ref()
            .is_some_and(|current| current.id == link.id)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn dial(&self) -> Result<UnixStream> {
        let path = &self.options.socket_path;
        let unreachable = |error: std::io::Error| ClientError::Unreachable {
            path: path.display().to_string(),
            reason: error.to_string(),
        };
        match UnixStream::connect(path).await {
            Ok(stream) => Ok(stream),
            Err(error) => {
                let Some(delay) = self.options.connect_retry else {
                    return Err(unreachable(error));
                };
                tracing::debug!(
                    socket = %path.display(),
                    %error,
                    retry_in_ms = delay.as_millis() as u64,
                    "broker unreachable; retrying once"
                );
                tokio::time::sleep(delay).await;
                UnixStream::connect(path).await.map_err(unreachable)
            }
        }
    }

    async fn open_link(self: &Arc<Self>, session_id: &str) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        let stream = match self.dial().await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::debug!(%error, "broker connect failed");
                if self.current_link().is_none() {
                    self.set_state(ConnectionState::Disconnected);
                }
                return Err(error);
            }
        };
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (registered_tx, registered_rx) = oneshot::channel();
        let link = Arc::new(Link {
            id: self.next_link_id.fetch_add(1, Ordering::Relaxed),
            outbound: outbound_tx,
            pending: Mutex::new(PendingRequests::default()),
            registered: Mutex::new(Some(registered_tx)),
            shutdown: CancellationToken::new(),
        });

        let previous = self.lock_link().replace(link.clone());
        if let Some(previous) = previous {
            previous.close(ClientError::ConnectionClosed);
        }
        self.set_state(ConnectionState::Connected);
        tracing::debug!(link_id = link.id, session_id, "broker connected, registering session");

        tokio::spawn(write_loop(link.clone(), write_half, outbound_rx));
        tokio::spawn(read_loop(self.clone(), link.clone(), read_half));

        let registered = match link.send(&ClientMessage::Register {
            session_id: session_id.to_string(),
        }) {
            Ok(()) => match tokio::time::timeout(self.options.register_timeout, registered_rx).await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(ClientError::ConnectionClosed),
                Err(_) => Err(ClientError::Timeout("registration")),
            },
            Err(error) => Err(error),
        };
        if let Err(error) = registered {
            // An unregistered link must not be mistaken for a usable one.
            tracing::debug!(link_id = link.id, session_id, %error, "broker registration failed");
            self.on_link_closed(&link);
            return Err(error);
        }
        if self.is_current(&link) {
            self.set_state(ConnectionState::Registered);
        }
        tracing::debug!(link_id = link.id, session_id, "session registered with broker");
        Ok(())
    }

    fn handle_message(&self, link: &Link, message: BrokerMessage) {
        match message {
            BrokerMessage::Registered => link.ack_registered(),
            BrokerMessage::NonceCreated {
                permission_id,
                nonce,
            } => {
                if !link.complete(&permission_id, nonce) {
                    tracing::debug!(permission_id, "nonce reply without pending request");
                }
            }
            BrokerMessage::PermissionResponse {
                permission_id,
                response,
            } => {
                tracing::info!(permission_id, %response, "permission response received");
                if self
                    .responses
                    .send(PermissionResponse {
                        permission_id,
                        response,
                    })
                    .is_err()
                {
                    tracing::warn!("permission response dropped: no receiver");
                }
            }
        }
    }

    fn on_link_closed(&self, link: &Link) {
        let was_current = {
            let mut current = self.lock_link();
            if current.as_ref().is_some_and(|c| c.id == link.id) {
                *current = None;
                true
            } else {
                false
            }
        };
        let failed = link.close(ClientError::ConnectionClosed);
        if was_current {
            self.set_state(ConnectionState::Disconnected);
        }
        tracing::debug!(
            link_id = link.id,
            was_current,
            failed_requests = failed,
            "broker connection closed"
        );
    }
}

async fn write_loop(
    link: Arc<Link>,
    write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let mut writer = FramedWrite::new(write_half, lines_codec());
    loop {
        tokio::select! {
            _ = link.shutdown.cancelled() => break,
            line = outbound.recv() => {
                let Some(line) = line else { break };
                if let Err(error) = writer.send(line).await {
                    tracing::warn!(link_id = link.id, %error, "broker write failed");
                    link.shutdown.cancel();
                    break;
                }
            }
        }
    }
}

async fn read_loop(inner: Arc<ClientInner>, link: Arc<Link>, read_half: OwnedReadHalf) {
    let mut reader = FramedRead::new(read_half, lines_codec());
    loop {
        tokio::select! {
            _ = link.shutdown.cancelled() => break,
            frame = reader.next() => match frame {
                Some(Ok(line)) => {
                    if let Some(message) = decode_line::<BrokerMessage>(&line) {
                        inner.handle_message(&link, message);
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(link_id = link.id, %error, "broker read failed");
                    break;
                }
                None => break,
            },
        }
    }
    inner.on_link_closed(&link);
}

/// Handle held by an agent session. Cheap to clone.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<ClientInner>,
}

impl SessionClient {
    /// Returns the client and the stream of decisions routed to this session.
    pub fn new(options: ClientOptions) -> (Self, mpsc::UnboundedReceiver<PermissionResponse>) {
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let client = Self {
            inner: Arc::new(ClientInner {
                options,
                session_id: Mutex::new(None),
                link: Mutex::new(None),
                next_link_id: AtomicU64::new(1),
                state,
                responses: responses_tx,
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        };
        (client, responses_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.lock_session().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current_link().is_some()
    }

    /// Connect and register `session_id`, replacing any existing link.
    pub async fn connect(&self, session_id: &str) -> Result<()> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(ClientError::InvalidInput("session_id is required".to_string()));
        }
        *self.inner.lock_session() = Some(session_id.to_string());
        let _guard = self.inner.connect_lock.lock().await;
        self.inner.open_link(session_id).await
    }

    /// Reconnect with the last registered session id. Returns whether a
    /// registered link is available afterwards.
    pub async fn try_reconnect(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            return true;
        }
        let Some(session_id) = self.session_id() else {
            return false;
        };
        match self.inner.open_link(&session_id).await {
            Ok(()) => true,
            Err(error) => {
                tracing::debug!(session_id, %error, "broker reconnect failed");
                false
            }
        }
    }

    pub async fn ensure_connected(&self) -> Result<()> {
        if self.try_reconnect().await {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    /// Ask the broker for a callback nonce bound to this session and
    /// `permission_id`. Resolves exactly once: with the nonce, with
    /// `ConnectionClosed` if the link drops first, or with `Timeout`.
    pub async fn request_nonce(&self, permission_id: &str) -> Result<String> {
        let permission_id = permission_id.trim().to_string();
        if permission_id.is_empty() {
            return Err(ClientError::InvalidInput(
                "permission_id is required".to_string(),
            ));
        }
        self.ensure_connected().await?;
        let link = self
            .inner
            .current_link()
            .ok_or(ClientError::NotConnected)?;
        let session_id = self.session_id().ok_or(ClientError::NotConnected)?;

        let (reply_tx, mut reply_rx) = oneshot::channel();
        {
            let mut pending = link.lock_pending();
            if pending.closed {
                return Err(ClientError::ConnectionClosed);
            }
            if pending.by_permission.contains_key(&permission_id) {
                return Err(ClientError::DuplicateRequest(permission_id));
            }
            pending
                .by_permission
                .insert(permission_id.clone(), reply_tx);
        }

        let sent = link.send(&ClientMessage::CreateNonce {
            session_id,
            permission_id: permission_id.clone(),
        });
        if let Err(error) = sent {
            link.lock_pending().by_permission.remove(&permission_id);
            return Err(error);
        }

        match tokio::time::timeout(self.inner.options.nonce_timeout, &mut reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                if link
                    .lock_pending()
                    .by_permission
                    .remove(&permission_id)
                    .is_some()
                {
                    tracing::warn!(permission_id, "nonce request timed out");
                    return Err(ClientError::Timeout("nonce request"));
                }
                // Completed between the deadline and the removal.
                reply_rx
                    .try_recv()
                    .unwrap_or(Err(ClientError::ConnectionClosed))
            }
        }
    }

    /// Close the link and forget the session id.
    pub fn disconnect(&self) {
        let link = self.inner.lock_link().take();
        *self.inner.lock_session() = None;
        if let Some(link) = link {
            link.close(ClientError::ConnectionClosed);
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::lines_codec;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    type ServerReader = FramedRead<OwnedReadHalf, tokio_util::codec::LinesCodec>;
    type ServerWriter = FramedWrite<OwnedWriteHalf, tokio_util::codec::LinesCodec>;

    fn socket_in(dir: &TempDir) -> PathBuf {
        dir.path().join("broker.sock")
    }

    async fn accept(listener: &UnixListener) -> (ServerReader, ServerWriter) {
        let (stream, _) = listener.accept().await.expect("accept");
        let (read_half, write_half) = stream.into_split();
        (
            FramedRead::new(read_half, lines_codec()),
            FramedWrite::new(write_half, lines_codec()),
        )
    }

    async fn next_client_message(reader: &mut ServerReader) -> ClientMessage {
        let line = reader
            .next()
            .await
            .expect("client line")
            .expect("line decode");
        decode_line(&line).expect("client message")
    }

    async fn send_broker_message(writer: &mut ServerWriter, message: &BrokerMessage) {
        writer
            .send(encode_line(message).expect("encode"))
            .await
            .expect("send");
    }

    /// Accept one connection and acknowledge its registration.
    async fn accept_registered(listener: &UnixListener) -> (ServerReader, ServerWriter, String) {
        let (mut reader, mut writer) = accept(listener).await;
        let ClientMessage::Register { session_id } = next_client_message(&mut reader).await else {
            panic!("expected register");
        };
        send_broker_message(&mut writer, &BrokerMessage::Registered).await;
        (reader, writer, session_id)
    }

    fn client_for(path: &Path) -> (SessionClient, mpsc::UnboundedReceiver<PermissionResponse>) {
        SessionClient::new(ClientOptions::new(path))
    }

    #[test]
    fn default_nonce_timeout_is_five_seconds() {
        assert_eq!(NONCE_REQUEST_TIMEOUT, Duration::from_secs(5));
        assert_eq!(ClientOptions::default().nonce_timeout, NONCE_REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn connect_registers_and_resolves_nonce_request() {
        let dir = TempDir::new().expect("tempdir");
        let path = socket_in(&dir);
        let listener = UnixListener::bind(&path).expect("bind");
        let (client, _responses) = client_for(&path);

        let server = tokio::spawn(async move {
            let (mut reader, mut writer, session_id) = accept_registered(&listener).await;
            assert_eq!(session_id, "s1");
            let ClientMessage::CreateNonce {
                session_id,
                permission_id,
            } = next_client_message(&mut reader).await
            else {
                panic!("expected create_nonce");
            };
            assert_eq!(session_id, "s1");
            send_broker_message(
                &mut writer,
                &BrokerMessage::NonceCreated {
                    permission_id,
                    nonce: "abc123".to_string(),
                },
            )
            .await;
            (reader, writer)
        });

        client.connect("s1").await.expect("connect");
        assert_eq!(client.state(), ConnectionState::Registered);
        let nonce = client.request_nonce("p1").await.expect("nonce");
        assert_eq!(nonce, "abc123");
        let _keep_open = server.await.expect("server task");
    }

    #[tokio::test]
    async fn permission_responses_are_forwarded_to_receiver() {
        let dir = TempDir::new().expect("tempdir");
        let path = socket_in(&dir);
        let listener = UnixListener::bind(&path).expect("bind");
        let (client, mut responses) = client_for(&path);

        let server = tokio::spawn(async move {
            let (reader, mut writer, _) = accept_registered(&listener).await;
            writer.send("".to_string()).await.expect("blank line");
            writer
                .send(r#"{"type":"future_feature","x":1}"#.to_string())
                .await
                .expect("unknown type");
            send_broker_message(
                &mut writer,
                &BrokerMessage::PermissionResponse {
                    permission_id: "p1".to_string(),
                    response: Decision::Once,
                },
            )
            .await;
            (reader, writer)
        });

        client.connect("s1").await.expect("connect");
        let response = tokio::time::timeout(Duration::from_secs(2), responses.recv())
            .await
            .expect("response in time")
            .expect("response");
        assert_eq!(
            response,
            PermissionResponse {
                permission_id: "p1".to_string(),
                response: Decision::Once,
            }
        );
        assert!(client.is_connected());
        let _keep_open = server.await.expect("server task");
    }

    #[tokio::test]
    async fn connection_close_rejects_pending_request_with_connection_closed() {
        let dir = TempDir::new().expect("tempdir");
        let path = socket_in(&dir);
        let listener = UnixListener::bind(&path).expect("bind");
        let (client, _responses) = client_for(&path);

        let server = tokio::spawn(async move {
            let (mut reader, writer, _) = accept_registered(&listener).await;
            let _ = next_client_message(&mut reader).await;
            drop(reader);
            drop(writer);
        });

        client.connect("s1").await.expect("connect");
        let started = std::time::Instant::now();
        let result = client.request_nonce("p1").await;
        assert_eq!(result, Err(ClientError::ConnectionClosed));
        assert!(started.elapsed() < NONCE_REQUEST_TIMEOUT);
        server.await.expect("server task");

        let mut state = client.watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .expect("state watch");
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn unanswered_request_times_out_while_connection_stays_open() {
        let dir = TempDir::new().expect("tempdir");
        let path = socket_in(&dir);
        let listener = UnixListener::bind(&path).expect("bind");
        let (client, _responses) = SessionClient::new(
            ClientOptions::new(&path).with_nonce_timeout(Duration::from_millis(150)),
        );

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (mut reader, writer, _) = accept_registered(&listener).await;
            let _ = next_client_message(&mut reader).await;
            let _ = release_rx.await;
            drop(writer);
        });

        client.connect("s1").await.expect("connect");
        let result = client.request_nonce("p1").await;
        assert_eq!(result, Err(ClientError::Timeout("nonce request")));
        assert!(client.is_connected());
        let _ = release_tx.send(());
        server.await.expect("server task");
    }

    #[tokio::test]
    async fn duplicate_pending_request_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = socket_in(&dir);
        let listener = UnixListener::bind(&path).expect("bind");
        let (client, _responses) = SessionClient::new(
            ClientOptions::new(&path).with_nonce_timeout(Duration::from_millis(300)),
        );

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (reader, writer, _) = accept_registered(&listener).await;
            let _ = release_rx.await;
            drop((reader, writer));
        });

        client.connect("s1").await.expect("connect");
        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.request_nonce("p1").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            client.request_nonce("p1").await,
            Err(ClientError::DuplicateRequest("p1".to_string()))
        );
        assert_eq!(
            first.await.expect("first request"),
            Err(ClientError::Timeout("nonce request"))
        );
        let _ = release_tx.send(());
        server.await.expect("server task");
    }

    #[tokio::test]
    async fn registration_timeout_discards_the_link() {
        let dir = TempDir::new().expect("tempdir");
        let path = socket_in(&dir);
        let listener = UnixListener::bind(&path).expect("bind");
        let (client, _responses) = SessionClient::new(
            ClientOptions::new(&path).with_register_timeout(Duration::from_millis(100)),
        );

        let server = tokio::spawn(async move {
            let (mut reader, writer) = accept(&listener).await;
            let message = next_client_message(&mut reader).await;
            assert!(matches!(message, ClientMessage::Register { .. }));
            // Never acknowledge; hold the socket open until the client gives up.
            let _ = reader.next().await;
            drop(writer);
            listener
        });

        let result = client.connect("s1").await;
        assert_eq!(result, Err(ClientError::Timeout("registration")));
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.session_id().as_deref(), Some("s1"));

        let _listener = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("client closed the abandoned link")
            .expect("server task");
    }

    #[tokio::test]
    async fn reconnect_without_prior_session_is_a_noop() {
        let dir = TempDir::new().expect("tempdir");
        let (client, _responses) = client_for(&socket_in(&dir));
        assert!(!client.try_reconnect().await);
        assert_eq!(
            client.request_nonce("p1").await,
            Err(ClientError::NotConnected)
        );
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_to_missing_socket_reports_unreachable() {
        let dir = TempDir::new().expect("tempdir");
        let (client, _responses) = SessionClient::new(
            ClientOptions::new(socket_in(&dir)).with_connect_retry(Some(Duration::from_millis(10))),
        );
        let result = client.connect("s1").await;
        assert!(matches!(result, Err(ClientError::Unreachable { .. })));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.session_id().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn reconnect_resends_register_with_last_session_id() {
        let dir = TempDir::new().expect("tempdir");
        let path = socket_in(&dir);
        let listener = UnixListener::bind(&path).expect("bind");
        let (client, _responses) = client_for(&path);

        let (first_reader, first_writer, first_session) = {
            let accept = accept_registered(&listener);
            let (accepted, connected) = tokio::join!(accept, client.connect("s1"));
            connected.expect("connect");
            accepted
        };
        assert_eq!(first_session, "s1");

        drop(first_reader);
        drop(first_writer);
        let mut state = client.watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .expect("state watch");

        let (accepted, reconnected) = tokio::join!(accept_registered(&listener), client.try_reconnect());
        assert!(reconnected);
        assert_eq!(accepted.2, "s1");
        assert_eq!(client.state(), ConnectionState::Registered);
    }

    #[tokio::test]
    async fn disconnect_clears_session_and_rejects_pending() {
        let dir = TempDir::new().expect("tempdir");
        let path = socket_in(&dir);
        let listener = UnixListener::bind(&path).expect("bind");
        let (client, _responses) = client_for(&path);

        let server = tokio::spawn(async move {
            let (mut reader, writer, _) = accept_registered(&listener).await;
            let _ = next_client_message(&mut reader).await;
            // Hold the connection open until the client hangs up.
            while reader.next().await.is_some() {}
            drop(writer);
        });

        client.connect("s1").await.expect("connect");
        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.request_nonce("p1").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.disconnect();

        assert_eq!(
            pending.await.expect("pending request"),
            Err(ClientError::ConnectionClosed)
        );
        assert_eq!(client.session_id(), None);
        assert!(!client.try_reconnect().await);
        server.await.expect("server task");
    }
}
