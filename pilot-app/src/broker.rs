//! Session broker.
//!
//! Routes between agent sessions (over a local Unix socket) and the callback
//! endpoint. Each accepted connection gets a monotonically increasing id; the
//! session registry maps a session id to the connection that most recently
//! registered it. A closing connection only removes bindings that still point
//! at its own id, so a late close never evicts a replacement.

use crate::callback::DecisionHandler;
use anyhow::{Context, Result, anyhow};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use pilot_auth::{CredentialClaims, Decision, NonceAuthority};
use pilot_ipc::{BrokerMessage, ClientMessage, decode_line, encode_line, lines_codec};
use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("session not connected: {0}")]
    SessionNotConnected(String),

    #[error("session connection closed: {0}")]
    ConnectionClosed(String),

    #[error("encode error: {0}")]
    Encode(String),
}

#[derive(Debug, Clone)]
struct SessionBinding {
    conn_id: u64,
    outbound: mpsc::UnboundedSender<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStats {
    pub sessions: usize,
    pub connections_total: u64,
}

pub struct Broker {
    sessions: DashMap<String, SessionBinding>,
    nonces: Arc<NonceAuthority>,
    next_conn_id: AtomicU64,
}

impl Broker {
    pub fn new(nonces: Arc<NonceAuthority>) -> Self {
        Self {
            sessions: DashMap::new(),
            nonces,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn nonces(&self) -> &Arc<NonceAuthority> {
        &self.nonces
    }

    pub fn is_registered(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            sessions: self.sessions.len(),
            connections_total: self.next_conn_id.load(Ordering::Relaxed) - 1,
        }
    }

    fn next_connection_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, session_id: &str, conn_id: u64, outbound: &mpsc::UnboundedSender<String>) {
        let previous = self.sessions.insert(
            session_id.to_string(),
            SessionBinding {
                conn_id,
                outbound: outbound.clone(),
            },
        );
        match previous {
            Some(previous) if previous.conn_id != conn_id => tracing::info!(
                session_id,
                conn_id,
                replaced_conn_id = previous.conn_id,
                "session re-registered on new connection"
            ),
            _ => tracing::info!(session_id, conn_id, "session registered"),
        }
    }

    /// Remove the binding only if `conn_id` still owns it.
    fn unregister(&self, session_id: &str, conn_id: u64) -> bool {
        let removed = self
            .sessions
            .remove_if(session_id, |_, binding| binding.conn_id == conn_id)
            .is_some();
        if removed {
            tracing::info!(session_id, conn_id, "session unregistered");
        } else {
            tracing::debug!(
                session_id,
                conn_id,
                "connection closed after its session was re-registered elsewhere"
            );
        }
        removed
    }

    /// Send a decision to the connection currently bound to the session.
    pub fn deliver(
        &self,
        session_id: &str,
        permission_id: &str,
        decision: Decision,
    ) -> std::result::Result<(), RoutingError> {
        let outbound = self
            .sessions
            .get(session_id)
            .map(|binding| binding.outbound.clone())
            .ok_or_else(|| RoutingError::SessionNotConnected(session_id.to_string()))?;
        let line = encode_line(&BrokerMessage::PermissionResponse {
            permission_id: permission_id.to_string(),
            response: decision,
        })
        .map_err(|e| RoutingError::Encode(e.to_string()))?;
        outbound
            .send(line)
            .map_err(|_| RoutingError::ConnectionClosed(session_id.to_string()))?;
        tracing::info!(session_id, permission_id, %decision, "decision routed to session");
        Ok(())
    }

    fn handle_message(
        &self,
        conn_id: u64,
        outbound: &mpsc::UnboundedSender<String>,
        owned_sessions: &mut HashSet<String>,
        message: ClientMessage,
    ) {
        match message {
            ClientMessage::Register { session_id } => {
                let session_id = session_id.trim().to_string();
                if session_id.is_empty() {
                    tracing::warn!(conn_id, "register without session id ignored");
                    return;
                }
                self.register(&session_id, conn_id, outbound);
                owned_sessions.insert(session_id);
                send_to(outbound, &BrokerMessage::Registered);
            }
            ClientMessage::CreateNonce {
                session_id,
                permission_id,
            } => {
                if !self.owns_session(session_id.trim(), conn_id) {
                    tracing::warn!(
                        conn_id,
                        session_id,
                        permission_id,
                        "create_nonce for a session this connection does not own"
                    );
                }
                self.create_nonce(conn_id, outbound, session_id, permission_id);
            }
        }
    }

    /// Whether `conn_id` is the connection currently bound to `session_id`.
    fn owns_session(&self, session_id: &str, conn_id: u64) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|binding| binding.conn_id == conn_id)
    }

    fn create_nonce(
        &self,
        conn_id: u64,
        outbound: &mpsc::UnboundedSender<String>,
        session_id: String,
        permission_id: String,
    ) {
        match self.nonces.issue(&session_id, &permission_id) {
            Ok(nonce) => {
                tracing::debug!(conn_id, session_id, permission_id, "nonce issued");
                send_to(
                    outbound,
                    &BrokerMessage::NonceCreated {
                        permission_id,
                        nonce,
                    },
                );
            }
            Err(error) => {
                tracing::error!(conn_id, session_id, permission_id, %error, "nonce issue failed");
            }
        }
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self: Arc<Self>, listener: UnixListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("broker accept loop stopping");
                    break;
                }
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(error) => {
                            tracing::warn!(%error, "broker accept failed");
                            continue;
                        }
                    };
                    tokio::spawn(self.clone().serve_connection(stream, shutdown.child_token()));
                }
            }
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(conn_id))]
    async fn serve_connection(self: Arc<Self>, stream: UnixStream, shutdown: CancellationToken) {
        let conn_id = self.next_connection_id();
        tracing::Span::current().record("conn_id", conn_id);
        tracing::debug!("broker connection accepted");

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, lines_codec());
        let mut writer = FramedWrite::new(write_half, lines_codec());
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        let writer_shutdown = shutdown.clone();
        let writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    line = outbound_rx.recv() => {
                        let Some(line) = line else { break };
                        if let Err(error) = writer.send(line).await {
                            tracing::warn!(conn_id, %error, "broker write failed");
                            break;
                        }
                    }
                }
            }
        });

        let mut owned_sessions = HashSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = reader.next() => match frame {
                    Some(Ok(line)) => {
                        if let Some(message) = decode_line::<ClientMessage>(&line) {
                            self.handle_message(conn_id, &outbound_tx, &mut owned_sessions, message);
                        }
                    }
                    Some(Err(error)) => {
                        tracing::warn!(conn_id, %error, "broker read failed; closing connection");
                        break;
                    }
                    None => break,
                },
            }
        }

        for session_id in &owned_sessions {
            self.unregister(session_id, conn_id);
        }
        drop(outbound_tx);
        if let Err(error) = writer_task.await {
            tracing::warn!(conn_id, %error, "broker writer task join failed");
        }
        tracing::debug!(conn_id, "broker connection closed");
    }
}

fn send_to(outbound: &mpsc::UnboundedSender<String>, message: &BrokerMessage) {
    match encode_line(message) {
        Ok(line) => {
            if outbound.send(line).is_err() {
                tracing::debug!("reply dropped: connection writer gone");
            }
        }
        Err(error) => tracing::error!(%error, "failed to encode broker reply"),
    }
}

#[async_trait::async_trait]
impl DecisionHandler for Broker {
    async fn deliver(
        &self,
        claims: &CredentialClaims,
        decision: Decision,
    ) -> std::result::Result<(), RoutingError> {
        Broker::deliver(self, &claims.session_id, &claims.permission_id, decision)
    }
}

/// Bind the broker socket with owner-only permissions. A leftover socket file
/// is replaced unless another broker is still answering on it.
pub async fn bind_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create socket dir {}", parent.display()))?;
    }
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        if UnixStream::connect(path).await.is_ok() {
            return Err(anyhow!(
                "another broker is already listening on {}",
                path.display()
            ));
        }
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("remove stale socket {}", path.display()))?;
        tracing::info!(socket = %path.display(), "removed stale broker socket");
    }
    let listener =
        UnixListener::bind(path).with_context(|| format!("bind broker socket {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("chmod broker socket {}", path.display()))?;
    tracing::info!(socket = %path.display(), "broker listening");
    Ok(listener)
}

pub fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(socket = %path.display(), "broker socket removed"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => {
            tracing::warn!(socket = %path.display(), %error, "failed to remove broker socket")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_ipc::{ClientOptions, PermissionResponse, SessionClient};
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        path: PathBuf,
        broker: Arc<Broker>,
        shutdown: CancellationToken,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    async fn start_broker() -> Harness {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("pilot.sock");
        let listener = bind_socket(&path).await.expect("bind");
        let broker = Arc::new(Broker::new(Arc::new(NonceAuthority::default())));
        let shutdown = CancellationToken::new();
        tokio::spawn(broker.clone().run(listener, shutdown.clone()));
        Harness {
            _dir: dir,
            path,
            broker,
            shutdown,
        }
    }

    fn client(path: &Path) -> (SessionClient, mpsc::UnboundedReceiver<PermissionResponse>) {
        SessionClient::new(ClientOptions::new(path))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition reached in time");
    }

    #[tokio::test]
    async fn nonce_issued_over_ipc_is_bound_to_session_and_permission() {
        let harness = start_broker().await;
        let (client, _responses) = client(&harness.path);
        client.connect("s1").await.expect("connect");

        let nonce = client.request_nonce("p1").await.expect("nonce");
        let claims = harness.broker.nonces().peek(&nonce).expect("nonce valid");
        assert_eq!(claims.session_id, "s1");
        assert_eq!(claims.permission_id, "p1");
    }

    #[tokio::test]
    async fn deliver_routes_to_registered_session() {
        let harness = start_broker().await;
        let (client, mut responses) = client(&harness.path);
        client.connect("s1").await.expect("connect");

        harness
            .broker
            .deliver("s1", "p1", Decision::Always)
            .expect("deliver");
        let response = tokio::time::timeout(Duration::from_secs(2), responses.recv())
            .await
            .expect("in time")
            .expect("response");
        assert_eq!(response.permission_id, "p1");
        assert_eq!(response.response, Decision::Always);
    }

    #[tokio::test]
    async fn deliver_to_unknown_session_is_routing_error() {
        let harness = start_broker().await;
        assert_eq!(
            harness.broker.deliver("ghost", "p1", Decision::Reject),
            Err(RoutingError::SessionNotConnected("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn replacement_survives_close_of_superseded_connection() {
        let harness = start_broker().await;
        let (first, mut first_responses) = client(&harness.path);
        first.connect("s1").await.expect("first connect");
        let (second, mut second_responses) = client(&harness.path);
        second.connect("s1").await.expect("second connect");

        first.disconnect();
        // Give the broker time to observe the close of the first connection.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(harness.broker.is_registered("s1"));

        harness
            .broker
            .deliver("s1", "p1", Decision::Once)
            .expect("deliver");
        let response = tokio::time::timeout(Duration::from_secs(2), second_responses.recv())
            .await
            .expect("in time")
            .expect("response");
        assert_eq!(response.permission_id, "p1");
        assert!(first_responses.try_recv().is_err());
    }

    #[test]
    fn superseded_connection_no_longer_owns_session() {
        let broker = Broker::new(Arc::new(NonceAuthority::default()));
        let (first_tx, _first_rx) = mpsc::unbounded_channel();
        let (second_tx, _second_rx) = mpsc::unbounded_channel();

        broker.register("s1", 1, &first_tx);
        assert!(broker.owns_session("s1", 1));
        broker.register("s1", 2, &second_tx);
        assert!(!broker.owns_session("s1", 1));
        assert!(broker.owns_session("s1", 2));
        assert!(!broker.owns_session("s2", 2));
    }

    #[test]
    fn create_nonce_for_unowned_session_still_replies() {
        let broker = Broker::new(Arc::new(NonceAuthority::default()));
        let (outbound, mut replies) = mpsc::unbounded_channel();
        let mut owned = HashSet::new();

        broker.handle_message(
            7,
            &outbound,
            &mut owned,
            ClientMessage::CreateNonce {
                session_id: "someone-else".to_string(),
                permission_id: "p1".to_string(),
            },
        );
        let line = replies.try_recv().expect("reply line");
        let Some(BrokerMessage::NonceCreated { permission_id, nonce }) = decode_line(&line) else {
            panic!("expected nonce_created, got {line}");
        };
        assert_eq!(permission_id, "p1");
        let claims = broker.nonces().peek(&nonce).expect("nonce valid");
        assert_eq!(claims.session_id, "someone-else");
    }

    #[tokio::test]
    async fn closing_active_connection_removes_binding() {
        let harness = start_broker().await;
        let (client, _responses) = client(&harness.path);
        client.connect("s1").await.expect("connect");
        assert!(harness.broker.is_registered("s1"));

        client.disconnect();
        let broker = harness.broker.clone();
        wait_until(move || !broker.is_registered("s1")).await;
        assert!(matches!(
            harness.broker.deliver("s1", "p1", Decision::Once),
            Err(RoutingError::SessionNotConnected(_))
        ));
    }

    #[tokio::test]
    async fn malformed_lines_do_not_close_connection() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let harness = start_broker().await;
        let stream = UnixStream::connect(&harness.path).await.expect("connect");
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(b"not json\n\n{\"type\":\"mystery\"}\n{\"type\":\"register\",\"sessionId\":\"s9\"}\n")
            .await
            .expect("write");
        let reply = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("in time")
            .expect("read")
            .expect("line");
        assert_eq!(
            decode_line::<BrokerMessage>(&reply),
            Some(BrokerMessage::Registered)
        );
        assert!(harness.broker.is_registered("s9"));
    }

    #[tokio::test]
    async fn create_nonce_without_register_is_served() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let harness = start_broker().await;
        let stream = UnixStream::connect(&harness.path).await.expect("connect");
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(b"{\"type\":\"create_nonce\",\"sessionId\":\"s2\",\"permissionId\":\"p7\"}\n")
            .await
            .expect("write");
        let reply = lines.next_line().await.expect("read").expect("line");
        let Some(BrokerMessage::NonceCreated {
            permission_id,
            nonce,
        }) = decode_line::<BrokerMessage>(&reply)
        else {
            panic!("expected nonce_created, got {reply}");
        };
        assert_eq!(permission_id, "p7");
        assert_eq!(
            harness.broker.nonces().peek(&nonce).expect("valid").session_id,
            "s2"
        );
    }

    #[tokio::test]
    async fn second_broker_refuses_live_socket_but_replaces_stale_one() {
        let harness = start_broker().await;
        assert!(bind_socket(&harness.path).await.is_err());

        harness.shutdown.cancel();
        let dir = TempDir::new().expect("tempdir");
        let stale = dir.path().join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&stale).expect("bind stale"));
        assert!(stale.exists());
        let listener = bind_socket(&stale).await.expect("rebind over stale socket");
        let mode = std::fs::metadata(&stale).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        drop(listener);
    }
}
