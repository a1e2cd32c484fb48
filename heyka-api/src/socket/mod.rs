// Copyright 2023 Heyka, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, Mutex as AsyncMutex, RwLock as AsyncRwLock},
    task::JoinHandle,
    time::timeout,
};

use crate::{bootstrap::Bootstrap, error_handler::ErrorHandler, tokens::TokenStore};

mod stream;

pub use stream::SocketEvent;
use stream::{Frame, SocketStream};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

pub type SocketResult<T> = Result<T, SocketError>;

#[derive(Error, Debug)]
pub enum SocketError {
    #[error("websocket failure: {0}")]
    WsError(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to parse the url: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("failed to encode frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Timeout(String),
    #[error("failed to send frame to the server")]
    SendError,
    #[error("not connected")]
    NotConnected,
    #[error("authorization rejected: {0}")]
    AuthRejected(String),
    #[error("initial bootstrap is in progress")]
    InitialInProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
}

/// Per-session authorization parameters.
///
/// `reuse_session` asks the broker to migrate the previous socket's state
/// (e.g. channel membership) to the new connection; it only makes sense
/// while the user sits in a channel.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub workspace_id: String,
    pub online_status: String,
    pub reuse_session: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthRequest<'a> {
    transaction: &'static str,
    workspace_id: &'a str,
    token: &'a str,
    online_status: &'a str,
    prev_socket_id: Option<&'a str>,
}

/// Events surfaced to the application layer.
#[derive(Debug)]
pub enum ChannelEvent {
    Connected { socket_id: String },
    Authenticated { data: Value },
    Disconnected,
    /// Broker push the client does not interpret itself.
    Server { name: String, data: Value },
}

pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Realtime socket client.
///
/// Owns one [SocketStream] at a time and drives the
/// connect -> authorize -> authenticated lifecycle over it. Reconnection is
/// single-flight and vetoed while the initial bootstrap runs.
#[derive(Clone)]
pub struct SocketClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    url: url::Url,
    tokens: TokenStore,
    bootstrap: Bootstrap,
    errors: ErrorHandler,

    state: Mutex<SocketState>,
    auth: Mutex<AuthContext>,
    socket_id: Mutex<Option<String>>,
    prev_socket_id: Mutex<Option<String>>,

    stream: AsyncRwLock<Option<SocketStream>>,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
    pending_welcome: Mutex<Option<oneshot::Sender<String>>>,
    pending_auth: Mutex<Option<oneshot::Sender<Result<Value, String>>>>,

    // Serializes connect attempts so concurrent callers share one handshake.
    connect_lock: AsyncMutex<()>,
    reconnecting: AtomicBool,

    emitter: mpsc::UnboundedSender<ChannelEvent>,
}

impl SocketClient {
    pub fn new(
        url: &str,
        tokens: TokenStore,
        bootstrap: Bootstrap,
        errors: ErrorHandler,
        auth: AuthContext,
    ) -> SocketResult<(Self, ChannelEvents)> {
        let (emitter, events) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            url: url::Url::parse(url)?,
            tokens,
            bootstrap,
            errors,
            state: Mutex::new(SocketState::Disconnected),
            auth: Mutex::new(auth),
            socket_id: Mutex::new(None),
            prev_socket_id: Mutex::new(None),
            stream: AsyncRwLock::new(None),
            dispatch_handle: Mutex::new(None),
            pending_welcome: Mutex::new(None),
            pending_auth: Mutex::new(None),
            connect_lock: AsyncMutex::new(()),
            reconnecting: AtomicBool::new(false),
            emitter,
        });

        Ok((Self { inner }, events))
    }

    pub fn state(&self) -> SocketState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.state(), SocketState::Disconnected | SocketState::Connecting)
    }

    /// Broker-assigned id of the current connection.
    pub fn socket_id(&self) -> Option<String> {
        self.inner.socket_id.lock().clone()
    }

    pub fn set_auth_context(&self, auth: AuthContext) {
        *self.inner.auth.lock() = auth;
    }

    /// Opens the transport and waits for the broker welcome.
    ///
    /// Safe to call concurrently: late callers wait for the in-flight
    /// attempt and return once a connection exists.
    pub async fn connect(&self) -> SocketResult<()> {
        let inner = &self.inner;
        let _guard = inner.connect_lock.lock().await;

        if self.is_connected() {
            return Ok(());
        }
        *inner.state.lock() = SocketState::Connecting;

        if let Some(handle) = inner.dispatch_handle.lock().take() {
            handle.abort();
        }

        let (welcome_tx, welcome_rx) = oneshot::channel();
        *inner.pending_welcome.lock() = Some(welcome_tx);

        let (emitter, events) = mpsc::unbounded_channel();
        let stream = match SocketStream::connect(inner.url.clone(), emitter).await {
            Ok(stream) => stream,
            Err(err) => {
                *inner.state.lock() = SocketState::Disconnected;
                inner.pending_welcome.lock().take();
                return Err(err);
            }
        };

        *inner.stream.write().await = Some(stream);
        *inner.dispatch_handle.lock() =
            Some(tokio::spawn(ClientInner::dispatch_task(inner.clone(), events)));

        match timeout(CONNECT_TIMEOUT, welcome_rx).await {
            Ok(Ok(socket_id)) => {
                *inner.state.lock() = SocketState::Connected;
                log::info!("socket connected, id {}", socket_id);
                let _ = inner.emitter.send(ChannelEvent::Connected { socket_id });
                Ok(())
            }
            _ => {
                inner.teardown().await;
                Err(SocketError::Timeout("the server never sent a welcome".to_owned()))
            }
        }
    }

    /// Sends the auth transaction and waits for the broker verdict.
    pub async fn authorize(&self) -> SocketResult<Value> {
        self.inner.authorize().await
    }

    /// Tears the connection down and builds a fresh authenticated one.
    ///
    /// No-op when another reconnect is already running. Refused while the
    /// initial bootstrap runs, the bootstrap performs its own connect.
    pub async fn reconnect(&self) -> SocketResult<()> {
        let inner = &self.inner;
        if inner.bootstrap.in_progress() {
            return Err(SocketError::InitialInProgress);
        }
        if inner
            .reconnecting
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            log::debug!("reconnect already in progress, skipping");
            return Ok(());
        }

        let result = async {
            self.destroy().await;
            self.connect().await?;
            self.authorize().await?;
            Ok(())
        }
        .await;

        inner.reconnecting.store(false, Ordering::Release);

        if let Err(err) = &result {
            inner.errors.handle(err);
        }
        result
    }

    /// Sends a named frame to the broker.
    pub async fn send(&self, event: &str, data: Value) -> SocketResult<()> {
        self.inner.send(Frame { event: event.to_owned(), data }).await
    }

    /// Closes the connection and drops all pending waiters. Idempotent.
    pub async fn destroy(&self) {
        self.inner.teardown().await;
    }
}

impl ClientInner {
    async fn send(&self, frame: Frame) -> SocketResult<()> {
        let stream = self.stream.read().await;
        stream.as_ref().ok_or(SocketError::NotConnected)?.send(frame).await
    }

    async fn authorize(self: &Arc<Self>) -> SocketResult<Value> {
        if matches!(
            *self.state.lock(),
            SocketState::Disconnected | SocketState::Connecting
        ) {
            return Err(SocketError::NotConnected);
        }

        let token = self
            .tokens
            .access_token()
            .await
            .ok_or_else(|| SocketError::AuthRejected("no access token".to_owned()))?;

        let auth = self.auth.lock().clone();
        let prev_socket_id =
            if auth.reuse_session { self.prev_socket_id.lock().clone() } else { None };

        *self.state.lock() = SocketState::Authenticating;
        let (auth_tx, auth_rx) = oneshot::channel();
        *self.pending_auth.lock() = Some(auth_tx);

        let request = AuthRequest {
            transaction: "auth",
            workspace_id: &auth.workspace_id,
            token: &token,
            online_status: &auth.online_status,
            prev_socket_id: prev_socket_id.as_deref(),
        };
        self.send(Frame { event: "auth".to_owned(), data: serde_json::to_value(&request)? })
            .await?;

        match timeout(AUTH_TIMEOUT, auth_rx).await {
            Ok(Ok(Ok(data))) => {
                log::info!("socket auth success");
                *self.state.lock() = SocketState::Authenticated;
                *self.prev_socket_id.lock() = self.socket_id.lock().clone();
                let _ = self.emitter.send(ChannelEvent::Authenticated { data: data.clone() });
                Ok(data)
            }
            Ok(Ok(Err(message))) => {
                self.auth_failed();
                Err(SocketError::AuthRejected(message))
            }
            Ok(Err(_)) => {
                self.auth_failed();
                Err(SocketError::NotConnected)
            }
            Err(_) => {
                self.pending_auth.lock().take();
                self.auth_failed();
                Err(SocketError::Timeout("the server never answered the auth".to_owned()))
            }
        }
    }

    /// Back to Connected after a failed auth, unless the transport died in
    /// the meantime; a Disconnected recorded by the dispatch task wins.
    fn auth_failed(&self) {
        let mut state = self.state.lock();
        if *state == SocketState::Authenticating {
            *state = SocketState::Connected;
        }
    }

    async fn dispatch_task(inner: Arc<Self>, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SocketEvent::Welcome { socket_id } => {
                    *inner.socket_id.lock() = Some(socket_id.clone());

                    if let Some(tx) = inner.pending_welcome.lock().take() {
                        let _ = tx.send(socket_id);
                    } else {
                        // The broker re-established the session on its own,
                        // authorize the new connection as the old one.
                        log::info!("unsolicited welcome, re-authorizing as {}", socket_id);
                        *inner.state.lock() = SocketState::Connected;
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            if let Err(err) = inner.authorize().await {
                                inner.errors.handle(&err);
                            }
                        });
                    }
                }
                SocketEvent::Event { name, data } => inner.handle_event(name, data),
                SocketEvent::Disconnected => {
                    log::info!("socket disconnected");
                    *inner.state.lock() = SocketState::Disconnected;
                    // Fail in-flight handshakes now instead of letting them
                    // ride out their timeouts against a dead stream.
                    inner.pending_welcome.lock().take();
                    inner.pending_auth.lock().take();
                    let _ = inner.emitter.send(ChannelEvent::Disconnected);
                }
            }
        }
    }

    fn handle_event(&self, name: String, data: Value) {
        match name.as_str() {
            "auth-success" => {
                if let Some(tx) = self.pending_auth.lock().take() {
                    let _ = tx.send(Ok(data));
                }
            }
            "auth-success-error" => {
                log::error!("socket auth error: {}", data);
                if let Some(tx) = self.pending_auth.lock().take() {
                    let message = data
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("authorization failed")
                        .to_owned();
                    let _ = tx.send(Err(message));
                }
            }
            _ => {
                let _ = self.emitter.send(ChannelEvent::Server { name, data });
            }
        }
    }

    async fn teardown(&self) {
        if let Some(handle) = self.dispatch_handle.lock().take() {
            handle.abort();
        }
        if let Some(stream) = self.stream.write().await.take() {
            stream.close().await;
        }

        *self.state.lock() = SocketState::Disconnected;
        self.socket_id.lock().take();
        self.pending_welcome.lock().take();
        self.pending_auth.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message};

    use super::*;
    use crate::{
        http_client::{ApiError, ApiResult},
        tokens::{MemoryTokenStorage, TokenPair, TokenRefresher},
    };

    struct NoRefresh;

    #[async_trait::async_trait]
    impl TokenRefresher for NoRefresh {
        async fn refresh(&self, _access: &str, _refresh: &str) -> ApiResult<TokenPair> {
            Err(ApiError::Timeout)
        }
    }

    fn far_future_ms() -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64 + 3_600_000
    }

    fn token_store() -> TokenStore {
        let store = TokenStore::new(
            Arc::new(NoRefresh),
            Arc::new(MemoryTokenStorage::new()),
            Default::default(),
            ErrorHandler::new(),
        );
        store.set_tokens(TokenPair {
            access_token: "test-access".into(),
            access_token_expired_at: far_future_ms(),
            refresh_token: "test-refresh".into(),
            refresh_token_expired_at: far_future_ms(),
        });
        store
    }

    fn auth_context() -> AuthContext {
        AuthContext {
            workspace_id: "ws-1".into(),
            online_status: "online".into(),
            reuse_session: false,
        }
    }

    /// Minimal broker: welcomes every connection and accepts any auth.
    /// Auth payloads are forwarded to the test for inspection.
    async fn spawn_broker(auth_seen: mpsc::UnboundedSender<Value>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut connection = 0u32;
            while let Ok((tcp, _)) = listener.accept().await {
                connection += 1;
                let socket_id = format!("sock-{connection}");
                let auth_seen = auth_seen.clone();

                tokio::spawn(async move {
                    let mut ws = accept_async(tcp).await.unwrap();
                    let welcome = serde_json::json!({
                        "event": "welcome",
                        "data": { "socketId": socket_id },
                    });
                    ws.send(Message::Text(welcome.to_string())).await.unwrap();

                    while let Some(Ok(msg)) = ws.next().await {
                        let Message::Text(text) = msg else { continue };
                        let frame: Value = serde_json::from_str(&text).unwrap();
                        if frame["event"] == "auth" {
                            let _ = auth_seen.send(frame["data"].clone());
                            let reply = serde_json::json!({
                                "event": "auth-success",
                                "data": { "onlineStatus": "online" },
                            });
                            let _ = ws.send(Message::Text(reply.to_string())).await;
                        }
                    }
                });
            }
        });

        format!("ws://{}", addr)
    }

    fn client(url: &str) -> (SocketClient, ChannelEvents) {
        let _ = env_logger::builder().is_test(true).try_init();
        SocketClient::new(url, token_store(), Bootstrap::new(), ErrorHandler::new(), auth_context())
            .unwrap()
    }

    /// Broker that welcomes and then drops the connection on the first auth
    /// frame, never answering it.
    async fn spawn_vanishing_broker() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = accept_async(tcp).await.unwrap();
                    let welcome = serde_json::json!({
                        "event": "welcome",
                        "data": { "socketId": "sock-1" },
                    });
                    ws.send(Message::Text(welcome.to_string())).await.unwrap();

                    while let Some(Ok(msg)) = ws.next().await {
                        let Message::Text(text) = msg else { continue };
                        let frame: Value = serde_json::from_str(&text).unwrap();
                        if frame["event"] == "auth" {
                            break;
                        }
                    }
                });
            }
        });

        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn connect_and_authorize() {
        let (auth_tx, mut auth_rx) = mpsc::unbounded_channel();
        let url = spawn_broker(auth_tx).await;
        let (client, _events) = client(&url);

        client.connect().await.unwrap();
        assert_eq!(client.state(), SocketState::Connected);
        assert_eq!(client.socket_id().as_deref(), Some("sock-1"));

        client.authorize().await.unwrap();
        assert_eq!(client.state(), SocketState::Authenticated);

        let payload = auth_rx.recv().await.unwrap();
        assert_eq!(payload["transaction"], "auth");
        assert_eq!(payload["workspaceId"], "ws-1");
        assert_eq!(payload["token"], "test-access");
        assert_eq!(payload["onlineStatus"], "online");
        assert_eq!(payload["prevSocketId"], Value::Null);

        client.destroy().await;
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (auth_tx, _auth_rx) = mpsc::unbounded_channel();
        let url = spawn_broker(auth_tx).await;
        let (client, _events) = client(&url);

        client.connect().await.unwrap();
        let first_id = client.socket_id();
        client.connect().await.unwrap();
        assert_eq!(client.socket_id(), first_id);

        client.destroy().await;
    }

    #[tokio::test]
    async fn destroy_twice_is_harmless() {
        let (auth_tx, _auth_rx) = mpsc::unbounded_channel();
        let url = spawn_broker(auth_tx).await;
        let (client, _events) = client(&url);

        client.connect().await.unwrap();
        client.destroy().await;
        client.destroy().await;
        assert_eq!(client.state(), SocketState::Disconnected);
    }

    #[tokio::test]
    async fn reconnect_reuses_previous_socket_id_in_call() {
        let (auth_tx, mut auth_rx) = mpsc::unbounded_channel();
        let url = spawn_broker(auth_tx).await;
        let (client, _events) = client(&url);
        client.set_auth_context(AuthContext { reuse_session: true, ..auth_context() });

        client.connect().await.unwrap();
        client.authorize().await.unwrap();
        let _ = auth_rx.recv().await.unwrap();

        client.reconnect().await.unwrap();
        let payload = auth_rx.recv().await.unwrap();
        assert_eq!(payload["prevSocketId"], "sock-1");

        client.destroy().await;
    }

    #[tokio::test]
    async fn transport_loss_during_auth_leaves_the_client_disconnected() {
        let url = spawn_vanishing_broker().await;
        let (client, mut events) = client(&url);

        client.connect().await.unwrap();
        assert!(client.authorize().await.is_err());

        // The dispatch task recorded the dead transport; the auth failure
        // path must not resurrect the state to Connected.
        assert_eq!(client.state(), SocketState::Disconnected);
        assert!(!client.is_connected());

        // And the application heard about it.
        loop {
            match events.recv().await.unwrap() {
                ChannelEvent::Disconnected => break,
                _ => continue,
            }
        }

        // A fresh connect is still possible against the same broker.
        client.connect().await.unwrap();
        assert_eq!(client.state(), SocketState::Connected);
        client.destroy().await;
    }

    #[tokio::test]
    async fn reconnect_is_vetoed_during_bootstrap() {
        let bootstrap = Bootstrap::new();
        bootstrap.set_in_progress(true);
        let (client, _events) = SocketClient::new(
            "ws://127.0.0.1:1",
            token_store(),
            bootstrap,
            ErrorHandler::new(),
            auth_context(),
        )
        .unwrap();

        assert!(matches!(client.reconnect().await, Err(SocketError::InitialInProgress)));
    }

    #[tokio::test]
    async fn authorize_requires_a_connection() {
        let (client, _events) = SocketClient::new(
            "ws://127.0.0.1:1",
            token_store(),
            Bootstrap::new(),
            ErrorHandler::new(),
            auth_context(),
        )
        .unwrap();

        assert!(matches!(client.authorize().await, Err(SocketError::NotConnected)));
    }
}
