//! Persistent connection to the media server.
//!
//! One endpoint owns one WebSocket at a time. Requests are correlated by a
//! monotonically increasing id that is never reused; unsolicited requests
//! from the server are forwarded, in arrival order, on a channel the session
//! bridge consumes. When the connection dies the endpoint tears it down,
//! abandons every outstanding request, and retries the connect-and-login
//! sequence on a fixed delay until it sticks.

use super::protocol::{self, IncomingFrame, Request, Response};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const LOG: &str = "Verto/Endpoint";

/// How long to stay quiet after the connection drops before dialing again.
const RECONNECT_DELAY: Duration = Duration::from_secs(30);

const REQUEST_CHANNEL_CAPACITY: usize = 100;

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// Resolved with the response's `result`, or rejected with its `error`.
type ResponseWaiter = oneshot::Sender<Result<Value, Value>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected to the media server")]
    NotConnected,
    #[error("websocket error: {0}")]
    Socket(#[from] tungstenite::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("media server rejected the request: {0}")]
    Rpc(Value),
    #[error("connection was replaced before a response arrived")]
    ConnectionReplaced,
}

/// Media-server login credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub login: String,
    pub passwd: String,
}

/// An unsolicited request or notification from the media server.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: String,
    /// Present when the server expects a response frame echoing this id.
    pub id: Option<Value>,
    pub params: Value,
}

/// The surface the session bridge talks through. Abstracted so call
/// handling can be exercised against a recording stub.
#[async_trait]
pub trait VertoTransport: Send + Sync {
    /// Session identifier sent with login and every dialog.
    fn session_id(&self) -> &str;

    /// Sends a correlated request and waits for the matching response.
    async fn send_request(&self, method: &str, params: Value) -> Result<Value, TransportError>;

    /// Replies to a server-initiated request without creating a
    /// correlation entry.
    async fn send_response(&self, result: Value, id: Value) -> Result<(), TransportError>;
}

pub struct VertoEndpoint {
    url: String,
    session_id: String,
    ws_sink: Mutex<Option<WsSink>>,
    pending: DashMap<u64, ResponseWaiter>,
    next_request_id: AtomicU64,
    requests_tx: mpsc::Sender<IncomingRequest>,
    /// Set while a reconnect is already scheduled, so a flurry of
    /// error/close signals yields exactly one retry.
    quiet: AtomicBool,
    credentials: Mutex<Option<Credentials>>,
    /// Handle to ourselves for the read pump and reconnect tasks.
    weak_self: Weak<VertoEndpoint>,
}

impl VertoEndpoint {
    /// Creates a disconnected endpoint and the receiving end of its
    /// server-request channel.
    pub fn new(url: impl Into<String>) -> (Arc<Self>, mpsc::Receiver<IncomingRequest>) {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let endpoint = Arc::new_cyclic(|weak_self| Self {
            url: url.into(),
            session_id: protocol::generate_token(),
            ws_sink: Mutex::new(None),
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            requests_tx: tx,
            quiet: AtomicBool::new(false),
            credentials: Mutex::new(None),
            weak_self: weak_self.clone(),
        });
        (endpoint, rx)
    }

    /// Opens the transport and performs the login handshake as the first
    /// correlated request. An error here means the process should not keep
    /// serving; later connection losses are recovered internally with a
    /// fixed-delay retry.
    pub async fn connect(&self, credentials: Credentials) -> Result<(), TransportError> {
        *self.credentials.lock().await = Some(credentials.clone());
        self.quiet.store(false, Ordering::SeqCst);
        self.open_socket().await?;
        self.login(&credentials).await?;
        info!(target: LOG, "[{}]: logged in, sessid={}", self.url, self.session_id);
        Ok(())
    }

    async fn open_socket(&self) -> Result<(), TransportError> {
        info!(target: LOG, "[{}]: dialing", self.url);
        let (socket, _response) = connect_async(&self.url).await?;
        let (sink, stream) = socket.split();
        *self.ws_sink.lock().await = Some(sink);
        if let Some(endpoint) = self.weak_self.upgrade() {
            tokio::spawn(endpoint.read_pump(stream));
        }
        Ok(())
    }

    async fn login(&self, credentials: &Credentials) -> Result<(), TransportError> {
        self.send_request(
            "login",
            json!({
                "login": credentials.login,
                "passwd": credentials.passwd,
                "sessid": self.session_id,
            }),
        )
        .await?;
        Ok(())
    }

    async fn read_pump(self: Arc<Self>, mut stream: WsStream) {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()).await,
                Some(Ok(Message::Close(frame))) => {
                    warn!(target: LOG, "[{}]: CLOSE: {frame:?}", self.url);
                    break;
                }
                Some(Ok(_)) => {} // ping/pong/binary: nothing to do
                Some(Err(e)) => {
                    error!(target: LOG, "[{}]: ERROR: {e}", self.url);
                    break;
                }
                None => {
                    warn!(target: LOG, "[{}]: stream ended", self.url);
                    break;
                }
            }
        }
        self.schedule_reconnect().await;
    }

    /// Routes one inbound frame: a response to a pending request, a
    /// server-initiated request, or noise.
    async fn handle_frame(&self, text: &str) {
        debug!(target: LOG, "[{}]: <-- {text}", self.url);
        let frame: IncomingFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                error!(target: LOG, "Failed to parse frame {text}: {e}");
                return;
            }
        };

        if let Some(id) = frame.numeric_id() {
            if let Some((_, waiter)) = self.pending.remove(&id) {
                // The entry must go even if the waiter is gone: after a
                // media-server restart its request counter starts over, and
                // a stale correlation would swallow one of its requests.
                let outcome = match frame.error {
                    Some(error) => Err(error),
                    None => Ok(frame.result.unwrap_or(Value::Null)),
                };
                if waiter.send(outcome).is_err() {
                    warn!(target: LOG, "Response for request {id} arrived after the caller gave up");
                }
                return;
            }
        }

        if let Some(method) = frame.method {
            let request = IncomingRequest {
                method,
                id: frame.id,
                params: frame.params.unwrap_or(Value::Null),
            };
            if self.requests_tx.send(request).await.is_err() {
                error!(target: LOG, "Server request dropped: bridge receiver is gone");
            }
        } else {
            warn!(target: LOG, "Frame matches no pending request and carries no method; dropping");
        }
    }

    /// Tears the connection down and arms one retry after the fixed delay.
    /// Outstanding requests are abandoned, never retried.
    async fn schedule_reconnect(&self) {
        if self.quiet.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.ws_sink.lock().await = None;
        self.abandon_pending();

        let Some(endpoint) = self.weak_self.upgrade() else {
            // Endpoint is being dropped; no retry to arm.
            return;
        };
        reconnect::spawn(endpoint);
    }

    /// Dropping the waiters resolves every in-flight `send_request` with
    /// `ConnectionReplaced`.
    fn abandon_pending(&self) {
        let abandoned = self.pending.len();
        self.pending.clear();
        if abandoned > 0 {
            warn!(target: LOG, "Abandoned {abandoned} outstanding request(s)");
        }
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        debug!(target: LOG, "[{}]: --> {text}", self.url);
        let mut guard = self.ws_sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(Message::Text(text.into())).await?;
        Ok(())
    }
}

/// Reconnect task, kept in its own module so the spawned future — which
/// recurses back through `open_socket`/`read_pump`/`schedule_reconnect` — is
/// registered outside `open_socket`'s opaque-return defining scope. Without
/// this, the compiler cannot resolve the spawned task's `Send`-ness.
mod reconnect {
    use super::{LOG, RECONNECT_DELAY, VertoEndpoint};
    use log::{error, info, warn};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    pub(super) fn spawn(endpoint: Arc<VertoEndpoint>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RECONNECT_DELAY).await;
                endpoint.quiet.store(false, Ordering::SeqCst);
                let credentials = endpoint.credentials.lock().await.clone();
                let Some(credentials) = credentials else {
                    warn!(target: LOG, "No credentials recorded; cannot relogin");
                    return;
                };
                info!(target: LOG, "[{}]: reconnecting", endpoint.url);
                match endpoint.open_socket().await {
                    Ok(()) => {
                        match endpoint.login(&credentials).await {
                            Ok(()) => info!(target: LOG, "[{}]: relogin complete", endpoint.url),
                            // A dead socket reschedules through its read
                            // pump; a rejection on a live socket waits for
                            // the server to act.
                            Err(e) => {
                                error!(target: LOG, "[{}]: relogin failed: {e}", endpoint.url);
                            }
                        }
                        return;
                    }
                    Err(e) => {
                        error!(target: LOG, "[{}]: reconnect failed: {e}", endpoint.url);
                        if endpoint.quiet.swap(true, Ordering::SeqCst) {
                            // Another scheduler took over in the meantime.
                            return;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl VertoTransport for VertoEndpoint {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::to_string(&Request::new(method, params, id))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if let Err(e) = self.send_text(frame).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(fault)) => Err(TransportError::Rpc(fault)),
            Err(_) => Err(TransportError::ConnectionReplaced),
        }
    }

    async fn send_response(&self, result: Value, id: Value) -> Result<(), TransportError> {
        let frame = serde_json::to_string(&Response::new(result, id))?;
        self.send_text(frame).await
    }
}
