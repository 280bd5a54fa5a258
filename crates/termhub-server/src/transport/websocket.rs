//! WebSocket listener using tokio-tungstenite.
//!
//! The upgrade request's URI is routed before the handshake completes, so a
//! request for an unknown session is refused with a plain HTTP error instead
//! of an upgraded connection that immediately closes.

use futures_util::future;
use futures_util::stream::{self, SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use termhub_core::{codec, ServerMessage, TermError, TermResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

pub type WsStream = WebSocketStream<TcpStream>;

/// Maximum size of one inbound message (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Limits applied while reading, before a message is buffered in full.
fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_WS_FRAME_SIZE),
        max_frame_size: Some(MAX_WS_FRAME_SIZE),
        ..Default::default()
    }
}

/// Why an upgrade request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub message: String,
}

impl Rejection {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.message));
        *response.status_mut() = self.status;
        response
    }
}

/// An accepted WebSocket connection and the route it was upgraded for.
pub struct WebSocketConnection<R> {
    pub ws_stream: WsStream,
    pub remote_addr: SocketAddr,
    pub route: R,
}

/// A running listener: accepted connections plus the accept task.
pub struct Listener<R> {
    pub local_addr: SocketAddr,
    pub connections: mpsc::Receiver<WebSocketConnection<R>>,
    accept_task: JoinHandle<()>,
}

impl<R> Listener<R> {
    /// Stop accepting and release the listening socket.
    pub async fn stop(self) {
        self.accept_task.abort();
        let _ = self.accept_task.await;
    }
}

/// Start the WebSocket listener.
///
/// `router` sees each upgrade request's URI; returning a [`Rejection`]
/// refuses the upgrade.
pub async fn start_listener<R, F>(bind_addr: SocketAddr, router: F) -> TermResult<Listener<R>>
where
    R: Send + 'static,
    F: Fn(&Uri) -> Result<R, Rejection> + Send + Sync + 'static,
{
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| TermError::Transport(format!("WS bind failed: {e}")))?;

    let local_addr = tcp_listener
        .local_addr()
        .map_err(|e| TermError::Transport(format!("WS bind failed: {e}")))?;
    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection<R>>(64);
    let router = Arc::new(router);

    let accept_task = tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let router = router.clone();
                    tokio::spawn(async move {
                        let mut route = None;
                        let callback = |request: &Request, response: Response| {
                            match router(request.uri()) {
                                Ok(r) => {
                                    route = Some(r);
                                    Ok(response)
                                }
                                Err(rejection) => {
                                    debug!(
                                        remote = %addr,
                                        uri = %request.uri(),
                                        status = %rejection.status,
                                        "upgrade refused"
                                    );
                                    Err(rejection.into_response())
                                }
                            }
                        };
                        let accepted = tokio_tungstenite::accept_hdr_async_with_config(
                            stream,
                            callback,
                            Some(ws_config()),
                        )
                        .await;
                        match accepted {
                            Ok(ws_stream) => {
                                let Some(route) = route else { return };
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    route,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                debug!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(Listener {
        local_addr,
        connections: rx,
        accept_task,
    })
}

/// Percent-decoded value of `key` in the URI's query string.
///
/// A value that does not decode to UTF-8 counts as absent.
pub fn query_param<'a>(uri: &'a Uri, key: &str) -> Option<Cow<'a, str>> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| urlencoding::decode(v).ok())
}

/// Receive and decode the next JSON message.
///
/// Returns `None` once the peer has closed the connection. Control frames
/// (ping/pong) are answered by tungstenite and skipped here.
pub async fn recv_json<T: DeserializeOwned>(
    stream: &mut SplitStream<WsStream>,
) -> TermResult<Option<T>> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return codec::decode(&text).map(Some),
            Some(Ok(Message::Binary(data))) => return codec::decode_bytes(&data).map(Some),
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
            Some(Err(WsError::Capacity(e))) => {
                return Err(TermError::InvalidMessage(format!(
                    "WS frame too large: {e} (max {MAX_WS_FRAME_SIZE})"
                )));
            }
            Some(Err(e)) => {
                return Err(TermError::Transport(format!("WS recv failed: {e}")));
            }
        }
    }
}

/// Decoded inbound messages as a stream; ends when the peer closes.
pub fn message_stream<T>(
    stream: SplitStream<WsStream>,
) -> Pin<Box<dyn Stream<Item = TermResult<T>> + Send>>
where
    T: DeserializeOwned + Send + 'static,
{
    Box::pin(stream::unfold(stream, |mut stream| async move {
        match recv_json::<T>(&mut stream).await {
            Ok(Some(msg)) => Some((Ok(msg), stream)),
            Ok(None) => None,
            Err(e) => Some((Err(e), stream)),
        }
    }))
}

/// Outbound half that accepts [`ServerMessage`]s and sends them as JSON text.
pub fn message_sink(
    sink: SplitSink<WsStream, Message>,
) -> impl Sink<ServerMessage, Error = TermError> + Unpin {
    json_sink(sink)
}

/// Outbound half for any serializable message type.
pub fn json_sink<T: serde::Serialize>(
    sink: SplitSink<WsStream, Message>,
) -> impl Sink<T, Error = TermError> + Unpin {
    sink.sink_map_err(|e| TermError::Transport(format!("WS send failed: {e}")))
        .with(|msg: T| future::ready(codec::encode(&msg).map(|text| Message::Text(text.into()))))
}
