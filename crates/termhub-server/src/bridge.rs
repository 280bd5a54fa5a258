//! Stream bridge: one client connection attached to one session's terminal.
//!
//! On attach the session's history is replayed as a single `output` message,
//! then terminal output and client messages are forwarded concurrently until
//! either side ends, the session is closed, another client takes over, or the
//! caller cancels.
//!
//! Input is handed to the session's writer queue. While that queue is full the
//! bridge stops reading client messages but keeps serving output, takeover,
//! close and cancellation.

use crate::session::output::Attachment;
use crate::session::{OutputEnd, Session};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::future::Future;
use std::io;
use termhub_core::{ClientMessage, ServerMessage, TermError, TermResult, Utf8Decoder};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

/// How a bridge ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEnd {
    /// The terminal reached end of stream.
    ProcessExited,
    /// The session was closed through the registry.
    SessionClosed,
    /// The client closed the connection.
    ClientClosed,
    /// The caller's cancellation fired (server shutdown).
    Cancelled,
}

impl BridgeEnd {
    /// Reason to send to the client in an `exit` message, if it is still
    /// listening.
    pub fn exit_reason(self) -> Option<&'static str> {
        match self {
            BridgeEnd::ProcessExited => Some("process exited"),
            BridgeEnd::SessionClosed => Some("session closed"),
            BridgeEnd::Cancelled => Some("server shutdown"),
            BridgeEnd::ClientClosed => None,
        }
    }
}

/// Run the bridge until the first terminal event.
///
/// Errors (`Io`, `Transport`, `InvalidMessage`, `Detached`) are for the caller
/// to report to the client as an `exit` message. The session itself stays
/// registered and can be attached again.
pub async fn run_bridge<Tx, Rx, C>(
    session: &Session,
    tx: &mut Tx,
    rx: &mut Rx,
    cancel: C,
) -> TermResult<BridgeEnd>
where
    Tx: Sink<ServerMessage, Error = TermError> + Unpin,
    Rx: Stream<Item = TermResult<ClientMessage>> + Unpin,
    C: Future<Output = ()>,
{
    session.touch();
    if session.output().is_attached() {
        info!(session_id = %session.id(), "taking over attached session");
    }
    let Attachment {
        history,
        mut data,
        mut end,
    } = session.output().attach();
    let mut utf8 = Utf8Decoder::new();

    if !history.is_empty() {
        debug!(session_id = %session.id(), bytes = history.len(), "replaying history");
        forward(tx, &mut utf8, &history).await?;
    }

    tokio::pin!(cancel);
    let mut data_open = true;
    // Input the writer queue had no room for yet.
    let mut pending_input: Option<Vec<u8>> = None;

    loop {
        tokio::select! {
            _ = &mut cancel => {
                return Ok(BridgeEnd::Cancelled);
            }

            chunk = data.recv(), if data_open => {
                match chunk {
                    Some(chunk) => forward(tx, &mut utf8, &chunk).await?,
                    None => data_open = false,
                }
            }

            ended = &mut end => {
                // A dropped end sender means the session went away.
                let ended = ended.unwrap_or(OutputEnd::Closed);
                if ended != OutputEnd::Detached {
                    while let Ok(chunk) = data.try_recv() {
                        forward(tx, &mut utf8, &chunk).await?;
                    }
                    let tail = utf8.finish();
                    if !tail.is_empty() {
                        tx.send(ServerMessage::output(tail)).await?;
                    }
                }
                return finish(ended);
            }

            permit = session.input().reserve(), if pending_input.is_some() => {
                let permit = permit.map_err(|_| terminal_closed())?;
                if let Some(bytes) = pending_input.take() {
                    permit.send(bytes);
                }
            }

            msg = rx.next(), if pending_input.is_none() => {
                match msg {
                    Some(Ok(msg)) => {
                        session.touch();
                        if let Some(bytes) = handle_client_message(session, tx, msg).await? {
                            match session.input().try_send(bytes) {
                                Ok(()) => {}
                                Err(TrySendError::Full(bytes)) => pending_input = Some(bytes),
                                Err(TrySendError::Closed(_)) => return Err(terminal_closed()),
                            }
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(BridgeEnd::ClientClosed),
                }
            }
        }
    }
}

async fn forward<Tx>(tx: &mut Tx, utf8: &mut Utf8Decoder, chunk: &[u8]) -> TermResult<()>
where
    Tx: Sink<ServerMessage, Error = TermError> + Unpin,
{
    let text = utf8.push(chunk);
    if !text.is_empty() {
        tx.send(ServerMessage::output(text)).await?;
    }
    Ok(())
}

/// Answer a client message. Returns the bytes to write to the terminal, if
/// any.
async fn handle_client_message<Tx>(
    session: &Session,
    tx: &mut Tx,
    msg: ClientMessage,
) -> TermResult<Option<Vec<u8>>>
where
    Tx: Sink<ServerMessage, Error = TermError> + Unpin,
{
    match msg {
        ClientMessage::Input { data } => {
            if !data.is_empty() {
                return Ok(Some(data.into_bytes()));
            }
        }
        ClientMessage::Resize { .. } => match msg.geometry() {
            Some((cols, rows)) => {
                if let Err(e) = session.resize(cols, rows) {
                    debug!(session_id = %session.id(), error = %e, "resize failed");
                }
            }
            None => debug!(session_id = %session.id(), ?msg, "ignoring resize"),
        },
        ClientMessage::Ping => tx.send(ServerMessage::Pong).await?,
    }
    Ok(None)
}

fn terminal_closed() -> TermError {
    TermError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "terminal closed"))
}

fn finish(end: OutputEnd) -> TermResult<BridgeEnd> {
    match end {
        OutputEnd::Eof => Ok(BridgeEnd::ProcessExited),
        OutputEnd::Closed => Ok(BridgeEnd::SessionClosed),
        OutputEnd::Detached => Err(TermError::Detached),
        OutputEnd::Failed(reason) => Err(TermError::Io(io::Error::new(io::ErrorKind::Other, reason))),
    }
}
