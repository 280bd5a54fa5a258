//! Terminal connection messages.
//!
//! Every frame on a terminal connection is one JSON object tagged by `type`.
//! Client and server directions are separate enums so that a message can only
//! travel the way it is meant to.

use serde::{Deserialize, Serialize};

/// Messages sent by the client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Keystrokes to write to the terminal verbatim.
    Input { data: String },
    /// New terminal geometry. Non-positive values are ignored by the server.
    Resize { cols: i64, rows: i64 },
    /// Keepalive; answered with [`ServerMessage::Pong`].
    Ping,
}

/// Messages sent by the server to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Terminal output (or replayed history).
    Output { data: String },
    Pong,
    /// The bridge ended; `data` carries a human-readable reason.
    Exit { data: String },
}

impl ServerMessage {
    pub fn output(data: impl Into<String>) -> Self {
        ServerMessage::Output { data: data.into() }
    }

    pub fn exit(reason: impl Into<String>) -> Self {
        ServerMessage::Exit {
            data: reason.into(),
        }
    }
}

impl ClientMessage {
    /// Geometry carried by a resize message, if both dimensions are usable.
    ///
    /// Returns `None` for non-resize messages and for dimensions that are
    /// zero, negative, or too large for a terminal.
    pub fn geometry(&self) -> Option<(u16, u16)> {
        match *self {
            ClientMessage::Resize { cols, rows } if cols > 0 && rows > 0 => {
                let cols = u16::try_from(cols).ok()?;
                let rows = u16::try_from(rows).ok()?;
                Some((cols, rows))
            }
            _ => None,
        }
    }
}
