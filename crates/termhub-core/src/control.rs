//! Control connection protocol: session management requests.
//!
//! A control connection carries one JSON request per frame, tagged by `op`,
//! and receives exactly one response per request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A session management request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ControlRequest {
    Create,
    List,
    Close { session_id: String },
    Rename { session_id: String, name: String },
    Cwd { session_id: String },
    Health,
}

/// Listing entry for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub display_index: u64,
    pub last_active: DateTime<Utc>,
}

/// Response to a [`ControlRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlResponse {
    Created {
        ok: bool,
        session_id: String,
        name: String,
        display_index: u64,
        ws_path: String,
    },
    Sessions {
        ok: bool,
        sessions: Vec<SessionInfo>,
    },
    Cwd {
        ok: bool,
        cwd: String,
    },
    Health {
        ok: bool,
        ts: i64,
    },
    Failed {
        ok: bool,
        message: String,
    },
    Ok {
        ok: bool,
    },
}

impl ControlResponse {
    pub fn ok() -> Self {
        ControlResponse::Ok { ok: true }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ControlResponse::Failed {
            ok: false,
            message: message.into(),
        }
    }
}

/// Path a client connects to in order to attach to `session_id`.
pub fn terminal_path(session_id: &str) -> String {
    format!("/api/ws?session_id={session_id}")
}
