//! Session control requests: create, list, close, rename, cwd.
//!
//! This is the only place that validates user-supplied session names; the
//! registry itself accepts anything.

use crate::session::{generate_session_id, SessionRegistry};
use termhub_core::control::terminal_path;
use termhub_core::{ControlRequest, ControlResponse, TermError, TermResult};
use tracing::debug;

/// Execute one control request against the registry.
pub async fn dispatch(registry: &SessionRegistry, request: ControlRequest) -> ControlResponse {
    debug!(?request, "control request");
    match execute(registry, request).await {
        Ok(response) => response,
        Err(e) => ControlResponse::failed(e.to_string()),
    }
}

async fn execute(registry: &SessionRegistry, request: ControlRequest) -> TermResult<ControlResponse> {
    match request {
        ControlRequest::Create => {
            let session_id = generate_session_id();
            let session = registry.create_session(session_id.clone()).await?;
            Ok(ControlResponse::Created {
                ok: true,
                ws_path: terminal_path(&session_id),
                name: session.name(),
                display_index: session.display_index(),
                session_id,
            })
        }
        ControlRequest::List => Ok(ControlResponse::Sessions {
            ok: true,
            sessions: registry.list_sessions(),
        }),
        ControlRequest::Close { session_id } => {
            require("session_id", &session_id)?;
            registry.close_session(&session_id).await?;
            Ok(ControlResponse::ok())
        }
        ControlRequest::Rename { session_id, name } => {
            require("session_id", &session_id)?;
            require("name", &name)?;
            registry.rename_session(&session_id, name)?;
            Ok(ControlResponse::ok())
        }
        ControlRequest::Cwd { session_id } => {
            require("session_id", &session_id)?;
            let cwd = registry.working_dir(&session_id)?;
            Ok(ControlResponse::Cwd {
                ok: true,
                cwd: cwd.to_string_lossy().into_owned(),
            })
        }
        ControlRequest::Health => Ok(ControlResponse::Health {
            ok: true,
            ts: chrono::Utc::now().timestamp(),
        }),
    }
}

fn require(field: &str, value: &str) -> TermResult<()> {
    if value.trim().is_empty() {
        return Err(TermError::InvalidMessage(format!("{field} required")));
    }
    Ok(())
}
