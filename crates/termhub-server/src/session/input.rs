//! Terminal input writer.
//!
//! Client keystrokes are queued to a per-session task that owns the terminal's
//! write side. A program that stops reading its input therefore stalls only
//! this task, never the bridge that queued the bytes.

use super::pty::{is_hangup, TerminalWriter};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Input chunks queued before senders have to wait.
pub const INPUT_QUEUE: usize = 256;

/// Start the writer task. Dropping every sender, or aborting the handle,
/// ends it.
pub fn spawn_writer(
    session_id: &str,
    mut writer: TerminalWriter,
) -> (mpsc::Sender<Vec<u8>>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE);
    let id = session_id.to_string();
    let handle = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            let result = match writer.write_all(&data).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                if is_hangup(&e) {
                    debug!(session_id = %id, "terminal hung up, input writer stopping");
                } else {
                    warn!(session_id = %id, error = %e, "terminal write failed");
                }
                break;
            }
        }
        debug!(session_id = %id, "input writer stopped");
    });
    (tx, handle)
}
