//! Terminal output pump and attachment point.
//!
//! One task per session drains the terminal. Each chunk is appended to the
//! session's history and forwarded to the currently attached bridge, both
//! under one lock. Attaching snapshots the history and installs the new
//! bridge's queue under that same lock, so the replay and the live stream
//! neither overlap nor leave a gap.
//!
//! The queue to the bridge is bounded and the pump waits for room before
//! reading on, so a slow client slows the terminal down instead of growing
//! server memory.

use super::history::HistoryBuffer;
use super::pty::{is_hangup, TerminalReader};
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Upper bound on a single terminal read.
pub const READ_CHUNK: usize = 4096;

/// Chunks queued for an attached bridge before the pump waits.
pub const OUTPUT_QUEUE: usize = 64;

/// Why the output stream of a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEnd {
    /// The terminal reached end of stream (the shell exited).
    Eof,
    /// Reading the terminal failed.
    Failed(String),
    /// The session was closed through the registry.
    Closed,
    /// Another bridge attached to the session.
    Detached,
}

/// Handed to a bridge when it attaches.
///
/// Every chunk recorded before an `Eof` or `Failed` end is already queued in
/// `data` by the time `end` resolves.
#[derive(Debug)]
pub struct Attachment {
    /// History as of the instant of attaching.
    pub history: Vec<u8>,
    /// Everything produced after `history`.
    pub data: mpsc::Receiver<Vec<u8>>,
    /// Resolves once this attachment stops receiving output.
    pub end: oneshot::Receiver<OutputEnd>,
}

#[derive(Debug)]
struct Sink {
    data: mpsc::Sender<Vec<u8>>,
    end: oneshot::Sender<OutputEnd>,
}

#[derive(Debug, Default)]
struct OutputState {
    sink: Option<Sink>,
    /// Set once no further data will arrive.
    finished: Option<OutputEnd>,
}

impl OutputState {
    fn holds(&self, data: Option<&mpsc::Sender<Vec<u8>>>) -> bool {
        match (self.sink.as_ref(), data) {
            (Some(sink), Some(data)) => sink.data.same_channel(data),
            (None, None) => true,
            _ => false,
        }
    }
}

/// History plus the attachment slot of one session.
#[derive(Debug)]
pub struct SessionOutput {
    history: HistoryBuffer,
    state: Mutex<OutputState>,
}

impl SessionOutput {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: HistoryBuffer::new(capacity),
            state: Mutex::new(OutputState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    /// Record a chunk read from the terminal and forward it to the attached
    /// bridge, if any.
    ///
    /// Waits while the bridge's queue is full. If the attachment changes
    /// while waiting, the chunk goes to the new one instead.
    pub async fn record(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        loop {
            let data = self.state().sink.as_ref().map(|sink| sink.data.clone());
            let permit = match &data {
                Some(tx) => match tx.reserve().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        // Bridge went away without detaching.
                        let mut state = self.state();
                        if state.holds(Some(tx)) {
                            state.sink = None;
                        }
                        continue;
                    }
                },
                None => None,
            };

            let state = self.state();
            if !state.holds(data.as_ref()) {
                continue;
            }
            self.history.write(chunk);
            if let Some(permit) = permit {
                permit.send(chunk.to_vec());
            }
            return;
        }
    }

    /// Mark the stream as finished and tell the attached bridge.
    ///
    /// The first end wins; a later end (e.g. the reader hitting EOF after the
    /// session was closed) is ignored.
    pub fn finish(&self, end: OutputEnd) {
        let mut state = self.state();
        if state.finished.is_some() {
            return;
        }
        state.finished = Some(end.clone());
        if let Some(sink) = state.sink.take() {
            let _ = sink.end.send(end);
        }
    }

    /// Attach a new bridge, replacing (and notifying) any previous one.
    pub fn attach(&self) -> Attachment {
        let mut state = self.state();
        let history = self.history.snapshot();
        let (data_tx, data_rx) = mpsc::channel(OUTPUT_QUEUE);
        let (end_tx, end_rx) = oneshot::channel();

        if let Some(previous) = state.sink.take() {
            let _ = previous.end.send(OutputEnd::Detached);
        }

        match &state.finished {
            Some(end) => {
                let _ = end_tx.send(end.clone());
            }
            None => {
                state.sink = Some(Sink {
                    data: data_tx,
                    end: end_tx,
                })
            }
        }

        Attachment {
            history,
            data: data_rx,
            end: end_rx,
        }
    }

    /// Whether a bridge is currently receiving output.
    pub fn is_attached(&self) -> bool {
        self.state()
            .sink
            .as_ref()
            .is_some_and(|sink| !sink.data.is_closed())
    }
}

/// Start the task that drains a session's terminal into `output`.
///
/// Aborting the returned handle drops the reader, which releases the
/// terminal descriptor even if the read would never complete.
pub fn spawn_pump(
    session_id: &str,
    output: Arc<SessionOutput>,
    mut reader: TerminalReader,
) -> JoinHandle<()> {
    let id = session_id.to_string();
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        let end = loop {
            match reader.read(&mut buf).await {
                Ok(0) => break OutputEnd::Eof,
                Ok(n) => output.record(&buf[..n]).await,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_hangup(&e) => break OutputEnd::Eof,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "terminal read failed");
                    break OutputEnd::Failed(e.to_string());
                }
            }
        };
        debug!(session_id = %id, ?end, "output pump stopped");
        output.finish(end);
    })
}
