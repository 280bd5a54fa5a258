//! In-memory terminal used by tests in place of a real PTY.
//!
//! Each fake terminal is a pair of in-memory pipes. Shutting one down only
//! records the call: like a shell whose background job still holds the
//! terminal, it keeps its ends open, so the session must release its own
//! ends to stop reading and writing.

use super::pty::{SpawnRequest, SpawnedTerminal, Spawner, TerminalControl};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use termhub_core::{TermError, TermResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct FakeShared {
    resizes: Mutex<Vec<(u16, u16)>>,
    shutdowns: AtomicUsize,
}

/// Test-side handle on one fake terminal: the "process" end of its pipes.
#[derive(Clone)]
pub struct FakeTerminal {
    output: Arc<tokio::sync::Mutex<Option<DuplexStream>>>,
    input: Arc<tokio::sync::Mutex<DuplexStream>>,
    shared: Arc<FakeShared>,
}

impl FakeTerminal {
    /// Make the "process" print `bytes`. Fails once the session has let go
    /// of the terminal.
    pub async fn emit(&self, bytes: &[u8]) -> io::Result<()> {
        match self.output.lock().await.as_mut() {
            Some(out) => out.write_all(bytes).await,
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "hung up")),
        }
    }

    /// Make the "process" exit: the reader sees end of stream.
    pub async fn hang_up(&self) {
        self.output.lock().await.take();
    }

    /// Wait for exactly `len` bytes of input to reach the terminal.
    pub async fn read_input(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let mut input = self.input.lock().await;
        tokio::time::timeout(Duration::from_secs(2), input.read_exact(&mut buf))
            .await
        .expect("timed out waiting for terminal input")
        .expect("terminal input closed");
        buf
    }

    /// Whether the session's input writer has let go of the terminal.
    pub async fn input_closed(&self) -> bool {
        let mut buf = [0u8; 1];
        let mut input = self.input.lock().await;
        let read = tokio::time::timeout(Duration::from_millis(500), input.read(&mut buf)).await;
        matches!(read, Ok(Ok(0)))
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.shared.resizes.lock().unwrap().clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.shared.shutdowns.load(Ordering::SeqCst)
    }
}

struct FakeControl(Arc<FakeShared>);

impl TerminalControl for FakeControl {
    fn resize(&mut self, cols: u16, rows: u16) -> TermResult<()> {
        self.0.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        // The test process itself, so cwd lookups have something to inspect.
        Some(std::process::id())
    }

    fn shutdown(&mut self) -> TermResult<()> {
        self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records each spawn request and hands out [`FakeTerminal`]s.
#[derive(Default)]
pub struct FakeSpawner {
    terminals: Mutex<Vec<FakeTerminal>>,
    requests: Mutex<Vec<(String, Vec<(String, String)>, u16, u16)>>,
    fail_next: AtomicBool,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Terminal of the `n`th successful spawn.
    pub fn terminal(&self, n: usize) -> FakeTerminal {
        self.terminals.lock().unwrap()[n].clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.terminals.lock().unwrap().len()
    }

    /// (shell, env, cols, rows) of the last request.
    pub fn last_request(&self) -> Option<(String, Vec<(String, String)>, u16, u16)> {
        self.requests.lock().unwrap().last().cloned()
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, request: &SpawnRequest<'_>) -> TermResult<SpawnedTerminal> {
        self.requests.lock().unwrap().push((
            request.shell.to_string(),
            request.env.to_vec(),
            request.cols,
            request.rows,
        ));
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TermError::ProcessSpawnFailed("no such shell".into()));
        }

        let (reader, process_out) = tokio::io::duplex(PIPE_CAPACITY);
        let (writer, process_in) = tokio::io::duplex(PIPE_CAPACITY);
        let shared = Arc::new(FakeShared::default());
        self.terminals.lock().unwrap().push(FakeTerminal {
            output: Arc::new(tokio::sync::Mutex::new(Some(process_out))),
            input: Arc::new(tokio::sync::Mutex::new(process_in)),
            shared: shared.clone(),
        });

        Ok(SpawnedTerminal {
            reader: Box::new(reader),
            writer: Box::new(writer),
            control: Box::new(FakeControl(shared)),
        })
    }
}
