//! PTY spawning using portable-pty.
//!
//! The registry only sees the [`Spawner`] trait so that tests can substitute
//! an in-memory terminal. Terminal reads and writes are async: the master
//! descriptor is switched to non-blocking mode and driven through tokio's
//! reactor, so dropping the handles is enough to release it.

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use termhub_core::{TermError, TermResult};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info};

/// Initial geometry of every new terminal. A 1-column terminal makes many
/// CLI programs wrap after every character.
pub const INITIAL_COLS: u16 = 120;
pub const INITIAL_ROWS: u16 = 30;

/// Output side of a terminal, owned by the session's output pump.
pub type TerminalReader = Box<dyn AsyncRead + Send + Unpin>;
/// Input side of a terminal, owned by the session's input writer.
pub type TerminalWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// What to run and how.
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    pub shell: &'a str,
    pub env: &'a [(String, String)],
    pub cols: u16,
    pub rows: u16,
}

/// Out-of-band operations on a running terminal.
pub trait TerminalControl: Send {
    fn resize(&mut self, cols: u16, rows: u16) -> TermResult<()>;

    /// OS process id of the shell, if known.
    fn pid(&self) -> Option<u32>;

    /// Close the terminal device and kill the process. May block while the
    /// process is reaped.
    fn shutdown(&mut self) -> TermResult<()>;
}

/// The three handles of a freshly spawned terminal.
///
/// `reader` is moved into the output pump and `writer` into the input
/// writer; `control` stays with the session.
pub struct SpawnedTerminal {
    pub reader: TerminalReader,
    pub writer: TerminalWriter,
    pub control: Box<dyn TerminalControl>,
}

/// Starts processes attached to a terminal device.
///
/// Called from a blocking context that has the tokio runtime entered.
pub trait Spawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest<'_>) -> TermResult<SpawnedTerminal>;
}

/// [`Spawner`] backed by the platform's native PTY.
#[derive(Debug, Default)]
pub struct PtySpawner;

impl Spawner for PtySpawner {
    fn spawn(&self, request: &SpawnRequest<'_>) -> TermResult<SpawnedTerminal> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows: request.rows,
            cols: request.cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| TermError::ProcessSpawnFailed(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(request.shell);
        cmd.env_clear();
        for (key, value) in request.env {
            cmd.env(key, value);
        }
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
            TermError::ProcessSpawnFailed(format!("failed to spawn {}: {e}", request.shell))
        })?;
        // The slave end belongs to the child now; keeping it open would stop
        // the master from ever seeing end-of-stream.
        drop(pair.slave);

        let pid = child.process_id();
        let io = match PtyIo::from_master(&*pair.master) {
            Ok(io) => io,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TermError::ProcessSpawnFailed(format!(
                    "failed to register PTY with the reactor: {e}"
                )));
            }
        };
        info!(shell = request.shell, pid, cols = request.cols, rows = request.rows, "PTY spawned");

        let (reader, writer) = tokio::io::split(io);
        Ok(SpawnedTerminal {
            reader: Box::new(reader),
            writer: Box::new(writer),
            control: Box::new(PtyControl {
                master: Some(pair.master),
                child,
                pid,
            }),
        })
    }
}

/// Non-blocking duplicate of the PTY master registered with the reactor.
///
/// The duplicate shares the master's open file description, so closing it
/// together with the master hangs up the terminal.
struct PtyIo {
    fd: AsyncFd<File>,
}

impl PtyIo {
    fn from_master(master: &(dyn MasterPty + Send)) -> io::Result<Self> {
        let raw = master
            .as_raw_fd()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "PTY master has no fd"))?;
        // SAFETY: `raw` is owned by `master`, which outlives this borrow.
        let owned: OwnedFd = unsafe { BorrowedFd::borrow_raw(raw) }.try_clone_to_owned()?;
        set_nonblocking(&owned)?;
        Ok(Self {
            fd: AsyncFd::new(File::from(owned))?,
        })
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: fcntl on a descriptor we own.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl AsyncRead for PtyIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for PtyIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A PTY master reports EIO once the last slave descriptor is gone, which is
/// how end of stream looks on Linux.
pub fn is_hangup(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EIO)
}

struct PtyControl {
    /// `None` once shut down.
    master: Option<Box<dyn MasterPty + Send>>,
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
}

impl TerminalControl for PtyControl {
    fn resize(&mut self, cols: u16, rows: u16) -> TermResult<()> {
        let master = self
            .master
            .as_ref()
            .ok_or_else(|| TermError::Other("terminal closed".into()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TermError::Other(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn shutdown(&mut self) -> TermResult<()> {
        drop(self.master.take());
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(pid = self.pid, code = status.exit_code(), "PTY child already exited");
            return Ok(());
        }
        self.child
            .kill()
            .map_err(|e| TermError::Other(format!("kill failed: {e}")))?;
        // Reap so the child does not linger as a zombie.
        let status = self
            .child
            .wait()
            .map_err(|e| TermError::Other(format!("wait failed: {e}")))?;
        info!(pid = self.pid, code = status.exit_code(), "PTY child terminated");
        Ok(())
    }
}
