//! Session lifecycle management.
//!
//! The registry is the only owner of live sessions: it creates them, names
//! them, orders them for display, and is the single teardown path.

use super::output::{self, OutputEnd, SessionOutput};
use super::pty::{SpawnRequest, SpawnedTerminal, Spawner, TerminalControl, INITIAL_COLS, INITIAL_ROWS};
use super::{env, input};
use chrono::{DateTime, Local, NaiveDate, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use termhub_core::{SessionInfo, TermError, TermResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Source of the calendar date used in session names.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// The server's local date.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

#[derive(Debug)]
struct SessionMeta {
    name: String,
    last_active: DateTime<Utc>,
}

/// One shell process on its own terminal, plus its output history.
pub struct Session {
    id: String,
    display_index: u64,
    meta: Mutex<SessionMeta>,
    output: Arc<SessionOutput>,
    input: mpsc::Sender<Vec<u8>>,
    control: Mutex<Option<Box<dyn TerminalControl>>>,
    /// Output pump and input writer; aborted on teardown.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A spawned terminal whose I/O tasks are running but which is not yet
/// registered.
struct Started {
    output: Arc<SessionOutput>,
    input: mpsc::Sender<Vec<u8>>,
    control: Box<dyn TerminalControl>,
    tasks: Vec<JoinHandle<()>>,
}

impl Started {
    fn new(id: &str, buffer_size: usize, terminal: SpawnedTerminal) -> Self {
        let SpawnedTerminal {
            reader,
            writer,
            control,
        } = terminal;
        let output = Arc::new(SessionOutput::new(buffer_size));
        let pump = output::spawn_pump(id, output.clone(), reader);
        let (input, writer_task) = input::spawn_writer(id, writer);
        Self {
            output,
            input,
            control,
            tasks: vec![pump, writer_task],
        }
    }

    /// Undo a start that lost a registration race.
    async fn discard(self, id: &str) {
        self.output.finish(OutputEnd::Closed);
        stop_tasks(self.tasks).await;
        let mut control = self.control;
        let id = id.to_string();
        let released = tokio::task::spawn_blocking(move || control.shutdown()).await;
        if !matches!(released, Ok(Ok(()))) {
            warn!(session_id = %id, "failed to release unregistered terminal");
        }
    }
}

impl Session {
    fn new(id: String, name: String, display_index: u64, started: Started) -> Self {
        Self {
            id,
            display_index,
            meta: Mutex::new(SessionMeta {
                name,
                last_active: Utc::now(),
            }),
            output: started.output,
            input: started.input,
            control: Mutex::new(Some(started.control)),
            tasks: Mutex::new(started.tasks),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_index(&self) -> u64 {
        self.display_index
    }

    pub fn name(&self) -> String {
        lock(&self.meta).name.clone()
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        lock(&self.meta).last_active
    }

    /// Mark the session as active now.
    pub fn touch(&self) {
        lock(&self.meta).last_active = Utc::now();
    }

    fn set_name(&self, name: String) {
        lock(&self.meta).name = name;
    }

    pub fn info(&self) -> SessionInfo {
        let meta = lock(&self.meta);
        SessionInfo {
            id: self.id.clone(),
            name: meta.name.clone(),
            display_index: self.display_index,
            last_active: meta.last_active,
        }
    }

    /// History and attachment point of the terminal output.
    pub fn output(&self) -> &SessionOutput {
        &self.output
    }

    /// Queue of raw bytes for the terminal. Closed once the terminal stops
    /// accepting input.
    pub fn input(&self) -> &mpsc::Sender<Vec<u8>> {
        &self.input
    }

    pub fn resize(&self, cols: u16, rows: u16) -> TermResult<()> {
        let mut control = lock(&self.control);
        match control.as_mut() {
            Some(control) => control.resize(cols, rows),
            None => Err(TermError::Other("terminal closed".into())),
        }
    }

    /// OS process id of the shell, while the terminal is open.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.control).as_ref().and_then(|c| c.pid())
    }

    /// Release the terminal and the process.
    ///
    /// The attached bridge is told first. Stopping the I/O tasks drops this
    /// side's terminal handles even if the process, or something it left
    /// behind, still holds the terminal open.
    async fn teardown(&self) -> TermResult<()> {
        self.output.finish(OutputEnd::Closed);
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        stop_tasks(tasks).await;

        let control = lock(&self.control).take();
        match control {
            Some(mut control) => tokio::task::spawn_blocking(move || control.shutdown())
                .await
                .map_err(|e| TermError::Other(format!("teardown task failed: {e}")))?,
            None => Ok(()),
        }
    }
}

async fn stop_tasks(tasks: Vec<JoinHandle<()>>) {
    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("display_index", &self.display_index)
            .field("meta", &*lock(&self.meta))
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, Arc<Session>>,
    next_display_index: u64,
    name_date: Option<NaiveDate>,
    name_seq: u32,
}

impl RegistryState {
    fn next_name(&mut self, today: NaiveDate) -> String {
        if self.name_date != Some(today) {
            self.name_date = Some(today);
            self.name_seq = 0;
        }
        self.name_seq += 1;
        format!("{}-{:03}", today.format("%Y-%m-%d"), self.name_seq)
    }
}

/// Owns all live sessions.
pub struct SessionRegistry {
    shell: String,
    buffer_size: usize,
    spawner: Arc<dyn Spawner>,
    clock: Arc<dyn Clock>,
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    /// Create a registry that spawns `shell` with `buffer_size` bytes of
    /// output history per session.
    pub fn new(shell: impl Into<String>, buffer_size: usize, spawner: Arc<dyn Spawner>) -> Self {
        Self {
            shell: shell.into(),
            buffer_size,
            spawner,
            clock: Arc::new(SystemClock),
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Replace the date source used for naming.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn the shell on a new terminal and register it under `id`.
    ///
    /// Nothing is registered if spawning fails.
    pub async fn create_session(&self, id: impl Into<String>) -> TermResult<Arc<Session>> {
        let id = id.into();
        if self.read().sessions.contains_key(&id) {
            return Err(TermError::AlreadyExists(id));
        }

        let spawner = self.spawner.clone();
        let shell = self.shell.clone();
        let spawned = tokio::task::spawn_blocking(move || {
            let env = env::process_color_env();
            spawner.spawn(&SpawnRequest {
                shell: &shell,
                env: &env,
                cols: INITIAL_COLS,
                rows: INITIAL_ROWS,
            })
        })
        .await
        .map_err(|e| TermError::ProcessSpawnFailed(format!("spawn task failed: {e}")))?
        .map_err(|e| match e {
            TermError::ProcessSpawnFailed(_) => e,
            other => TermError::ProcessSpawnFailed(other.to_string()),
        })?;

        let started = Started::new(&id, self.buffer_size, spawned);

        let registered = {
            let mut state = self.write();
            if state.sessions.contains_key(&id) {
                Err(started)
            } else {
                // Indices restart only once every session is gone.
                if state.sessions.is_empty() {
                    state.next_display_index = 1;
                }
                let name = state.next_name(self.clock.today());
                let display_index = state.next_display_index;
                state.next_display_index += 1;

                let session = Arc::new(Session::new(id.clone(), name, display_index, started));
                state.sessions.insert(id.clone(), session.clone());
                Ok(session)
            }
        };
        let session = match registered {
            Ok(session) => session,
            Err(started) => {
                started.discard(&id).await;
                return Err(TermError::AlreadyExists(id));
            }
        };

        info!(
            session_id = %id,
            name = %session.name(),
            display_index = session.display_index(),
            "session created"
        );
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.read().sessions.get(id).cloned()
    }

    /// All sessions, ordered by display index.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self.read().sessions.values().map(|s| s.info()).collect();
        list.sort_by_key(|info| info.display_index);
        list
    }

    /// Remove a session and release its terminal and process.
    ///
    /// Teardown failures are logged; the session is gone either way.
    pub async fn close_session(&self, id: &str) -> TermResult<()> {
        let session = self
            .write()
            .sessions
            .remove(id)
            .ok_or_else(|| TermError::NotFound(id.to_string()))?;

        shutdown_session(session).await;
        info!(session_id = %id, "session closed");
        Ok(())
    }

    pub fn rename_session(&self, id: &str, name: impl Into<String>) -> TermResult<()> {
        let session = self
            .get_session(id)
            .ok_or_else(|| TermError::NotFound(id.to_string()))?;
        let name = name.into();
        debug!(session_id = %id, name = %name, "session renamed");
        session.set_name(name);
        Ok(())
    }

    /// Directory the session's shell is currently in.
    pub fn working_dir(&self, id: &str) -> TermResult<PathBuf> {
        let session = self
            .get_session(id)
            .ok_or_else(|| TermError::NotFound(id.to_string()))?;
        let pid = session
            .pid()
            .ok_or_else(|| TermError::NotFound(format!("{id} (no process)")))?;
        std::fs::read_link(format!("/proc/{pid}/cwd"))
            .map_err(|e| TermError::NotFound(format!("{id} (cannot resolve cwd: {e})")))
    }

    /// Close every session (server shutdown).
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self.write().sessions.drain().map(|(_, s)| s).collect();
        if !sessions.is_empty() {
            info!(count = sessions.len(), "closing all sessions");
        }
        for session in sessions {
            shutdown_session(session).await;
        }
    }

    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().sessions.is_empty()
    }
}

async fn shutdown_session(session: Arc<Session>) {
    if let Err(e) = session.teardown().await {
        warn!(session_id = %session.id(), error = %e, "session teardown failed");
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
pub fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::FakeSpawner;

    struct ManualClock(Mutex<NaiveDate>);

    impl ManualClock {
        fn new(y: i32, m: u32, d: u32) -> Arc<Self> {
            Arc::new(Self(Mutex::new(NaiveDate::from_ymd_opt(y, m, d).unwrap())))
        }

        fn advance(&self) {
            let mut date = self.0.lock().unwrap();
            *date = date.succ_opt().unwrap();
        }
    }

    impl Clock for ManualClock {
        fn today(&self) -> NaiveDate {
            *self.0.lock().unwrap()
        }
    }

    fn registry(spawner: &Arc<FakeSpawner>) -> SessionRegistry {
        SessionRegistry::new("/bin/test-shell", 1024, spawner.clone())
    }

    #[tokio::test]
    async fn names_follow_the_calendar_date() {
        let spawner = FakeSpawner::new();
        let clock = ManualClock::new(2024, 3, 9);
        let reg = registry(&spawner).with_clock(clock.clone());

        let mut names = Vec::new();
        for id in ["a", "b", "c"] {
            names.push(reg.create_session(id).await.unwrap().name());
        }
        assert_eq!(names, ["2024-03-09-001", "2024-03-09-002", "2024-03-09-003"]);

        clock.advance();
        let d = reg.create_session("d").await.unwrap();
        assert_eq!(d.name(), "2024-03-10-001");
    }

    #[tokio::test]
    async fn display_indices_reset_only_when_empty() {
        let spawner = FakeSpawner::new();
        let reg = registry(&spawner);

        for (id, expected) in [("a", 1), ("b", 2), ("c", 3)] {
            assert_eq!(reg.create_session(id).await.unwrap().display_index(), expected);
        }
        reg.close_session("a").await.unwrap();
        reg.close_session("b").await.unwrap();
        assert_eq!(reg.create_session("d").await.unwrap().display_index(), 4);

        reg.close_session("c").await.unwrap();
        reg.close_session("d").await.unwrap();
        assert!(reg.is_empty());
        assert_eq!(reg.create_session("e").await.unwrap().display_index(), 1);
    }

    #[tokio::test]
    async fn close_unknown_leaves_others_untouched() {
        let spawner = FakeSpawner::new();
        let reg = registry(&spawner);
        reg.create_session("a").await.unwrap();
        reg.create_session("b").await.unwrap();
        let before = reg.list_sessions();

        let err = reg.close_session("nope").await.unwrap_err();
        assert!(matches!(err, TermError::NotFound(_)));
        assert_eq!(reg.list_sessions(), before);
    }

    #[tokio::test]
    async fn close_twice_is_not_found() {
        let spawner = FakeSpawner::new();
        let reg = registry(&spawner);
        reg.create_session("a").await.unwrap();

        reg.close_session("a").await.unwrap();
        assert!(reg.get_session("a").is_none());
        assert_eq!(spawner.terminal(0).shutdowns(), 1);
        assert!(matches!(
            reg.close_session("a").await,
            Err(TermError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn spawn_failure_registers_nothing() {
        let spawner = FakeSpawner::new();
        let reg = registry(&spawner);
        spawner.fail_next();

        let err = reg.create_session("a").await.unwrap_err();
        assert!(matches!(err, TermError::ProcessSpawnFailed(_)));
        assert!(reg.is_empty());

        // Neither the name sequence nor the display index was consumed.
        let s = reg.create_session("a").await.unwrap();
        assert_eq!(s.display_index(), 1);
        assert!(s.name().ends_with("-001"));
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let spawner = FakeSpawner::new();
        let reg = registry(&spawner);
        reg.create_session("a").await.unwrap();
        assert!(matches!(
            reg.create_session("a").await,
            Err(TermError::AlreadyExists(_))
        ));
        assert_eq!(reg.len(), 1);
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn spawn_request_carries_shell_env_and_geometry() {
        let spawner = FakeSpawner::new();
        let reg = registry(&spawner);
        reg.create_session("a").await.unwrap();

        let (shell, env, cols, rows) = spawner.last_request().unwrap();
        assert_eq!(shell, "/bin/test-shell");
        assert_eq!((cols, rows), (120, 30));
        assert!(env.contains(&("TERM".to_string(), "xterm-256color".to_string())));
        assert!(env.contains(&("FORCE_COLOR".to_string(), "1".to_string())));
        assert!(!env.iter().any(|(k, _)| k == "NO_COLOR"));
    }

    #[tokio::test]
    async fn list_is_sorted_by_display_index() {
        let spawner = FakeSpawner::new();
        let reg = registry(&spawner);
        for id in ["zeta", "alpha", "mid", "beta", "omega"] {
            reg.create_session(id).await.unwrap();
        }
        let list = reg.list_sessions();
        let indices: Vec<u64> = list.iter().map(|s| s.display_index).collect();
        assert_eq!(indices, [1, 2, 3, 4, 5]);
        let ids: Vec<&str> = list.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["zeta", "alpha", "mid", "beta", "omega"]);
    }

    #[tokio::test]
    async fn rename_updates_name_only() {
        let spawner = FakeSpawner::new();
        let reg = registry(&spawner);
        let s = reg.create_session("a").await.unwrap();

        reg.rename_session("a", "build").unwrap();
        assert_eq!(s.name(), "build");
        assert_eq!(s.display_index(), 1);
        // No validation at this layer.
        reg.rename_session("a", "").unwrap();
        assert_eq!(s.name(), "");

        assert!(matches!(
            reg.rename_session("missing", "x"),
            Err(TermError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn session_io_reaches_terminal() {
        let spawner = FakeSpawner::new();
        let reg = registry(&spawner);
        let s = reg.create_session("a").await.unwrap();

        s.input().send(b"echo hi\r".to_vec()).await.unwrap();
        s.resize(80, 24).unwrap();
        let term = spawner.terminal(0);
        assert_eq!(term.read_input(8).await, b"echo hi\r");
        assert_eq!(term.resizes(), vec![(80, 24)]);

        reg.close_session("a").await.unwrap();
        assert!(s.input().send(b"x".to_vec()).await.is_err());
        assert!(s.resize(1, 1).is_err());
        assert_eq!(s.pid(), None);
    }

    #[tokio::test]
    async fn close_releases_a_terminal_the_process_keeps_open() {
        let spawner = FakeSpawner::new();
        let reg = registry(&spawner);
        let s = reg.create_session("a").await.unwrap();
        let term = spawner.terminal(0);
        term.emit(b"before").await.unwrap();
        while s.output().history().len() < 6 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        // The fake process never closes its ends; close must still stop
        // the pump and the writer.
        tokio::time::timeout(std::time::Duration::from_secs(2), reg.close_session("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(term.shutdowns(), 1);
        assert!(term.input_closed().await);
        assert!(term.emit(b"after").await.is_err());
        assert!(s.input().is_closed());
        assert_eq!(s.output().history().snapshot(), b"before");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn working_dir_reads_process_cwd() {
        let spawner = FakeSpawner::new();
        let reg = registry(&spawner);
        reg.create_session("a").await.unwrap();

        let cwd = reg.working_dir("a").unwrap();
        let expected = std::fs::canonicalize(std::env::current_dir().unwrap()).unwrap();
        assert_eq!(cwd, expected);
    }

    #[tokio::test]
    async fn working_dir_unknown_session() {
        let spawner = FakeSpawner::new();
        let reg = registry(&spawner);
        assert!(matches!(reg.working_dir("x"), Err(TermError::NotFound(_))));
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let spawner = FakeSpawner::new();
        let reg = registry(&spawner);
        reg.create_session("a").await.unwrap();
        reg.create_session("b").await.unwrap();
        reg.close_all().await;
        assert!(reg.is_empty());
        assert_eq!(spawner.terminal(0).shutdowns(), 1);
        assert_eq!(spawner.terminal(1).shutdowns(), 1);
    }

    #[test]
    fn session_ids_are_32_hex_chars() {
        let id = generate_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_session_id());
    }
}
