//! Session registry.
//!
//! Owns every live [`Session`], allocates identifiers, routes commands by
//! identifier and removes a session once its exit has been forwarded.

use super::pty::{default_shell, LaunchSpec, ProcessLauncher};
use super::terminal::Session;
use crate::bridge::OutboundSender;
use crate::config::expand_tilde;
use hostdeck_core::{DeckError, DeckResult, Outbound, SessionId, SessionInfo};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How long shutdown waits for session pumps to deliver their exit events.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Settings applied to sessions whose open request leaves them out.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    /// Shell command line; `None` means the user's configured shell.
    pub shell: Option<String>,
    /// Working directory; `None` means the home directory.
    pub cwd: Option<PathBuf>,
    pub rows: u16,
    pub cols: u16,
    pub env: BTreeMap<String, String>,
    pub max_sessions: usize,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            shell: None,
            cwd: None,
            rows: 24,
            cols: 80,
            env: BTreeMap::new(),
            max_sessions: 32,
        }
    }
}

/// A request to open a session. Every field falls back to [`SessionDefaults`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenRequest {
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    pub env: BTreeMap<String, String>,
}

impl OpenRequest {
    pub fn shell(shell: impl Into<String>) -> Self {
        Self {
            shell: Some(shell.into()),
            ..Self::default()
        }
    }
}

type SessionMap = Arc<RwLock<HashMap<SessionId, Arc<Session>>>>;

/// Multiplexes sessions behind identifier-keyed operations.
///
/// The map lock is held only to look a session up; per-session work runs
/// against the session's own lock, so different sessions never block each
/// other.
pub struct SessionRegistry {
    sessions: SessionMap,
    next_id: AtomicU64,
    /// Slots reserved by opens still launching their process.
    opening: AtomicUsize,
    launcher: Arc<dyn ProcessLauncher>,
    defaults: SessionDefaults,
    outbound: OutboundSender,
    pumps: Mutex<JoinSet<SessionId>>,
}

impl SessionRegistry {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        defaults: SessionDefaults,
        outbound: OutboundSender,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            opening: AtomicUsize::new(0),
            launcher,
            defaults,
            outbound,
            pumps: Mutex::new(JoinSet::new()),
        }
    }

    /// Open a session and start forwarding its output.
    ///
    /// Emits `SessionOpened` before any output of the new session. On
    /// failure nothing is registered.
    pub async fn create_session(&self, request: OpenRequest) -> DeckResult<SessionId> {
        let spec = self.launch_spec(request)?;
        let slot = self.reserve_slot().await?;
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let launcher = self.launcher.clone();
        let open_spec = spec.clone();
        // Launching forks and may touch the filesystem.
        let (session, stream) =
            tokio::task::spawn_blocking(move || Session::open(id, launcher.as_ref(), &open_spec))
                .await
                .map_err(|e| DeckError::Spawn(format!("launch task failed: {e}")))??;

        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(id, session.clone());
            drop(slot);
        }
        info!(session_id = %id, shell = %spec.command, "session registered");

        let opened = Outbound::SessionOpened {
            id,
            shell: spec.command.clone(),
            cwd: spec
                .cwd
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            rows: spec.rows,
            cols: spec.cols,
        };
        if let Err(e) = self.outbound.send(opened).await {
            debug!(session_id = %id, error = %e, "could not announce session");
        }

        let sessions = self.sessions.clone();
        let outbound = self.outbound.clone();
        self.pumps.lock().await.spawn(async move {
            session.pump(stream, &outbound).await;
            sessions.write().await.remove(&id);
            debug!(session_id = %id, "session removed");
            id
        });
        self.reap_finished().await;

        Ok(id)
    }

    pub async fn dispatch_input(&self, id: SessionId, bytes: Vec<u8>) -> DeckResult<()> {
        self.get(id).await?.write(bytes).await
    }

    pub async fn dispatch_resize(&self, id: SessionId, rows: u16, cols: u16) -> DeckResult<()> {
        self.get(id).await?.resize(rows, cols).await
    }

    /// Terminate a session. It stays registered until its exit is forwarded.
    pub async fn close_session(&self, id: SessionId) -> DeckResult<()> {
        self.get(id).await?.close().await
    }

    /// Snapshot of every registered session, ordered by identifier.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    /// Close every session and wait for their exit events to be forwarded.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        if !sessions.is_empty() {
            info!(count = sessions.len(), "closing all sessions");
        }
        for session in sessions {
            if let Err(e) = session.close().await {
                warn!(session_id = %session.id(), error = %e, "close during shutdown failed");
            }
        }

        let mut pumps = std::mem::take(&mut *self.pumps.lock().await);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = pumps.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "session pump failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = pumps.len(), "session pumps did not finish, aborting");
            pumps.shutdown().await;
        }
    }

    async fn get(&self, id: SessionId) -> DeckResult<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(DeckError::UnknownSession(id))
    }

    /// Claim room for one more session. The count and the claim happen
    /// under the map's write lock, so concurrent opens respect the limit.
    async fn reserve_slot(&self) -> DeckResult<SlotReservation<'_>> {
        let sessions = self.sessions.write().await;
        let opening = self.opening.load(Ordering::Acquire);
        if sessions.len() + opening >= self.defaults.max_sessions {
            return Err(DeckError::SessionLimit(self.defaults.max_sessions));
        }
        self.opening.fetch_add(1, Ordering::AcqRel);
        Ok(SlotReservation {
            opening: &self.opening,
        })
    }

    /// Drop join handles of pumps that already finished.
    async fn reap_finished(&self) {
        let mut pumps = self.pumps.lock().await;
        while let Some(joined) = pumps.try_join_next() {
            if let Err(e) = joined {
                warn!(error = %e, "session pump failed");
            }
        }
    }

    fn launch_spec(&self, request: OpenRequest) -> DeckResult<LaunchSpec> {
        let command = request
            .shell
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.defaults.shell.clone())
            .unwrap_or_else(default_shell);

        let cwd = match request.cwd.filter(|c| !c.trim().is_empty()) {
            Some(cwd) => Some(expand_tilde(&cwd)),
            None => self
                .defaults
                .cwd
                .clone()
                .or_else(|| dirs::home_dir().filter(|home| home.is_dir())),
        };
        if let Some(dir) = &cwd {
            if !dir.is_dir() {
                return Err(DeckError::Spawn(format!(
                    "working directory does not exist: {}",
                    dir.display()
                )));
            }
        }

        let rows = request.rows.filter(|r| *r > 0).unwrap_or(self.defaults.rows);
        let cols = request.cols.filter(|c| *c > 0).unwrap_or(self.defaults.cols);

        let mut env = self.defaults.env.clone();
        env.extend(request.env);

        Ok(LaunchSpec {
            command,
            cwd,
            rows,
            cols,
            env,
        })
    }
}

/// A session slot held while its process launches. Released on drop,
/// either after the session is registered or when the launch fails.
struct SlotReservation<'a> {
    opening: &'a AtomicUsize,
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        self.opening.fetch_sub(1, Ordering::AcqRel);
    }
}
